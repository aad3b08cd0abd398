//! Recursive-descent parser for the filter DSL, compiling to a postfix
//! op-vector (spec.md §4.2).
//!
//! ```text
//! expr   = term   { 'or'  term }
//! term   = factor { 'and' factor }
//! factor = [ 'not' ] ( rule | '(' expr ')' )
//! rule   = [ 'src' | 'dst' ] field values
//! values = value { 'or' value }
//! ```

use crate::error::{FlowError, Result};
use crate::field::{self, FieldId, FieldType};
use crate::filter::lexer::{tokenize, Spanned, Token};

/// Which side(s) of a flow a [`Basic`] rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Explicit `src` prefix.
    Src,
    /// Explicit `dst` prefix.
    Dst,
    /// No prefix given, field has a src/dst pair (`host`, `port`, `mac`):
    /// match either side.
    Both,
    /// No prefix given, field has no src/dst pair (e.g. `proto`, `vlan`).
    None,
}

/// What a rule's field keyword resolves to.
#[derive(Debug, Clone, Copy)]
pub enum FieldRef {
    /// A single declarative-table field (no src/dst pairing of its own).
    Field(FieldId),
    /// The `host`/`net` shorthand: IPv4 or IPv6 address, either side.
    Host,
    /// The `port` shorthand: L4 port, either side.
    Port,
    /// The `mac` shorthand: MAC address, either side.
    Mac,
}

/// One literal match value.
#[derive(Debug, Clone)]
pub enum Literal {
    /// IPv4 network (address, prefix length 0-32).
    Cidr4 { addr: [u8; 4], mask: u8 },
    /// IPv6 network (address, prefix length 0-128).
    Cidr6 { addr: [u8; 16], mask: u8 },
    /// Inclusive integer range.
    Range { lo: u64, hi: u64 },
    /// MAC address.
    Mac([u8; 6]),
    /// String literal.
    Str(String),
}

/// A single `BASIC(filter)` leaf, per spec.md §3 "Filter expression".
#[derive(Debug, Clone)]
pub struct Basic {
    /// The value kind this rule matches on.
    pub ty: FieldType,
    /// The field (or shorthand) being matched.
    pub field: FieldRef,
    /// Side(s) of the flow to check.
    pub direction: Direction,
    /// Values OR'd together within this single rule.
    pub values: Vec<Literal>,
}

/// One postfix operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// A leaf match.
    Basic(Basic),
    /// Bitwise complement of the top of stack (see spec.md §9 open question).
    Not,
    /// Bitwise AND of the top two stack entries.
    And,
    /// Bitwise OR of the top two stack entries.
    Or,
}

/// A compiled filter expression: a postfix op-vector.
#[derive(Debug, Clone, Default)]
pub struct FilterExpr(pub Vec<Op>);

struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos).map(|s| &s.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.toks.get(self.pos + offset).map(|s| &s.tok)
    }

    fn pos_line_col(&self) -> (usize, usize) {
        self.toks
            .get(self.pos)
            .map(|s| (s.line, s.col))
            .unwrap_or((0, 0))
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).map(|s| s.tok.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> FlowError {
        let (line, col) = self.pos_line_col();
        FlowError::FilterParse { line, col, msg: msg.into() }
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(format!("expected {tok:?}")))
        }
    }

    fn parse_expr(&mut self) -> Result<Vec<Op>> {
        let mut ops = self.parse_term()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let mut rhs = self.parse_term()?;
            ops.append(&mut rhs);
            ops.push(Op::Or);
        }
        Ok(ops)
    }

    fn parse_term(&mut self) -> Result<Vec<Op>> {
        let mut ops = self.parse_factor()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let mut rhs = self.parse_factor()?;
            ops.append(&mut rhs);
            ops.push(Op::And);
        }
        Ok(ops)
    }

    fn parse_factor(&mut self) -> Result<Vec<Op>> {
        let negate = matches!(self.peek(), Some(Token::Not));
        if negate {
            self.bump();
        }
        let mut ops = if matches!(self.peek(), Some(Token::LParen)) {
            self.bump();
            let inner = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            inner
        } else {
            self.parse_rule()?
        };
        if negate {
            ops.push(Op::Not);
        }
        Ok(ops)
    }

    fn parse_rule(&mut self) -> Result<Vec<Op>> {
        let explicit_dir = match self.peek() {
            Some(Token::Src) => {
                self.bump();
                Some(Direction::Src)
            }
            Some(Token::Dst) => {
                self.bump();
                Some(Direction::Dst)
            }
            _ => None,
        };

        let field_name = match self.bump() {
            Some(Token::Ident(s)) => s,
            other => return Err(self.err(format!("expected field name, found {other:?}"))),
        };

        let lower = field_name.to_ascii_lowercase();
        let (field_ref, ty, paired) = match lower.as_str() {
            "host" | "net" => (FieldRef::Host, FieldType::Addr4, true),
            "port" => (FieldRef::Port, FieldType::Range, true),
            "mac" => (FieldRef::Mac, FieldType::Mac, true),
            _ => {
                let desc = field::lookup(&field_name)?;
                (FieldRef::Field(desc.id), desc.ty, false)
            }
        };

        let direction = match explicit_dir {
            Some(d) => d,
            None if paired => Direction::Both,
            None => Direction::None,
        };

        let values = self.parse_values(ty)?;
        Ok(vec![Op::Basic(Basic { ty, field: field_ref, direction, values })])
    }

    fn parse_values(&mut self, ty: FieldType) -> Result<Vec<Literal>> {
        let mut values = vec![self.parse_value(ty)?];
        loop {
            if !matches!(self.peek(), Some(Token::Or)) {
                break;
            }
            // Only consume 'or' here if what follows is a bare value for
            // this field's type, not the start of a new rule.
            if !self.next_is_bare_value(ty) {
                break;
            }
            self.bump();
            values.push(self.parse_value(ty)?);
        }
        Ok(values)
    }

    fn next_is_bare_value(&self, ty: FieldType) -> bool {
        match ty {
            FieldType::Range => matches!(self.peek_at(1), Some(Token::IntRange(_, _))),
            FieldType::StringField => matches!(self.peek_at(1), Some(Token::Str(_))),
            FieldType::Addr4 | FieldType::Addr6 | FieldType::Mac => {
                match self.peek_at(1) {
                    Some(Token::Ident(s)) => field::lookup(s).is_err() && s.to_ascii_lowercase() != "host"
                        && s.to_ascii_lowercase() != "net"
                        && s.to_ascii_lowercase() != "port"
                        && s.to_ascii_lowercase() != "mac",
                    _ => false,
                }
            }
        }
    }

    fn parse_value(&mut self, ty: FieldType) -> Result<Literal> {
        match ty {
            FieldType::Range => match self.bump() {
                Some(Token::IntRange(lo, hi)) => Ok(Literal::Range { lo, hi }),
                other => Err(self.err(format!("expected integer range, found {other:?}"))),
            },
            FieldType::StringField => match self.bump() {
                Some(Token::Str(s)) => Ok(Literal::Str(s)),
                other => Err(self.err(format!("expected string literal, found {other:?}"))),
            },
            FieldType::Mac => match self.bump() {
                Some(Token::Ident(s)) => parse_mac(&s).map_err(|msg| self.err(msg)),
                other => Err(self.err(format!("expected MAC address, found {other:?}"))),
            },
            FieldType::Addr4 | FieldType::Addr6 => {
                let ident = match self.bump() {
                    Some(Token::Ident(s)) => s,
                    other => return Err(self.err(format!("expected IP address, found {other:?}"))),
                };
                let mut mask: Option<u8> = None;
                if matches!(self.peek(), Some(Token::Slash)) {
                    self.bump();
                    match self.bump() {
                        Some(Token::IntRange(n, _)) => mask = Some(n as u8),
                        other => return Err(self.err(format!("expected mask length, found {other:?}"))),
                    }
                }
                parse_ip_cidr(&ident, mask).map_err(|msg| self.err(msg))
            }
        }
    }
}

fn parse_mac(s: &str) -> std::result::Result<Literal, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("invalid MAC address '{s}'"));
    }
    let mut out = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).map_err(|_| format!("invalid MAC address '{s}'"))?;
    }
    Ok(Literal::Mac(out))
}

fn parse_ip_cidr(s: &str, mask: Option<u8>) -> std::result::Result<Literal, String> {
    if s.contains(':') {
        let addr: std::net::Ipv6Addr = s.parse().map_err(|_| format!("invalid IPv6 address '{s}'"))?;
        Ok(Literal::Cidr6 { addr: addr.octets(), mask: mask.unwrap_or(128) })
    } else {
        let addr: std::net::Ipv4Addr = s.parse().map_err(|_| format!("invalid IPv4 address '{s}'"))?;
        Ok(Literal::Cidr4 { addr: addr.octets(), mask: mask.unwrap_or(32) })
    }
}

/// Parses and compiles a filter expression string into a postfix
/// op-vector. Parse failures record `(line, col, message)` and bail early,
/// per spec.md §7 error-handling policy ("abort this unit, continue
/// process") — this function itself only returns the error; the caller
/// decides whether that means rejecting a single MO.
pub fn parse(src: &str) -> Result<FilterExpr> {
    let toks = tokenize(src)?;
    let mut p = Parser { toks, pos: 0 };
    let ops = p.parse_expr()?;
    if p.pos != p.toks.len() {
        return Err(p.err("unexpected trailing tokens"));
    }
    Ok(FilterExpr(ops))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sample_expression() {
        let expr = parse(
            "src host 10.0.0.1 and (port 12345 or port 54321) or dst host 4.3.2.1",
        )
        .unwrap();
        assert!(!expr.0.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("src host ) and").is_err());
    }

    #[test]
    fn or_within_single_rule_is_one_basic() {
        let expr = parse("proto 6 or 17").unwrap();
        let basics: Vec<_> = expr.0.iter().filter(|op| matches!(op, Op::Basic(_))).collect();
        assert_eq!(basics.len(), 1);
        if let Op::Basic(b) = basics[0] {
            assert_eq!(b.values.len(), 2);
        }
    }
}
