//! Evaluates a compiled [`FilterExpr`] against a [`FlowRecord`] using a
//! fixed-size stack machine (spec.md §4.2).
//!
//! `BASIC` pushes only `0u32` or `1u32`. `NOT` complements the top bitwise
//! rather than testing truthiness first — since the only values ever pushed
//! are 0/1, `!0u32 = 0xFFFF_FFFF` (nonzero, so the final `!= 0` check reads
//! "matched") but `!1u32 = 0xFFFF_FFFE` is *also* nonzero, so `NOT` of a true
//! input also reads as matched. This is preserved intentionally per
//! spec.md §9's open question rather than "fixed" into a boolean NOT.
//! `AND`/`OR` likewise use `&`/`|`, not `&&`/`||`.

use crate::field::FieldId;
use crate::filter::parser::{Basic, Direction, FieldRef, FilterExpr, Literal, Op};
use crate::flow::FlowRecord;

fn addr4_match(value: &[u8], addr: [u8; 4], mask: u8) -> bool {
    if value.len() != 4 {
        return false;
    }
    let v = u32::from_be_bytes(value.try_into().unwrap());
    let a = u32::from_be_bytes(addr);
    let bits = mask.min(32);
    let shift = 32 - bits;
    let m: u32 = if shift == 32 { 0 } else { !0u32 << shift };
    (v & m) == (a & m)
}

fn addr6_match(value: &[u8], addr: [u8; 16], mask: u8) -> bool {
    if value.len() != 16 {
        return false;
    }
    let v = u128::from_be_bytes(value.try_into().unwrap());
    let a = u128::from_be_bytes(addr);
    let bits = mask.min(128);
    let shift = 128 - bits as u32;
    let m: u128 = if shift == 128 { 0 } else { !0u128 << shift };
    (v & m) == (a & m)
}

fn range_match(value: u64, lo: u64, hi: u64) -> bool {
    value >= lo && value <= hi
}

fn mac_match(value: &[u8], mac: [u8; 6]) -> bool {
    value.len() == 6 && value == mac
}

fn str_match(value: &[u8], s: &str) -> bool {
    value == s.as_bytes()
}

fn literal_matches(value: &[u8], lit: &Literal) -> bool {
    match lit {
        Literal::Cidr4 { addr, mask } => addr4_match(value, *addr, *mask),
        Literal::Cidr6 { addr, mask } => addr6_match(value, *addr, *mask),
        Literal::Range { lo, hi } => {
            let v = match value.len() {
                1 => value[0] as u64,
                2 => u16::from_be_bytes(value.try_into().unwrap()) as u64,
                4 => u32::from_be_bytes(value.try_into().unwrap()) as u64,
                8 => u64::from_be_bytes(value.try_into().unwrap()),
                _ => return false,
            };
            range_match(v, *lo, *hi)
        }
        Literal::Mac(m) => mac_match(value, *m),
        Literal::Str(s) => str_match(value, s),
    }
}

fn any_literal_matches(value: &[u8], present: bool, values: &[Literal]) -> bool {
    present && values.iter().any(|l| literal_matches(value, l))
}

fn eval_host(flow: &FlowRecord, direction: Direction, values: &[Literal]) -> bool {
    let sides: &[FieldId] = match direction {
        Direction::Src => &[FieldId::Ipv4Src, FieldId::Ipv6Src],
        Direction::Dst => &[FieldId::Ipv4Dst, FieldId::Ipv6Dst],
        Direction::Both | Direction::None => {
            &[FieldId::Ipv4Src, FieldId::Ipv6Src, FieldId::Ipv4Dst, FieldId::Ipv6Dst]
        }
    };
    sides.iter().any(|id| {
        let slot = flow.slot(*id);
        any_literal_matches(slot.as_bytes(), slot.is_present(), values)
    })
}

fn eval_port(flow: &FlowRecord, direction: Direction, values: &[Literal]) -> bool {
    let sides: &[FieldId] = match direction {
        Direction::Src => &[FieldId::PortSrc],
        Direction::Dst => &[FieldId::PortDst],
        Direction::Both | Direction::None => &[FieldId::PortSrc, FieldId::PortDst],
    };
    sides.iter().any(|id| {
        let slot = flow.slot(*id);
        any_literal_matches(slot.as_bytes(), slot.is_present(), values)
    })
}

fn eval_mac(flow: &FlowRecord, direction: Direction, values: &[Literal]) -> bool {
    let sides: &[FieldId] = match direction {
        Direction::Src => &[FieldId::MacSrc],
        Direction::Dst => &[FieldId::MacDst],
        Direction::Both | Direction::None => &[FieldId::MacSrc, FieldId::MacDst],
    };
    sides.iter().any(|id| {
        let slot = flow.slot(*id);
        any_literal_matches(slot.as_bytes(), slot.is_present(), values)
    })
}

fn eval_basic(b: &Basic, flow: &FlowRecord) -> bool {
    match b.field {
        FieldRef::Host => eval_host(flow, b.direction, &b.values),
        FieldRef::Port => eval_port(flow, b.direction, &b.values),
        FieldRef::Mac => eval_mac(flow, b.direction, &b.values),
        FieldRef::Field(id) => {
            if matches!(b.direction, Direction::Src | Direction::Dst) {
                // Unsupported direction for a non-paired field: no match.
                return false;
            }
            let slot = flow.slot(id);
            any_literal_matches(slot.as_bytes(), slot.is_present(), &b.values)
        }
    }
}

/// Evaluates a compiled filter expression; `true` means the flow matched.
pub fn evaluate(expr: &FilterExpr, flow: &FlowRecord) -> bool {
    let mut stack: Vec<u32> = Vec::with_capacity(expr.0.len());
    for op in &expr.0 {
        match op {
            Op::Basic(b) => stack.push(eval_basic(b, flow) as u32),
            Op::Not => {
                if let Some(top) = stack.last_mut() {
                    *top = !*top;
                }
            }
            Op::And => {
                let b = stack.pop().unwrap_or(0);
                let a = stack.pop().unwrap_or(0);
                stack.push(a & b);
            }
            Op::Or => {
                let b = stack.pop().unwrap_or(0);
                let a = stack.pop().unwrap_or(0);
                stack.push(a | b);
            }
        }
    }
    stack.last().copied().unwrap_or(0) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parser::parse;

    fn flow_with(src4: Option<[u8; 4]>, dst_port: Option<u16>) -> FlowRecord {
        let mut f = FlowRecord::new();
        if let Some(a) = src4 {
            f.set_raw(FieldId::Ipv4Src, &a);
        }
        if let Some(p) = dst_port {
            f.set_raw(FieldId::PortDst, &p.to_be_bytes());
        }
        f
    }

    #[test]
    fn s1_scenario_matches_and_mismatches() {
        let expr = parse(
            "src host 10.0.0.1 and (port 12345 or port 54321) or dst host 4.3.2.1",
        )
        .unwrap();

        let matching = flow_with(Some([10, 0, 0, 1]), Some(54321));
        assert!(evaluate(&expr, &matching));

        let non_matching = flow_with(Some([10, 0, 0, 2]), Some(54321));
        assert!(!evaluate(&expr, &non_matching));
    }

    #[test]
    fn not_of_basic_is_always_truthy() {
        let expr = parse("not proto 255").unwrap();
        let flow = FlowRecord::new();
        // proto absent -> BASIC is 0 -> NOT(0) = 0xFFFFFFFF -> matches.
        assert!(evaluate(&expr, &flow));

        let expr2 = parse("not proto 6").unwrap();
        let mut flow2 = FlowRecord::new();
        flow2.set_raw(FieldId::Proto, &[6]);
        // proto present and equal to 6 -> BASIC is 1 -> NOT(1) = 0xFFFFFFFE -> still matches.
        assert!(evaluate(&expr2, &flow2));
    }
}
