//! Parses a `fields: [...]` config list into key components (non-aggregable,
//! concatenated verbatim into the OKVS key) and value components
//! (aggregable, summed into the per-key measure vector), per spec.md §4.1
//! and the invariant-1 "key layout stability" contract.

use crate::error::{FlowError, Result};
use crate::field::accessor::{eval_func, FieldFunc, FuncContext};
use crate::field::{self, FieldId};
use crate::flow::FlowRecord;

/// Fixed width function string outputs are padded/truncated to, so a
/// fieldset's key length stays constant across every flow it sees — the
/// original's buffers were fixed-width per field; this repo gives computed
/// string functions (`geoip_*`, `asd`, `tfstr`, `portstr`, `ppstr`) the same
/// property rather than length-prefixing them.
pub const FUNC_STRING_WIDTH: usize = 32;

/// One key-building component: either a raw table field or a computed
/// function.
#[derive(Debug, Clone, Copy)]
pub enum FieldSpec {
    /// A declarative-table field, copied verbatim.
    Plain(FieldId),
    /// A computed function.
    Func(FieldFunc),
}

impl FieldSpec {
    /// Encoded width of this component within a built key.
    pub fn size(&self) -> usize {
        match self {
            FieldSpec::Plain(id) => field::descriptor(*id).size,
            FieldSpec::Func(f) => match f {
                FieldFunc::Div(..)
                | FieldFunc::DivL(..)
                | FieldFunc::DivR(..)
                | FieldFunc::Min(..)
                | FieldFunc::Mfreq(..) => 8,
                FieldFunc::Asn(_) => 4,
                FieldFunc::GeoipCountry(_)
                | FieldFunc::GeoipCity(_)
                | FieldFunc::Asd(_)
                | FieldFunc::Tfstr(_)
                | FieldFunc::Portstr(_)
                | FieldFunc::Ppstr(..) => FUNC_STRING_WIDTH,
            },
        }
    }

    fn is_string_func(&self) -> bool {
        matches!(
            self,
            FieldSpec::Func(
                FieldFunc::GeoipCountry(_)
                    | FieldFunc::GeoipCity(_)
                    | FieldFunc::Asd(_)
                    | FieldFunc::Tfstr(_)
                    | FieldFunc::Portstr(_)
                    | FieldFunc::Ppstr(..)
            )
        )
    }

    fn write(&self, flow: &FlowRecord, ctx: &FuncContext, out: &mut Vec<u8>) {
        match self {
            FieldSpec::Plain(id) => {
                let desc = field::descriptor(*id);
                crate::field::read_field(desc, flow, false, out);
                let slot = flow.slot(*id);
                for _ in slot.as_bytes().len()..desc.size {
                    out.push(0);
                }
            }
            FieldSpec::Func(f) => {
                let width = self.size();
                if self.is_string_func() {
                    let mut buf = Vec::new();
                    eval_func(*f, flow, ctx, &mut buf);
                    buf.resize(width, 0);
                    out.extend_from_slice(&buf[..width]);
                } else {
                    eval_func(*f, flow, ctx, out);
                }
            }
        }
    }
}

/// One entry of a fieldset's original declared column order, used by the
/// MAVG threshold-CSV reader to line up a row's columns with `fields: [...]`
/// (spec.md §6 "MAVG thresholds CSV") regardless of how key/value columns
/// interleave.
#[derive(Debug, Clone, Copy)]
pub enum Column {
    /// Index into `key_specs`/`key_names`.
    Key(usize),
    /// Index into `value_fields`.
    Value(usize),
}

/// A parsed `fields: [...]` list, split into key and value components.
#[derive(Debug, Clone)]
pub struct Fieldset {
    /// Non-aggregable / computed components, in the order they were listed.
    pub key_specs: Vec<FieldSpec>,
    /// Original config text for each `key_specs` entry, for SQL/label
    /// column naming.
    pub key_names: Vec<String>,
    /// Aggregable measure fields, in the order they were listed.
    pub value_fields: Vec<FieldId>,
    /// The original declared column order, interleaving key and value
    /// columns exactly as `fields: [...]` listed them.
    pub columns: Vec<Column>,
}

impl Fieldset {
    /// Parses the `"fields"` string list from a FWM/MAVG/CLSF config block.
    pub fn parse(names: &[String]) -> Result<Self> {
        let mut key_specs = Vec::new();
        let mut key_names = Vec::new();
        let mut value_fields = Vec::new();
        let mut columns = Vec::new();
        for name in names {
            match parse_one(name)? {
                Parsed::Plain(id) if field::descriptor(id).aggregable => {
                    columns.push(Column::Value(value_fields.len()));
                    value_fields.push(id);
                }
                Parsed::Plain(id) => {
                    columns.push(Column::Key(key_specs.len()));
                    key_specs.push(FieldSpec::Plain(id));
                    key_names.push(name.clone());
                }
                Parsed::Func(f) => {
                    columns.push(Column::Key(key_specs.len()));
                    key_specs.push(FieldSpec::Func(f));
                    key_names.push(name.clone());
                }
            }
        }
        Ok(Self { key_specs, key_names, value_fields, columns })
    }

    /// Total byte length of a key built from this fieldset.
    pub fn key_len(&self) -> usize {
        self.key_specs.iter().map(FieldSpec::size).sum()
    }

    /// Builds the OKVS key for one flow.
    pub fn build_key(&self, flow: &FlowRecord, ctx: &FuncContext) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key_len());
        for spec in &self.key_specs {
            spec.write(flow, ctx, &mut out);
        }
        out
    }

    /// Encodes one CSV-literal text column into its binary key-component
    /// encoding, used by the MAVG per-key threshold override reader
    /// (spec.md §6 "MAVG thresholds CSV").
    pub fn encode_key_literal(&self, key_index: usize, text: &str) -> Result<Vec<u8>> {
        let spec = &self.key_specs[key_index];
        let size = spec.size();
        match spec {
            FieldSpec::Plain(id) => {
                let desc = field::descriptor(*id);
                match desc.ty {
                    field::FieldType::Addr4 => {
                        let addr: std::net::Ipv4Addr = text
                            .parse()
                            .map_err(|_| FlowError::Config { path: text.to_string(), msg: "invalid IPv4 literal".into() })?;
                        Ok(addr.octets().to_vec())
                    }
                    field::FieldType::Addr6 => {
                        let addr: std::net::Ipv6Addr = text
                            .parse()
                            .map_err(|_| FlowError::Config { path: text.to_string(), msg: "invalid IPv6 literal".into() })?;
                        Ok(addr.octets().to_vec())
                    }
                    field::FieldType::Mac => {
                        let parts: Vec<&str> = text.split(':').collect();
                        if parts.len() != 6 {
                            return Err(FlowError::Config { path: text.to_string(), msg: "invalid MAC literal".into() });
                        }
                        let mut out = vec![0u8; 6];
                        for (i, p) in parts.iter().enumerate() {
                            out[i] = u8::from_str_radix(p, 16)
                                .map_err(|_| FlowError::Config { path: text.to_string(), msg: "invalid MAC literal".into() })?;
                        }
                        Ok(out)
                    }
                    field::FieldType::StringField => {
                        let mut out = text.as_bytes().to_vec();
                        out.resize(size, 0);
                        Ok(out)
                    }
                    field::FieldType::Range => {
                        let n: u64 = text
                            .parse()
                            .map_err(|_| FlowError::Config { path: text.to_string(), msg: "invalid integer literal".into() })?;
                        let bytes = n.to_be_bytes();
                        Ok(bytes[8 - size..].to_vec())
                    }
                }
            }
            FieldSpec::Func(_) if self.key_specs[key_index].is_string_func() => {
                let mut out = text.as_bytes().to_vec();
                out.resize(size, 0);
                Ok(out)
            }
            FieldSpec::Func(_) => {
                let n: u64 = text
                    .parse()
                    .map_err(|_| FlowError::Config { path: text.to_string(), msg: "invalid integer literal".into() })?;
                Ok(n.to_be_bytes().to_vec())
            }
        }
    }
}

/// Renders one key component back to human-readable text, shared by the
/// CLSF label renderer and the MAVG notification-file writer.
pub fn render_field_text(spec: &FieldSpec, bytes: &[u8]) -> String {
    match spec {
        FieldSpec::Plain(id) => {
            let desc = field::descriptor(*id);
            match desc.ty {
                field::FieldType::Addr4 if bytes.len() == 4 => format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]),
                field::FieldType::Addr6 if bytes.len() == 16 => {
                    let arr: [u8; 16] = bytes.try_into().unwrap();
                    std::net::Ipv6Addr::from(arr).to_string()
                }
                field::FieldType::Mac if bytes.len() == 6 => {
                    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
                }
                field::FieldType::StringField => String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string(),
                field::FieldType::Range if *id == FieldId::TcpFlags && bytes.len() == 1 => {
                    crate::field::accessor::tcp_flags_str_pub(bytes[0])
                }
                field::FieldType::Range if (*id == FieldId::PortSrc || *id == FieldId::PortDst) && bytes.len() == 2 => {
                    crate::field::accessor::portstr(u16::from_be_bytes(bytes.try_into().unwrap()))
                }
                _ => {
                    let mut buf = [0u8; 8];
                    let n = bytes.len().min(8);
                    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
                    u64::from_be_bytes(buf).to_string()
                }
            }
        }
        FieldSpec::Func(_) => String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string(),
    }
}

/// Splits a built key back into its per-component rendered text, in
/// declared order.
pub fn render_key_parts(fieldset: &Fieldset, key: &[u8]) -> Vec<String> {
    let mut offset = 0;
    let mut parts = Vec::with_capacity(fieldset.key_specs.len());
    for spec in &fieldset.key_specs {
        let size = spec.size();
        parts.push(render_field_text(spec, &key[offset..offset + size]));
        offset += size;
    }
    parts
}

enum Parsed {
    Plain(FieldId),
    Func(FieldFunc),
}

fn parse_one(name: &str) -> Result<Parsed> {
    let name = name.trim();
    if let Some(open) = name.find('(') {
        if !name.ends_with(')') {
            return Err(FlowError::Config { path: name.to_string(), msg: "unterminated function call".into() });
        }
        let func_name = &name[..open];
        let args_str = &name[open + 1..name.len() - 1];
        let args: Vec<&str> = if args_str.trim().is_empty() {
            Vec::new()
        } else {
            args_str.split(',').map(str::trim).collect()
        };
        return parse_func(func_name, &args).map(Parsed::Func);
    }
    let desc = field::lookup(name)?;
    Ok(Parsed::Plain(desc.id))
}

fn arg_field(args: &[&str], idx: usize, func: &str) -> Result<FieldId> {
    let name = args.get(idx).ok_or_else(|| FlowError::Config {
        path: func.to_string(),
        msg: format!("missing argument {idx}"),
    })?;
    Ok(field::lookup(name)?.id)
}

fn arg_u64(args: &[&str], idx: usize, func: &str) -> Result<u64> {
    let raw = args.get(idx).ok_or_else(|| FlowError::Config {
        path: func.to_string(),
        msg: format!("missing argument {idx}"),
    })?;
    raw.parse().map_err(|_| FlowError::Config { path: func.to_string(), msg: format!("bad integer '{raw}'") })
}

fn parse_func(name: &str, args: &[&str]) -> Result<FieldFunc> {
    Ok(match name {
        "div" => FieldFunc::Div(arg_field(args, 0, name)?, arg_field(args, 1, name)?),
        "div_l" => FieldFunc::DivL(arg_field(args, 0, name)?, arg_field(args, 1, name)?, arg_u64(args, 2, name)?),
        "div_r" => FieldFunc::DivR(arg_field(args, 0, name)?, arg_field(args, 1, name)?, arg_u64(args, 2, name)?),
        "min" => FieldFunc::Min(arg_field(args, 0, name)?, arg_field(args, 1, name)?),
        "mfreq" => FieldFunc::Mfreq(arg_field(args, 0, name)?, arg_field(args, 1, name)?),
        "geoip_country" => FieldFunc::GeoipCountry(arg_field(args, 0, name)?),
        "geoip_city" => FieldFunc::GeoipCity(arg_field(args, 0, name)?),
        "asn" => FieldFunc::Asn(arg_field(args, 0, name)?),
        "asd" => FieldFunc::Asd(arg_field(args, 0, name)?),
        "tfstr" => FieldFunc::Tfstr(arg_field(args, 0, name)?),
        "portstr" => FieldFunc::Portstr(arg_field(args, 0, name)?),
        "ppstr" => FieldFunc::Ppstr(arg_field(args, 0, name)?, arg_field(args, 1, name)?),
        other => {
            return Err(FlowError::Config { path: other.to_string(), msg: "unknown function".into() });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::accessor::{MfreqTable, NullGeoip};

    #[test]
    fn splits_key_and_value_fields() {
        let names = vec!["ip4.src".to_string(), "ip4.dst".to_string(), "octets".to_string(), "packets".to_string()];
        let fs = Fieldset::parse(&names).unwrap();
        assert_eq!(fs.key_specs.len(), 2);
        assert_eq!(fs.value_fields, vec![FieldId::Octets, FieldId::Packets]);
    }

    #[test]
    fn parses_function_field_into_key() {
        let names = vec!["div(octets,packets)".to_string(), "ip4.src".to_string()];
        let fs = Fieldset::parse(&names).unwrap();
        assert_eq!(fs.key_specs.len(), 2);
        assert!(fs.value_fields.is_empty());
    }

    #[test]
    fn key_length_matches_invariant_1() {
        let names = vec!["ip4.src".to_string(), "port.dst".to_string()];
        let fs = Fieldset::parse(&names).unwrap();
        assert_eq!(fs.key_len(), 4 + 2);

        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let ctx = FuncContext { mfreq: &mfreq, geoip: &geoip };
        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Ipv4Src, &[10, 0, 0, 1]);
        flow.set_raw(FieldId::PortDst, &54321u16.to_be_bytes());
        let key = fs.build_key(&flow, &ctx);
        assert_eq!(key.len(), fs.key_len());
    }
}
