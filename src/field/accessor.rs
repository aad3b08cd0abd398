//! Field accessor and computed-function fields (spec.md §4.1).

use crate::field::table::FieldDescriptor;
use crate::field::FieldId;
use crate::flow::FlowRecord;
use std::sync::atomic::{AtomicU32, Ordering};

/// A computed value derived from one or two source fields at key-build
/// time, per spec.md §4.1 "Functions and their semantics".
#[derive(Debug, Clone, Copy)]
pub enum FieldFunc {
    /// `div(a, b)` — unsigned quotient, 0 when `b == 0`.
    Div(FieldId, FieldId),
    /// `div_l(a, b, k)` — logarithmic bucket index.
    DivL(FieldId, FieldId, u64),
    /// `div_r(a, b, k)` — linearly scaled bucket index.
    DivR(FieldId, FieldId, u64),
    /// `min(a, b)` — byte-wise minimum of two equal-type fields.
    Min(FieldId, FieldId),
    /// `mfreq(a, b)` — higher-observed-frequency of the two, ties by value.
    Mfreq(FieldId, FieldId),
    /// `geoip_country(ip)`.
    GeoipCountry(FieldId),
    /// `geoip_city(ip)`.
    GeoipCity(FieldId),
    /// `asn(ip)` — autonomous system number, big-endian u32.
    Asn(FieldId),
    /// `asd(ip)` — autonomous system description string.
    Asd(FieldId),
    /// `tfstr(flags)` — TCP flags byte rendered as `"CWR+ECE+..."`.
    Tfstr(FieldId),
    /// `portstr(port)` — well-known service name for a single port.
    Portstr(FieldId),
    /// `ppstr(p1, p2)` — well-known service name picked from a port pair.
    Ppstr(FieldId, FieldId),
}

/// Lookup service consumed by `geoip_*`/`asn`/`asd`. The real lookup
/// (GeoIP/ASN databases) is an external collaborator per spec.md §1; this
/// crate only defines the seam.
pub trait GeoipLookup: Send + Sync {
    /// ISO country code, or `"?"` on miss.
    fn country(&self, ip: &[u8]) -> String;
    /// City name, or `"?"` on miss.
    fn city(&self, ip: &[u8]) -> String;
    /// Autonomous system number, or 0 on miss.
    fn asn(&self, ip: &[u8]) -> u32;
    /// Autonomous system description, or `"?"` on miss.
    fn asd(&self, ip: &[u8]) -> String;
}

/// A `GeoipLookup` that always misses; used when no database is configured.
#[derive(Debug, Default)]
pub struct NullGeoip;

impl GeoipLookup for NullGeoip {
    fn country(&self, _ip: &[u8]) -> String {
        "?".to_string()
    }
    fn city(&self, _ip: &[u8]) -> String {
        "?".to_string()
    }
    fn asn(&self, _ip: &[u8]) -> u32 {
        0
    }
    fn asd(&self, _ip: &[u8]) -> String {
        "?".to_string()
    }
}

/// The 65,536-entry atomic frequency table shared across threads for
/// `mfreq`, per spec.md §4.1.
pub struct MfreqTable {
    counts: Vec<AtomicU32>,
}

impl Default for MfreqTable {
    fn default() -> Self {
        let mut counts = Vec::with_capacity(65536);
        counts.resize_with(65536, || AtomicU32::new(0));
        Self { counts }
    }
}

impl MfreqTable {
    /// Increments and returns the observation count for a value, indexed by
    /// its low 16 bits.
    pub fn observe(&self, value: u64) -> u32 {
        let idx = (value & 0xFFFF) as usize;
        self.counts[idx].fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Shared state needed to evaluate computed fields.
pub struct FuncContext<'a> {
    /// The frequency table backing `mfreq`.
    pub mfreq: &'a MfreqTable,
    /// The GeoIP/ASN lookup backing `geoip_*`/`asn`/`asd`.
    pub geoip: &'a dyn GeoipLookup,
}

fn safe_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        a / b
    }
}

fn tcp_flags_str(flags: u8) -> String {
    const NAMES: [(u8, &str); 8] = [
        (0x80, "CWR"),
        (0x40, "ECE"),
        (0x20, "URG"),
        (0x10, "ACK"),
        (0x08, "PSH"),
        (0x04, "RST"),
        (0x02, "SYN"),
        (0x01, "FIN"),
    ];
    let parts: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join("+")
    }
}

/// Public wrapper around [`tcp_flags_str`], used by the CLSF label renderer.
pub fn tcp_flags_str_pub(flags: u8) -> String {
    tcp_flags_str(flags)
}

/// Well-known service name for a single port, or the port number itself as
/// text when unknown.
pub fn portstr(port: u16) -> String {
    match port {
        20 | 21 => "ftp".to_string(),
        22 => "ssh".to_string(),
        23 => "telnet".to_string(),
        25 => "smtp".to_string(),
        53 => "dns".to_string(),
        80 => "http".to_string(),
        110 => "pop3".to_string(),
        143 => "imap".to_string(),
        443 => "https".to_string(),
        3306 => "mysql".to_string(),
        5432 => "postgresql".to_string(),
        other => other.to_string(),
    }
}

/// Renders a port pair, preferring whichever side resolves to a well-known
/// name (the usual case: one side is an ephemeral client port).
pub fn ppstr(p1: u16, p2: u16) -> String {
    let s1 = portstr(p1);
    let s2 = portstr(p2);
    if s1 != p1.to_string() {
        s1
    } else if s2 != p2.to_string() {
        s2
    } else {
        format!("{p1}/{p2}")
    }
}

/// Computes a [`FieldFunc`] against a flow record, writing the network-order
/// result into `out`.
pub fn eval_func(func: FieldFunc, flow: &FlowRecord, ctx: &FuncContext, out: &mut Vec<u8>) {
    match func {
        FieldFunc::Div(a, b) => {
            let v = safe_div(flow.u64_be(a), flow.u64_be(b));
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldFunc::DivL(a, b, k) => {
            let q = safe_div(flow.u64_be(a), flow.u64_be(b));
            let bucket = if q == 0 {
                0
            } else {
                (64 - q.leading_zeros() as u64) / k.max(1)
            };
            out.extend_from_slice(&bucket.to_be_bytes());
        }
        FieldFunc::DivR(a, b, k) => {
            let q = safe_div(flow.u64_be(a), flow.u64_be(b));
            let bucket = if k == 0 { q } else { q / k };
            out.extend_from_slice(&bucket.to_be_bytes());
        }
        FieldFunc::Min(a, b) => {
            let v = flow.u64_be(a).min(flow.u64_be(b));
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldFunc::Mfreq(a, b) => {
            let va = flow.u64_be(a);
            let vb = flow.u64_be(b);
            let ca = ctx.mfreq.observe(va);
            let cb = ctx.mfreq.observe(vb);
            let v = match ca.cmp(&cb) {
                std::cmp::Ordering::Greater => va,
                std::cmp::Ordering::Less => vb,
                std::cmp::Ordering::Equal => va.max(vb),
            };
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldFunc::GeoipCountry(ip) => {
            let s = ctx.geoip.country(flow.slot(ip).as_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        FieldFunc::GeoipCity(ip) => {
            let s = ctx.geoip.city(flow.slot(ip).as_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        FieldFunc::Asn(ip) => {
            let v = ctx.geoip.asn(flow.slot(ip).as_bytes());
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldFunc::Asd(ip) => {
            let s = ctx.geoip.asd(flow.slot(ip).as_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        FieldFunc::Tfstr(flags) => {
            let byte = flow.slot(flags).as_bytes().first().copied().unwrap_or(0);
            out.extend_from_slice(tcp_flags_str(byte).as_bytes());
        }
        FieldFunc::Portstr(port) => {
            let v = flow.u64_be(port) as u16;
            out.extend_from_slice(portstr(v).as_bytes());
        }
        FieldFunc::Ppstr(p1, p2) => {
            let v1 = flow.u64_be(p1) as u16;
            let v2 = flow.u64_be(p2) as u16;
            out.extend_from_slice(ppstr(v1, v2).as_bytes());
        }
    }
}

/// Writes a plain (non-function) field's raw bytes to `out`, inverting them
/// bitwise first when `descending` is set so ascending OKVS iteration yields
/// descending numeric order (spec.md §3 invariant 2, §9's preserve-as-is
/// note on 8/16-bit descending fields not being endian-converted before the
/// inversion — the inversion below is applied to the raw network-order
/// bytes exactly as the original does, not to a host-order reinterpretation).
pub fn read_field(desc: &FieldDescriptor, flow: &FlowRecord, descending: bool, out: &mut Vec<u8>) {
    let slot = flow.slot(desc.id);
    let bytes = slot.as_bytes();
    if descending {
        out.extend(bytes.iter().map(|b| !b));
    } else {
        out.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_flags_render_plus_joined() {
        assert_eq!(tcp_flags_str(0x12), "ACK+SYN");
        assert_eq!(tcp_flags_str(0x00), "-");
    }

    #[test]
    fn div_by_zero_is_zero() {
        assert_eq!(safe_div(10, 0), 0);
    }

    #[test]
    fn descending_inversion_is_bitwise_not() {
        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Octets, &100u64.to_be_bytes());
        let desc = crate::field::descriptor(FieldId::Octets);
        let mut out = Vec::new();
        read_field(desc, &flow, true, &mut out);
        let expected: Vec<u8> = 100u64.to_be_bytes().iter().map(|b| !b).collect();
        assert_eq!(out, expected);
    }
}
