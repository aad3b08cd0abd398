//! The declarative field table — one row per raw/virtual flow-record slot.
//!
//! Computed ("function") fields such as `div(a,b)` are *not* rows here: they
//! are parsed out of a fieldset's textual field list into a
//! [`crate::field::FieldFunc`] that references two of these raw rows. See
//! `mo::fieldset` for that parse step.

/// Stable identifier for a flow-record slot. Doubles as the index into
/// [`crate::flow::FlowRecord::slots`] — the Rust model's stand-in for the
/// original's per-field `nf_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum FieldId {
    Ipv4Src,
    Ipv4Dst,
    Ipv6Src,
    Ipv6Dst,
    PortSrc,
    PortDst,
    Proto,
    TcpFlags,
    Octets,
    Packets,
    IfIndexIn,
    IfIndexOut,
    Tos,
    Ttl,
    MacSrc,
    MacDst,
    Vlan,
    DnsName,
    DnsIp,
    Sni,
    DeviceIp,
    DeviceId,
    DeviceMark,
    SamplingRate,
}

/// Count of [`FieldId`] variants; kept in sync by the unit test at the
/// bottom of this file.
pub const FIELD_COUNT: usize = 24;

/// Filter-DSL / key-layout value kind, per spec.md §3 "Filter expression".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 4-byte IPv4 address, matched with `IP[/mask]` literals.
    Addr4,
    /// 16-byte IPv6 address.
    Addr6,
    /// Fixed-width unsigned integer, matched with `N` or `N-M` ranges.
    Range,
    /// 6-byte MAC address.
    Mac,
    /// Variable-length text, matched with `'literal'`.
    StringField,
}

/// One row of the declarative field table.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// Stable id, also the slot index.
    pub id: FieldId,
    /// Identifier used in the filter DSL and in `fields: [...]` config lists.
    pub name: &'static str,
    /// Human-readable description, used only in the inspect CLI's dump.
    pub display_desc: &'static str,
    /// Filter/key value kind.
    pub ty: FieldType,
    /// Size in bytes of the raw encoding.
    pub size: usize,
    /// Whether this field is a measure (summed across flows) rather than a
    /// key component.
    pub aggregable: bool,
}

macro_rules! field_row {
    ($id:ident, $name:literal, $desc:literal, $ty:expr, $size:expr, $aggr:expr) => {
        FieldDescriptor {
            id: FieldId::$id,
            name: $name,
            display_desc: $desc,
            ty: $ty,
            size: $size,
            aggregable: $aggr,
        }
    };
}

/// The single source of truth for every known field. Order does not matter;
/// lookups are by `id`/`name`, never positional.
pub const FIELDS: &[FieldDescriptor] = &[
    field_row!(Ipv4Src, "ip4.src", "IPv4 source address", FieldType::Addr4, 4, false),
    field_row!(Ipv4Dst, "ip4.dst", "IPv4 destination address", FieldType::Addr4, 4, false),
    field_row!(Ipv6Src, "ip6.src", "IPv6 source address", FieldType::Addr6, 16, false),
    field_row!(Ipv6Dst, "ip6.dst", "IPv6 destination address", FieldType::Addr6, 16, false),
    field_row!(PortSrc, "port.src", "L4 source port", FieldType::Range, 2, false),
    field_row!(PortDst, "port.dst", "L4 destination port", FieldType::Range, 2, false),
    field_row!(Proto, "proto", "IP protocol number", FieldType::Range, 1, false),
    field_row!(TcpFlags, "tcp.flags", "TCP flags byte", FieldType::Range, 1, false),
    field_row!(Octets, "octets", "byte count", FieldType::Range, 8, true),
    field_row!(Packets, "packets", "packet count", FieldType::Range, 8, true),
    field_row!(IfIndexIn, "if.in", "input interface index", FieldType::Range, 4, false),
    field_row!(IfIndexOut, "if.out", "output interface index", FieldType::Range, 4, false),
    field_row!(Tos, "tos", "type of service", FieldType::Range, 1, false),
    field_row!(Ttl, "ttl", "time to live", FieldType::Range, 1, false),
    field_row!(MacSrc, "mac.src", "source MAC address", FieldType::Mac, 6, false),
    field_row!(MacDst, "mac.dst", "destination MAC address", FieldType::Mac, 6, false),
    field_row!(Vlan, "vlan", "VLAN tag", FieldType::Range, 2, false),
    field_row!(DnsName, "dns.name", "sniffed DNS answer name", FieldType::StringField, 128, false),
    field_row!(DnsIp, "dns.ip", "sniffed DNS answer address", FieldType::StringField, 46, false),
    field_row!(Sni, "tls.sni", "sniffed TLS SNI hostname", FieldType::StringField, 128, false),
    field_row!(DeviceIp, "device.ip", "exporting device address", FieldType::Addr4, 4, false),
    field_row!(DeviceId, "device.id", "exporting device id", FieldType::Range, 4, false),
    field_row!(DeviceMark, "device.mark", "operator-assigned device mark", FieldType::Range, 4, false),
    field_row!(SamplingRate, "device.sampling", "per-device sampling multiplier", FieldType::Range, 4, false),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_count_matches_table_len() {
        assert_eq!(FIELDS.len(), FIELD_COUNT);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = FIELDS.iter().map(|f| f.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FIELDS.len());
    }
}
