//! The flow record — the input to [`crate::dispatch`], owned transiently by
//! one dispatch call and never shared across threads (spec.md §3 "Flow
//! record").

use crate::field::table::FIELD_COUNT;
use crate::field::FieldId;

/// One flow-record slot: raw network-order bytes, the number of bytes
/// actually present, and whether the decoder populated it at all. Mirrors
/// the original's "raw bytes + recorded size + presence flag" contract.
#[derive(Debug, Clone, Copy)]
pub struct FlowSlot {
    bytes: [u8; 16],
    size: u8,
    present: bool,
}

impl Default for FlowSlot {
    fn default() -> Self {
        Self {
            bytes: [0; 16],
            size: 0,
            present: false,
        }
    }
}

impl FlowSlot {
    /// Raw bytes, truncated to the recorded size.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Whether the decoder populated this slot.
    pub fn is_present(&self) -> bool {
        self.present
    }
}

/// A flat, fixed-layout flow record. Populated by an external decoder
/// (out of scope per spec.md §1); this struct is the contract the decoder
/// must fill in.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    slots: [FlowSlot; FIELD_COUNT],
    /// Per-device sampling multiplier applied before aggregation.
    pub sampling_rate: u64,
    /// Set by module J when a DNS answer was sniffed from the sFlow payload.
    pub has_dns: bool,
    /// Set by module J when a TLS SNI was sniffed from the sFlow payload.
    pub has_sni: bool,
    /// Class name written by a CLSF lookup hit, consumed only by debug dump.
    pub classified_as: Option<String>,
}

impl Default for FlowRecord {
    fn default() -> Self {
        Self {
            slots: [FlowSlot::default(); FIELD_COUNT],
            sampling_rate: 1,
            has_dns: false,
            has_sni: false,
            classified_as: None,
        }
    }
}

impl FlowRecord {
    /// Creates an empty record with sampling rate 1 and no fields present.
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates a slot with up to 16 raw network-order bytes.
    pub fn set_raw(&mut self, id: FieldId, bytes: &[u8]) {
        let idx = id as usize;
        let slot = &mut self.slots[idx];
        let n = bytes.len().min(16);
        slot.bytes[..n].copy_from_slice(&bytes[..n]);
        slot.size = n as u8;
        slot.present = true;
    }

    /// Reads a slot by field id.
    pub fn slot(&self, id: FieldId) -> &FlowSlot {
        &self.slots[id as usize]
    }

    /// Convenience accessor for a big-endian unsigned integer slot (used by
    /// function fields). Returns 0 for any width other than 4 or 8 bytes,
    /// matching the original's `monit_object_nf_val` fallback.
    pub fn u64_be(&self, id: FieldId) -> u64 {
        let slot = self.slot(id);
        match slot.size {
            8 => u64::from_be_bytes(slot.bytes[..8].try_into().unwrap()),
            4 => u32::from_be_bytes(slot.bytes[..4].try_into().unwrap()) as u64,
            _ => 0,
        }
    }
}
