//! Top-K classification: per-class aggregator producing top-N% directory
//! trees, with a reverse-lookup DB reloaded from disk after every merge
//! (spec.md §4.7, [MODULE G]).

use crate::bank::Bank;
use crate::error::{FlowError, Result};
use crate::field::accessor::FuncContext;
use crate::field::{self, FieldId};
use crate::flow::FlowRecord;
use crate::mo::config::ClsfConfig;
use crate::mo::fieldset::{render_key_parts, Fieldset};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Per-monitoring-object top-percent classifier.
pub struct Clsf {
    /// Class id, `[0, CLASSES_MAX)`.
    pub class_id: u32,
    /// Key fieldset (no aggregable fields expected; `measure` is separate).
    pub fieldset: Fieldset,
    /// The single aggregable measure field.
    pub measure: FieldId,
    /// Merge period.
    pub time: Duration,
    /// Cumulative percentage cutoff.
    pub top_percents: f64,
    banks: Vec<Bank>,
    reverse: RwLock<HashMap<Vec<u8>, String>>,
    dropped_oom: AtomicU64,
    last_export_unix: AtomicU64,
}

impl Clsf {
    /// Builds a CLSF instance with one bank per ingest thread.
    pub fn new(cfg: &ClsfConfig, num_threads: usize, bank_limit_bytes: usize) -> Result<Self> {
        let fieldset = Fieldset::parse(&cfg.fields)?;
        let measure = field::lookup(&cfg.val)?.id;
        let banks = (0..num_threads).map(|_| Bank::new(bank_limit_bytes)).collect();
        Ok(Self {
            class_id: cfg.id,
            fieldset,
            measure,
            time: Duration::from_secs(cfg.time),
            top_percents: cfg.top_percents,
            banks,
            reverse: RwLock::new(HashMap::new()),
            dropped_oom: AtomicU64::new(0),
            last_export_unix: AtomicU64::new(0),
        })
    }

    /// Whether a merge pass is due: `classification.c`'s
    /// `classification_merge_rec` fires once `last_export + time <= now`,
    /// an additive (not boundary-aligned) cadence, unlike FWM's.
    pub fn due(&self, now_unix: u64) -> bool {
        let last = self.last_export_unix.load(Ordering::Relaxed);
        last.saturating_add(self.time.as_secs()) <= now_unix
    }

    /// Records that a merge pass ran at `now_unix`.
    pub fn mark_exported(&self, now_unix: u64) {
        self.last_export_unix.store(now_unix, Ordering::Relaxed);
    }

    /// Records one matching flow and, if its key is already classified,
    /// writes the class label into the flow record for downstream debug use.
    pub fn produce(&self, thread_id: usize, flow: &mut FlowRecord, ctx: &FuncContext, sampling_rate: u64) -> Result<()> {
        let key = self.fieldset.build_key(flow, ctx);
        let incoming = flow.u64_be(self.measure).saturating_mul(sampling_rate.max(1));

        let result = self.banks[thread_id].write(|txn| {
            let merged = match txn.get(&key) {
                Some(existing) => {
                    let prev = u64::from_be_bytes(existing.try_into().unwrap_or([0; 8]));
                    prev.saturating_add(incoming)
                }
                None => incoming,
            };
            txn.put(&key, &merged.to_be_bytes())
        });

        match result {
            Ok(()) => {}
            Err(FlowError::OutOfMemory { .. }) => {
                self.dropped_oom.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }

        if let Some(label) = self.reverse.read().get(&key) {
            flow.classified_as = Some(label.clone());
        }
        Ok(())
    }

    fn merge_banks(&self) -> BTreeMap<Vec<u8>, u64> {
        let mut acc: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for bank in &self.banks {
            let mut cursor = bank.swap();
            while let Some((k, v)) = cursor.next() {
                let val = u64::from_be_bytes(v.try_into().unwrap_or([0; 8]));
                acc.entry(k.to_vec()).and_modify(|e| *e = e.saturating_add(val)).or_insert(val);
            }
        }
        acc
    }

    /// Runs one merge cycle: drain, sort descending, walk writing class
    /// directories until the cumulative ratio reaches `top_percents`, then
    /// reload the reverse-lookup DB from the directory tree.
    pub fn merge_and_classify(&self, clsf_dir: &Path, mo_name: &str) -> Result<()> {
        let merged = self.merge_banks();
        let total: u64 = merged.values().fold(0u64, |a, b| a.saturating_add(*b));
        if total == 0 {
            return Ok(());
        }

        let mut ordered: BTreeMap<Vec<u8>, (Vec<u8>, u64)> = BTreeMap::new();
        for (key, value) in merged {
            let mut order_key: Vec<u8> = value.to_be_bytes().iter().map(|b| !b).collect();
            order_key.extend_from_slice(&key);
            ordered.insert(order_key, (key, value));
        }

        let class_dir = clsf_dir.join(mo_name).join(self.class_id.to_string());
        std::fs::create_dir_all(&class_dir)?;

        let mut cumulative: u64 = 0;
        for (_, (key, value)) in ordered {
            cumulative = cumulative.saturating_add(value);
            let percent = (cumulative as f64 / total as f64) * 100.0;
            let dirname = render_key_dirname(&self.fieldset, &key);
            let dir = class_dir.join(&dirname);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("name"), render_label(&self.fieldset, &key))?;
            std::fs::write(dir.join("stats"), format!("{value} of {total}, {percent:.2}%\n"))?;
            if percent >= self.top_percents {
                break;
            }
        }

        match reload_reverse_lookup(&class_dir, &self.fieldset) {
            Ok(map) => *self.reverse.write() = map,
            Err(err) => warn!(mo = mo_name, class = self.class_id, error = %err, "clsf reverse-lookup reload failed, keeping previous table"),
        }
        Ok(())
    }
}

fn render_key_dirname(fieldset: &Fieldset, key: &[u8]) -> String {
    let mut offset = 0;
    let mut parts = Vec::with_capacity(fieldset.key_specs.len());
    for spec in &fieldset.key_specs {
        let size = spec.size();
        let bytes = &key[offset..offset + size];
        parts.push(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>());
        offset += size;
    }
    parts.join("-")
}

fn render_label(fieldset: &Fieldset, key: &[u8]) -> String {
    render_key_parts(fieldset, key).join(",")
}

fn reload_reverse_lookup(class_dir: &Path, fieldset: &Fieldset) -> Result<HashMap<Vec<u8>, String>> {
    let mut map = HashMap::new();
    let expected_len: usize = fieldset.key_len() * 2; // hex-encoded
    for entry in std::fs::read_dir(class_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dirname = entry.file_name();
        let dirname = dirname.to_string_lossy();
        let hex: String = dirname.chars().filter(|c| *c != '-').collect();
        if hex.len() != expected_len {
            continue;
        }
        let mut key = Vec::with_capacity(fieldset.key_len());
        let mut ok = true;
        let bytes = hex.as_bytes();
        for chunk in bytes.chunks(2) {
            match std::str::from_utf8(chunk).ok().and_then(|s| u8::from_str_radix(s, 16).ok()) {
                Some(b) => key.push(b),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let name_path = entry.path().join("name");
        if let Ok(label) = std::fs::read_to_string(name_path) {
            map.insert(key, label);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::accessor::{MfreqTable, NullGeoip};

    #[test]
    fn top_percent_walk_stops_at_cutoff() {
        let cfg = ClsfConfig {
            id: 0,
            fields: vec!["port.src".into()],
            val: "octets".into(),
            time: 60,
            top_percents: 60.0,
        };
        let clsf = Clsf::new(&cfg, 1, 1 << 20).unwrap();
        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let fctx = FuncContext { mfreq: &mfreq, geoip: &geoip };

        let values = [1000u64, 500, 250, 125, 64, 32, 16, 8, 4, 2];
        for (i, v) in values.iter().enumerate() {
            let mut flow = FlowRecord::new();
            flow.set_raw(FieldId::PortSrc, &(i as u16).to_be_bytes());
            flow.set_raw(FieldId::Octets, &v.to_be_bytes());
            clsf.produce(0, &mut flow, &fctx, 1).unwrap();
        }

        let tmp = tempfile::tempdir().unwrap();
        clsf.merge_and_classify(tmp.path(), "mo1").unwrap();

        let class_dir = tmp.path().join("mo1").join("0");
        let written: Vec<_> = std::fs::read_dir(&class_dir).unwrap().collect();
        // top two keys (1000, 500) already sum to 1500/2001 ~ 75%, so the
        // walk should stop after the second row.
        assert_eq!(written.len(), 2);
    }
}
