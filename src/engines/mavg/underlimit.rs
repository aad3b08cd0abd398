//! Under-limit checker: scans the merged decayed-value arenas looking for
//! keys that have fallen *below* a configured floor (spec.md §4.6
//! "Under-limit pass"), reusing the overlimit reactor's state machine with
//! the breach polarity flipped.

use super::reactor::{merge_observation, walk_store};
use super::{decay, decode_row, Mavg};
use crate::engines::fwm::Fwm;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Runs one underlimit pass. A no-op until at least one full window has
/// elapsed since the MO was created, since a key with no traffic yet isn't
/// meaningfully "below" anything (spec.md §4.6 "Under-limit pass, warm-up").
pub fn run_underlimit_pass(mavg: &Mavg, mo_name: &str, notif_dir: &Path, fwms: &HashMap<String, Fwm>, now_nanos: u64) -> crate::error::Result<()> {
    let rules = mavg.underlimit.active();
    if rules.rules.is_empty() {
        return Ok(());
    }
    let window_nanos = mavg.window.as_nanos() as u64;
    if now_nanos.saturating_sub(mavg.created_at_nanos) < window_nanos {
        return Ok(());
    }

    let n = mavg.fieldset.value_fields.len();
    let w_secs = mavg.window.as_secs_f64().max(1e-9);

    let mut merged: HashMap<Vec<u8>, Vec<f64>> = HashMap::new();
    for okvs in &mavg.value_banks {
        let mut cursor = okvs.cursor();
        while let Some((k, v)) = cursor.next() {
            let (values, ts) = decode_row(v, n);
            let entry = merged.entry(k.to_vec()).or_insert_with(|| vec![0.0; n]);
            for i in 0..n {
                entry[i] += decay(values[i], ts, now_nanos, window_nanos, 0.0);
            }
        }
    }

    {
        let mut store = mavg.underlimit_store.write();
        for (key, mv) in &merged {
            for (limit_idx, rule) in rules.rules.iter().enumerate() {
                let threshold = rule.threshold_for(key);
                let below = (0..n).all(|i| {
                    let t = threshold.get(i).copied().unwrap_or(0);
                    mv[i] / w_secs < t as f64
                });
                if below {
                    let mut viol_key = key.clone();
                    viol_key.push(limit_idx as u8);
                    merge_observation(&mut store, &viol_key, &rules, mv.clone(), now_nanos);
                }
            }
        }
    }

    walk_store(&mavg.underlimit_store, mavg, mo_name, notif_dir, fwms, now_nanos, false);
    debug!(mo = mo_name, mavg = %mavg.name, "mavg underlimit pass");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::accessor::{FuncContext, MfreqTable, NullGeoip};
    use crate::field::FieldId;
    use crate::flow::FlowRecord;
    use crate::mo::config::{MavgConfig, MavgLimitConfig};

    fn cfg() -> MavgConfig {
        MavgConfig {
            name: "m1".into(),
            fields: vec!["ip4.src".into(), "octets".into()],
            time: 1,
            dump: None,
            mem_m: 1,
            overlimit: Vec::new(),
            underlimit: vec![MavgLimitConfig {
                name: "floor".into(),
                limits: None,
                default: vec![1_000_000],
                action_script: "/bin/true".into(),
                back2norm_script: "/bin/true".into(),
                back2norm_time: 0,
                ext: Vec::new(),
            }],
        }
    }

    #[test]
    fn quiet_key_after_warmup_triggers_underlimit_notification() {
        let mavg = Mavg::new(&cfg(), 1, 1 << 20, 0).unwrap();
        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let fctx = FuncContext { mfreq: &mfreq, geoip: &geoip };

        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Ipv4Src, &[10, 0, 0, 1]);
        flow.set_raw(FieldId::Octets, &10u64.to_be_bytes());
        mavg.produce(0, &flow, &fctx, 1, 0).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let fwms = HashMap::new();
        // Before warm-up elapses, nothing should be recorded.
        run_underlimit_pass(&mavg, "mo1", tmp.path(), &fwms, 500_000_000).unwrap();
        assert!(mavg.underlimit_store.read().is_empty());

        run_underlimit_pass(&mavg, "mo1", tmp.path(), &fwms, 2_000_000_000).unwrap();
        assert_eq!(mavg.underlimit_store.read().len(), 1);
    }
}
