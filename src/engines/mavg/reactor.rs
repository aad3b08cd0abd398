//! MAVG overlimit reactor: drains per-thread violation banks into the
//! MO-global store and drives the NEW → UPDATE ↔ ALMOST_GONE → GONE state
//! machine (spec.md §4.6 "Reactor task").

use super::limits::{LimitSet, MavgLimitRule};
use super::{decay, decode_row, Mavg, ViolState, Violation};
use crate::engines::fwm::Fwm;
use crate::mo::fieldset::render_key_parts;
use crate::process::spawn_detached;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const REWRITE_INTERVAL_NANOS: u64 = 3_000_000_000;

/// Runs one overlimit reactor pass: flips the per-thread violation bank
/// selector, drains every thread, merges observations into the MO-global
/// store, then walks the state machine.
pub fn run_overlimit_pass(mavg: &Mavg, mo_name: &str, notif_dir: &Path, fwms: &HashMap<String, Fwm>, now_nanos: u64) -> crate::error::Result<()> {
    let n = mavg.fieldset.value_fields.len();
    let limits = mavg.overlimit.active();

    let mut drained: HashMap<Vec<u8>, (Vec<f64>, u64)> = HashMap::new();
    for bank in &mavg.overlimit_banks {
        let mut cursor = bank.swap();
        while let Some((k, v)) = cursor.next() {
            let (values, ts) = decode_row(v, n);
            drained
                .entry(k.to_vec())
                .and_modify(|(existing, existing_ts)| {
                    if ts >= *existing_ts {
                        *existing = values.clone();
                        *existing_ts = ts;
                    }
                })
                .or_insert((values, ts));
        }
    }

    {
        let mut store = mavg.overlimit_store.write();
        for (viol_key, (values, ts)) in drained {
            merge_observation(&mut store, &viol_key, &limits, values, ts);
        }
    }

    walk_store(&mavg.overlimit_store, mavg, mo_name, notif_dir, fwms, now_nanos, true);
    debug!(mo = mo_name, mavg = %mavg.name, "mavg overlimit reactor pass");
    Ok(())
}

/// Merges one observed `(key ++ limit_idx, value, timestamp)` triple into a
/// violation store per spec.md §4.6 "Merge rules": refresh an `UPDATE`,
/// resurrect a `GONE` slot to `NEW`, else insert fresh.
pub(crate) fn merge_observation(store: &mut HashMap<Vec<u8>, Violation>, viol_key: &[u8], limits: &LimitSet, values: Vec<f64>, ts: u64) {
    let limit_idx = *viol_key.last().unwrap_or(&0) as usize;
    let key = &viol_key[..viol_key.len().saturating_sub(1)];
    let threshold = limits.rules.get(limit_idx).map(|r| r.threshold_for(key).to_vec()).unwrap_or_default();
    match store.get_mut(viol_key) {
        Some(v) if v.state == ViolState::Gone => {
            *v = Violation {
                state: ViolState::New,
                limit_idx,
                val: values,
                limit: threshold,
                time_last_nanos: ts,
                time_back2norm_nanos: 0,
                last_file_write_nanos: 0,
            };
        }
        Some(v) => {
            v.time_last_nanos = ts;
            v.val = values;
            v.limit = threshold;
        }
        None => {
            store.insert(
                viol_key.to_vec(),
                Violation {
                    state: ViolState::New,
                    limit_idx,
                    val: values,
                    limit: threshold,
                    time_last_nanos: ts,
                    time_back2norm_nanos: 0,
                    last_file_write_nanos: 0,
                },
            );
        }
    }
}

fn merged_value(mavg: &Mavg, key: &[u8], now_nanos: u64, n: usize, window_nanos: u64) -> Vec<f64> {
    let mut mv = vec![0.0f64; n];
    for okvs in &mavg.value_banks {
        if let Some(existing) = okvs.get(key) {
            let (values, ts) = decode_row(&existing, n);
            for i in 0..n {
                mv[i] += decay(values[i], ts, now_nanos, window_nanos, 0.0);
            }
        }
    }
    mv
}

/// Walks a violation store (overlimit or underlimit) applying the state
/// machine in spec.md §4.6 "Walk the global store". Shared between
/// [`run_overlimit_pass`] and the underlimit checker, which differ only in
/// which rule set and store they use and the breach polarity.
pub(crate) fn walk_store(
    store_lock: &RwLock<HashMap<Vec<u8>, Violation>>,
    mavg: &Mavg,
    mo_name: &str,
    notif_dir: &Path,
    fwms: &HashMap<String, Fwm>,
    now_nanos: u64,
    overlimit: bool,
) {
    let n = mavg.fieldset.value_fields.len();
    let window_nanos = mavg.window.as_nanos() as u64;
    let w_secs = mavg.window.as_secs_f64().max(1e-9);
    let limits = if overlimit { mavg.overlimit.active() } else { mavg.underlimit.active() };

    let mut store = store_lock.write();
    let keys: Vec<Vec<u8>> = store.keys().cloned().collect();
    for viol_key in keys {
        let (limit_idx, threshold) = match store.get(&viol_key) {
            Some(v) => (v.limit_idx, v.limit.clone()),
            None => continue,
        };
        let rule = match limits.rules.get(limit_idx) {
            Some(r) => r.clone(),
            None => continue,
        };
        let key = viol_key[..viol_key.len().saturating_sub(1)].to_vec();
        let mv = merged_value(mavg, &key, now_nanos, n, window_nanos);
        let still = if overlimit {
            !mv.is_empty() && (0..n).all(|i| mv[i] / w_secs >= threshold.get(i).copied().unwrap_or(u64::MAX) as f64)
        } else {
            !mv.is_empty() && (0..n).all(|i| mv[i] / w_secs < threshold.get(i).copied().unwrap_or(0) as f64)
        };

        let viol = store.get_mut(&viol_key).expect("key observed above under the same lock");
        match viol.state {
            ViolState::New => {
                write_notification(notif_dir, mo_name, &mavg.name, &rule, mavg, &key, &viol.val, &viol.limit);
                spawn_detached(&rule.action_script, &action_args(notif_dir, mo_name, &mavg.name, &rule, mavg, &key, &viol.val, &viol.limit));
                for ext in &rule.ext {
                    if let Some(fwm) = fwms.get(ext) {
                        fwm.set_active(true);
                    }
                }
                viol.state = ViolState::Update;
                viol.last_file_write_nanos = now_nanos;
            }
            ViolState::Update => {
                if still {
                    if now_nanos.saturating_sub(viol.last_file_write_nanos) >= REWRITE_INTERVAL_NANOS {
                        write_notification(notif_dir, mo_name, &mavg.name, &rule, mavg, &key, &viol.val, &viol.limit);
                        viol.last_file_write_nanos = now_nanos;
                    }
                } else {
                    viol.state = ViolState::AlmostGone;
                    viol.time_back2norm_nanos = now_nanos;
                }
            }
            ViolState::AlmostGone => {
                if still {
                    viol.state = ViolState::Update;
                } else if now_nanos.saturating_sub(viol.time_back2norm_nanos) >= rule.back2norm_time_nanos {
                    remove_notification(notif_dir, mo_name, &mavg.name, &rule, mavg, &key);
                    spawn_detached(&rule.back2norm_script, &action_args(notif_dir, mo_name, &mavg.name, &rule, mavg, &key, &viol.val, &viol.limit));
                    for ext in &rule.ext {
                        if let Some(fwm) = fwms.get(ext) {
                            fwm.set_active(false);
                        }
                    }
                    viol.state = ViolState::Gone;
                }
            }
            ViolState::Gone => {}
        }
    }
}

fn key_dashed(mavg: &Mavg, key: &[u8]) -> String {
    render_key_parts(&mavg.fieldset, key).join("-")
}

fn notif_path(notif_dir: &Path, mo_name: &str, mavg_name: &str, rule_name: &str, dashed: &str) -> PathBuf {
    notif_dir.join(mo_name).join(format!("{mavg_name}-{rule_name}-{dashed}"))
}

fn render_vec(values: &[f64]) -> String {
    values.iter().map(|v| format!("{v:.2}")).collect::<Vec<_>>().join(",")
}

/// Writes `{notif-dir}/<mo>/<mavg>-<limit>-<key-dashed>` (spec.md §6
/// "Notification file"): `"{rendered key fields} {val} {limit}\n"`.
pub(crate) fn write_notification(notif_dir: &Path, mo_name: &str, mavg_name: &str, rule: &MavgLimitRule, mavg: &Mavg, key: &[u8], val: &[f64], limit: &[u64]) {
    let dashed = key_dashed(mavg, key);
    let path = notif_path(notif_dir, mo_name, mavg_name, &rule.name, &dashed);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let fields = render_key_parts(&mavg.fieldset, key).join(" ");
    let limit_str = limit.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
    let _ = std::fs::write(path, format!("{fields} {} {limit_str}\n", render_vec(val)));
}

/// Unlinks the notification file on back-to-normal.
pub(crate) fn remove_notification(notif_dir: &Path, mo_name: &str, mavg_name: &str, rule: &MavgLimitRule, mavg: &Mavg, key: &[u8]) {
    let dashed = key_dashed(mavg, key);
    let path = notif_path(notif_dir, mo_name, mavg_name, &rule.name, &dashed);
    let _ = std::fs::remove_file(path);
}

/// Builds the `execve` argv for an action/back2norm script (spec.md §6
/// "Action script invocation").
pub(crate) fn action_args(notif_dir: &Path, mo_name: &str, mavg_name: &str, rule: &MavgLimitRule, mavg: &Mavg, key: &[u8], val: &[f64], limit: &[u64]) -> Vec<String> {
    let dashed = key_dashed(mavg, key);
    let path = notif_path(notif_dir, mo_name, mavg_name, &rule.name, &dashed);
    let mut args = vec![mo_name.to_string(), mavg_name.to_string(), rule.name.clone(), path.display().to_string()];
    args.extend(render_key_parts(&mavg.fieldset, key));
    args.push(render_vec(val));
    args.push(limit.iter().map(u64::to_string).collect::<Vec<_>>().join(","));
    args
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
            overlimit: vec![MavgLimitConfig {
                name: "lim1".into(),
                limits: None,
                default: vec![10],
                action_script: "/bin/true".into(),
                back2norm_script: "/bin/true".into(),
                back2norm_time: 0,
                ext: Vec::new(),
            }],
            underlimit: Vec::new(),
        }
    }

    #[test]
    fn new_violation_fires_notification_and_transitions_to_update() {
        let mavg = Mavg::new(&cfg(), 1, 1 << 20, 0).unwrap();
        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let fctx = FuncContext { mfreq: &mfreq, geoip: &geoip };

        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Ipv4Src, &[10, 0, 0, 1]);
        flow.set_raw(FieldId::Octets, &1000u64.to_be_bytes());
        mavg.produce(0, &flow, &fctx, 1, 0).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let fwms = HashMap::new();
        run_overlimit_pass(&mavg, "mo1", tmp.path(), &fwms, 0).unwrap();

        let store = mavg.overlimit_store.read();
        assert_eq!(store.len(), 1);
        let viol = store.values().next().unwrap();
        assert_eq!(viol.state, ViolState::Update);

        let mo_dir = tmp.path().join("mo1");
        let written: Vec<_> = std::fs::read_dir(&mo_dir).unwrap().collect();
        assert_eq!(written.len(), 1);
    }
}
