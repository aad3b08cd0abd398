//! Moving-average sliding-window counters with over/under-limit detection,
//! notification files, and action-script launch (spec.md §4.6, [MODULE F]).
//!
//! The per-flow decayed-counter maintenance lives in [`Mavg::produce`]; the
//! reactor, underlimit checker, and dumper are background tasks split into
//! sibling modules since each polls on its own cadence (spec.md §5 "four
//! background tasks poll each monitoring object").

pub mod dumper;
pub mod limits;
pub mod reactor;
pub mod underlimit;

use crate::bank::Bank;
use crate::error::{FlowError, Result};
use crate::field::accessor::FuncContext;
use crate::flow::FlowRecord;
use crate::mo::config::MavgConfig;
use crate::mo::fieldset::Fieldset;
use crate::okvs::Okvs;
use limits::LimitSets;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// The per-violation state machine's state (spec.md §3 "mavg_lim_data").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolState {
    /// First observation of a breach this cycle.
    New,
    /// Ongoing breach; notification file rewritten every 3 seconds.
    Update,
    /// No longer breaching; waiting out the back-to-normal dwell.
    AlmostGone,
    /// Back-to-normal fired; slot is a cheap revive target.
    Gone,
}

/// One active over/under-limit violation tracked by the MO-global store.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Current state-machine state.
    pub state: ViolState,
    /// Index into the active [`limits::LimitSet`]'s rule vector.
    pub limit_idx: usize,
    /// Last-observed per-field decayed value.
    pub val: Vec<f64>,
    /// Threshold in effect when this violation was last observed.
    pub limit: Vec<u64>,
    /// Nanosecond timestamp of the last observation.
    pub time_last_nanos: u64,
    /// Nanosecond timestamp the violation first stopped breaching.
    pub time_back2norm_nanos: u64,
    /// Nanosecond timestamp the notification file was last (re)written.
    pub last_file_write_nanos: u64,
}

fn encode_row(values: &[f64], last_update_nanos: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8 + 8);
    for v in values {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.extend_from_slice(&last_update_nanos.to_be_bytes());
    out
}

fn decode_row(bytes: &[u8], n: usize) -> (Vec<f64>, u64) {
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let start = i * 8;
        let chunk: [u8; 8] = bytes.get(start..start + 8).and_then(|s| s.try_into().ok()).unwrap_or([0u8; 8]);
        values.push(f64::from_be_bytes(chunk));
    }
    let ts_start = n * 8;
    let ts_chunk: [u8; 8] = bytes.get(ts_start..ts_start + 8).and_then(|s| s.try_into().ok()).unwrap_or([0u8; 8]);
    (values, u64::from_be_bytes(ts_chunk))
}

/// Exponential decay of a previous value `v0` observed at `t0` to `now`,
/// adding `inc` (spec.md §4.6 step 4): `v0 - (t-t0)/W*v0 + inc` while still
/// inside the window, else a fresh `inc`.
fn decay(v0: f64, t0: u64, now: u64, window_nanos: u64, inc: f64) -> f64 {
    if window_nanos == 0 {
        return inc;
    }
    let dt = now.saturating_sub(t0);
    if dt < window_nanos {
        v0 - (dt as f64 / window_nanos as f64) * v0 + inc
    } else {
        inc
    }
}

/// Per-monitoring-object moving-average engine.
pub struct Mavg {
    /// Instance name, used in notification/dump file names.
    pub name: String,
    /// Parsed fieldset: key components + aggregable value fields.
    pub fieldset: Fieldset,
    /// Decay window.
    pub window: Duration,
    /// Periodic dump interval, independent of the `.d`/`.a` trigger-file
    /// mechanism the dumper task actually polls (spec.md §4.6).
    pub dump_period: Option<Duration>,
    /// Over-limit rule sets, hot-swappable.
    pub overlimit: LimitSets,
    /// Under-limit rule sets, hot-swappable.
    pub underlimit: LimitSets,
    value_banks: Vec<Okvs>,
    overlimit_banks: Vec<Bank>,
    db_full: Vec<AtomicBool>,
    overlimit_store: RwLock<HashMap<Vec<u8>, Violation>>,
    underlimit_store: RwLock<HashMap<Vec<u8>, Violation>>,
    created_at_nanos: u64,
    dropped_oom: AtomicU64,
}

impl Mavg {
    /// Builds a MAVG instance with one decayed-value arena and one overlimit
    /// violation bank per ingest thread.
    pub fn new(cfg: &MavgConfig, num_threads: usize, violation_bank_limit_bytes: usize, created_at_nanos: u64) -> Result<Self> {
        let fieldset = Fieldset::parse(&cfg.fields)?;
        let value_limit_bytes = (cfg.mem_m as usize).saturating_mul(1 << 20);
        let value_banks = (0..num_threads).map(|_| Okvs::new(value_limit_bytes)).collect();
        let overlimit_banks = (0..num_threads).map(|_| Bank::new(violation_bank_limit_bytes)).collect();
        let overlimit = LimitSets::load(&cfg.overlimit, &fieldset)?;
        let underlimit = LimitSets::load(&cfg.underlimit, &fieldset)?;
        Ok(Self {
            name: cfg.name.clone(),
            fieldset,
            window: Duration::from_secs(cfg.time.max(1)),
            dump_period: cfg.dump.map(Duration::from_secs),
            overlimit,
            underlimit,
            value_banks,
            overlimit_banks,
            db_full: (0..num_threads).map(|_| AtomicBool::new(false)).collect(),
            overlimit_store: RwLock::new(HashMap::new()),
            underlimit_store: RwLock::new(HashMap::new()),
            created_at_nanos,
            dropped_oom: AtomicU64::new(0),
        })
    }

    /// Number of updates dropped so far because a per-thread arena could not
    /// be reclaimed.
    pub fn dropped_oom(&self) -> u64 {
        self.dropped_oom.load(Ordering::Relaxed)
    }

    /// Records one matching flow's aggregable fields into `thread_id`'s
    /// decayed-value arena, then checks the value merged across every
    /// thread against the active overlimit rules (spec.md §4.6 "Produce").
    pub fn produce(&self, thread_id: usize, flow: &FlowRecord, ctx: &FuncContext, sampling_rate: u64, now_nanos: u64) -> Result<()> {
        if self.db_full[thread_id].load(Ordering::Relaxed) {
            return Ok(());
        }
        let key = self.fieldset.build_key(flow, ctx);
        let n = self.fieldset.value_fields.len();
        let window_nanos = self.window.as_nanos() as u64;
        let scale = sampling_rate.max(1) as f64;
        let inc: Vec<f64> = self.fieldset.value_fields.iter().map(|id| flow.u64_be(*id) as f64 * scale).collect();

        let v1 = self.store_decayed(thread_id, &key, &inc, now_nanos, window_nanos)?;

        let mut mv = v1;
        for (idx, other) in self.value_banks.iter().enumerate() {
            if idx == thread_id {
                continue;
            }
            if let Some(existing) = other.get(&key) {
                let (values, ts) = decode_row(&existing, n);
                for i in 0..n {
                    mv[i] += decay(values[i], ts, now_nanos, window_nanos, 0.0);
                }
            }
        }

        self.check_overlimit(thread_id, &key, &mv, now_nanos);
        Ok(())
    }

    fn store_decayed(&self, thread_id: usize, key: &[u8], inc: &[f64], now_nanos: u64, window_nanos: u64) -> Result<Vec<f64>> {
        let okvs = &self.value_banks[thread_id];
        let decayed = |okvs: &Okvs| -> Vec<f64> {
            match okvs.get(key) {
                Some(existing) => {
                    let (v0, t0) = decode_row(&existing, inc.len());
                    (0..inc.len()).map(|i| decay(v0[i], t0, now_nanos, window_nanos, inc[i])).collect()
                }
                None => inc.to_vec(),
            }
        };

        let v1 = decayed(okvs);
        let mut txn = okvs.begin();
        match txn.put(key, &encode_row(&v1, now_nanos)) {
            Ok(()) => {
                txn.commit()?;
                return Ok(v1);
            }
            Err(FlowError::OutOfMemory { .. }) => txn.rollback(),
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        }

        // Arena full: reclaim by copying forward only rows that haven't
        // aged out of the window, then retry once (spec.md §4.6 "Per-thread
        // arena full").
        okvs.retain(|_, v| {
            let (_, t0) = decode_row(v, inc.len());
            now_nanos.saturating_sub(t0) < window_nanos
        });
        let v1 = decayed(okvs);
        let mut txn = okvs.begin();
        match txn.put(key, &encode_row(&v1, now_nanos)) {
            Ok(()) => {
                txn.commit()?;
                Ok(v1)
            }
            Err(FlowError::OutOfMemory { .. }) => {
                txn.rollback();
                self.db_full[thread_id].store(true, Ordering::Relaxed);
                self.dropped_oom.fetch_add(1, Ordering::Relaxed);
                Ok(inc.to_vec())
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    fn check_overlimit(&self, thread_id: usize, key: &[u8], mv: &[f64], now_nanos: u64) {
        if mv.is_empty() {
            return;
        }
        let w_secs = self.window.as_secs_f64().max(1e-9);
        let limits = self.overlimit.active();
        for (limit_idx, rule) in limits.rules.iter().enumerate() {
            let threshold = rule.threshold_for(key);
            let breached = (0..mv.len()).all(|i| {
                let t = threshold.get(i).copied().unwrap_or(u64::MAX);
                mv[i] / w_secs >= t as f64
            });
            if breached {
                let mut viol_key = key.to_vec();
                viol_key.push(limit_idx as u8);
                let record = encode_row(mv, now_nanos);
                let _ = self.overlimit_banks[thread_id].write(|txn| txn.put(&viol_key, &record));
            }
        }
    }
}
