//! Hot-swappable over/under-limit threshold sets (spec.md §4.6 "Hot-reload").
//!
//! Rather than the original's atomic-index-selected pair of arrays baked
//! into every per-key value, this generalizes the swap the same way
//! [`Context::set_geoip`](crate::context::Context::set_geoip) does: an
//! `RwLock<Arc<LimitSet>>` readers clone cheaply, writers replace wholesale.
//! Per-thread decayed values never reference a generation directly, so there
//! is nothing equivalent to `mavg_limits_update`'s per-value rewrite to do.

use crate::error::{FlowError, Result};
use crate::mo::config::MavgLimitConfig;
use crate::mo::fieldset::{Column, Fieldset};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// One `mavg_limit` rule: a default per-aggregable-field threshold vector,
/// optionally overridden per key by a CSV file, plus the scripts and
/// `ext`-linked FWM names fired on transition.
#[derive(Debug, Clone)]
pub struct MavgLimitRule {
    /// Rule name, used in notification file names and action-script argv.
    pub name: String,
    /// Per-aggregable-field default threshold.
    pub default: Vec<u64>,
    /// Per-key threshold overrides, loaded from `limits` CSV if configured.
    pub overrides: HashMap<Vec<u8>, Vec<u64>>,
    /// Action script invoked on violation.
    pub action_script: String,
    /// Script invoked on return to normal.
    pub back2norm_script: String,
    /// Dwell time before firing back-to-normal.
    pub back2norm_time_nanos: u64,
    /// Extended-FWM names toggled active while this limit is breached.
    pub ext: Vec<String>,
}

impl MavgLimitRule {
    fn load(cfg: &MavgLimitConfig, fieldset: &Fieldset) -> Result<Self> {
        let overrides = match &cfg.limits {
            Some(path) => load_overrides(Path::new(path), fieldset, cfg.default.len())?,
            None => HashMap::new(),
        };
        Ok(Self {
            name: cfg.name.clone(),
            default: cfg.default.clone(),
            overrides,
            action_script: cfg.action_script.clone(),
            back2norm_script: cfg.back2norm_script.clone(),
            back2norm_time_nanos: cfg.back2norm_time.saturating_mul(1_000_000_000),
            ext: cfg.ext.clone(),
        })
    }

    /// The threshold vector in effect for `key`: a per-key override if one
    /// was loaded from the CSV, else the rule's default.
    pub fn threshold_for(&self, key: &[u8]) -> &[u64] {
        self.overrides.get(key).map(Vec::as_slice).unwrap_or(&self.default)
    }
}

fn load_overrides(path: &Path, fieldset: &Fieldset, n_values: usize) -> Result<HashMap<Vec<u8>, Vec<u64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| FlowError::Config { path: path.display().to_string(), msg: e.to_string() })?;
    let mut out = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| FlowError::Config { path: path.display().to_string(), msg: e.to_string() })?;
        let mut key = Vec::with_capacity(fieldset.key_len());
        let mut values = vec![0u64; n_values];
        for (col_idx, column) in fieldset.columns.iter().enumerate() {
            let text = record.get(col_idx).ok_or_else(|| FlowError::Config {
                path: path.display().to_string(),
                msg: format!("row missing column {col_idx}"),
            })?;
            match column {
                Column::Key(key_idx) => key.extend(fieldset.encode_key_literal(*key_idx, text.trim())?),
                Column::Value(value_idx) => {
                    if *value_idx < values.len() {
                        values[*value_idx] = text.trim().parse().map_err(|_| FlowError::Config {
                            path: path.display().to_string(),
                            msg: format!("bad threshold '{text}'"),
                        })?;
                    }
                }
            }
        }
        out.insert(key, values);
    }
    Ok(out)
}

/// A loaded set of limit rules, either the overlimit or underlimit list for
/// one MAVG.
#[derive(Debug, Clone, Default)]
pub struct LimitSet {
    /// The rules, in config-declared order; a violation's `limit_idx`
    /// indexes this vector.
    pub rules: Vec<MavgLimitRule>,
}

impl LimitSet {
    fn load(cfgs: &[MavgLimitConfig], fieldset: &Fieldset) -> Result<Self> {
        Ok(Self { rules: cfgs.iter().map(|c| MavgLimitRule::load(c, fieldset)).collect::<Result<Vec<_>>>()? })
    }
}

/// The hot-swappable holder for one MAVG's over- or under-limit rule set.
pub struct LimitSets {
    active: RwLock<Arc<LimitSet>>,
}

impl LimitSets {
    /// Loads the initial rule set.
    pub fn load(cfgs: &[MavgLimitConfig], fieldset: &Fieldset) -> Result<Self> {
        Ok(Self { active: RwLock::new(Arc::new(LimitSet::load(cfgs, fieldset)?)) })
    }

    /// The currently active rule set.
    pub fn active(&self) -> Arc<LimitSet> {
        self.active.read().clone()
    }

    /// Loads a fresh rule set and swaps it in, preserving every per-thread
    /// decayed value untouched (spec.md §4.6 "Hot-reload").
    pub fn reload(&self, cfgs: &[MavgLimitConfig], fieldset: &Fieldset) -> Result<()> {
        let next = LimitSet::load(cfgs, fieldset)?;
        *self.active.write() = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rule_cfg(default: Vec<u64>, limits: Option<String>) -> MavgLimitConfig {
        MavgLimitConfig {
            name: "r1".into(),
            limits,
            default,
            action_script: "/bin/true".into(),
            back2norm_script: "/bin/true".into(),
            back2norm_time: 30,
            ext: Vec::new(),
        }
    }

    #[test]
    fn default_threshold_used_without_override() {
        let fieldset = Fieldset::parse(&["ip4.src".to_string(), "octets".to_string()]).unwrap();
        let set = LimitSet::load(&[rule_cfg(vec![1000], None)], &fieldset).unwrap();
        assert_eq!(set.rules[0].threshold_for(&[10, 0, 0, 1]), &[1000]);
    }

    #[test]
    fn csv_override_takes_precedence_for_matching_key() {
        let fieldset = Fieldset::parse(&["ip4.src".to_string(), "octets".to_string()]).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.1,500").unwrap();
        file.flush().unwrap();

        let set = LimitSet::load(&[rule_cfg(vec![1000], Some(file.path().display().to_string()))], &fieldset).unwrap();
        assert_eq!(set.rules[0].threshold_for(&[10, 0, 0, 1]), &[500]);
        assert_eq!(set.rules[0].threshold_for(&[10, 0, 0, 2]), &[1000]);
    }
}
