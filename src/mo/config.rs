//! Per-monitoring-object JSON config, `{mo-dir}/<name>/mo.conf` (spec.md §6).

use serde::Deserialize;

/// `mo.conf` top level.
#[derive(Debug, Clone, Deserialize)]
pub struct MoConfig {
    /// Filter DSL source text gating every child collection.
    pub filter: String,
    /// Optional flow-dump sink for debugging.
    #[serde(default)]
    pub debug: Option<DebugConfig>,
    /// FWM instances owned by this MO.
    #[serde(default)]
    pub fwm: Vec<FwmConfig>,
    /// MAVG instances owned by this MO.
    #[serde(default)]
    pub mavg: Vec<MavgConfig>,
    /// CLSF instances owned by this MO.
    #[serde(default)]
    pub classification: Vec<ClsfConfig>,
}

/// `debug` block.
#[derive(Debug, Clone, Deserialize)]
pub struct DebugConfig {
    /// `"none" | "syslog" | "stdout" | <path>`.
    #[serde(rename = "dump-flows")]
    pub dump_flows: String,
}

/// SQL dialect an FWM export targets.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// PostgreSQL: `INET`, `macaddr`, `TEXT`, `BIGINT`.
    #[default]
    Postgres,
    /// ClickHouse: `IPv4`/`IPv6`, `UInt64`, `String`.
    Clickhouse,
}

/// One entry of `fwm: [...]`.
#[derive(Debug, Clone, Deserialize)]
pub struct FwmConfig {
    /// Instance name, used in export file names.
    pub name: String,
    /// Fieldset spec; see [`crate::mo::fieldset::Fieldset::parse`].
    pub fields: Vec<String>,
    /// Dump period, seconds.
    pub time: u64,
    /// Row limit before the catch-all "others" row, if any.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Whether to emit a `CREATE INDEX` alongside the table.
    #[serde(rename = "create-index", default)]
    pub create_index: bool,
    /// Only produced while a linked MAVG overlimit is active.
    #[serde(default)]
    pub extended: bool,
    /// Target SQL dialect for the export file.
    #[serde(default)]
    pub dialect: SqlDialect,
}

/// One entry of `mavg: [...]`.
#[derive(Debug, Clone, Deserialize)]
pub struct MavgConfig {
    /// Instance name, used in notification/dump file names.
    pub name: String,
    /// Fieldset spec.
    pub fields: Vec<String>,
    /// Decay window, seconds.
    pub time: u64,
    /// Dump period, seconds, if periodic dumping is enabled.
    #[serde(default)]
    pub dump: Option<u64>,
    /// Per-thread arena size, megabytes.
    #[serde(rename = "mem-m")]
    pub mem_m: u64,
    /// Over-limit rules.
    #[serde(default)]
    pub overlimit: Vec<MavgLimitConfig>,
    /// Under-limit rules.
    #[serde(default)]
    pub underlimit: Vec<MavgLimitConfig>,
}

/// `mavg_limit_obj`.
#[derive(Debug, Clone, Deserialize)]
pub struct MavgLimitConfig {
    /// Limit rule name, used in notification file names and action-script argv.
    pub name: String,
    /// CSV path of per-key threshold overrides.
    #[serde(default)]
    pub limits: Option<String>,
    /// Per-aggregable-field default threshold vector.
    pub default: Vec<u64>,
    /// Action script invoked on violation.
    #[serde(rename = "action-script")]
    pub action_script: String,
    /// Script invoked on return to normal.
    #[serde(rename = "back2norm-script")]
    pub back2norm_script: String,
    /// Dwell time before firing back-to-normal, seconds.
    #[serde(rename = "back2norm-time")]
    pub back2norm_time: u64,
    /// Extended-FWM names to toggle active while this limit is breached.
    #[serde(default)]
    pub ext: Vec<String>,
}

/// One entry of `classification: [...]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClsfConfig {
    /// Class id, `[0, CLASSES_MAX)`.
    pub id: u32,
    /// Fieldset spec (key fields only; `val` names the measure).
    pub fields: Vec<String>,
    /// Aggregable measure field name.
    pub val: String,
    /// Merge period, seconds.
    pub time: u64,
    /// Cumulative percentage cutoff for directory emission.
    #[serde(rename = "top-percents")]
    pub top_percents: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_mo_conf() {
        let json = r#"{
            "filter": "proto 6",
            "fwm": [{"name":"f1","fields":["ip4.src","octets"],"time":60}]
        }"#;
        let cfg: MoConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.fwm.len(), 1);
        assert_eq!(cfg.fwm[0].time, 60);
        assert!(cfg.mavg.is_empty());
    }
}
