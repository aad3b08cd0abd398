//! Monitoring-object tree: one node per `{mo-dir}/<name>/mo.conf`, owning a
//! compiled filter and its FWM/MAVG/CLSF engine instances, plus child MOs
//! loaded from subdirectories (spec.md §4.8/§4.9, [MODULE H], [MODULE I]).

pub mod config;
pub mod debug;
pub mod fieldset;

use crate::engines::clsf::Clsf;
use crate::engines::fwm::Fwm;
use crate::engines::mavg::Mavg;
use crate::error::{FlowError, Result};
use crate::filter::{self, FilterExpr};
use config::MoConfig;
use debug::DebugSink;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Structural identity fields a hot-reload is not allowed to change
/// (spec.md §4.9 "only name/fields/time are rejected as not implemented to
/// reload"). Held alongside the parsed engines so a reload attempt can
/// compare against what's already running.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Structural {
    filter_src: String,
    fwm_shapes: Vec<(String, Vec<String>, u64)>,
    mavg_shapes: Vec<(String, Vec<String>, u64)>,
    clsf_shapes: Vec<(u32, Vec<String>, String, u64)>,
}

impl Structural {
    fn from_config(cfg: &MoConfig) -> Self {
        Self {
            filter_src: cfg.filter.clone(),
            fwm_shapes: cfg.fwm.iter().map(|f| (f.name.clone(), f.fields.clone(), f.time)).collect(),
            mavg_shapes: cfg.mavg.iter().map(|m| (m.name.clone(), m.fields.clone(), m.time)).collect(),
            clsf_shapes: cfg.classification.iter().map(|c| (c.id, c.fields.clone(), c.val.clone(), c.time)).collect(),
        }
    }
}

/// One monitoring-object node: a compiled filter, its engine instances, and
/// children loaded from subdirectories of its own `{mo-dir}/<name>/`.
pub struct MonitObject {
    /// Directory name, used as the label in export/notification/clsf paths.
    pub name: String,
    /// Directory this MO was loaded from.
    pub dir: PathBuf,
    filter: RwLock<FilterExpr>,
    structural: RwLock<Structural>,
    /// Resolved flow-dump sink, if `mo.conf` carries a `debug` block whose
    /// `dump-flows` isn't `"none"`.
    pub debug: Option<DebugSink>,
    /// FWM instances owned by this node, keyed by name.
    pub fwm: HashMap<String, Fwm>,
    /// MAVG instances owned by this node, keyed by name.
    pub mavg: HashMap<String, Mavg>,
    /// CLSF instances owned by this node, keyed by class id.
    pub classification: HashMap<u32, Clsf>,
    /// Child monitoring objects, loaded from subdirectories.
    pub children: Vec<MonitObject>,
    /// Set while a reload is being applied; the dispatcher skips a node
    /// mid-reload rather than racing a partially swapped filter/engine set
    /// (spec.md §4.9 "mark `is_reloading` on the MO").
    pub is_reloading: AtomicBool,
    mtime_nanos: AtomicU64,
}

fn mtime_nanos(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified()?;
    let dur = modified.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    Ok(dur.as_nanos() as u64)
}

impl MonitObject {
    /// Loads one MO from `dir` (expects `dir/mo.conf`), recursing into every
    /// subdirectory that itself contains an `mo.conf`.
    pub fn load(dir: &Path, num_threads: usize, bank_limit_bytes: usize, violation_bank_limit_bytes: usize, created_at_nanos: u64) -> Result<Self> {
        let conf_path = dir.join("mo.conf");
        let text = std::fs::read_to_string(&conf_path)?;
        let cfg: MoConfig = serde_json::from_str(&text).map_err(|e| FlowError::Config { path: conf_path.display().to_string(), msg: e.to_string() })?;

        let expr = filter::parse(&cfg.filter)?;
        let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let debug = match &cfg.debug {
            Some(d) => DebugSink::resolve(&d.dump_flows)?,
            None => None,
        };

        let fwm = cfg
            .fwm
            .iter()
            .map(|f| Fwm::new(f, num_threads, bank_limit_bytes).map(|inst| (f.name.clone(), inst)))
            .collect::<Result<HashMap<_, _>>>()?;
        let mavg = cfg
            .mavg
            .iter()
            .map(|m| Mavg::new(m, num_threads, violation_bank_limit_bytes, created_at_nanos).map(|inst| (m.name.clone(), inst)))
            .collect::<Result<HashMap<_, _>>>()?;
        let classification = cfg
            .classification
            .iter()
            .map(|c| Clsf::new(c, num_threads, bank_limit_bytes).map(|inst| (c.id, inst)))
            .collect::<Result<HashMap<_, _>>>()?;

        let mut children = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let child_dir = entry.path();
            if !child_dir.join("mo.conf").exists() {
                continue;
            }
            match MonitObject::load(&child_dir, num_threads, bank_limit_bytes, violation_bank_limit_bytes, created_at_nanos) {
                Ok(child) => children.push(child),
                Err(err) => warn!(dir = %child_dir.display(), error = %err, "skipping monitoring object that failed to load"),
            }
        }

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            filter: RwLock::new(expr),
            structural: RwLock::new(Structural::from_config(&cfg)),
            debug,
            fwm,
            mavg,
            classification,
            children,
            is_reloading: AtomicBool::new(false),
            mtime_nanos: AtomicU64::new(mtime_nanos(&conf_path).unwrap_or(0)),
        })
    }

    /// The currently compiled filter, read-locked for the duration of one
    /// dispatch call.
    pub fn filter(&self) -> FilterExpr {
        self.filter.read().clone()
    }

    /// Last-seen `mo.conf` modification time, in nanoseconds since epoch.
    pub fn mtime_nanos(&self) -> u64 {
        self.mtime_nanos.load(Ordering::Relaxed)
    }

    /// Re-parses `mo.conf` and, if nothing structural changed, hot-swaps the
    /// filter and every engine's limit sets in place (spec.md §4.9). Rejects
    /// and logs (keeping the previous config running) if `name`/`fields`/
    /// `time` differ for any FWM/MAVG/CLSF entry, or if the entry set itself
    /// changed shape.
    pub fn reload(&self) -> Result<()> {
        self.is_reloading.store(true, Ordering::Relaxed);
        let result = self.reload_inner();
        self.is_reloading.store(false, Ordering::Relaxed);
        result
    }

    fn reload_inner(&self) -> Result<()> {
        let conf_path = self.dir.join("mo.conf");
        let text = std::fs::read_to_string(&conf_path)?;
        let cfg: MoConfig = serde_json::from_str(&text).map_err(|e| FlowError::Config { path: conf_path.display().to_string(), msg: e.to_string() })?;

        let next_structural = Structural::from_config(&cfg);
        if *self.structural.read() != next_structural {
            return Err(FlowError::NotReloadable("name/fields/time"));
        }

        let next_expr = filter::parse(&cfg.filter)?;
        *self.filter.write() = next_expr;

        for m in &cfg.mavg {
            if let Some(inst) = self.mavg.get(&m.name) {
                inst.overlimit.reload(&m.overlimit, &inst.fieldset)?;
                inst.underlimit.reload(&m.underlimit, &inst.fieldset)?;
            }
        }

        self.mtime_nanos.store(mtime_nanos(&conf_path)?, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_mo(dir: &Path, filter: &str) {
        std::fs::write(dir.join("mo.conf"), format!(r#"{{"filter":"{filter}","fwm":[{{"name":"f1","fields":["ip4.src","octets"],"time":60}}]}}"#)).unwrap();
    }

    #[test]
    fn loads_nested_children() {
        let tmp = tempfile::tempdir().unwrap();
        write_mo(tmp.path(), "proto 6");
        let child_dir = tmp.path().join("child");
        std::fs::create_dir_all(&child_dir).unwrap();
        write_mo(&child_dir, "proto 17");

        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();
        assert_eq!(mo.children.len(), 1);
        assert_eq!(mo.children[0].name, "child");
        assert_eq!(mo.fwm.len(), 1);
    }

    #[test]
    fn reload_rejects_structural_field_change() {
        let tmp = tempfile::tempdir().unwrap();
        write_mo(tmp.path(), "proto 6");
        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();

        std::fs::write(
            tmp.path().join("mo.conf"),
            r#"{"filter":"proto 6","fwm":[{"name":"f1","fields":["ip4.src","packets"],"time":60}]}"#,
        )
        .unwrap();
        let err = mo.reload().unwrap_err();
        assert!(matches!(err, FlowError::NotReloadable(_)));
    }

    #[test]
    fn reload_swaps_filter_when_only_filter_text_changes() {
        let tmp = tempfile::tempdir().unwrap();
        write_mo(tmp.path(), "proto 6");
        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();

        write_mo(tmp.path(), "proto 17");
        mo.reload().unwrap();
        assert!(!mo.is_reloading.load(Ordering::Relaxed));
    }
}
