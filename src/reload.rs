//! Background hot-reload coordinator: polls every `mo.conf`'s mtime roughly
//! every 10 ms and re-applies changed config in place (spec.md §4.9,
//! [MODULE I]).

use crate::context::Context;
use crate::mo::MonitObject;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn mtime_nanos(path: &std::path::Path) -> Option<u64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let dur = modified.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    Some(dur.as_nanos() as u64)
}

fn poll_tree(mo: &MonitObject) {
    let conf_path = mo.dir.join("mo.conf");
    if let Some(disk_mtime) = mtime_nanos(&conf_path) {
        if disk_mtime != mo.mtime_nanos() {
            match mo.reload() {
                Ok(()) => debug!(mo = %mo.name, "hot-reloaded monitoring object"),
                Err(err) => warn!(mo = %mo.name, error = %err, "reload rejected, keeping previous config"),
            }
        }
    }
    for child in &mo.children {
        poll_tree(child);
    }
}

/// Runs the reload coordinator loop until [`Context::should_stop`] returns
/// true. Intended to run on its own background thread, one instance per
/// process.
pub fn run(roots: &[MonitObject], ctx: &Context) {
    while !ctx.should_stop() {
        for mo in roots {
            poll_tree(mo);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TemplatesConfig};
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn test_config() -> Config {
        Config {
            devices: PathBuf::from("/dev/null"),
            mo_dir: PathBuf::from("/dev/null"),
            export_dir: PathBuf::from("/dev/null"),
            iplists_dir: PathBuf::from("/dev/null"),
            notifications_dir: PathBuf::from("/dev/null"),
            clsf_dir: PathBuf::from("/dev/null"),
            geodb: PathBuf::from("/dev/null"),
            db_exporter_path: None,
            templates: TemplatesConfig { db: PathBuf::from("/dev/null"), allow_templates_in_future: false },
            capture: Vec::new(),
            sflow_capture: Vec::new(),
        }
    }

    #[test]
    fn poll_tree_picks_up_filter_change() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("mo.conf"), r#"{"filter":"proto 6"}"#).unwrap();
        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();
        let before = mo.mtime_nanos();

        std::thread::sleep(Duration::from_millis(10));
        std::fs::write(tmp.path().join("mo.conf"), r#"{"filter":"proto 17"}"#).unwrap();
        poll_tree(&mo);

        assert!(mo.mtime_nanos() >= before);
        assert!(!mo.is_reloading.load(Ordering::Relaxed));
    }

    #[test]
    fn run_exits_once_stop_is_requested() {
        let ctx = Context::new(test_config());
        ctx.request_stop();
        run(&[], &ctx);
    }
}
