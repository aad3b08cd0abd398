//! Process-wide shared state, passed by reference to every component
//! instead of living in globals (spec.md §9 "Process-wide mutables").

use crate::config::Config;
use crate::field::accessor::{GeoipLookup, MfreqTable, NullGeoip};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide state: config, the frequency table, the swappable GeoIP
/// lookup, and the cooperative stop/reload flags every background loop
/// polls.
pub struct Context {
    /// The parsed top-level config.
    pub config: Config,
    /// The `mfreq()` frequency table, shared across all ingest threads.
    pub mfreq: MfreqTable,
    /// The active GeoIP/ASN lookup, swappable on SIGHUP without disturbing
    /// in-flight readers (readers take a read lock only for the duration of
    /// one lookup call).
    geoip: RwLock<Arc<dyn GeoipLookup>>,
    /// Polled by every background loop; set on process shutdown request.
    stop: AtomicBool,
    /// Set by the signal handler on SIGHUP; background loops poll it and
    /// clear it once they've acted on it.
    reload_requested: AtomicBool,
}

impl Context {
    /// Builds a context with no GeoIP database loaded (`NullGeoip`).
    pub fn new(config: Config) -> Self {
        Self {
            config,
            mfreq: MfreqTable::default(),
            geoip: RwLock::new(Arc::new(NullGeoip)),
            stop: AtomicBool::new(false),
            reload_requested: AtomicBool::new(false),
        }
    }

    /// Returns the currently active GeoIP lookup.
    pub fn geoip(&self) -> Arc<dyn GeoipLookup> {
        self.geoip.read().clone()
    }

    /// Swaps in a newly loaded GeoIP lookup.
    pub fn set_geoip(&self, lookup: Arc<dyn GeoipLookup>) {
        *self.geoip.write() = lookup;
    }

    /// Whether background loops should exit.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Requests every background loop to exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether a config reload was requested (e.g. by SIGHUP).
    pub fn reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::Relaxed)
    }

    /// Sets the reload-requested flag; called from a signal handler, so it
    /// must stay allocation-free.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Relaxed);
    }

    /// Clears the reload-requested flag once a background loop has acted on it.
    pub fn clear_reload_requested(&self) {
        self.reload_requested.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

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
            templates: crate::config::TemplatesConfig { db: PathBuf::from("/dev/null"), allow_templates_in_future: false },
            capture: Vec::new(),
            sflow_capture: Vec::new(),
        }
    }

    #[test]
    fn stop_and_reload_flags_round_trip() {
        let ctx = Context::new(test_config());
        assert!(!ctx.should_stop());
        ctx.request_stop();
        assert!(ctx.should_stop());

        assert!(!ctx.reload_requested());
        ctx.request_reload();
        assert!(ctx.reload_requested());
        ctx.clear_reload_requested();
        assert!(!ctx.reload_requested());
    }
}
