//! Process-wide tracing subscriber installation.
//!
//! Background loops and the dispatch path log through `tracing`; this module
//! just wires up a default subscriber once. Callers embedding this crate in a
//! process that already installs its own subscriber can skip calling [`init`].

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a global `tracing` subscriber reading `RUST_LOG`, defaulting to
/// `info` for this crate and `warn` elsewhere. Safe to call more than once;
/// only the first call takes effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,flowcore=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
