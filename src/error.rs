use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Error type for all fallible core operations.
///
/// Per the error-handling policy, most of these are caught at the call site
/// and logged rather than propagated out of a background loop or the
/// dispatch hot path — see the module-level docs on `engines` and `reload`.
#[derive(Debug, Error)]
pub enum FlowError {
    /// I/O error while reading/writing config, dumps, notifications, or exports.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The per-thread OKVS arena ran out of its configured byte budget.
    #[error("out of memory: arena exhausted ({used}/{limit} bytes)")]
    OutOfMemory {
        /// Bytes currently allocated.
        used: usize,
        /// Configured arena byte limit.
        limit: usize,
    },
    /// Key was not present in the store.
    #[error("key not found")]
    NotFound,
    /// Filter DSL failed to parse.
    #[error("filter parse error at {line}:{col}: {msg}")]
    FilterParse {
        /// 1-based line number.
        line: usize,
        /// 1-based column number.
        col: usize,
        /// Human-readable message.
        msg: String,
    },
    /// `mo.conf` or a top-level config file failed to parse.
    #[error("config error in {path}: {msg}")]
    Config {
        /// Path of the file that failed to parse.
        path: String,
        /// Human-readable message.
        msg: String,
    },
    /// A structural field (`name`, `fields`, `time`) changed across a reload;
    /// the reload is rejected per spec and the MO keeps its previous config.
    #[error("field {0} is not reloadable")]
    NotReloadable(&'static str),
    /// A fieldset referenced an unknown field name.
    #[error("unknown field: {0}")]
    UnknownField(String),
    /// Reverse-lookup directory scan failed; caller keeps the previous DB.
    #[error("reverse-lookup reload failed: {0}")]
    ReverseLookupReload(String),
}
