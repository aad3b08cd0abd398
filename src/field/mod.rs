//! Field accessor and key builder (spec [MODULE A]).
//!
//! A single declarative table (`table::FIELDS`) is the source of truth for
//! field ids, sizes, and computed-function wiring; the filter lexer's
//! keyword set, the debug-print switch, and the accessor below are all
//! driven from it, per the "X-macro field tables" redesign note.

pub mod accessor;
pub mod table;

pub use accessor::{read_field, FieldFunc};
pub use table::{FieldDescriptor, FieldId, FieldType, FIELDS};

use crate::error::{FlowError, Result};

/// Looks up a field descriptor by its declarative-table name (case-sensitive,
/// matching the lexer's identifier token).
pub fn lookup(name: &str) -> Result<&'static FieldDescriptor> {
    FIELDS
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| FlowError::UnknownField(name.to_string()))
}

/// Looks up a field descriptor by id. Panics only if `FIELDS` and `FieldId`
/// have drifted apart, which would be a programmer error, not a runtime one.
pub fn descriptor(id: FieldId) -> &'static FieldDescriptor {
    FIELDS
        .iter()
        .find(|f| f.id == id)
        .expect("FIELDS table missing an entry for a FieldId variant")
}
