//! Per-MO flow-dump debug sink: `mo.conf`'s `debug: {dump-flows}` block
//! (spec.md §6, [MODULE H] "optional debug sink"). Renders every field
//! present on a matched flow and writes it to syslog, stdout, or an
//! append-mode file, mirroring `flow_debug.c`'s `flow_print_str`.

use crate::field::table::FIELDS;
use crate::flow::FlowRecord;
use crate::mo::fieldset::{render_field_text, FieldSpec};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// A resolved `dump-flows` destination.
pub enum DebugSink {
    /// `"syslog"`: one `tracing::info!` event per matched flow.
    Syslog,
    /// `"stdout"`: one line on the process's standard output.
    Stdout,
    /// Any other value: an append-mode file opened once at load time.
    File(Mutex<File>),
}

impl DebugSink {
    /// Parses a `dump-flows` value. `"none"` (or empty) yields no sink at
    /// all, matching `flow_debug_config`'s `print_flows = 0` branch.
    pub fn resolve(dump_flows: &str) -> crate::error::Result<Option<Self>> {
        match dump_flows {
            "none" | "" => Ok(None),
            "syslog" => Ok(Some(DebugSink::Syslog)),
            "stdout" => Ok(Some(DebugSink::Stdout)),
            path => {
                let file = OpenOptions::new().create(true).append(true).open(Path::new(path))?;
                Ok(Some(DebugSink::File(Mutex::new(file))))
            }
        }
    }

    /// Writes one already-rendered flow line to this sink.
    pub fn write(&self, line: &str) {
        match self {
            DebugSink::Syslog => tracing::info!(flow = %line, "flow dump"),
            DebugSink::Stdout => println!("{line}"),
            DebugSink::File(file) => {
                let mut file = file.lock();
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

/// Renders every present field of `flow`, `"; "`-joined, in field-table
/// order, plus the classified-as label if a CLSF lookup hit upstream of
/// this call (`flow_debug_add_field` + `flow_print_str`'s devinfo suffix).
/// Per-field text uses the same renderer the CLSF label/MAVG notification
/// writer already share, so a field prints identically everywhere it's
/// shown to an operator.
pub fn render(flow: &FlowRecord) -> String {
    let mut parts = Vec::new();
    for field in FIELDS {
        let slot = flow.slot(field.id);
        if !slot.is_present() {
            continue;
        }
        parts.push(format!("{}: {}", field.display_desc, render_field_text(&FieldSpec::Plain(field.id), slot.as_bytes())));
    }
    if let Some(class) = &flow.classified_as {
        parts.push(format!("class: {class}"));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldId;

    #[test]
    fn renders_present_fields_only() {
        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Ipv4Src, &[10, 0, 0, 1]);
        flow.set_raw(FieldId::Octets, &1500u64.to_be_bytes());
        let line = render(&flow);
        assert!(line.contains("IPv4 source address: 10.0.0.1"));
        assert!(line.contains("byte count: 1500"));
        assert!(!line.contains("port"));
    }

    #[test]
    fn renders_classified_as_when_set() {
        let mut flow = FlowRecord::new();
        flow.classified_as = Some("web".to_string());
        assert_eq!(render(&flow), "class: web");
    }

    #[test]
    fn resolve_none_yields_no_sink() {
        assert!(DebugSink::resolve("none").unwrap().is_none());
        assert!(DebugSink::resolve("").unwrap().is_none());
    }

    #[test]
    fn resolve_file_opens_in_append_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("flows.log");
        let sink = DebugSink::resolve(path.to_str().unwrap()).unwrap().unwrap();
        sink.write("line one");
        drop(sink);
        let sink2 = DebugSink::resolve(path.to_str().unwrap()).unwrap().unwrap();
        sink2.write("line two");
        drop(sink2);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }
}
