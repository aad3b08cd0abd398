//! Trigger-file dumper: writes a snapshot of every decayed counter when an
//! operator drops a `.d`/`.a` trigger file next to the MO directory
//! (spec.md §4.6 "Dump trigger files").

use super::{decay, decode_row, Mavg};
use crate::mo::fieldset::render_key_parts;
use std::collections::HashMap;
use std::path::Path;

/// Checks for `{mo_dir}/{name}.d` (plain dump) and `{mo_dir}/{name}.a`
/// (append dump) trigger files and, if present, writes the current
/// per-second decayed value of every live key plus arena usage.
pub fn run_dump_pass(mavg: &Mavg, mo_dir: &Path, now_nanos: u64) -> crate::error::Result<()> {
    let dump_trigger = mo_dir.join(format!("{}.d", mavg.name));
    let append_trigger = mo_dir.join(format!("{}.a", mavg.name));

    let want_dump = dump_trigger.exists();
    let want_append = append_trigger.exists();
    if !want_dump && !want_append {
        return Ok(());
    }

    let body = render_dump(mavg, now_nanos);

    if want_dump {
        std::fs::write(mo_dir.join(format!("{}.dump", mavg.name)), &body)?;
        let _ = std::fs::remove_file(&dump_trigger);
    }
    if want_append {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(mo_dir.join(format!("{}.adump", mavg.name)))?;
        file.write_all(&body)?;
        let _ = std::fs::remove_file(&append_trigger);
    }
    Ok(())
}

fn render_dump(mavg: &Mavg, now_nanos: u64) -> Vec<u8> {
    let n = mavg.fieldset.value_fields.len();
    let window_nanos = mavg.window.as_nanos() as u64;
    let w_secs = mavg.window.as_secs_f64().max(1e-9);

    let mut merged: HashMap<Vec<u8>, Vec<f64>> = HashMap::new();
    for okvs in &mavg.value_banks {
        let mut cursor = okvs.cursor();
        while let Some((k, v)) = cursor.next() {
            let (values, ts) = decode_row(v, n);
            let entry = merged.entry(k.to_vec()).or_insert_with(|| vec![0.0; n]);
            for i in 0..n {
                entry[i] += decay(values[i], ts, now_nanos, window_nanos, 0.0);
            }
        }
    }

    let mut out = String::new();
    for (key, mv) in &merged {
        let fields = render_key_parts(&mavg.fieldset, key).join(" ");
        let per_sec: Vec<String> = mv.iter().map(|v| format!("{:.2}", v / w_secs)).collect();
        out.push_str(&format!("{fields} {}\n", per_sec.join(",")));
    }

    let (mem_used, mem_avail): (usize, usize) = mavg.value_banks.iter().map(|okvs| (okvs.used_bytes(), okvs.limit_bytes())).fold((0, 0), |(u, a), (u2, a2)| (u + u2, a + a2));
    out.push_str(&format!("mem_used {mem_used}\nmem_avail {mem_avail}\n"));

    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::accessor::{FuncContext, MfreqTable, NullGeoip};
    use crate::field::FieldId;
    use crate::flow::FlowRecord;
    use crate::mo::config::MavgConfig;

    fn cfg() -> MavgConfig {
        MavgConfig {
            name: "m1".into(),
            fields: vec!["ip4.src".into(), "octets".into()],
            time: 60,
            dump: None,
            mem_m: 1,
            overlimit: Vec::new(),
            underlimit: Vec::new(),
        }
    }

    #[test]
    fn dump_trigger_produces_snapshot_and_clears_trigger() {
        let mavg = Mavg::new(&cfg(), 1, 1 << 20, 0).unwrap();
        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let fctx = FuncContext { mfreq: &mfreq, geoip: &geoip };

        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Ipv4Src, &[10, 0, 0, 1]);
        flow.set_raw(FieldId::Octets, &100u64.to_be_bytes());
        mavg.produce(0, &flow, &fctx, 1, 0).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("m1.d"), b"").unwrap();

        run_dump_pass(&mavg, tmp.path(), 1_000_000_000).unwrap();

        assert!(!tmp.path().join("m1.d").exists());
        let body = std::fs::read_to_string(tmp.path().join("m1.dump")).unwrap();
        assert!(body.contains("mem_used"));
    }

    #[test]
    fn no_trigger_file_is_a_no_op() {
        let mavg = Mavg::new(&cfg(), 1, 1 << 20, 0).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        run_dump_pass(&mavg, tmp.path(), 0).unwrap();
        assert!(!tmp.path().join("m1.dump").exists());
    }
}
