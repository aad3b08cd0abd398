//! Background task orchestration: the five per-monitoring-object poll loops
//! spec.md §2 "Control flow" lists alongside the dispatcher — FWM dumper,
//! MAVG limit-reactor, MAVG underlimit-checker, MAVG dumper, and CLSF
//! merger. Module I's coordinator has its own loop in [`crate::reload`];
//! these five are the periodic halves of modules E/F/G.
//!
//! Grounded on `original_source/monit-objects-fwm.c`'s `fwm_bg_thread`,
//! `monit-objects-mavg-act.c`'s reactor loop, `monit-objects-mavg-under.c`,
//! `monit-objects-mavg-dump.c`, and `classification.c`'s
//! `classification_bg_thread` — each polls its own cadence on its own
//! thread rather than sharing a single scheduler, which this module
//! reproduces as one `run_*` function per cadence rather than a unified
//! executor.

use crate::context::Context;
use crate::engines::mavg::{dumper, reactor, underlimit};
use crate::mo::MonitObject;
use crate::process::spawn_detached;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn now_nanos() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

fn fwm_pass(mo: &MonitObject, export_dir: &Path, now: u64, exported_any: &mut bool) {
    for fwm in mo.fwm.values() {
        if !fwm.due(now) {
            continue;
        }
        match fwm.merge_and_export(export_dir, &mo.name, now) {
            Ok(Some(_)) => *exported_any = true,
            Ok(None) => {}
            Err(err) => warn!(mo = %mo.name, fwm = %fwm.name, error = %err, "fwm merge/export failed"),
        }
        fwm.mark_exported(now);
    }
    for child in &mo.children {
        fwm_pass(child, export_dir, now, exported_any);
    }
}

/// The FWM dumper task (`fwm_bg_thread`): once a second, walks the whole MO
/// tree merging and exporting every FWM whose `time` boundary was just
/// crossed, then — if anything was exported this pass — invokes the
/// process-wide exporter script once, with no arguments (spec.md §4.5
/// "Post-emit").
pub fn run_fwm_dumper(roots: &[MonitObject], ctx: &Context) {
    while !ctx.should_stop() {
        let now = now_unix();
        let mut exported_any = false;
        for mo in roots {
            fwm_pass(mo, &ctx.config.export_dir, now, &mut exported_any);
        }
        if exported_any {
            if let Some(script) = ctx.config.db_exporter_path.as_deref() {
                if !script.is_empty() {
                    spawn_detached(script, &[]);
                }
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// The MAVG overlimit reactor task: every ~100ms, runs one
/// [`reactor::run_overlimit_pass`] per MAVG instance in the whole tree
/// (spec.md §4.6 "Reactor task"). `ext` links are resolved against the
/// owning MO's own FWM collection, matching how `mo.conf`'s `ext` entries
/// are declared alongside the MAVG rule itself.
pub fn run_mavg_reactor(roots: &[MonitObject], ctx: &Context) {
    while !ctx.should_stop() {
        let now = now_nanos();
        for mo in roots {
            reactor_pass(mo, &ctx.config.notifications_dir, now);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn reactor_pass(mo: &MonitObject, notif_dir: &Path, now_nanos: u64) {
    for mavg in mo.mavg.values() {
        if let Err(err) = reactor::run_overlimit_pass(mavg, &mo.name, notif_dir, &mo.fwm, now_nanos) {
            warn!(mo = %mo.name, mavg = %mavg.name, error = %err, "mavg reactor pass failed");
        }
    }
    for child in &mo.children {
        reactor_pass(child, notif_dir, now_nanos);
    }
}

/// The MAVG underlimit checker task: once a second, runs one
/// [`underlimit::run_underlimit_pass`] per MAVG instance (spec.md §4.6
/// "Underlimit checker task").
pub fn run_mavg_underlimit(roots: &[MonitObject], ctx: &Context) {
    while !ctx.should_stop() {
        let now = now_nanos();
        for mo in roots {
            underlimit_pass(mo, &ctx.config.notifications_dir, now);
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn underlimit_pass(mo: &MonitObject, notif_dir: &Path, now_nanos: u64) {
    for mavg in mo.mavg.values() {
        if let Err(err) = underlimit::run_underlimit_pass(mavg, &mo.name, notif_dir, &mo.fwm, now_nanos) {
            warn!(mo = %mo.name, mavg = %mavg.name, error = %err, "mavg underlimit pass failed");
        }
    }
    for child in &mo.children {
        underlimit_pass(child, notif_dir, now_nanos);
    }
}

/// The MAVG dumper task: once a second, checks every MAVG's trigger files
/// and writes a snapshot if present (spec.md §4.6 "Dumper task").
pub fn run_mavg_dumper(roots: &[MonitObject], ctx: &Context) {
    while !ctx.should_stop() {
        let now = now_nanos();
        for mo in roots {
            dumper_pass(mo, now);
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn dumper_pass(mo: &MonitObject, now_nanos: u64) {
    for mavg in mo.mavg.values() {
        if let Err(err) = dumper::run_dump_pass(mavg, &mo.dir, now_nanos) {
            warn!(mo = %mo.name, mavg = %mavg.name, error = %err, "mavg dump pass failed");
        }
    }
    for child in &mo.children {
        dumper_pass(child, now_nanos);
    }
}

/// The CLSF merger task: once a second, merges and re-classifies every CLSF
/// instance whose `time` period has elapsed since its last merge (spec.md
/// §4.7 "Background merge").
pub fn run_clsf_merger(roots: &[MonitObject], ctx: &Context) {
    while !ctx.should_stop() {
        let now = now_unix();
        for mo in roots {
            clsf_pass(mo, &ctx.config.clsf_dir, now);
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn clsf_pass(mo: &MonitObject, clsf_dir: &Path, now: u64) {
    for clsf in mo.classification.values() {
        if !clsf.due(now) {
            continue;
        }
        if let Err(err) = clsf.merge_and_classify(clsf_dir, &mo.name) {
            warn!(mo = %mo.name, class = clsf.class_id, error = %err, "clsf merge/classify failed");
        }
        clsf.mark_exported(now);
    }
    for child in &mo.children {
        clsf_pass(child, clsf_dir, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TemplatesConfig};
    use std::path::PathBuf;

    fn test_config(export_dir: PathBuf, notif_dir: PathBuf, clsf_dir: PathBuf) -> Config {
        Config {
            devices: PathBuf::from("/dev/null"),
            mo_dir: PathBuf::from("/dev/null"),
            export_dir,
            iplists_dir: PathBuf::from("/dev/null"),
            notifications_dir: notif_dir,
            clsf_dir,
            geodb: PathBuf::from("/dev/null"),
            db_exporter_path: None,
            templates: TemplatesConfig { db: PathBuf::from("/dev/null"), allow_templates_in_future: false },
            capture: Vec::new(),
            sflow_capture: Vec::new(),
        }
    }

    #[test]
    fn fwm_pass_exports_due_instance_and_marks_it() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("mo.conf"),
            r#"{"filter":"proto 6","fwm":[{"name":"f1","fields":["ip4.src","octets"],"time":1}]}"#,
        )
        .unwrap();
        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();

        let mfreq = crate::field::accessor::MfreqTable::default();
        let geoip = crate::field::accessor::NullGeoip;
        let fctx = crate::field::accessor::FuncContext { mfreq: &mfreq, geoip: &geoip };
        let mut flow = crate::flow::FlowRecord::new();
        flow.set_raw(crate::field::FieldId::Ipv4Src, &[10, 0, 0, 1]);
        flow.set_raw(crate::field::FieldId::Octets, &100u64.to_be_bytes());
        mo.fwm["f1"].produce(0, &flow, &fctx, 1).unwrap();

        let export_dir = tempfile::tempdir().unwrap();
        let mut exported_any = false;
        fwm_pass(&mo, export_dir.path(), 1_700_000_000, &mut exported_any);
        assert!(exported_any);
        assert!(!mo.fwm["f1"].due(1_700_000_000));

        let mut exported_again = false;
        fwm_pass(&mo, export_dir.path(), 1_700_000_000, &mut exported_again);
        assert!(!exported_again);
    }

    #[test]
    fn run_loops_exit_once_stop_is_requested() {
        let tmp1 = tempfile::tempdir().unwrap();
        let tmp2 = tempfile::tempdir().unwrap();
        let tmp3 = tempfile::tempdir().unwrap();
        let ctx = Context::new(test_config(tmp1.path().to_path_buf(), tmp2.path().to_path_buf(), tmp3.path().to_path_buf()));
        ctx.request_stop();
        run_fwm_dumper(&[], &ctx);
        run_mavg_reactor(&[], &ctx);
        run_mavg_underlimit(&[], &ctx);
        run_mavg_dumper(&[], &ctx);
        run_clsf_merger(&[], &ctx);
    }
}
