//! Per-flow, per-ingest-thread dispatch: filter match, then CLSF, then FWM
//! (with extended/DNS/SNI gating), then MAVG, then recurse into children
//! (spec.md §4.8, [MODULE H]).

use crate::engines::fwm::Fwm;
use crate::field::accessor::FuncContext;
use crate::filter::evaluate;
use crate::flow::FlowRecord;
use crate::mo::MonitObject;
use std::sync::atomic::Ordering;

/// Walks the monitoring-object tree rooted at `roots`, dispatching `flow`
/// into every node whose filter matches (and, transitively, every matching
/// descendant), per spec.md §4.8's pseudocode.
pub fn dispatch(roots: &[MonitObject], thread_id: usize, flow: &mut FlowRecord, fctx: &FuncContext, now_nanos: u64) {
    for mo in roots {
        dispatch_one(mo, thread_id, flow, fctx, now_nanos);
    }
}

fn dispatch_one(mo: &MonitObject, thread_id: usize, flow: &mut FlowRecord, fctx: &FuncContext, now_nanos: u64) {
    if mo.is_reloading.load(Ordering::Relaxed) {
        return;
    }
    let expr = mo.filter();
    if !evaluate(&expr, flow) {
        return;
    }

    for clsf in mo.classification.values() {
        if let Err(err) = clsf.produce(thread_id, flow, fctx, flow.sampling_rate) {
            tracing::warn!(mo = %mo.name, error = %err, "clsf produce failed");
        }
    }

    for fwm in mo.fwm.values() {
        if !should_produce_fwm(fwm, flow) {
            continue;
        }
        if let Err(err) = fwm.produce(thread_id, flow, fctx, flow.sampling_rate) {
            tracing::warn!(mo = %mo.name, fwm = %fwm.name, error = %err, "fwm produce failed");
        }
    }

    for mavg in mo.mavg.values() {
        if let Err(err) = mavg.produce(thread_id, flow, fctx, flow.sampling_rate, now_nanos) {
            tracing::warn!(mo = %mo.name, mavg = %mavg.name, error = %err, "mavg produce failed");
        }
    }

    if let Some(sink) = &mo.debug {
        sink.write(&crate::mo::debug::render(flow));
    }

    for child in &mo.children {
        dispatch_one(child, thread_id, flow, fctx, now_nanos);
    }
}

/// Extended FWM instances only produce while activated by a linked MAVG
/// overlimit; `requires_dns`/`requires_sni` gating is driven by the flow's
/// own sniff-result flags, since the fieldset itself carries no "this needs
/// DNS" marker beyond whichever function fields it lists.
fn should_produce_fwm(fwm: &Fwm, flow: &FlowRecord) -> bool {
    if !fwm.should_produce() {
        return false;
    }
    let needs_dns = fwm.fieldset.key_specs.iter().any(|s| matches!(s, crate::mo::fieldset::FieldSpec::Plain(id) if *id == crate::field::FieldId::DnsName || *id == crate::field::FieldId::DnsIp));
    if needs_dns && !flow.has_dns {
        return false;
    }
    let needs_sni = fwm.fieldset.key_specs.iter().any(|s| matches!(s, crate::mo::fieldset::FieldSpec::Plain(id) if *id == crate::field::FieldId::Sni));
    if needs_sni && !flow.has_sni {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::accessor::{MfreqTable, NullGeoip};
    use crate::field::FieldId;

    #[test]
    fn unmatched_filter_skips_every_engine() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("mo.conf"),
            r#"{"filter":"proto 6","fwm":[{"name":"f1","fields":["ip4.src","octets"],"time":60}]}"#,
        )
        .unwrap();
        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();
        let roots = vec![mo];

        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let fctx = FuncContext { mfreq: &mfreq, geoip: &geoip };

        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Proto, &[17]);
        dispatch(&roots, 0, &mut flow, &fctx, 0);

        let fwm = &roots[0].fwm["f1"];
        let tmp2 = tempfile::tempdir().unwrap();
        let exported = fwm.merge_and_export(tmp2.path(), "mo1", 0).unwrap();
        assert!(exported.is_none());
    }

    #[test]
    fn matching_filter_reaches_fwm() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("mo.conf"),
            r#"{"filter":"proto 6","fwm":[{"name":"f1","fields":["ip4.src","octets"],"time":60}]}"#,
        )
        .unwrap();
        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();
        let roots = vec![mo];

        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let fctx = FuncContext { mfreq: &mfreq, geoip: &geoip };

        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Proto, &[6]);
        flow.set_raw(FieldId::Ipv4Src, &[10, 0, 0, 1]);
        flow.set_raw(FieldId::Octets, &100u64.to_be_bytes());
        dispatch(&roots, 0, &mut flow, &fctx, 0);

        let fwm = &roots[0].fwm["f1"];
        let tmp2 = tempfile::tempdir().unwrap();
        let exported = fwm.merge_and_export(tmp2.path(), "mo1", 0).unwrap();
        assert!(exported.is_some());
    }

    #[test]
    fn matching_filter_writes_debug_dump() {
        let tmp = tempfile::tempdir().unwrap();
        let dump_path = tmp.path().join("flows.log");
        std::fs::write(
            tmp.path().join("mo.conf"),
            format!(
                r#"{{"filter":"proto 6","debug":{{"dump-flows":{:?}}},"fwm":[{{"name":"f1","fields":["ip4.src","octets"],"time":60}}]}}"#,
                dump_path.to_str().unwrap()
            ),
        )
        .unwrap();
        let mo = MonitObject::load(tmp.path(), 1, 1 << 20, 1 << 20, 0).unwrap();
        let roots = vec![mo];

        let mfreq = MfreqTable::default();
        let geoip = NullGeoip;
        let fctx = FuncContext { mfreq: &mfreq, geoip: &geoip };

        let mut flow = FlowRecord::new();
        flow.set_raw(FieldId::Proto, &[6]);
        flow.set_raw(FieldId::Ipv4Src, &[10, 0, 0, 1]);
        dispatch(&roots, 0, &mut flow, &fctx, 0);

        let contents = std::fs::read_to_string(&dump_path).unwrap();
        assert!(contents.contains("IPv4 source address: 10.0.0.1"));
    }
}
