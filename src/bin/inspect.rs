//! `flowcore-inspect`: loads a monitoring-object tree and prints its
//! compiled filter/fieldset/limit layout without ingesting any flows. Useful
//! for validating `mo.conf` changes before pointing a live collector at them.

use clap::Parser;
use flowcore::mo::MonitObject;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "flowcore-inspect", version, about = "Validate and print a monitoring-object tree's compiled layout")]
struct Cli {
    /// Root directory of monitoring-object subdirectories (the `mo-dir` from
    /// the top-level config).
    #[arg(value_name = "MO_DIR")]
    mo_dir: PathBuf,

    /// Number of ingest threads to size per-thread arenas for; only affects
    /// the byte budgets reported, not the printed layout.
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

fn print_tree(mo: &MonitObject, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{indent}{} ({})", mo.name, mo.dir.display());
    for fwm in mo.fwm.values() {
        println!("{indent}  fwm {} fields={} time={:?} extended={}", fwm.name, fwm.fieldset.key_specs.len() + fwm.fieldset.value_fields.len(), fwm.time, fwm.extended);
    }
    for mavg in mo.mavg.values() {
        println!(
            "{indent}  mavg {} window={:?} overlimit_rules={} underlimit_rules={}",
            mavg.name,
            mavg.window,
            mavg.overlimit.active().rules.len(),
            mavg.underlimit.active().rules.len()
        );
    }
    for clsf in mo.classification.values() {
        println!("{indent}  clsf class={} top_percents={}", clsf.class_id, clsf.top_percents);
    }
    for child in &mo.children {
        print_tree(child, depth + 1);
    }
}

fn main() -> ExitCode {
    flowcore::logging::init();
    let cli = Cli::parse();

    let bank_limit_bytes = 16 << 20;
    let violation_bank_limit_bytes = 16 << 20;
    let created_at_nanos = 0;

    match MonitObject::load(&cli.mo_dir, cli.threads.max(1), bank_limit_bytes, violation_bank_limit_bytes, created_at_nanos) {
        Ok(root) => {
            print_tree(&root, 0);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to load monitoring object tree at {}: {err}", cli.mo_dir.display());
            ExitCode::FAILURE
        }
    }
}
