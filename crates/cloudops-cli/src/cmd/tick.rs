use std::path::Path;

use crate::output::print_json;

/// Run exactly one dispatch cycle: the entry point for cron-style triggers.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let orch = super::open_orchestrator(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(orch.run_cycle())?;

    if json {
        return print_json(&report);
    }
    println!(
        "selected {}: {} advanced, {} polled, {} degraded, {} succeeded, {} failed, {} rescheduled, {} skipped, {} handed off",
        report.selected,
        report.advanced,
        report.polled,
        report.degraded,
        report.succeeded,
        report.failed,
        report.rescheduled,
        report.skipped,
        report.handed_off,
    );
    if report.errors > 0 {
        println!("{} action(s) hit store errors; see logs", report.errors);
    }
    if let Some(sweep) = report.sweep {
        if sweep.actions_deleted + sweep.logs_deleted > 0 {
            println!(
                "retention: removed {} action(s), {} log entr(ies)",
                sweep.actions_deleted, sweep.logs_deleted
            );
        }
    }
    Ok(())
}
