use std::path::Path;

use chrono::Utc;

use crate::output::print_json;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let orch = super::open_orchestrator(root)?;
    let report = orch.sweep(Utc::now())?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Removed {} action(s) and {} log entr(ies).",
            report.actions_deleted, report.logs_deleted
        );
    }
    Ok(())
}
