use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use cloudops_core::orchestrator::{
    Action, ActionFilter, ActionPayload, ActionStatus, NewAction, OperationType,
};
use uuid::Uuid;

use crate::output::{print_json, print_table, ts};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ActionSubcommand {
    /// Schedule a new action
    Create {
        /// Operation: start, stop, restart, deploy, transport
        #[arg(long = "op", value_parser = parse_operation)]
        operation: OperationType,
        /// Owning principal; dispatch partitions on it
        #[arg(long)]
        owner: String,
        #[arg(long = "app")]
        application_id: String,
        #[arg(long = "env")]
        environment: String,
        /// Credential reference, resolved from CLOUDOPS_CREDENTIAL_<REF>
        #[arg(long = "credential")]
        credential_ref: String,
        /// Branch to build (deploy)
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        revision: Option<String>,
        /// Version label for the built package (deploy)
        #[arg(long)]
        package_version: Option<String>,
        /// Environment whose deployed package is copied (transport)
        #[arg(long = "source-env")]
        source_environment: Option<String>,
        /// Destination override (transport); defaults to --env
        #[arg(long = "target-env")]
        target_environment: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        /// Earliest run time, RFC 3339 (default: now)
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
        /// Give up retrying after this time, RFC 3339
        #[arg(long, value_parser = parse_time)]
        retry_until: Option<DateTime<Utc>>,
    },

    /// List actions, newest first
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, value_parser = parse_status)]
        status: Option<ActionStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one action
    Show { id: Uuid },

    /// Show an action's log entries
    Logs { id: Uuid },

    /// Cancel a scheduled action
    Cancel { id: Uuid },

    /// Advance one step now, ignoring the schedule
    Run { id: Uuid },
}

fn parse_operation(s: &str) -> Result<OperationType, String> {
    OperationType::parse(s).ok_or_else(|| {
        let valid: Vec<&str> = OperationType::ALL.iter().map(|o| o.as_str()).collect();
        format!("unknown operation '{s}' (expected one of: {})", valid.join(", "))
    })
}

fn parse_status(s: &str) -> Result<ActionStatus, String> {
    ActionStatus::parse(s).ok_or_else(|| {
        let valid: Vec<&str> = ActionStatus::ALL.iter().map(|st| st.as_str()).collect();
        format!("unknown status '{s}' (expected one of: {})", valid.join(", "))
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time '{s}': {e}"))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ActionSubcommand, json: bool) -> anyhow::Result<()> {
    let orch = super::open_orchestrator(root)?;
    match subcmd {
        ActionSubcommand::Create {
            operation,
            owner,
            application_id,
            environment,
            credential_ref,
            branch,
            revision,
            package_version,
            source_environment,
            target_environment,
            comment,
            at,
            retry_until,
        } => {
            let req = NewAction {
                owner,
                application_id,
                environment,
                credential_ref,
                operation,
                payload: ActionPayload {
                    branch,
                    revision,
                    version: package_version,
                    source_environment,
                    target_environment,
                    comment,
                },
                scheduled_for: at,
                retry_until,
            };
            let action = orch.submit(req)?;
            if json {
                print_json(&action)?;
            } else {
                println!("Scheduled {} {} ({})", action.operation, target(&action), action.id);
            }
        }
        ActionSubcommand::List {
            owner,
            status,
            limit,
        } => {
            let actions = orch.db().list(&ActionFilter {
                owner,
                status,
                limit,
            })?;
            if json {
                print_json(&actions)?;
            } else if actions.is_empty() {
                println!("No actions.");
            } else {
                let rows = actions
                    .iter()
                    .map(|a| {
                        vec![
                            a.id.to_string(),
                            a.owner.clone(),
                            a.operation.to_string(),
                            target(a),
                            a.status.to_string(),
                            step(a),
                            a.attempt_count.to_string(),
                            ts(Some(a.updated_at)),
                        ]
                    })
                    .collect();
                print_table(
                    &["ID", "OWNER", "OP", "TARGET", "STATUS", "STEP", "ATTEMPTS", "UPDATED"],
                    rows,
                );
            }
        }
        ActionSubcommand::Show { id } => {
            let action = orch.db().get(id)?;
            if json {
                print_json(&action)?;
            } else {
                show(&action);
            }
        }
        ActionSubcommand::Logs { id } => {
            orch.db().get(id)?;
            let logs = orch.db().logs_for(id)?;
            if json {
                print_json(&logs)?;
            } else if logs.is_empty() {
                println!("No log entries.");
            } else {
                let rows = logs
                    .iter()
                    .map(|l| {
                        vec![
                            ts(Some(l.created_at)),
                            format!("{:?}", l.level).to_lowercase(),
                            l.step.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                            l.message.clone(),
                        ]
                    })
                    .collect();
                print_table(&["TIME", "LEVEL", "STEP", "MESSAGE"], rows);
            }
        }
        ActionSubcommand::Cancel { id } => {
            if !orch.cancel(id)? {
                let action = orch.db().get(id)?;
                anyhow::bail!(
                    "action {id} is {}; only scheduled actions can be canceled",
                    action.status
                );
            }
            if json {
                print_json(&orch.db().get(id)?)?;
            } else {
                println!("Canceled {id}");
            }
        }
        ActionSubcommand::Run { id } => {
            let rt = tokio::runtime::Runtime::new()?;
            let transition = rt
                .block_on(orch.run_now(id))
                .with_context(|| format!("failed to run action {id}"))?;
            let action = orch.db().get(id)?;
            if json {
                print_json(&serde_json::json!({
                    "transition": transition,
                    "action": action,
                }))?;
            } else {
                println!(
                    "{id}: {transition} (status {}, step {})",
                    action.status,
                    step(&action)
                );
            }
        }
    }
    Ok(())
}

fn target(a: &Action) -> String {
    format!("{}/{}", a.target.application_id, a.target.environment)
}

fn step(a: &Action) -> String {
    a.current_step
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn show(a: &Action) {
    println!("id:            {}", a.id);
    println!("owner:         {}", a.owner);
    println!("operation:     {}", a.operation);
    println!("target:        {}", target(a));
    println!("credential:    {}", a.credential_ref);
    println!("status:        {}", a.status);
    println!("step:          {}", step(a));
    println!("attempts:      {}", a.attempt_count);
    println!("scheduled for: {}", ts(a.scheduled_for));
    println!("retry until:   {}", ts(a.retry_until));
    println!("heartbeat:     {}", ts(a.last_heartbeat));
    println!("created:       {}", ts(Some(a.created_at)));
    println!("started:       {}", ts(a.started_at));
    println!("completed:     {}", ts(a.completed_at));
    if let Some(err) = &a.error_message {
        println!("error:         {err}");
    }
    for (k, v) in &a.step_data {
        println!("data.{k}: {v}");
    }
}
