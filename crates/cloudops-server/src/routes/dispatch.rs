use axum::extract::State;
use axum::Json;

use cloudops_core::orchestrator::CycleReport;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/dispatch — run one dispatch cycle and return its report.
///
/// This is the external trigger for deployments where a scheduler (cron, a
/// cloud timer) owns the cadence instead of the server's own ticker.
pub async fn run_cycle(State(app): State<AppState>) -> Result<Json<CycleReport>, AppError> {
    let report = app.orchestrator.run_cycle().await?;
    Ok(Json(report))
}
