use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/config — the effective configuration plus validation findings.
///
/// Read-only: the YAML file under `.cloudops/` is the source of truth and
/// changes take effect on the next `serve`.
pub async fn get_config(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let warnings = app.config.validate();
    Ok(Json(serde_json::json!({
        "config": serde_json::to_value(app.config.as_ref())?,
        "warnings": warnings,
    })))
}
