use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use cloudops_core::orchestrator::{ActionFilter, ActionStatus, NewAction};
use cloudops_core::EngineError;

use crate::error::AppError;
use crate::state::AppState;

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::bad_request(format!("invalid action id '{raw}'")))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    status: Option<ActionStatus>,
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /api/actions — newest first, optionally filtered by owner and status.
pub async fn list_actions(
    State(app): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let orch = app.orchestrator.clone();
    let result = tokio::task::spawn_blocking(move || {
        let filter = ActionFilter {
            owner: params.owner,
            status: params.status,
            limit: params.limit,
        };
        let actions = orch.db().list(&filter)?;
        Ok::<_, EngineError>(serde_json::to_value(actions)?)
    })
    .await
    .map_err(AppError::join)??;

    Ok(Json(result))
}

/// POST /api/actions — schedule a new action.
pub async fn create_action(
    State(app): State<AppState>,
    Json(body): Json<NewAction>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let orch = app.orchestrator.clone();
    let result = tokio::task::spawn_blocking(move || {
        let action = orch.submit(body)?;
        Ok::<_, EngineError>(serde_json::to_value(action)?)
    })
    .await
    .map_err(AppError::join)??;

    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /api/actions/{id}
pub async fn get_action(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    let orch = app.orchestrator.clone();
    let result = tokio::task::spawn_blocking(move || {
        let action = orch.db().get(id)?;
        Ok::<_, EngineError>(serde_json::to_value(action)?)
    })
    .await
    .map_err(AppError::join)??;

    Ok(Json(result))
}

/// GET /api/actions/{id}/logs — the action's log entries, oldest first.
pub async fn get_action_logs(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    let orch = app.orchestrator.clone();
    let result = tokio::task::spawn_blocking(move || {
        // 404 for unknown ids instead of an empty list.
        orch.db().get(id)?;
        let logs = orch.db().logs_for(id)?;
        Ok::<_, EngineError>(serde_json::to_value(logs)?)
    })
    .await
    .map_err(AppError::join)??;

    Ok(Json(result))
}

/// POST /api/actions/{id}/cancel — only a `scheduled` action can be canceled;
/// anything else answers 409 and leaves the action untouched.
pub async fn cancel_action(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    let orch = app.orchestrator.clone();
    let (canceled, action) = tokio::task::spawn_blocking(move || {
        let canceled = orch.cancel(id)?;
        let action = orch.db().get(id)?;
        Ok::<_, EngineError>((canceled, action))
    })
    .await
    .map_err(AppError::join)??;

    if !canceled {
        return Err(AppError::conflict(format!(
            "action {id} is {}; only scheduled actions can be canceled",
            action.status
        )));
    }
    Ok(Json(serde_json::to_value(action)?))
}

/// POST /api/actions/{id}/run — advance one step now, ignoring the schedule.
pub async fn run_action(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    let transition = app.orchestrator.run_now(id).await?;
    let orch = app.orchestrator.clone();
    let action = tokio::task::spawn_blocking(move || orch.db().get(id))
        .await
        .map_err(AppError::join)??;
    Ok(Json(serde_json::json!({
        "transition": transition,
        "action": action,
    })))
}
