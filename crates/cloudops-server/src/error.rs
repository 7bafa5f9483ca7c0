use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cloudops_core::EngineError;

// ---------------------------------------------------------------------------
// Internal sentinels for explicit 4xx responses
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 409 through the `anyhow::Error` chain.
#[derive(Debug)]
struct ConflictError(String);

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConflictError {}

#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(ConflictError(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(EngineError::ActionNotFound(msg.into()).into())
    }

    pub fn join(e: tokio::task::JoinError) -> Self {
        Self(anyhow::anyhow!("task join error: {e}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<ConflictError>().is_some() {
            StatusCode::CONFLICT
        } else if self.0.downcast_ref::<BadRequestError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<EngineError>() {
            match e {
                EngineError::ActionNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::InvalidAction(_) | EngineError::InvalidConfig(_) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::StoreLocked(_) => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Db(_)
                | EngineError::PlatformClient(_)
                | EngineError::Io(_)
                | EngineError::Yaml(_)
                | EngineError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_not_found_maps_to_404() {
        let err = AppError(EngineError::ActionNotFound("abc".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_action_maps_to_400() {
        let err = AppError(EngineError::InvalidAction("owner must not be empty".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn invalid_transition_maps_to_422() {
        let err = AppError(
            EngineError::InvalidTransition {
                operation: "stop".into(),
                from: "call_start".into(),
                to: "resume".into(),
            }
            .into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn db_error_maps_to_500() {
        let err = AppError(EngineError::Db("disk full".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn locked_store_maps_to_503() {
        let err = AppError(EngineError::StoreLocked(".cloudops/actions.redb".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn other_errors_map_to_500() {
        let err = AppError(anyhow::anyhow!("something unexpected"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn conflict_constructor_maps_to_409() {
        let err = AppError::conflict("action is running");
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn bad_request_constructor_maps_to_400() {
        let err = AppError::bad_request("invalid action id");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn response_body_is_json() {
        let response = AppError::not_found("x").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .expect("should have content-type");
        assert!(ct.to_str().unwrap().contains("application/json"));
    }
}
