use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors that abort a setup request.
///
/// Everything the user can correct is collected as a
/// [`SetupIssue`](crate::setup::validation::SetupIssue) instead and rendered with
/// the form.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The installed flag is already set. The wizard never runs twice.
    #[error("The forum has already been installed.")]
    AlreadyInstalled,

    /// The current session lacks the permission required for the route.
    #[error("You don't have permission to do that.")]
    PermissionDenied,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SetupResult<T> = Result<T, SetupError>;

impl IntoResponse for SetupError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            SetupError::AlreadyInstalled => (
                StatusCode::FORBIDDEN,
                "ALREADY_INSTALLED",
                self.to_string(),
            ),
            SetupError::PermissionDenied => (
                StatusCode::FORBIDDEN,
                "PERMISSION_DENIED",
                self.to_string(),
            ),
            SetupError::Internal(err) => {
                log::error!("[PHASE: http] [STEP: error] Internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_installed_maps_to_forbidden() {
        let resp = SetupError::AlreadyInstalled.into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn internal_error_hides_details() {
        let err = SetupError::Internal(anyhow::anyhow!("disk exploded at /secret/path"));
        assert_eq!(err.to_string(), "disk exploded at /secret/path");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
