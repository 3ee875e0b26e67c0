use axum::http::StatusCode;
use axum::response::IntoResponse;
use thiserror::Error;

/// The typed error surface of the tower. Anything that isn't one of these
/// never reaches an HTTP handler; internal helpers convert into the
/// closest-fitting variant at the point they're called from admission.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request; recovered locally, 400 to the caller.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Protocol invariant violated by a mode-specific inspector; 400.
    #[error("inspection failed: {0}")]
    InspectionFailed(String),

    /// Invariant breach inside the tower itself (e.g. a gas-queue
    /// construction check). Logged, 500, process keeps running.
    #[error("application error: {0}")]
    ApplicationError(String),

    /// RPC timeout or 5xx from the chain endpoint. Retried with backoff at
    /// the call site; should never reach the HTTP boundary, but is part of
    /// the typed surface so every component reports it the same way.
    #[error("transient provider error: {0}")]
    TransientProviderError(String),

    /// The reorg detector's common ancestor fell below the retained
    /// window. Fatal: the process exits and relies on the supervisor
    /// restarting it plus Store-driven recovery.
    #[error("deep reorg: common ancestor below retention window")]
    DeepReorg,

    /// The Responder exhausted `max_attempts` for an intent.
    #[error("response failed after exhausting retries")]
    ResponseFailed,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ValidationFailed(_) | Error::InspectionFailed(_) => StatusCode::BAD_REQUEST,
            Error::ApplicationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::TransientProviderError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::DeepReorg => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ResponseFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failed_maps_to_400() {
        let response = Error::ValidationFailed("bad field".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn inspection_failed_maps_to_400() {
        let response = Error::InspectionFailed("stale round".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn application_error_maps_to_500() {
        let response = Error::ApplicationError("queue invariant broken".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
