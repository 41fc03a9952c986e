//! Mapping of engine errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use stagehand_core::Error;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Engine(Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Engine(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Engine(
                Error::CycleDetected(_) | Error::InvalidPipeline(_) | Error::UnknownStage(_),
            ) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Engine(
                Error::NotReady { .. }
                | Error::ApprovalNotRequired { .. }
                | Error::InstanceTerminated(_),
            ) => StatusCode::CONFLICT,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => msg.clone(),
            ApiError::Engine(e) => e.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %message, "Request failed");
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Parse a prefixed id from a path segment.
pub fn parse_id<T: std::str::FromStr>(raw: &str, kind: &str) -> ApiResult<T> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid {} ID: {}", kind, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::PipelineNotFound("p".into()), StatusCode::NOT_FOUND),
            (
                Error::StageNotFound {
                    instance: "i".into(),
                    stage: "s".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                Error::CycleDetected("a".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                Error::NotReady {
                    stage: "deploy".into(),
                },
                StatusCode::CONFLICT,
            ),
            (Error::InstanceTerminated("i".into()), StatusCode::CONFLICT),
            (
                Error::Dispatch("down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
