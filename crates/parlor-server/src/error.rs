//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: msg.into(),
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": "error",
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<parlor_core::Error> for ApiError {
    fn from(err: parlor_core::Error) -> Self {
        match &err {
            parlor_core::Error::Validation(_) | parlor_core::Error::Configuration(_) => {
                ApiError::bad_request(err.to_string())
            }
            parlor_core::Error::NotFound(_) => ApiError::not_found(err.to_string()),
            parlor_core::Error::Transport(_) => ApiError::bad_gateway(err.to_string()),
            parlor_core::Error::Upstream { status, .. } => {
                // A 4xx from a provider is the caller's problem; anything
                // else surfaces as a gateway failure.
                match status {
                    Some(code) if (400..500).contains(code) => {
                        ApiError::bad_request(err.to_string())
                    }
                    _ => ApiError::bad_gateway(err.to_string()),
                }
            }
            _ => ApiError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_expected_statuses() {
        let api: ApiError = parlor_core::Error::validation("bad input").into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);

        let api: ApiError = parlor_core::Error::NotFound("gone".into()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);

        let api: ApiError = parlor_core::Error::Transport("refused".into()).into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);

        let api: ApiError = parlor_core::Error::upstream(Some(401), "no key").into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);

        let api: ApiError = parlor_core::Error::upstream(Some(503), "down").into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
    }
}
