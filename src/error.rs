use thiserror::Error;

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use crate::balancer::PickError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pick error: {0}")]
    Pick(#[from] PickError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("model {0} is not configured")]
    ModelNotConfigured(String),

    #[error("no bindings for model {0}")]
    NoBindings(String),

    #[error("provider {0} is not configured")]
    ProviderNotConfigured(i64),

    #[error("no {dialect} provider found for model {model}")]
    NoProviderForModel { model: String, dialect: String },

    #[error("no provider with tool_call or structured_output or image found for model {0}")]
    NoCapableProvider(String),

    #[error("connection limit reached for host {host}: {active}/{max}")]
    ConnectionLimitReached {
        host: String,
        active: usize,
        max: usize,
    },

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    #[error("upstream error: status: {status}, body: {body}")]
    Upstream { status: u16, body: String },

    #[error("maximum retry attempts reached")]
    RetryExhausted,

    #[error("retry budget exceeded")]
    BudgetExceeded,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) | GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::ModelNotConfigured(_)
            | GatewayError::NoBindings(_)
            | GatewayError::ProviderNotConfigured(_) => StatusCode::NOT_FOUND,
            GatewayError::NoProviderForModel { .. }
            | GatewayError::NoCapableProvider(_)
            | GatewayError::RetryExhausted
            | GatewayError::BudgetExceeded
            | GatewayError::Pick(_)
            | GatewayError::ConnectionLimitReached { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Http(_)
            | GatewayError::UpstreamTransport(_)
            | GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::Http(_) => "http_error",
            GatewayError::Json(_) => "json_error",
            GatewayError::Toml(_) => "toml_error",
            GatewayError::Db(_) => "db_error",
            GatewayError::Io(_) => "io_error",
            GatewayError::Pick(_) => "pick_error",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::ModelNotConfigured(_) => "model_not_configured",
            GatewayError::NoBindings(_) => "no_bindings",
            GatewayError::ProviderNotConfigured(_) => "provider_not_configured",
            GatewayError::NoProviderForModel { .. } => "no_provider_for_model",
            GatewayError::NoCapableProvider(_) => "no_capable_provider",
            GatewayError::ConnectionLimitReached { .. } => "connection_limit_reached",
            GatewayError::UpstreamTransport(_) => "upstream_transport_error",
            GatewayError::UpstreamRateLimited(_) => "upstream_rate_limited",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::RetryExhausted => "retry_exhausted",
            GatewayError::BudgetExceeded => "budget_exceeded",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Config(_) => "config_error",
        }
    }

    /// Whether the retry engine may keep trying other candidates after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamTransport(_)
                | GatewayError::UpstreamRateLimited(_)
                | GatewayError::Upstream { .. }
                | GatewayError::ConnectionLimitReached { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_errors_map_to_503() {
        let err = GatewayError::NoProviderForModel {
            model: "m1".into(),
            dialect: "openai".into(),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            GatewayError::RetryExhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::BudgetExceeded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn lookup_errors_map_to_404() {
        assert_eq!(
            GatewayError::ModelNotConfigured("m1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::NoBindings("m1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::ProviderNotConfigured(7).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn upstream_outcomes_are_recoverable() {
        assert!(GatewayError::UpstreamTransport("timeout".into()).is_recoverable());
        assert!(GatewayError::UpstreamRateLimited("429".into()).is_recoverable());
        assert!(
            GatewayError::Upstream {
                status: 500,
                body: "oops".into()
            }
            .is_recoverable()
        );
        assert!(
            GatewayError::ConnectionLimitReached {
                host: "api.example.com".into(),
                active: 100,
                max: 100
            }
            .is_recoverable()
        );
        assert!(!GatewayError::BadRequest("model is empty".into()).is_recoverable());
        assert!(!GatewayError::RetryExhausted.is_recoverable());
    }
}
