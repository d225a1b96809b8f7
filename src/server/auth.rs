use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::GatewayError;
use crate::server::AppState;

/// OpenAI 风格入站鉴权：`Authorization: Bearer <token>`。
/// 未配置令牌时放行全部请求。
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if state.inbound_token.is_empty() {
        return Ok(next.run(request).await);
    }

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Unauthorized("Authorization header is missing".into()))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| GatewayError::Unauthorized("Invalid authorization header".into()))?;

    if token != state.inbound_token {
        return Err(GatewayError::Unauthorized("Invalid token".into()));
    }
    Ok(next.run(request).await)
}

/// Anthropic 风格入站鉴权：`x-api-key: <token>`。
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if state.inbound_token.is_empty() {
        return Ok(next.run(request).await);
    }

    let key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GatewayError::Unauthorized("x-api-key header is missing".into()))?;

    if key != state.inbound_token {
        return Err(GatewayError::Unauthorized("Invalid token".into()));
    }
    Ok(next.run(request).await)
}
