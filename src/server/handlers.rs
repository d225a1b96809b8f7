use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;

use crate::dialect::Dialect;
use crate::error::GatewayError;
use crate::providers::{ModelInfo, ModelList};
use crate::server::AppState;
use crate::service::router;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    router::route_chat(&state, Dialect::OpenAI, body).await
}

pub async fn messages(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    router::route_chat(&state, Dialect::Anthropic, body).await
}

/// 配置的逻辑模型列表，按 OpenAI ModelList 形状返回。
pub async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ModelList>, GatewayError> {
    let models = state.cache.models().await?;
    let data = models
        .into_iter()
        .map(|m| ModelInfo {
            id: m.name,
            object: "model".to_string(),
            created: m.created_at.timestamp(),
            owned_by: "llm-gateway".to_string(),
        })
        .collect();
    Ok(Json(ModelList {
        object: "list".to_string(),
        data,
    }))
}
