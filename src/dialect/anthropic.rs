use bytes::Bytes;
use serde_json::Value;

use crate::dialect::RequestFacts;
use crate::dialect::openai::has_user_content_part;
use crate::error::{GatewayError, Result};

/// 检查 Anthropic 风格请求体。不改写请求体。
///
/// Anthropic 的结构化输出走 tool use，路由时二者视为同一种能力。
pub fn inspect(raw: &[u8]) -> Result<RequestFacts> {
    let body: Value = serde_json::from_slice(raw)
        .map_err(|e| GatewayError::BadRequest(format!("invalid json body: {e}")))?;

    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if model.is_empty() {
        return Err(GatewayError::BadRequest("model is empty".into()));
    }

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let wants_tool_call = body
        .get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty());

    let wants_image = has_user_content_part(&body, "image");

    Ok(RequestFacts {
        model,
        stream,
        wants_tool_call,
        wants_structured_output: wants_tool_call,
        wants_image,
        body: Bytes::copy_from_slice(raw),
    })
}
