use bytes::Bytes;
use serde_json::{Value, json};

use crate::dialect::RequestFacts;
use crate::error::{GatewayError, Result};

/// 检查 OpenAI 风格请求体，提取路由事实。
///
/// 流式请求会被改写：注入 `stream_options.include_usage = true`，
/// 否则多数客户端不会要求上游输出最终 usage chunk。
pub fn inspect(raw: &[u8]) -> Result<RequestFacts> {
    let mut body: Value = serde_json::from_slice(raw)
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

    let wants_structured_output = body.get("response_format").is_some();

    let wants_image = has_user_content_part(&body, "image_url");

    let raw = if stream {
        body["stream_options"] = json!({ "include_usage": true });
        Bytes::from(serde_json::to_vec(&body)?)
    } else {
        Bytes::copy_from_slice(raw)
    };

    Ok(RequestFacts {
        model,
        stream,
        wants_tool_call,
        wants_structured_output,
        wants_image,
        body: raw,
    })
}

/// 任一 user 消息的 content 中包含指定类型分片即视为命中。
pub(super) fn has_user_content_part(body: &Value, part_type: &str) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return false;
    };
    messages
        .iter()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .any(|m| {
            m.get("content")
                .and_then(Value::as_array)
                .is_some_and(|parts| {
                    parts
                        .iter()
                        .any(|p| p.get("type").and_then(Value::as_str) == Some(part_type))
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_bad_request() {
        let err = inspect(br#"{"messages":[]}"#).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));

        let err = inspect(br#"{"model":"","messages":[]}"#).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn invalid_json_is_bad_request() {
        let err = inspect(b"not json").unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn non_stream_body_is_untouched() {
        let raw = br#"{"model":"m1","messages":[{"role":"user","content":"hi"}]}"#;
        let facts = inspect(raw).unwrap();
        assert_eq!(facts.model, "m1");
        assert!(!facts.stream);
        assert_eq!(&facts.body[..], &raw[..]);
    }

    #[test]
    fn stream_injects_include_usage_and_preserves_fields() {
        let raw = br#"{"model":"m1","stream":true,"temperature":0.7,"messages":[{"role":"user","content":"hi"}]}"#;
        let facts = inspect(raw).unwrap();
        assert!(facts.stream);

        let rewritten: Value = serde_json::from_slice(&facts.body).unwrap();
        assert_eq!(rewritten["stream_options"]["include_usage"], true);
        assert_eq!(rewritten["model"], "m1");
        assert_eq!(rewritten["temperature"], 0.7);
        assert_eq!(rewritten["messages"][0]["content"], "hi");
    }

    #[test]
    fn detects_tools_and_response_format() {
        let facts = inspect(
            br#"{"model":"m1","tools":[{"type":"function"}],"response_format":{"type":"json_object"},"messages":[]}"#,
        )
        .unwrap();
        assert!(facts.wants_tool_call);
        assert!(facts.wants_structured_output);

        // 空 tools 数组不算
        let facts = inspect(br#"{"model":"m1","tools":[],"messages":[]}"#).unwrap();
        assert!(!facts.wants_tool_call);
        assert!(!facts.wants_structured_output);
    }

    #[test]
    fn detects_image_url_parts_in_user_messages_only() {
        let facts = inspect(
            br#"{"model":"m1","messages":[
                {"role":"user","content":[{"type":"text","text":"look"},{"type":"image_url","image_url":{"url":"https://x/img.png"}}]}
            ]}"#,
        )
        .unwrap();
        assert!(facts.wants_image);

        let facts = inspect(
            br#"{"model":"m1","messages":[
                {"role":"assistant","content":[{"type":"image_url","image_url":{"url":"https://x/img.png"}}]},
                {"role":"user","content":"plain text"}
            ]}"#,
        )
        .unwrap();
        assert!(!facts.wants_image);
    }
}
