use serde_json::Value;

use crate::db::types::Provider;
use crate::error::{GatewayError, Result};

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicUpstream;
pub use openai::{ModelInfo, ModelList, OpenAIUpstream};

/// 上游调用方：从 Provider 的不透明 JSON 配置构造。
pub enum Upstream {
    OpenAI(OpenAIUpstream),
    Anthropic(AnthropicUpstream),
}

impl Upstream {
    pub fn from_provider(provider: &Provider) -> Result<Self> {
        match provider.kind {
            crate::dialect::Dialect::OpenAI => {
                Ok(Upstream::OpenAI(serde_json::from_str(&provider.config)?))
            }
            crate::dialect::Dialect::Anthropic => {
                Ok(Upstream::Anthropic(serde_json::from_str(&provider.config)?))
            }
        }
    }

    /// 连接池按 base_url 归组。
    pub fn host(&self) -> &str {
        match self {
            Upstream::OpenAI(u) => &u.base_url,
            Upstream::Anthropic(u) => &u.base_url,
        }
    }

    /// 发送聊天请求：改写 body 的 model 字段后转发，响应头到达即返回。
    pub async fn chat(
        &self,
        client: &reqwest::Client,
        model: &str,
        raw_body: &[u8],
    ) -> Result<reqwest::Response> {
        let body = stamp_model(raw_body, model)?;
        let request = match self {
            Upstream::OpenAI(u) => u.chat_request(client, body),
            Upstream::Anthropic(u) => u.chat_request(client, body),
        };
        Ok(request.send().await?)
    }
}

/// 将请求体中的 model 字段覆盖为绑定的上游模型名，其余字段保持不变。
pub fn stamp_model(raw: &[u8], model: &str) -> Result<Vec<u8>> {
    let mut body: Value = serde_json::from_slice(raw)
        .map_err(|e| GatewayError::BadRequest(format!("invalid json body: {e}")))?;
    body["model"] = Value::String(model.to_string());
    Ok(serde_json::to_vec(&body)?)
}
