use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod openai;

/// 上游协议方言：决定请求预处理、转发头与流式解析方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    OpenAI,
    Anthropic,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAI => "openai",
            Dialect::Anthropic => "anthropic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Dialect::OpenAI),
            "anthropic" => Some(Dialect::Anthropic),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 请求体检查结果：路由所需的全部事实。
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub model: String,
    pub stream: bool,
    pub wants_tool_call: bool,
    pub wants_structured_output: bool,
    pub wants_image: bool,
    /// 可能被改写过的请求体（OpenAI 流式会注入 stream_options）
    pub body: Bytes,
}

impl RequestFacts {
    pub fn inspect(dialect: Dialect, raw: &[u8]) -> crate::error::Result<Self> {
        match dialect {
            Dialect::OpenAI => openai::inspect(raw),
            Dialect::Anthropic => anthropic::inspect(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_round_trips_through_str() {
        assert_eq!(Dialect::parse("openai"), Some(Dialect::OpenAI));
        assert_eq!(Dialect::parse("anthropic"), Some(Dialect::Anthropic));
        assert_eq!(Dialect::parse("gemini"), None);
        assert_eq!(Dialect::OpenAI.as_str(), "openai");
        assert_eq!(Dialect::Anthropic.to_string(), "anthropic");
    }
}
