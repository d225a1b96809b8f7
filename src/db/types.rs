use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// 上游服务商。config 为不透明 JSON（base_url、密钥等方言相关字段）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub kind: Dialect,
    pub config: String,
}

/// 面向客户端的逻辑模型，携带它授予的重试预算。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub remark: String,
    /// 重试次数上限
    pub max_retry: i64,
    /// 覆盖全部重试的墙钟预算，单位秒
    pub timeout_secs: i64,
    pub created_at: DateTime<Utc>,
}

/// 模型与服务商之间的多对多边。
///
/// 能力标志是三态的：None 表示未约束（历史绑定的常态），
/// Some(false) 才会在能力过滤中剔除该绑定。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: i64,
    pub model_id: i64,
    pub provider_id: i64,
    pub upstream_model: String,
    pub tool_call: Option<bool>,
    pub structured_output: Option<bool>,
    pub image: Option<bool>,
    pub weight: i64,
}

/// 每个服务商一条的健康记录。
///
/// 不变式：is_healthy 时 next_retry_at 为 None；
/// 不健康时 next_retry_at >= last_checked_at。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: i64,
    pub is_healthy: bool,
    pub consecutive_errors: i64,
    pub consecutive_successes: i64,
    pub last_error: String,
    pub last_status_code: i64,
    pub last_checked_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    /// 未知服务商的合成记录：健康、从未检查过。读取路径不落库。
    pub fn never_checked(provider_id: i64) -> Self {
        Self {
            provider_id,
            is_healthy: true,
            consecutive_errors: 0,
            consecutive_successes: 0,
            last_error: String::new(),
            last_status_code: 0,
            last_checked_at: Utc::now(),
            last_success_at: None,
            next_retry_at: None,
        }
    }
}

/// 每服务商每日用量计数器。仅成功请求推进 token 与平均耗时。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyUsage {
    pub provider_id: i64,
    pub date: NaiveDate,
    pub total_requests: i64,
    pub success_requests: i64,
    pub failed_requests: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub avg_response_time_ms: f64,
    pub last_used_at: DateTime<Utc>,
}

/// 健康检查配置，单例。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_minutes: i64,
    pub max_error_count: i64,
    pub retry_after_hours: i64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            max_error_count: 5,
            retry_after_hours: 1,
        }
    }
}

/// 流式/一次性响应中解析出的 token 用量。
///
/// cache 相关字段来自 Anthropic 的 usage 扩展，入库但不参与 TPS 计算。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(default)]
    pub cache_creation_tokens: i64,
    #[serde(default)]
    pub cache_read_tokens: i64,
}

/// 每次被路由的请求一条。创建于转发成功（收到响应头）时，
/// 流结束后由遥测消费者更新一次。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatLog {
    pub id: Option<i64>,
    pub model_name: String,
    pub upstream_model: String,
    pub provider_name: String,
    pub dialect: String,
    pub status: String,
    pub error: Option<String>,
    pub retry: i64,
    pub proxy_time_ms: i64,
    pub first_chunk_time_ms: Option<i64>,
    pub chunk_time_ms: Option<i64>,
    pub tps: Option<f64>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

impl ChatLog {
    pub fn new(
        model_name: &str,
        upstream_model: &str,
        provider_name: &str,
        dialect: Dialect,
        retry: i64,
    ) -> Self {
        Self {
            id: None,
            model_name: model_name.to_string(),
            upstream_model: upstream_model.to_string(),
            provider_name: provider_name.to_string(),
            dialect: dialect.as_str().to_string(),
            status: STATUS_SUCCESS.to_string(),
            error: None,
            retry,
            proxy_time_ms: 0,
            first_chunk_time_ms: None,
            chunk_time_ms: None,
            tps: None,
            usage: Usage::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.status = STATUS_ERROR.to_string();
        self.error = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_error_flips_status() {
        let log = ChatLog::new("m1", "gpt-x", "prov-a", Dialect::OpenAI, 2);
        assert!(log.is_success());
        let log = log.with_error("status: 500");
        assert_eq!(log.status, STATUS_ERROR);
        assert_eq!(log.error.as_deref(), Some("status: 500"));
        assert_eq!(log.retry, 2);
    }

    #[test]
    fn never_checked_stub_is_healthy() {
        let stub = ProviderHealth::never_checked(9);
        assert!(stub.is_healthy);
        assert_eq!(stub.consecutive_errors, 0);
        assert!(stub.next_retry_at.is_none());
        assert!(stub.last_success_at.is_none());
    }
}
