use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::db::Database;
use crate::db::types::{Provider, ProviderHealth};
use crate::health::HealthRegistry;
use crate::pool::ConnectionPool;
use crate::providers::Upstream;

/// 探活请求的响应头预算，固定 10 秒。
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// 健康检查被禁用时的休眠间隔。
const DISABLED_INTERVAL: Duration = Duration::from_secs(3600);

/// 周期性巡检所有服务商的后台任务。
pub struct HealthChecker {
    db: Database,
    pool: Arc<ConnectionPool>,
    registry: Arc<HealthRegistry>,
}

/// 探活结论：可达与否 + 记录用的说明文本。
/// 401/403/404/429 说明服务商本身在线，凭证/模型/限流是正交问题。
pub fn classify_probe_status(status: u16) -> (bool, String) {
    match status {
        200..=299 => (true, String::new()),
        401 | 403 => (true, "authentication error (provider is reachable)".into()),
        404 => (true, "model not found (provider is reachable)".into()),
        429 => (true, "rate limited (provider is reachable)".into()),
        500..=599 => (false, format!("server error: {status}")),
        _ => (false, format!("unexpected status: {status}")),
    }
}

/// 不健康且未到重试时间的服务商跳过本轮检查。
pub fn should_skip(health: &ProviderHealth, now: DateTime<Utc>) -> bool {
    if health.is_healthy {
        return false;
    }
    match health.next_retry_at {
        Some(next_retry) => next_retry > now,
        None => false,
    }
}

/// 最小化的合成聊天请求。
pub fn probe_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 5,
    }))
    .expect("static probe body serializes")
}

impl HealthChecker {
    pub fn new(db: Database, pool: Arc<ConnectionPool>, registry: Arc<HealthRegistry>) -> Self {
        Self { db, pool, registry }
    }

    /// 启动巡检循环；停止信号在每个休眠边界被观察。
    pub fn spawn(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("health check service started");
            // 启动即检查一次
            self.check_all_providers().await;

            loop {
                // 每轮重新读取配置，支持运行中调整间隔
                let interval = self.check_interval().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => self.check_all_providers().await,
                    _ = shutdown.changed() => {
                        tracing::info!("health check service stopped");
                        return;
                    }
                }
            }
        })
    }

    async fn check_interval(&self) -> Duration {
        match self.db.get_health_check_config().await {
            Ok(config) if !config.enabled => DISABLED_INTERVAL,
            Ok(config) => Duration::from_secs((config.interval_minutes.max(1) as u64) * 60),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read health check config, using default");
                Duration::from_secs(300)
            }
        }
    }

    async fn check_all_providers(&self) {
        let config = match self.db.get_health_check_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "failed to read health check config");
                return;
            }
        };
        if !config.enabled {
            return;
        }

        let providers = match self.db.list_providers().await {
            Ok(providers) => providers,
            Err(e) => {
                tracing::error!(error = %e, "failed to list providers for health check");
                return;
            }
        };

        tracing::debug!(provider_count = providers.len(), "starting health check");
        for provider in &providers {
            self.check_provider(provider).await;
        }
    }

    async fn check_provider(&self, provider: &Provider) {
        let health = match self.registry.get(provider.id).await {
            Ok(health) => health,
            Err(e) => {
                tracing::error!(provider = %provider.name, error = %e, "failed to read health record");
                return;
            }
        };

        if should_skip(&health, Utc::now()) {
            tracing::debug!(
                provider = %provider.name,
                next_retry = ?health.next_retry_at,
                "provider not ready for retry"
            );
            return;
        }

        let outcome = self.probe(provider).await;
        let result = match outcome {
            Ok((true, _)) => self.registry.on_success(provider.id).await,
            Ok((false, reason)) => {
                let status = reason.1;
                self.registry.on_failure(provider.id, &reason.0, status).await
            }
            Err(reason) => self.registry.on_failure(provider.id, &reason, 0).await,
        };
        if let Err(e) = result {
            tracing::error!(provider = %provider.name, error = %e, "failed to save health record");
        }
    }

    /// 发送探活请求并分类。返回 Err 表示传输层失败。
    async fn probe(
        &self,
        provider: &Provider,
    ) -> std::result::Result<(bool, (String, u16)), String> {
        let upstream = Upstream::from_provider(provider)
            .map_err(|e| format!("failed to create provider: {e}"))?;

        let pooled = self
            .pool
            .get(upstream.host())
            .map_err(|e| format!("connection pool: {e}"))?;

        let sent =
            tokio::time::timeout(PROBE_TIMEOUT, upstream.chat(&pooled.client, "test-model", &probe_body()))
                .await;
        let outcome = match sent {
            Ok(Ok(res)) => {
                let status = res.status().as_u16();
                let (reachable, note) = classify_probe_status(status);
                Ok((reachable, (note, status)))
            }
            Ok(Err(e)) => Err(format!("request failed: {e}")),
            Err(_) => Err(format!("request timed out after {PROBE_TIMEOUT:?}")),
        };

        let mut pooled = pooled;
        if outcome.is_err() {
            pooled.mark_unhealthy();
        }
        self.pool.release(upstream.host(), pooled);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;

    #[test]
    fn reachable_statuses_count_as_success() {
        for status in [200, 204, 401, 403, 404, 429] {
            let (reachable, _) = classify_probe_status(status);
            assert!(reachable, "status {status} should be reachable");
        }
        for status in [500, 502, 503, 301, 400] {
            let (reachable, _) = classify_probe_status(status);
            assert!(!reachable, "status {status} should be a failure");
        }
    }

    #[test]
    fn skip_rule_honours_next_retry() {
        let now = Utc::now();
        let mut health = ProviderHealth::never_checked(1);
        assert!(!should_skip(&health, now));

        health.is_healthy = false;
        health.next_retry_at = Some(now + ChronoDuration::hours(1));
        assert!(should_skip(&health, now));

        // 到点之后要重新检查
        health.next_retry_at = Some(now - ChronoDuration::minutes(1));
        assert!(!should_skip(&health, now));

        // 不健康但没有重试时间戳的残缺记录也要检查
        health.next_retry_at = None;
        assert!(!should_skip(&health, now));
    }

    #[test]
    fn probe_body_is_minimal_chat_request() {
        let body: Value = serde_json::from_slice(&probe_body()).unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 5);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
    }
}
