use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::db::Database;
use crate::db::types::ProviderHealth;
use crate::error::Result;

/// 服务商健康状态的唯一事实来源。
///
/// 路由器在每次转发结果上调用，后台检查器在周期扫描中调用；
/// 两边共用同一套状态迁移。
pub struct HealthRegistry {
    db: Database,
}

impl HealthRegistry {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// 读取健康记录；没有记录的服务商视为健康且从未检查过（不落库）。
    pub async fn get(&self, provider_id: i64) -> Result<ProviderHealth> {
        Ok(self
            .db
            .get_provider_health(provider_id)
            .await?
            .unwrap_or_else(|| ProviderHealth::never_checked(provider_id)))
    }

    pub async fn get_all(&self) -> Result<Vec<ProviderHealth>> {
        Ok(self.db.list_provider_health().await?)
    }

    pub async fn on_success(&self, provider_id: i64) -> Result<()> {
        let mut health = self.get(provider_id).await?;
        let now = Utc::now();

        let was_unhealthy = !health.is_healthy;
        health.consecutive_successes += 1;
        health.consecutive_errors = 0;
        health.last_success_at = Some(now);
        health.last_checked_at = now;

        if was_unhealthy {
            tracing::info!(
                provider_id,
                previous_error = %health.last_error,
                "provider recovered from unhealthy state"
            );
            health.is_healthy = true;
            health.last_error = String::new();
            health.next_retry_at = None;
        }

        self.db.upsert_provider_health(&health).await?;
        Ok(())
    }

    pub async fn on_failure(&self, provider_id: i64, reason: &str, status_code: u16) -> Result<()> {
        let config = self.db.get_health_check_config().await?;
        let mut health = self.get(provider_id).await?;
        let now = Utc::now();

        health.consecutive_errors += 1;
        health.consecutive_successes = 0;
        health.last_error = reason.to_string();
        health.last_status_code = status_code as i64;
        health.last_checked_at = now;

        if health.consecutive_errors >= config.max_error_count && health.is_healthy {
            tracing::warn!(
                provider_id,
                consecutive_errors = health.consecutive_errors,
                "provider marked as unhealthy"
            );
            health.is_healthy = false;
            health.next_retry_at = Some(now + Duration::hours(config.retry_after_hours));
        }

        self.db.upsert_provider_health(&health).await?;
        Ok(())
    }
}
