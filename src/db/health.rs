use chrono::Utc;
use rusqlite::{OptionalExtension, Result, Row, params};

use crate::db::types::{HealthCheckConfig, ProviderHealth};
use crate::db::{Database, parse_ts, to_ts};

fn map_health(row: &Row<'_>) -> Result<ProviderHealth> {
    Ok(ProviderHealth {
        provider_id: row.get(0)?,
        is_healthy: row.get(1)?,
        consecutive_errors: row.get(2)?,
        consecutive_successes: row.get(3)?,
        last_error: row.get(4)?,
        last_status_code: row.get(5)?,
        last_checked_at: parse_ts(&row.get::<_, String>(6)?)?,
        last_success_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        next_retry_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_ts(&s))
            .transpose()?,
    })
}

const HEALTH_COLUMNS: &str = "provider_id, is_healthy, consecutive_errors, consecutive_successes,
     last_error, last_status_code, last_checked_at, last_success_at, next_retry_at";

impl Database {
    pub async fn get_provider_health(&self, provider_id: i64) -> Result<Option<ProviderHealth>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HEALTH_COLUMNS} FROM provider_validations
             WHERE provider_id = ?1 AND deleted_at IS NULL"
        ))?;
        let mut rows = stmt.query_map(params![provider_id], map_health)?;
        rows.next().transpose()
    }

    pub async fn list_provider_health(&self) -> Result<Vec<ProviderHealth>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HEALTH_COLUMNS} FROM provider_validations
             WHERE deleted_at IS NULL ORDER BY provider_id"
        ))?;
        let rows = stmt.query_map([], map_health)?;
        rows.collect()
    }

    /// 整条替换式写入：记录不存在则创建。
    pub async fn upsert_provider_health(&self, health: &ProviderHealth) -> Result<()> {
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO provider_validations (
                provider_id, is_healthy, consecutive_errors, consecutive_successes,
                last_error, last_status_code, last_checked_at, last_success_at, next_retry_at,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT (provider_id) DO UPDATE SET
                is_healthy = excluded.is_healthy,
                consecutive_errors = excluded.consecutive_errors,
                consecutive_successes = excluded.consecutive_successes,
                last_error = excluded.last_error,
                last_status_code = excluded.last_status_code,
                last_checked_at = excluded.last_checked_at,
                last_success_at = excluded.last_success_at,
                next_retry_at = excluded.next_retry_at,
                updated_at = excluded.updated_at",
            params![
                health.provider_id,
                health.is_healthy,
                health.consecutive_errors,
                health.consecutive_successes,
                health.last_error,
                health.last_status_code,
                to_ts(&health.last_checked_at),
                health.last_success_at.as_ref().map(to_ts),
                health.next_retry_at.as_ref().map(to_ts),
                now,
            ],
        )?;
        Ok(())
    }

    /// 读取健康检查配置；首次访问时写入默认单例。
    pub async fn get_health_check_config(&self) -> Result<HealthCheckConfig> {
        let conn = self.connection.lock().await;
        let existing = conn
            .query_row(
                "SELECT enabled, interval_minutes, max_error_count, retry_after_hours
                 FROM health_check_configs WHERE deleted_at IS NULL
                 ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok(HealthCheckConfig {
                        enabled: row.get(0)?,
                        interval_minutes: row.get(1)?,
                        max_error_count: row.get(2)?,
                        retry_after_hours: row.get(3)?,
                    })
                },
            )
            .optional()?;

        if let Some(config) = existing {
            return Ok(config);
        }

        let config = HealthCheckConfig::default();
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO health_check_configs
             (enabled, interval_minutes, max_error_count, retry_after_hours, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                config.enabled,
                config.interval_minutes,
                config.max_error_count,
                config.retry_after_hours,
                now,
            ],
        )?;
        Ok(config)
    }

    pub async fn update_health_check_config(&self, config: &HealthCheckConfig) -> Result<()> {
        // 先保证单例存在
        drop(self.get_health_check_config().await?);
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        conn.execute(
            "UPDATE health_check_configs SET
                enabled = ?1, interval_minutes = ?2, max_error_count = ?3,
                retry_after_hours = ?4, updated_at = ?5
             WHERE deleted_at IS NULL",
            params![
                config.enabled,
                config.interval_minutes,
                config.max_error_count,
                config.retry_after_hours,
                now,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn health_record_round_trips() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_provider_health(1).await.unwrap().is_none());

        let now = Utc::now();
        let record = ProviderHealth {
            provider_id: 1,
            is_healthy: false,
            consecutive_errors: 5,
            consecutive_successes: 0,
            last_error: "status: 500".into(),
            last_status_code: 500,
            last_checked_at: now,
            last_success_at: Some(now - Duration::hours(2)),
            next_retry_at: Some(now + Duration::hours(1)),
        };
        db.upsert_provider_health(&record).await.unwrap();

        let stored = db.get_provider_health(1).await.unwrap().unwrap();
        assert!(!stored.is_healthy);
        assert_eq!(stored.consecutive_errors, 5);
        assert_eq!(stored.last_status_code, 500);
        assert!(stored.next_retry_at.is_some());
        assert!(stored.last_success_at.is_some());
    }

    #[tokio::test]
    async fn upsert_replaces_whole_record() {
        let db = Database::open_in_memory().unwrap();
        let mut record = ProviderHealth::never_checked(3);
        record.consecutive_errors = 2;
        db.upsert_provider_health(&record).await.unwrap();

        record.consecutive_errors = 0;
        record.consecutive_successes = 1;
        record.last_success_at = Some(Utc::now());
        db.upsert_provider_health(&record).await.unwrap();

        let stored = db.get_provider_health(3).await.unwrap().unwrap();
        assert_eq!(stored.consecutive_errors, 0);
        assert_eq!(stored.consecutive_successes, 1);
        assert_eq!(db.list_provider_health().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_check_config_defaults_then_updates() {
        let db = Database::open_in_memory().unwrap();
        let config = db.get_health_check_config().await.unwrap();
        assert!(config.enabled);
        assert_eq!(config.interval_minutes, 5);
        assert_eq!(config.max_error_count, 5);
        assert_eq!(config.retry_after_hours, 1);

        let updated = HealthCheckConfig {
            enabled: false,
            interval_minutes: 15,
            ..config
        };
        db.update_health_check_config(&updated).await.unwrap();

        let stored = db.get_health_check_config().await.unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.interval_minutes, 15);
    }
}
