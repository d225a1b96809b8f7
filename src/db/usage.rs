use chrono::{NaiveDate, Utc};
use rusqlite::{Result, Row, params};

use crate::db::types::DailyUsage;
use crate::db::{Database, parse_ts, to_ts};

const DATE_FORMAT: &str = "%Y-%m-%d";

fn map_usage(row: &Row<'_>) -> Result<DailyUsage> {
    let date: String = row.get(1)?;
    Ok(DailyUsage {
        provider_id: row.get(0)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        total_requests: row.get(2)?,
        success_requests: row.get(3)?,
        failed_requests: row.get(4)?,
        prompt_tokens: row.get(5)?,
        completion_tokens: row.get(6)?,
        total_tokens: row.get(7)?,
        avg_response_time_ms: row.get(8)?,
        last_used_at: parse_ts(&row.get::<_, String>(9)?)?,
    })
}

const USAGE_COLUMNS: &str = "provider_id, date, total_requests, success_requests, failed_requests,
     prompt_tokens, completion_tokens, total_tokens, avg_response_time_ms, last_used_at";

impl Database {
    pub async fn get_daily_usage(
        &self,
        provider_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailyUsage>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USAGE_COLUMNS} FROM provider_usage_stats
             WHERE provider_id = ?1 AND date = ?2 AND deleted_at IS NULL"
        ))?;
        let mut rows = stmt.query_map(
            params![provider_id, date.format(DATE_FORMAT).to_string()],
            map_usage,
        )?;
        rows.next().transpose()
    }

    pub async fn upsert_daily_usage(&self, usage: &DailyUsage) -> Result<()> {
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO provider_usage_stats (
                provider_id, date, total_requests, success_requests, failed_requests,
                prompt_tokens, completion_tokens, total_tokens, avg_response_time_ms,
                last_used_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT (provider_id, date) DO UPDATE SET
                total_requests = excluded.total_requests,
                success_requests = excluded.success_requests,
                failed_requests = excluded.failed_requests,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                total_tokens = excluded.total_tokens,
                avg_response_time_ms = excluded.avg_response_time_ms,
                last_used_at = excluded.last_used_at,
                updated_at = excluded.updated_at",
            params![
                usage.provider_id,
                usage.date.format(DATE_FORMAT).to_string(),
                usage.total_requests,
                usage.success_requests,
                usage.failed_requests,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                usage.avg_response_time_ms,
                to_ts(&usage.last_used_at),
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn list_daily_usage_since(
        &self,
        provider_id: i64,
        since: NaiveDate,
    ) -> Result<Vec<DailyUsage>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {USAGE_COLUMNS} FROM provider_usage_stats
             WHERE provider_id = ?1 AND date >= ?2 AND deleted_at IS NULL
             ORDER BY date DESC"
        ))?;
        let rows = stmt.query_map(
            params![provider_id, since.format(DATE_FORMAT).to_string()],
            map_usage,
        )?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn usage_upsert_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert!(db.get_daily_usage(1, date).await.unwrap().is_none());

        let usage = DailyUsage {
            provider_id: 1,
            date,
            total_requests: 1,
            success_requests: 1,
            failed_requests: 0,
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
            avg_response_time_ms: 120.0,
            last_used_at: Utc::now(),
        };
        db.upsert_daily_usage(&usage).await.unwrap();

        let mut updated = db.get_daily_usage(1, date).await.unwrap().unwrap();
        assert_eq!(updated.total_requests, 1);
        assert_eq!(updated.avg_response_time_ms, 120.0);

        updated.total_requests = 2;
        updated.failed_requests = 1;
        db.upsert_daily_usage(&updated).await.unwrap();

        let stored = db.get_daily_usage(1, date).await.unwrap().unwrap();
        assert_eq!(stored.total_requests, 2);
        assert_eq!(stored.failed_requests, 1);
        // (provider, date) 唯一
        assert_eq!(db.list_daily_usage_since(1, date).await.unwrap().len(), 1);
    }
}
