use rusqlite::{Result, Row, params};

use crate::db::types::{ChatLog, Usage};
use crate::db::{Database, parse_ts, to_ts};

fn map_chat_log(row: &Row<'_>) -> Result<ChatLog> {
    Ok(ChatLog {
        id: Some(row.get(0)?),
        model_name: row.get(1)?,
        upstream_model: row.get(2)?,
        provider_name: row.get(3)?,
        dialect: row.get(4)?,
        status: row.get(5)?,
        error: row.get(6)?,
        retry: row.get(7)?,
        proxy_time_ms: row.get(8)?,
        first_chunk_time_ms: row.get(9)?,
        chunk_time_ms: row.get(10)?,
        tps: row.get(11)?,
        usage: Usage {
            prompt_tokens: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
            completion_tokens: row.get::<_, Option<i64>>(13)?.unwrap_or(0),
            total_tokens: row.get::<_, Option<i64>>(14)?.unwrap_or(0),
            cache_creation_tokens: row.get::<_, Option<i64>>(15)?.unwrap_or(0),
            cache_read_tokens: row.get::<_, Option<i64>>(16)?.unwrap_or(0),
        },
        created_at: parse_ts(&row.get::<_, String>(17)?)?,
    })
}

impl Database {
    pub async fn save_chat_log(&self, log: &ChatLog) -> Result<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO chat_logs (
                model_name, upstream_model, provider_name, dialect, status, error,
                retry, proxy_time_ms, first_chunk_time_ms, chunk_time_ms, tps,
                prompt_tokens, completion_tokens, total_tokens,
                cache_creation_tokens, cache_read_tokens, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                log.model_name,
                log.upstream_model,
                log.provider_name,
                log.dialect,
                log.status,
                log.error,
                log.retry,
                log.proxy_time_ms,
                log.first_chunk_time_ms,
                log.chunk_time_ms,
                log.tps,
                log.usage.prompt_tokens,
                log.usage.completion_tokens,
                log.usage.total_tokens,
                log.usage.cache_creation_tokens,
                log.usage.cache_read_tokens,
                to_ts(&log.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 流结束后由遥测消费者调用：补写耗时、用量与可能的错误。
    pub async fn update_chat_log_telemetry(
        &self,
        log_id: i64,
        first_chunk_time_ms: i64,
        chunk_time_ms: i64,
        tps: Option<f64>,
        usage: &Usage,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE chat_logs SET
                first_chunk_time_ms = ?1,
                chunk_time_ms = ?2,
                tps = ?3,
                prompt_tokens = ?4,
                completion_tokens = ?5,
                total_tokens = ?6,
                cache_creation_tokens = ?7,
                cache_read_tokens = ?8,
                status = CASE WHEN ?9 IS NULL THEN status ELSE 'error' END,
                error = COALESCE(?9, error)
             WHERE id = ?10",
            params![
                first_chunk_time_ms,
                chunk_time_ms,
                tps,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                usage.cache_creation_tokens,
                usage.cache_read_tokens,
                error,
                log_id,
            ],
        )?;
        Ok(())
    }

    pub async fn get_chat_log(&self, id: i64) -> Result<Option<ChatLog>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, model_name, upstream_model, provider_name, dialect, status, error,
                    retry, proxy_time_ms, first_chunk_time_ms, chunk_time_ms, tps,
                    prompt_tokens, completion_tokens, total_tokens,
                    cache_creation_tokens, cache_read_tokens, created_at
             FROM chat_logs WHERE id = ?1 AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query_map(params![id], map_chat_log)?;
        rows.next().transpose()
    }

    pub async fn recent_chat_logs(&self, limit: i64) -> Result<Vec<ChatLog>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, model_name, upstream_model, provider_name, dialect, status, error,
                    retry, proxy_time_ms, first_chunk_time_ms, chunk_time_ms, tps,
                    prompt_tokens, completion_tokens, total_tokens,
                    cache_creation_tokens, cache_read_tokens, created_at
             FROM chat_logs WHERE deleted_at IS NULL
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], map_chat_log)?;
        rows.collect()
    }
}
