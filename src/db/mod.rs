use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

use chrono::{DateTime, Utc};

pub mod catalog;
pub mod chat_logs;
pub mod health;
pub mod types;
pub mod usage;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 时间统一以 UTC 字符串入库。
pub fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    use chrono::NaiveDateTime;
    let naive = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(naive.and_utc())
}

/// 网关的持久层句柄。所有访问串行经过同一个连接。
#[derive(Clone)]
pub struct Database {
    pub(super) connection: Arc<Mutex<Connection>>,
}

impl Database {
    pub async fn open(database_path: &str) -> rusqlite::Result<Self> {
        // 确保数据库文件的目录存在
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            if !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("Failed to create directory: {}", e)),
                    ));
                }
                tracing::info!("Created database directory: {}", parent.display());
            }
        }

        let conn = Connection::open(database_path)?;
        tracing::info!("Database initialized at: {}", database_path);
        Self::bootstrap(conn)
    }

    /// 测试用内存数据库。
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS providers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_providers_kind ON providers(kind)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                remark TEXT NOT NULL DEFAULT '',
                max_retry INTEGER NOT NULL DEFAULT 3,
                timeout_secs INTEGER NOT NULL DEFAULT 60,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS model_with_providers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL,
                provider_id INTEGER NOT NULL,
                upstream_model TEXT NOT NULL,
                tool_call INTEGER,
                structured_output INTEGER,
                image INTEGER,
                weight INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_mwp_model_provider
             ON model_with_providers(model_id, provider_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chat_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_name TEXT NOT NULL,
                upstream_model TEXT NOT NULL,
                provider_name TEXT NOT NULL,
                dialect TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                retry INTEGER NOT NULL DEFAULT 0,
                proxy_time_ms INTEGER NOT NULL DEFAULT 0,
                first_chunk_time_ms INTEGER,
                chunk_time_ms INTEGER,
                tps REAL,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                cache_creation_tokens INTEGER,
                cache_read_tokens INTEGER,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_logs_provider_status
             ON chat_logs(provider_name, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_logs_created_at ON chat_logs(created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS provider_validations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id INTEGER NOT NULL UNIQUE,
                is_healthy INTEGER NOT NULL DEFAULT 1,
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                consecutive_successes INTEGER NOT NULL DEFAULT 0,
                last_error TEXT NOT NULL DEFAULT '',
                last_status_code INTEGER NOT NULL DEFAULT 0,
                last_checked_at TEXT NOT NULL,
                last_success_at TEXT,
                next_retry_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_validations_next_retry
             ON provider_validations(next_retry_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS provider_usage_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                total_requests INTEGER NOT NULL DEFAULT 0,
                success_requests INTEGER NOT NULL DEFAULT 0,
                failed_requests INTEGER NOT NULL DEFAULT 0,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                avg_response_time_ms REAL NOT NULL DEFAULT 0,
                last_used_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                UNIQUE (provider_id, date)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS health_check_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                enabled INTEGER NOT NULL DEFAULT 1,
                interval_minutes INTEGER NOT NULL DEFAULT 5,
                max_error_count INTEGER NOT NULL DEFAULT 5,
                retry_after_hours INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            )",
            [],
        )?;

        // 迁移：补充旧表缺失的 cache token 列（若已存在则忽略错误）
        let _ = conn.execute(
            "ALTER TABLE chat_logs ADD COLUMN cache_creation_tokens INTEGER",
            [],
        );
        let _ = conn.execute(
            "ALTER TABLE chat_logs ADD COLUMN cache_read_tokens INTEGER",
            [],
        );

        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
        })
    }
}
