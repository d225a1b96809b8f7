use crate::error::Result as AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7070,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "data/gateway.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 配置快照的TTL，过期后后台异步刷新
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_conns_per_host")]
    pub max_conns_per_host: usize,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: default_max_conns_per_host(),
            max_idle_conns: default_max_idle_conns(),
        }
    }
}

fn default_max_conns_per_host() -> usize {
    100
}

fn default_max_idle_conns() -> usize {
    50
}

impl Settings {
    /// 加载配置文件；不存在时使用默认值（纯环境变量部署场景）。
    pub fn load() -> AppResult<Self> {
        match Self::find_config_file() {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                let settings: Settings = toml::from_str(&content)?;
                Ok(settings)
            }
            None => Ok(Settings::default()),
        }
    }

    /// 网关入站鉴权令牌；为空则关闭鉴权。
    pub fn inbound_token() -> String {
        std::env::var("TOKEN").unwrap_or_default()
    }

    fn find_config_file() -> Option<String> {
        let possible_names = ["custom-config.toml", "config.toml"];

        possible_names
            .iter()
            .find(|name| Path::new(name).exists())
            .map(|name| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_contract() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 7070);
        assert_eq!(settings.cache.ttl_secs, 300);
        assert_eq!(settings.pool.max_conns_per_host, 100);
        assert_eq!(settings.pool.max_idle_conns, 50);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [database]
            path = "/tmp/test.db"
            "#,
        )
        .unwrap();
        assert_eq!(settings.database.path, "/tmp/test.db");
        assert_eq!(settings.server.port, 7070);
        assert_eq!(settings.cache.ttl_secs, 300);
    }
}
