use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::db::Database;
use crate::db::types::{Binding, Model, Provider};
use crate::error::{GatewayError, Result};

/// {模型, 服务商, 绑定} 的进程内快照。
///
/// 热路径读取永远不碰数据库：TTL 过期时在后台整体重建快照，
/// 过期读返回旧数据（宁可旧，不可错）。
#[derive(Clone)]
pub struct ConfigCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    db: Database,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    /// 单飞刷新门：同一时刻至多一个刷新在跑
    refreshing: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
}

struct Snapshot {
    models: HashMap<String, Model>,
    providers: HashMap<i64, Provider>,
    bindings: HashMap<String, Vec<Binding>>,
    refreshed_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub models_cached: usize,
    pub providers_cached: usize,
    pub model_bindings_cached: usize,
    pub is_expired: bool,
}

impl ConfigCache {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                db,
                ttl,
                snapshot: RwLock::new(None),
                refreshing: tokio::sync::Mutex::new(()),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    /// 按名称查模型及其全部绑定。
    pub async fn lookup(&self, model_name: &str) -> Result<(Model, Vec<Binding>)> {
        self.ensure_loaded().await?;

        let guard = self.inner.snapshot.read().expect("config cache lock poisoned");
        let snapshot = guard.as_ref().expect("snapshot populated by ensure_loaded");

        let model = snapshot
            .models
            .get(model_name)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotConfigured(model_name.to_string()))?;
        let bindings = snapshot
            .bindings
            .get(model_name)
            .cloned()
            .unwrap_or_default();
        if bindings.is_empty() {
            return Err(GatewayError::NoBindings(model_name.to_string()));
        }
        Ok((model, bindings))
    }

    pub async fn provider(&self, id: i64) -> Result<Provider> {
        self.ensure_loaded().await?;

        let guard = self.inner.snapshot.read().expect("config cache lock poisoned");
        let snapshot = guard.as_ref().expect("snapshot populated by ensure_loaded");
        snapshot
            .providers
            .get(&id)
            .cloned()
            .ok_or(GatewayError::ProviderNotConfigured(id))
    }

    /// 全部逻辑模型（/v1/models 用）。
    pub async fn models(&self) -> Result<Vec<Model>> {
        self.ensure_loaded().await?;

        let guard = self.inner.snapshot.read().expect("config cache lock poisoned");
        let snapshot = guard.as_ref().expect("snapshot populated by ensure_loaded");
        let mut models: Vec<Model> = snapshot.models.values().cloned().collect();
        models.sort_by_key(|m| m.id);
        Ok(models)
    }

    /// 管理面变更后调用：下一次读取立即调度刷新。
    pub fn invalidate(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.snapshot.read().expect("config cache lock poisoned");
        match guard.as_ref() {
            Some(s) => CacheStats {
                models_cached: s.models.len(),
                providers_cached: s.providers.len(),
                model_bindings_cached: s.bindings.len(),
                is_expired: self.is_expired(s),
            },
            None => CacheStats {
                models_cached: 0,
                providers_cached: 0,
                model_bindings_cached: 0,
                is_expired: true,
            },
        }
    }

    /// 首次读取阻塞到快照可用；之后的过期读只调度后台刷新并返回旧快照。
    async fn ensure_loaded(&self) -> Result<()> {
        let needs_blocking_load = {
            let guard = self.inner.snapshot.read().expect("config cache lock poisoned");
            match guard.as_ref() {
                None => true,
                Some(s) => {
                    if self.is_expired(s) {
                        let cache = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = cache.refresh().await {
                                tracing::warn!(error = %e, "refresh config cache failed");
                            }
                        });
                    }
                    false
                }
            }
        };

        if needs_blocking_load {
            self.refresh().await?;
            let guard = self.inner.snapshot.read().expect("config cache lock poisoned");
            if guard.is_none() {
                // 并发首刷被单飞门挡掉且对端失败
                return Err(GatewayError::Config("config cache not populated".into()));
            }
        }
        Ok(())
    }

    /// 整体重建快照。单飞：发现已有刷新在跑时直接返回。
    pub async fn refresh(&self) -> Result<()> {
        let Ok(_gate) = self.inner.refreshing.try_lock() else {
            tracing::debug!("cache refresh already in progress, skipping");
            return Ok(());
        };

        // 双重检查：拿到门之后别人可能已经刷新过了
        {
            let guard = self.inner.snapshot.read().expect("config cache lock poisoned");
            if let Some(s) = guard.as_ref() {
                if !self.is_expired(s) {
                    return Ok(());
                }
            }
        }

        // 刷新自带超时，悬死的查询不能泄漏刷新任务
        let loaded = tokio::time::timeout(self.inner.ttl, self.load_snapshot()).await;
        let snapshot = match loaded {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(GatewayError::Config(format!(
                    "config cache refresh timed out after {:?}",
                    self.inner.ttl
                )));
            }
        };

        let (models, providers, bindings) = (
            snapshot.models.len(),
            snapshot.providers.len(),
            snapshot.bindings.len(),
        );

        *self
            .inner
            .snapshot
            .write()
            .expect("config cache lock poisoned") = Some(snapshot);
        self.inner.dirty.store(false, Ordering::SeqCst);
        tracing::info!(models, providers, bindings, "config cache refreshed");
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Snapshot> {
        let all_models = self.inner.db.list_models().await?;
        let all_providers = self.inner.db.list_providers().await?;
        let all_bindings = self.inner.db.list_bindings_with_model_name().await?;

        let mut models = HashMap::with_capacity(all_models.len());
        for model in all_models {
            models.insert(model.name.clone(), model);
        }
        let mut providers = HashMap::with_capacity(all_providers.len());
        for provider in all_providers {
            providers.insert(provider.id, provider);
        }
        let mut bindings: HashMap<String, Vec<Binding>> = HashMap::new();
        for (model_name, binding) in all_bindings {
            bindings.entry(model_name).or_default().push(binding);
        }

        Ok(Snapshot {
            models,
            providers,
            bindings,
            refreshed_at: Instant::now(),
        })
    }

    fn is_expired(&self, snapshot: &Snapshot) -> bool {
        self.inner.dirty.load(Ordering::SeqCst) || snapshot.refreshed_at.elapsed() > self.inner.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;

    async fn seeded_cache(ttl: Duration) -> ConfigCache {
        let db = Database::open_in_memory().unwrap();
        let pid = db
            .create_provider("prov-a", Dialect::OpenAI, "{}")
            .await
            .unwrap();
        let mid = db.create_model("m1", "", 3, 60).await.unwrap();
        db.create_binding(mid, pid, "gpt-x", None, None, None, 3)
            .await
            .unwrap();
        ConfigCache::new(db, ttl)
    }

    #[tokio::test]
    async fn lookup_hits_after_eager_first_load() {
        let cache = seeded_cache(Duration::from_secs(300)).await;
        let (model, bindings) = cache.lookup("m1").await.unwrap();
        assert_eq!(model.name, "m1");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].upstream_model, "gpt-x");

        let stats = cache.stats();
        assert_eq!(stats.models_cached, 1);
        assert_eq!(stats.providers_cached, 1);
        assert!(!stats.is_expired);
    }

    #[tokio::test]
    async fn unknown_model_and_missing_bindings_error_kinds() {
        let cache = seeded_cache(Duration::from_secs(300)).await;
        assert!(matches!(
            cache.lookup("nope").await.unwrap_err(),
            GatewayError::ModelNotConfigured(_)
        ));

        // 有模型但没有绑定
        cache.inner.db.create_model("m2", "", 1, 30).await.unwrap();
        cache.invalidate();
        cache.refresh().await.unwrap();
        assert!(matches!(
            cache.lookup("m2").await.unwrap_err(),
            GatewayError::NoBindings(_)
        ));
    }

    #[tokio::test]
    async fn provider_lookup_by_id() {
        let cache = seeded_cache(Duration::from_secs(300)).await;
        let (_, bindings) = cache.lookup("m1").await.unwrap();
        let provider = cache.provider(bindings[0].provider_id).await.unwrap();
        assert_eq!(provider.name, "prov-a");
        assert!(matches!(
            cache.provider(999).await.unwrap_err(),
            GatewayError::ProviderNotConfigured(999)
        ));
    }

    #[tokio::test]
    async fn invalidate_makes_admin_writes_visible() {
        let cache = seeded_cache(Duration::from_secs(300)).await;
        cache.lookup("m1").await.unwrap();

        let pid = cache
            .inner
            .db
            .create_provider("prov-b", Dialect::OpenAI, "{}")
            .await
            .unwrap();
        let model = cache
            .inner
            .db
            .get_model_by_name("m1")
            .await
            .unwrap()
            .unwrap();
        cache
            .inner
            .db
            .create_binding(model.id, pid, "gpt-y", None, None, None, 1)
            .await
            .unwrap();

        // 快照尚未过期，新绑定不可见
        let (_, bindings) = cache.lookup("m1").await.unwrap();
        assert_eq!(bindings.len(), 1);

        cache.invalidate();
        cache.refresh().await.unwrap();
        let (_, bindings) = cache.lookup("m1").await.unwrap();
        assert_eq!(bindings.len(), 2);
    }

    #[tokio::test]
    async fn refresh_is_single_flight() {
        let cache = seeded_cache(Duration::from_millis(1)).await;
        cache.refresh().await.unwrap();

        // 持有单飞门模拟进行中的刷新；并发 refresh 应立即返回而不更新快照
        let gate = cache.inner.refreshing.lock().await;
        cache.inner.db.create_model("m-new", "", 1, 30).await.unwrap();
        cache.invalidate();
        cache.refresh().await.unwrap();
        assert_eq!(cache.stats().models_cached, 1);
        drop(gate);

        cache.refresh().await.unwrap();
        assert_eq!(cache.stats().models_cached, 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_snapshot() {
        let cache = seeded_cache(Duration::from_secs(300)).await;
        cache.lookup("m1").await.unwrap();

        // 制造一个必然失败的刷新：破坏表结构
        {
            let conn = cache.inner.db.connection.lock().await;
            conn.execute("DROP TABLE model_with_providers", []).unwrap();
        }
        cache.invalidate();
        assert!(cache.refresh().await.is_err());

        // 旧快照仍然可读
        let (model, _) = cache.lookup("m1").await.unwrap();
        assert_eq!(model.name, "m1");
    }
}
