pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;

use crate::cache::ConfigCache;
use crate::config::Settings;
use crate::db::Database;
use crate::health::HealthRegistry;
use crate::pool::ConnectionPool;

/// 进程级共享状态。单例（连接池/配置缓存/健康注册表）作为依赖注入，
/// 而不是通过全局名字访问。
pub struct AppState {
    pub settings: Settings,
    pub db: Database,
    pub cache: ConfigCache,
    pub pool: Arc<ConnectionPool>,
    pub health: Arc<HealthRegistry>,
    /// 入站鉴权令牌；为空则关闭鉴权
    pub inbound_token: String,
}

impl AppState {
    pub fn new(settings: Settings, db: Database) -> Arc<Self> {
        let cache = ConfigCache::new(db.clone(), Duration::from_secs(settings.cache.ttl_secs));
        let pool = ConnectionPool::new(
            settings.pool.max_conns_per_host,
            settings.pool.max_idle_conns,
        );
        let health = HealthRegistry::new(db.clone());
        Arc::new(Self {
            settings,
            db,
            cache,
            pool,
            health,
            inbound_token: Settings::inbound_token(),
        })
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let openai_routes = Router::new()
        .route(
            "/v1/chat/completions",
            axum::routing::post(handlers::chat_completions),
        )
        .route("/v1/models", axum::routing::get(handlers::list_models))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_bearer,
        ));

    let anthropic_routes = Router::new()
        .route("/v1/messages", axum::routing::post(handlers::messages))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    Router::new()
        .merge(openai_routes)
        .merge(anthropic_routes)
        .with_state(state)
}
