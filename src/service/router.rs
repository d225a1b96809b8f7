use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::balancer::weighted_random;
use crate::db::types::{Binding, ChatLog, Provider};
use crate::dialect::{Dialect, RequestFacts};
use crate::error::{GatewayError, Result};
use crate::health::HealthRegistry;
use crate::providers::Upstream;
use crate::server::AppState;
use crate::service::{telemetry, usage_stats};

/// 分流管道容量：遥测侧跟不上时降级为仅转发，绝不阻塞客户端。
const TEE_CHANNEL_CAPACITY: usize = 64;

/// 按权重的候选集：绑定ID -> 剩余权重。仅在单个请求内生效。
type CandidateItems = HashMap<i64, i64>;

/// 整条请求的路由入口：预处理、候选选择、重试转发、流式分流。
pub async fn route_chat(
    state: &Arc<AppState>,
    dialect: Dialect,
    raw_body: Bytes,
) -> Result<Response> {
    let proxy_start = Instant::now();
    let facts = RequestFacts::inspect(dialect, &raw_body)?;

    let (model, bindings) = state.cache.lookup(&facts.model).await?;

    tracing::info!(
        model = %facts.model,
        stream = facts.stream,
        tool_call = facts.wants_tool_call,
        structured_output = facts.wants_structured_output,
        image = facts.wants_image,
        "routing request"
    );

    // 逐绑定解析 Provider；快照中缺失的直接丢弃
    let mut providers: HashMap<i64, Provider> = HashMap::new();
    for binding in &bindings {
        if !providers.contains_key(&binding.provider_id) {
            if let Ok(provider) = state.cache.provider(binding.provider_id).await {
                providers.insert(provider.id, provider);
            }
        }
    }
    let mut healthy: HashMap<i64, bool> = HashMap::new();
    for provider_id in providers.keys() {
        let health = state.health.get(*provider_id).await?;
        healthy.insert(*provider_id, health.is_healthy);
    }

    let mut items = build_candidates(&facts, dialect, &bindings, &providers, &healthy)?;
    let binding_by_id: HashMap<i64, &Binding> = bindings.iter().map(|b| (b.id, b)).collect();

    // 重试过程中的错误日志走独立通道落库，不阻塞重试循环；
    // 发送端随请求结束析构，排空任务自然退出。
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<ChatLog>();
    {
        let db = state.db.clone();
        tokio::spawn(async move {
            while let Some(log) = err_rx.recv().await {
                if let Err(e) = db.save_chat_log(&log).await {
                    tracing::error!(error = %e, "failed to save chat log");
                }
            }
        });
    }

    let deadline = proxy_start + Duration::from_secs(model.timeout_secs.max(0) as u64);
    let header_budget = Duration::from_secs(model.timeout_secs.max(0) as u64) / 3;

    for retry in 0..model.max_retry {
        let now = Instant::now();
        if now >= deadline {
            return Err(GatewayError::BudgetExceeded);
        }
        if items.is_empty() {
            break;
        }

        let binding_id = weighted_random(&items)?;
        let binding = binding_by_id[&binding_id];
        let provider = &providers[&binding.provider_id];
        let upstream = Upstream::from_provider(provider)?;

        tracing::info!(
            provider = %provider.name,
            upstream_model = %binding.upstream_model,
            retry,
            "using provider"
        );

        let mut log = ChatLog::new(
            &facts.model,
            &binding.upstream_model,
            &provider.name,
            dialect,
            retry,
        );
        log.proxy_time_ms = proxy_start.elapsed().as_millis() as i64;

        let mut pooled = match state.pool.get(upstream.host()) {
            Ok(pooled) => pooled,
            Err(e) => {
                let _ = err_tx.send(log.with_error(e.to_string()));
                items.remove(&binding_id);
                continue;
            }
        };

        // 单次尝试的响应头预算 = timeout/3，且不越过外层截止时间
        let attempt_budget = header_budget.min(deadline - now).max(Duration::from_millis(1));
        let req_start = Instant::now();
        let sent = tokio::time::timeout(
            attempt_budget,
            upstream.chat(&pooled.client, &binding.upstream_model, &facts.body),
        )
        .await;

        let res = match sent {
            Ok(Ok(res)) => {
                state.pool.release(upstream.host(), pooled);
                res
            }
            Ok(Err(e)) => {
                pooled.mark_unhealthy();
                state.pool.release(upstream.host(), pooled);
                let outcome = GatewayError::UpstreamTransport(e.to_string());
                classify_failure(state, &err_tx, log, &mut items, binding_id, provider.id, 0, outcome);
                continue;
            }
            Err(_) => {
                pooled.mark_unhealthy();
                state.pool.release(upstream.host(), pooled);
                if Instant::now() >= deadline {
                    // 截止时间先于响应头到达
                    let _ = err_tx.send(log.with_error("retry budget exceeded"));
                    return Err(GatewayError::BudgetExceeded);
                }
                let outcome = GatewayError::UpstreamTransport(format!(
                    "response header timeout after {attempt_budget:?}"
                ));
                classify_failure(state, &err_tx, log, &mut items, binding_id, provider.id, 0, outcome);
                continue;
            }
        };

        let status = res.status();
        if !status.is_success() {
            let body = tokio::time::timeout(attempt_budget, res.text())
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default();
            let outcome = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                GatewayError::UpstreamRateLimited(format!("status: 429, body: {body}"))
            } else {
                GatewayError::Upstream {
                    status: status.as_u16(),
                    body,
                }
            };
            classify_failure(
                state,
                &err_tx,
                log,
                &mut items,
                binding_id,
                provider.id,
                status.as_u16(),
                outcome,
            );
            continue;
        }

        // 成功路径：先落成功日志（拿到 log_id），再挂遥测
        log.proxy_time_ms = proxy_start.elapsed().as_millis() as i64;
        let log_id = state.db.save_chat_log(&log).await?;

        {
            let registry = Arc::clone(&state.health);
            let provider_id = provider.id;
            tokio::spawn(async move {
                if let Err(e) = registry.on_success(provider_id).await {
                    tracing::error!(provider_id, error = %e, "failed to record health success");
                }
            });
        }
        {
            let db = state.db.clone();
            let provider_id = provider.id;
            let usage_log = log.clone();
            tokio::spawn(async move {
                if let Err(e) = usage_stats::update_provider_usage(&db, provider_id, &usage_log).await
                {
                    tracing::error!(provider_id, error = %e, "failed to update usage stats");
                }
            });
        }

        let (tee_tx, tee_rx) = mpsc::channel::<Bytes>(TEE_CHANNEL_CAPACITY);
        telemetry::spawn_consumer(
            state.db.clone(),
            dialect,
            facts.stream,
            log_id,
            req_start,
            tee_rx,
        );

        // 分流：每个字节原样转发给客户端，副本送入遥测管道
        let mut tee: Option<mpsc::Sender<Bytes>> = Some(tee_tx);
        let body_stream = res.bytes_stream().map(move |item| match item {
            Ok(chunk) => {
                if let Some(tx) = tee.as_ref() {
                    use tokio::sync::mpsc::error::TrySendError;
                    match tx.try_send(chunk.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!("telemetry consumer lagging, tee degraded to forward-only");
                            tee = None;
                        }
                        Err(TrySendError::Closed(_)) => tee = None,
                    }
                }
                Ok(chunk)
            }
            Err(e) => Err(std::io::Error::other(e)),
        });

        let mut builder = Response::builder().status(status.as_u16());
        if facts.stream {
            builder = builder
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache");
        } else {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let response = builder
            .body(Body::from_stream(body_stream))
            .map_err(|e| GatewayError::Config(format!("failed to build response: {e}")))?;
        return Ok(response);
    }

    if Instant::now() >= deadline {
        return Err(GatewayError::BudgetExceeded);
    }
    Err(GatewayError::RetryExhausted)
}

/// 限流降权：w -= w/3（整数除法）。权重为 1 时维持不变。
pub(crate) fn decay_weight(weight: i64) -> i64 {
    weight - weight / 3
}

/// 候选选择（纯函数）：方言过滤 → 健康过滤（带降级）→ 能力过滤 → 权重表。
pub(crate) fn build_candidates(
    facts: &RequestFacts,
    dialect: Dialect,
    bindings: &[Binding],
    providers: &HashMap<i64, Provider>,
    healthy: &HashMap<i64, bool>,
) -> Result<CandidateItems> {
    // 方言过滤
    let dialect_matched: Vec<&Binding> = bindings
        .iter()
        .filter(|b| {
            providers
                .get(&b.provider_id)
                .is_some_and(|p| p.kind == dialect)
        })
        .collect();
    if dialect_matched.is_empty() {
        return Err(GatewayError::NoProviderForModel {
            model: facts.model.clone(),
            dialect: dialect.as_str().to_string(),
        });
    }

    // 健康过滤；全部不健康时降级回退到完整方言集
    let healthy_matched: Vec<&Binding> = dialect_matched
        .iter()
        .copied()
        .filter(|b| healthy.get(&b.provider_id).copied().unwrap_or(true))
        .collect();
    let candidates = if healthy_matched.is_empty() {
        tracing::warn!(
            model = %facts.model,
            "no healthy providers found, falling back to all providers"
        );
        dialect_matched
    } else {
        healthy_matched
    };

    // 能力过滤：请求需要而绑定显式声明不支持的才剔除，未声明视为不设限
    let mut items = CandidateItems::new();
    for binding in candidates {
        if facts.wants_tool_call && binding.tool_call == Some(false) {
            continue;
        }
        if facts.wants_structured_output && binding.structured_output == Some(false) {
            continue;
        }
        if facts.wants_image && binding.image == Some(false) {
            continue;
        }
        items.insert(binding.id, binding.weight);
    }

    if items.is_empty() {
        return Err(GatewayError::NoCapableProvider(facts.model.clone()));
    }
    Ok(items)
}

/// 单次尝试失败后的统一处置：错误日志走通道、健康记录异步落库、
/// 调整候选集（限流降权，其余移除）。
#[allow(clippy::too_many_arguments)]
fn classify_failure(
    state: &Arc<AppState>,
    err_tx: &mpsc::UnboundedSender<ChatLog>,
    log: ChatLog,
    items: &mut CandidateItems,
    binding_id: i64,
    provider_id: i64,
    status_code: u16,
    outcome: GatewayError,
) {
    debug_assert!(outcome.is_recoverable());
    let reason = outcome.to_string();
    let _ = err_tx.send(log.with_error(reason.clone()));
    spawn_health_failure(&state.health, provider_id, reason, status_code);

    if matches!(outcome, GatewayError::UpstreamRateLimited(_)) {
        // 命中限流：降权但保留资格
        if let Some(weight) = items.get_mut(&binding_id) {
            *weight = decay_weight(*weight);
        }
    } else {
        items.remove(&binding_id);
    }
}

fn spawn_health_failure(
    registry: &Arc<HealthRegistry>,
    provider_id: i64,
    reason: String,
    status_code: u16,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(e) = registry.on_failure(provider_id, &reason, status_code).await {
            tracing::error!(provider_id, error = %e, "failed to record health failure");
        }
    });
}
