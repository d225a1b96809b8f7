use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::GatewayError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const MAX_CONN_LIFETIME: Duration = Duration::from_secs(30 * 60);
const LEAK_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// 池化的 HTTP 客户端及其使用信息。
#[derive(Clone, Debug)]
pub struct PooledClient {
    pub client: reqwest::Client,
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    healthy: bool,
}

impl PooledClient {
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

struct HostPool {
    idle: VecDeque<PooledClient>,
    in_use: HashMap<u64, Instant>,
    active: usize,
}

/// 按主机划分的 HTTP 客户端池。
///
/// 客户端不设整体超时（完整下载流式响应可能很长），
/// 响应头预算由调用方在发送时包一层超时实现。
pub struct ConnectionPool {
    pools: Mutex<HashMap<String, Arc<Mutex<HostPool>>>>,
    max_conns_per_host: usize,
    max_idle_conns: usize,
    next_id: std::sync::atomic::AtomicU64,
    leaked_total: std::sync::atomic::AtomicU64,
    recycled_total: std::sync::atomic::AtomicU64,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_hosts: usize,
    pub total_active: usize,
    pub total_idle: usize,
    pub max_conns_per_host: usize,
    pub leaked_connections: u64,
    pub recycled_connections: u64,
    pub uptime_secs: u64,
}

impl ConnectionPool {
    pub fn new(max_conns_per_host: usize, max_idle_conns: usize) -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(HashMap::new()),
            max_conns_per_host,
            max_idle_conns,
            next_id: std::sync::atomic::AtomicU64::new(1),
            leaked_total: std::sync::atomic::AtomicU64::new(0),
            recycled_total: std::sync::atomic::AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    /// 获取指定主机的客户端：优先复用空闲连接，必要时新建。
    pub fn get(&self, host: &str) -> Result<PooledClient, GatewayError> {
        let pool = self.host_pool(host);
        let mut hp = pool.lock().expect("host pool lock poisoned");

        // 先扫空闲队列，丢弃超龄或不健康的连接
        while let Some(mut client) = hp.idle.pop_front() {
            if !client.healthy || client.created_at.elapsed() > MAX_CONN_LIFETIME {
                self.recycled_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }
            client.last_used_at = Instant::now();
            client.use_count += 1;
            hp.in_use.insert(client.id, client.last_used_at);
            hp.active += 1;
            tracing::debug!(host, use_count = client.use_count, "reusing idle connection");
            return Ok(client);
        }

        if hp.active >= self.max_conns_per_host {
            return Err(GatewayError::ConnectionLimitReached {
                host: host.to_string(),
                active: hp.active,
                max: self.max_conns_per_host,
            });
        }

        let client = self.build_client()?;
        hp.in_use.insert(client.id, client.last_used_at);
        hp.active += 1;
        tracing::debug!(host, active = hp.active, "created new connection");
        Ok(client)
    }

    /// 归还客户端：超龄、不健康或队列已满则直接丢弃。
    pub fn release(&self, host: &str, client: PooledClient) {
        let pool = self.host_pool(host);
        let mut hp = pool.lock().expect("host pool lock poisoned");

        if hp.in_use.remove(&client.id).is_none() {
            // 已被巡检判定泄漏并回收
            return;
        }
        hp.active = hp.active.saturating_sub(1);

        if !client.healthy || client.created_at.elapsed() > MAX_CONN_LIFETIME {
            self.recycled_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!(host, "dropping expired or unhealthy connection");
            return;
        }
        if hp.idle.len() >= self.max_idle_conns {
            tracing::debug!(host, "idle queue full, dropping connection");
            return;
        }

        let mut client = client;
        client.last_used_at = Instant::now();
        hp.idle.push_back(client);
    }

    /// 周期巡检：回收过期空闲连接，强制清理疑似泄漏的在用连接。
    pub fn sweep(&self) {
        let pools: Vec<(String, Arc<Mutex<HostPool>>)> = {
            let guard = self.pools.lock().expect("pool map lock poisoned");
            guard
                .iter()
                .map(|(host, pool)| (host.clone(), Arc::clone(pool)))
                .collect()
        };

        let mut total_leaked = 0u64;
        let mut total_recycled = 0u64;

        for (host, pool) in pools {
            let mut hp = pool.lock().expect("host pool lock poisoned");

            let before = hp.idle.len();
            hp.idle
                .retain(|c| c.healthy && c.created_at.elapsed() <= MAX_CONN_LIFETIME);
            let recycled = (before - hp.idle.len()) as u64;

            let leaked_ids: Vec<u64> = hp
                .in_use
                .iter()
                .filter(|(_, last_used)| last_used.elapsed() > LEAK_THRESHOLD)
                .map(|(id, _)| *id)
                .collect();
            let leaked = leaked_ids.len() as u64;
            for id in leaked_ids {
                hp.in_use.remove(&id);
                hp.active = hp.active.saturating_sub(1);
            }

            if leaked > 0 {
                tracing::warn!(host = %host, count = leaked, "detected leaked connections");
            }
            if recycled > 0 {
                tracing::info!(host = %host, count = recycled, "recycled expired connections");
            }
            total_leaked += leaked;
            total_recycled += recycled;
        }

        self.leaked_total
            .fetch_add(total_leaked, std::sync::atomic::Ordering::Relaxed);
        self.recycled_total
            .fetch_add(total_recycled, std::sync::atomic::Ordering::Relaxed);

        if total_leaked > 0 || total_recycled > 0 {
            tracing::info!(
                recycled_connections = total_recycled,
                leaked_connections = total_leaked,
                "connection sweep completed"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        let guard = self.pools.lock().expect("pool map lock poisoned");
        let mut stats = PoolStats {
            total_hosts: guard.len(),
            total_active: 0,
            total_idle: 0,
            max_conns_per_host: self.max_conns_per_host,
            leaked_connections: self.leaked_total.load(std::sync::atomic::Ordering::Relaxed),
            recycled_connections: self
                .recycled_total
                .load(std::sync::atomic::Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        };
        for pool in guard.values() {
            let hp = pool.lock().expect("host pool lock poisoned");
            stats.total_active += hp.active;
            stats.total_idle += hp.idle.len();
        }
        stats
    }

    /// 启动后台巡检任务，收到停机信号后在下一个周期边界退出。
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => pool.sweep(),
                    _ = shutdown.changed() => {
                        tracing::info!("connection sweep stopped");
                        return;
                    }
                }
            }
        })
    }

    fn host_pool(&self, host: &str) -> Arc<Mutex<HostPool>> {
        let mut guard = self.pools.lock().expect("pool map lock poisoned");
        Arc::clone(guard.entry(host.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(HostPool {
                idle: VecDeque::new(),
                in_use: HashMap::new(),
                active: 0,
            }))
        }))
    }

    fn build_client(&self) -> Result<PooledClient, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(KEEP_ALIVE)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        let now = Instant::now();
        Ok(PooledClient {
            client,
            id: self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            created_at: now,
            last_used_at: now,
            use_count: 1,
            healthy: true,
        })
    }
}
