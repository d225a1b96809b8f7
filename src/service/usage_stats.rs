use chrono::Utc;

use crate::db::Database;
use crate::db::types::{ChatLog, DailyUsage};
use crate::error::Result;

/// 按 (provider, 日期) 累计用量。仅成功请求推进 token 计数与平均耗时。
pub async fn update_provider_usage(db: &Database, provider_id: i64, log: &ChatLog) -> Result<()> {
    let now = Utc::now();
    let today = now.date_naive();

    let mut stats = match db.get_daily_usage(provider_id, today).await? {
        Some(stats) => stats,
        None => DailyUsage {
            provider_id,
            date: today,
            total_requests: 0,
            success_requests: 0,
            failed_requests: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            avg_response_time_ms: 0.0,
            last_used_at: now,
        },
    };

    stats.total_requests += 1;
    stats.last_used_at = now;

    if log.is_success() {
        stats.success_requests += 1;
        stats.prompt_tokens += log.usage.prompt_tokens;
        stats.completion_tokens += log.usage.completion_tokens;
        stats.total_tokens += log.usage.total_tokens;

        // 滚动平均：new = (old·(n−1) + sample) / n，n 为新的成功计数
        let n = stats.success_requests as f64;
        stats.avg_response_time_ms =
            (stats.avg_response_time_ms * (n - 1.0) + log.proxy_time_ms as f64) / n;
    } else {
        stats.failed_requests += 1;
    }

    db.upsert_daily_usage(&stats).await?;
    Ok(())
}
