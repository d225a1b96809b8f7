use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::db::Database;
use crate::db::types::Usage;
use crate::dialect::Dialect;

/// 行缓冲的初始与上限容量。超大 SSE 帧截止于 15 MiB。
pub const INIT_LINE_BUFFER: usize = 8 * 1024;
pub const MAX_LINE_BUFFER: usize = 15 * 1024 * 1024;

/// 对上游响应分流副本做方言相关的行解析，提取 usage 与时延。
///
/// 解析失败不会影响转发路径；已有的部分指标照常写回 ChatLog。
pub struct TelemetryParser {
    dialect: Dialect,
    stream: bool,
    buf: Vec<u8>,
    overflowed: bool,
    // openai 流式：最近一个 data chunk 中出现的 usage
    usage: Option<Usage>,
    // anthropic 流式：跨帧追踪当前事件名
    current_event: String,
    // 一次性响应整体缓冲
    body: Vec<u8>,
    error: Option<String>,
    saw_done: bool,
}

impl TelemetryParser {
    pub fn new(dialect: Dialect, stream: bool) -> Self {
        Self {
            dialect,
            stream,
            buf: Vec::with_capacity(INIT_LINE_BUFFER),
            overflowed: false,
            usage: None,
            current_event: String::new(),
            body: Vec::new(),
            error: None,
            saw_done: false,
        }
    }

    /// 喂入一段原始字节。返回 false 表示解析已终止（[DONE]、错误或超限）。
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.overflowed || self.saw_done {
            return false;
        }

        if !self.stream {
            if self.body.len() + chunk.len() > MAX_LINE_BUFFER {
                self.mark_overflow();
                return false;
            }
            self.body.extend_from_slice(chunk);
            return true;
        }

        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_LINE_BUFFER {
            self.mark_overflow();
            return false;
        }

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
            if line.is_empty() {
                continue;
            }
            if !self.feed_line(line) {
                return false;
            }
        }
        true
    }

    fn mark_overflow(&mut self) {
        self.overflowed = true;
        self.error = Some(format!(
            "telemetry frame exceeds {} bytes, parsing aborted",
            MAX_LINE_BUFFER
        ));
        self.buf.clear();
        self.body.clear();
    }

    fn feed_line(&mut self, line: &str) -> bool {
        match self.dialect {
            Dialect::OpenAI => self.feed_openai_line(line),
            Dialect::Anthropic => self.feed_anthropic_line(line),
        }
    }

    fn feed_openai_line(&mut self, line: &str) -> bool {
        let data = line.strip_prefix("data: ").unwrap_or(line);
        if data == "[DONE]" {
            self.saw_done = true;
            return false;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return true;
        };
        // 流式过程中的错误帧
        if let Some(err) = value.get("error") {
            self.error = Some(err.to_string());
            return false;
        }
        if let Some(usage) = parse_openai_usage(&value) {
            self.usage = Some(usage);
        }
        true
    }

    fn feed_anthropic_line(&mut self, line: &str) -> bool {
        if let Some(event) = line.strip_prefix("event: ") {
            self.current_event = event.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            if self.current_event == "message_delta" {
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    if let Some(usage) = value.get("usage") {
                        self.usage = Some(parse_anthropic_usage(usage));
                    }
                }
            }
        }
        true
    }

    /// 结束解析，产出用量与可能的错误文本。
    pub fn finish(mut self) -> (Usage, Option<String>) {
        if !self.stream && self.error.is_none() {
            if let Ok(value) = serde_json::from_slice::<Value>(&self.body) {
                if let Some(err) = value.get("error") {
                    self.error = Some(err.to_string());
                } else {
                    match self.dialect {
                        Dialect::OpenAI => self.usage = parse_openai_usage(&value),
                        Dialect::Anthropic => {
                            self.usage = value.get("usage").map(parse_anthropic_usage);
                        }
                    }
                }
            } else if !self.body.is_empty() {
                self.error = Some("failed to parse response body".into());
            }
        }
        (self.usage.unwrap_or_default(), self.error)
    }
}

/// 宽容地从 chunk 中提取 OpenAI usage（容忍厂商扩展字段）。
fn parse_openai_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_i64);
    let completion = usage.get("completion_tokens").and_then(Value::as_i64);
    let total = usage.get("total_tokens").and_then(Value::as_i64);
    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }
    let prompt = prompt.unwrap_or(0);
    let completion = completion.unwrap_or(0);
    let total = total.unwrap_or(prompt + completion);
    if total == 0 {
        return None;
    }
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
        cache_creation_tokens: 0,
        cache_read_tokens: cached,
    })
}

/// Anthropic usage：input + output 记为 total，cache 字段一并入库。
fn parse_anthropic_usage(usage: &Value) -> Usage {
    let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Usage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        cache_read_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    }
}

/// 启动遥测消费任务：读取分流管道直到对端关闭，然后更新 ChatLog。
pub fn spawn_consumer(
    db: Database,
    dialect: Dialect,
    stream: bool,
    log_id: i64,
    started_at: Instant,
    mut rx: mpsc::Receiver<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut parser = TelemetryParser::new(dialect, stream);
        let mut first_chunk_at: Option<Instant> = None;
        let mut parsing = true;

        while let Some(chunk) = rx.recv().await {
            if chunk.is_empty() {
                continue;
            }
            first_chunk_at.get_or_insert_with(Instant::now);
            if parsing {
                parsing = parser.feed(&chunk);
            }
            // 解析终止后继续排空管道，避免阻塞分流端
        }

        let first_chunk_time_ms = first_chunk_at
            .map(|t| t.duration_since(started_at).as_millis() as i64)
            .unwrap_or(0);
        let chunk_time_ms =
            (started_at.elapsed().as_millis() as i64 - first_chunk_time_ms).max(0);

        let (usage, error) = parser.finish();
        let tps = compute_tps(stream, usage.total_tokens, chunk_time_ms);

        if let Err(e) = db
            .update_chat_log_telemetry(
                log_id,
                first_chunk_time_ms,
                chunk_time_ms,
                tps,
                &usage,
                error.as_deref(),
            )
            .await
        {
            tracing::error!(log_id, error = %e, "failed to update chat log telemetry");
        }
        tracing::info!(
            log_id,
            input = usage.prompt_tokens,
            output = usage.completion_tokens,
            total = usage.total_tokens,
            first_chunk_time_ms,
            chunk_time_ms,
            tps = tps.unwrap_or(0.0),
            "telemetry recorded"
        );
    })
}

/// TPS 仅对流式成功定义。
fn compute_tps(stream: bool, total_tokens: i64, chunk_time_ms: i64) -> Option<f64> {
    if !stream || total_tokens <= 0 {
        return None;
    }
    let secs = (chunk_time_ms.max(1) as f64) / 1000.0;
    Some(total_tokens as f64 / secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn feed_all(parser: &mut TelemetryParser, frames: &[&str]) {
        for frame in frames {
            parser.feed(frame.as_bytes());
        }
    }

    #[test]
    fn openai_stream_usage_comes_from_final_chunk() {
        let mut parser = TelemetryParser::new(Dialect::OpenAI, true);
        feed_all(
            &mut parser,
            &[
                "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n",
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":34,\"total_tokens\":46}}\n",
                "data: [DONE]\n",
            ],
        );
        let (usage, error) = parser.finish();
        assert!(error.is_none());
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 34);
        assert_eq!(usage.total_tokens, 46);
    }

    #[test]
    fn openai_stream_handles_split_frames() {
        // 一个 data 帧被切成多个网络 chunk
        let mut parser = TelemetryParser::new(Dialect::OpenAI, true);
        parser.feed(b"data: {\"usage\":{\"prompt_tokens\":1,");
        parser.feed(b"\"completion_tokens\":2,\"total_tokens\":3}}\nda");
        parser.feed(b"ta: [DONE]\n");
        let (usage, error) = parser.finish();
        assert!(error.is_none());
        assert_eq!(usage.total_tokens, 3);
    }

    #[test]
    fn openai_midstream_error_is_recorded() {
        let mut parser = TelemetryParser::new(Dialect::OpenAI, true);
        assert!(parser.feed(b"data: {\"choices\":[{\"delta\":{}}]}\n"));
        assert!(!parser.feed(b"data: {\"error\":{\"message\":\"overloaded\"}}\n"));
        let (_, error) = parser.finish();
        assert!(error.unwrap().contains("overloaded"));
    }

    #[test]
    fn openai_non_stream_reads_top_level_usage() {
        let mut parser = TelemetryParser::new(Dialect::OpenAI, false);
        parser.feed(br#"{"id":"cmpl-1","usage":{"prompt_tokens":5,"#);
        parser.feed(br#""completion_tokens":7,"total_tokens":12}}"#);
        let (usage, error) = parser.finish();
        assert!(error.is_none());
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn openai_cached_tokens_are_surfaced() {
        let mut parser = TelemetryParser::new(Dialect::OpenAI, true);
        feed_all(
            &mut parser,
            &[
                "data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15,\"prompt_tokens_details\":{\"cached_tokens\":8}}}\n",
                "data: [DONE]\n",
            ],
        );
        let (usage, _) = parser.finish();
        assert_eq!(usage.cache_read_tokens, 8);
    }

    #[test]
    fn anthropic_stream_tracks_message_delta_usage() {
        let mut parser = TelemetryParser::new(Dialect::Anthropic, true);
        feed_all(
            &mut parser,
            &[
                "event: message_start\n",
                "data: {\"message\":{\"usage\":{\"input_tokens\":9}}}\n",
                "event: content_block_delta\n",
                "data: {\"delta\":{\"text\":\"hi\"}}\n",
                "event: message_delta\n",
                "data: {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"input_tokens\":9,\"output_tokens\":21,\"cache_creation_input_tokens\":3,\"cache_read_input_tokens\":4}}\n",
            ],
        );
        let (usage, error) = parser.finish();
        assert!(error.is_none());
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 21);
        assert_eq!(usage.total_tokens, 30);
        assert_eq!(usage.cache_creation_tokens, 3);
        assert_eq!(usage.cache_read_tokens, 4);
    }

    #[test]
    fn anthropic_non_stream_reads_body_usage() {
        let mut parser = TelemetryParser::new(Dialect::Anthropic, false);
        parser.feed(
            br#"{"id":"msg-1","content":[],"usage":{"input_tokens":11,"output_tokens":22}}"#,
        );
        let (usage, error) = parser.finish();
        assert!(error.is_none());
        assert_eq!(usage.total_tokens, 33);
    }

    #[test]
    fn oversized_frame_aborts_with_error() {
        let mut parser = TelemetryParser::new(Dialect::OpenAI, true);
        // 没有换行的持续载荷最终超过上限
        let chunk = vec![b'x'; 1024 * 1024];
        let mut aborted = false;
        for _ in 0..16 {
            if !parser.feed(&chunk) {
                aborted = true;
                break;
            }
        }
        assert!(aborted);
        let (usage, error) = parser.finish();
        assert_eq!(usage.total_tokens, 0);
        assert!(error.unwrap().contains("exceeds"));
    }

    #[test]
    fn frame_just_under_cap_is_processed() {
        let mut parser = TelemetryParser::new(Dialect::OpenAI, true);
        // 一个略小于上限的超大行，后面跟正常的 usage 帧
        let mut big = vec![b'y'; MAX_LINE_BUFFER - 1024];
        big.push(b'\n');
        assert!(parser.feed(&big));
        assert!(parser.feed(
            b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n"
        ));
        let (usage, error) = parser.finish();
        assert!(error.is_none());
        assert_eq!(usage.total_tokens, 2);
    }

    #[test]
    fn tps_is_streaming_only() {
        assert!(compute_tps(false, 100, 1000).is_none());
        assert!(compute_tps(true, 0, 1000).is_none());
        let tps = compute_tps(true, 50, 2000).unwrap();
        assert!((tps - 25.0).abs() < f64::EPSILON);
        // 零耗时兜底到 1ms，避免除零
        assert!(compute_tps(true, 10, 0).unwrap() > 0.0);
    }

    #[tokio::test]
    async fn consumer_updates_chat_log() {
        use crate::db::types::ChatLog;

        let db = Database::open_in_memory().unwrap();
        let log = ChatLog::new("m1", "gpt-x", "prov-a", Dialect::OpenAI, 0);
        let log_id = db.save_chat_log(&log).await.unwrap();

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let handle = spawn_consumer(
            db.clone(),
            Dialect::OpenAI,
            true,
            log_id,
            Instant::now(),
            rx,
        );

        tx.send(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(Bytes::from_static(
            b"data: {\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":6,\"total_tokens\":10}}\ndata: [DONE]\n",
        ))
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let stored = db.get_chat_log(log_id).await.unwrap().unwrap();
        assert!(stored.is_success());
        assert_eq!(stored.usage.total_tokens, 10);
        assert!(stored.tps.unwrap() > 0.0);
        assert!(stored.chunk_time_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn consumer_records_partial_metrics_on_parse_failure() {
        use crate::db::types::ChatLog;

        let db = Database::open_in_memory().unwrap();
        let log = ChatLog::new("m1", "claude-x", "prov-b", Dialect::Anthropic, 0);
        let log_id = db.save_chat_log(&log).await.unwrap();

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let handle = spawn_consumer(
            db.clone(),
            Dialect::Anthropic,
            false,
            log_id,
            Instant::now(),
            rx,
        );
        tx.send(Bytes::from_static(b"not json at all")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let stored = db.get_chat_log(log_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "error");
        assert!(stored.error.is_some());
    }
}
