//! Multi-provider LLM API gateway.
//!
//! 接收 OpenAI / Anthropic 方言的聊天补全请求，按能力过滤 + 加权随机
//! 选择上游绑定，带自适应降权的重试转发，流式响应原样回传的同时分流
//! 一份副本做遥测（首字时延、token 用量、TPS），健康状态持久化并由
//! 后台巡检维护。

pub mod balancer;
pub mod cache;
pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod health;
pub mod pool;
pub mod providers;
pub mod server;
pub mod service;
