pub mod router;
pub mod telemetry;
pub mod usage_stats;
