pub mod checker;
pub mod registry;

pub use checker::HealthChecker;
pub use registry::HealthRegistry;
