pub mod app;
pub mod bootstrap;
pub mod config;
pub mod driver;
pub mod http;
pub mod metrics;
pub mod observability;
pub mod shutdown;

pub use app::{App, AppError, run};
pub use config::{AppConfig, ConfigError, StaticServiceAccount};
pub use observability::{LogFormat, LoggingError, init_tracing};
