//! Domain-driven configuration for the app-worker execution subsystem
//!
//! Each domain is a `#[serde(default)]` struct with its own validation, so a
//! YAML file only needs to mention the values it changes. Environment
//! variables prefixed with `APPWORKER_` override file values.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    execution::ExecutionConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    AppWorkerConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration;
