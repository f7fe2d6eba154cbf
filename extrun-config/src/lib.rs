//! Domain-split configuration for the extension runtime
//!
//! Each functional area (execution, workspace layout, backend access,
//! logging) owns its own section with defaults and validation. The loader
//! layers a YAML file and `EXTRUN_*` environment variables on top.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    backend::BackendConfig, execution::ExecutionConfig, logging::LoggingConfig,
    workspace::WorkspaceConfig, ExtrunConfig,
};

// Re-export utilities
pub use domains::utils::{serde_millis, serde_millis_option};
