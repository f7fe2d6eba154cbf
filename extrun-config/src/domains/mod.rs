//! Domain-specific configuration modules

pub mod backend;
pub mod execution;
pub mod logging;
pub mod utils;
pub mod workspace;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Complete runtime configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExtrunConfig {
    #[serde(default)]
    pub execution: execution::ExecutionConfig,

    #[serde(default)]
    pub workspace: workspace::WorkspaceConfig,

    #[serde(default)]
    pub backend: backend::BackendConfig,

    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl ExtrunConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.execution.validate()?;
        self.workspace.validate()?;
        self.backend.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}
