//! Application folder layout

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigResult;
use crate::validation::{validate_path_segment, Validatable};

/// Where the runtime finds extensions, their registrations and step storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub application_folder: PathBuf,
    pub settings_folder: String,
    pub extensions_folder: String,
    pub attached_extensions_file: String,
    pub storage_file: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            application_folder: PathBuf::from("."),
            settings_folder: ".extrun".to_string(),
            extensions_folder: "extensions".to_string(),
            attached_extensions_file: "attachedExtensions.json".to_string(),
            storage_file: "storage.json".to_string(),
        }
    }
}

impl WorkspaceConfig {
    pub fn for_application(folder: impl Into<PathBuf>) -> Self {
        Self {
            application_folder: folder.into(),
            ..Default::default()
        }
    }

    pub fn application_folder(&self) -> &Path {
        &self.application_folder
    }

    pub fn settings_path(&self) -> PathBuf {
        self.application_folder.join(&self.settings_folder)
    }

    pub fn extensions_path(&self) -> PathBuf {
        self.application_folder.join(&self.extensions_folder)
    }

    pub fn attached_extensions_path(&self) -> PathBuf {
        self.settings_path().join(&self.attached_extensions_file)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.settings_path().join(&self.storage_file)
    }
}

impl Validatable for WorkspaceConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.application_folder.as_os_str().is_empty() {
            return Err(self.validation_error("application_folder cannot be empty"));
        }

        validate_path_segment(&self.settings_folder, "settings_folder", self.domain_name())?;
        validate_path_segment(&self.extensions_folder, "extensions_folder", self.domain_name())?;
        validate_path_segment(
            &self.attached_extensions_file,
            "attached_extensions_file",
            self.domain_name(),
        )?;
        validate_path_segment(&self.storage_file, "storage_file", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "workspace"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let config = WorkspaceConfig::for_application("/apps/shop");
        assert_eq!(config.extensions_path(), PathBuf::from("/apps/shop/extensions"));
        assert_eq!(
            config.attached_extensions_path(),
            PathBuf::from("/apps/shop/.extrun/attachedExtensions.json")
        );
        assert_eq!(config.storage_path(), PathBuf::from("/apps/shop/.extrun/storage.json"));
    }

    #[test]
    fn test_nested_folder_rejected() {
        let config = WorkspaceConfig {
            extensions_folder: "a/b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
