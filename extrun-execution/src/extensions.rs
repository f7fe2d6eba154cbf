//! Attached extension registry
//!
//! Maps extension ids to their install path below the extensions folder.
//! The worker reloads it on every invocation so attaching an extension takes
//! effect without a restart.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One attached extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedExtension {
    /// Install path relative to the extensions folder
    pub path: String,
    #[serde(default)]
    pub trusted: bool,
}

impl AttachedExtension {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            trusted: false,
        }
    }

    /// Directory holding the extension's step files
    pub fn source_dir(&self, extensions_path: &Path) -> PathBuf {
        extensions_path.join(&self.path).join("extension")
    }
}

pub type AttachedExtensionMap = HashMap<String, AttachedExtension>;

/// Registry errors
#[derive(Error, Debug)]
pub enum ExtensionsError {
    #[error("Failed to read attached extensions from {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Invalid attached extensions file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Source of the attached extension map
#[async_trait]
pub trait AttachedExtensions: Send + Sync {
    async fn load(&self) -> Result<AttachedExtensionMap, ExtensionsError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachedExtensionsDocument {
    #[serde(default)]
    attached_extensions: AttachedExtensionMap,
}

/// Registry read from `attachedExtensions.json`.
///
/// A missing file means nothing is attached.
#[derive(Debug, Clone)]
pub struct AttachedExtensionsFile {
    path: PathBuf,
}

impl AttachedExtensionsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AttachedExtensions for AttachedExtensionsFile {
    async fn load(&self) -> Result<AttachedExtensionMap, ExtensionsError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AttachedExtensionMap::new())
            }
            Err(e) => {
                return Err(ExtensionsError::Read {
                    path: self.path.clone(),
                    message: e.to_string(),
                })
            }
        };

        let document: AttachedExtensionsDocument =
            serde_json::from_str(&content).map_err(|e| ExtensionsError::Parse {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Ok(document.attached_extensions)
    }
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct StaticExtensions {
    extensions: RwLock<AttachedExtensionMap>,
}

impl StaticExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, id: impl Into<String>, extension: AttachedExtension) {
        self.extensions.write().insert(id.into(), extension);
    }

    pub fn detach(&self, id: &str) -> Option<AttachedExtension> {
        self.extensions.write().remove(id)
    }
}

#[async_trait]
impl AttachedExtensions for StaticExtensions {
    async fn load(&self) -> Result<AttachedExtensionMap, ExtensionsError> {
        Ok(self.extensions.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_attached_extensions_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("attachedExtensions.json");
        std::fs::write(
            &file,
            r#"{"attachedExtensions": {"@foo/bar": {"path": "foobar", "trusted": true}, "@x/y": {"path": "xy"}}}"#,
        )
        .unwrap();

        let map = AttachedExtensionsFile::new(&file).load().await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map["@foo/bar"],
            AttachedExtension {
                path: "foobar".to_string(),
                trusted: true
            }
        );
        assert!(!map["@x/y"].trusted);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = AttachedExtensionsFile::new(dir.path().join("nope.json"))
            .load()
            .await
            .unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("attachedExtensions.json");
        std::fs::write(&file, "{").unwrap();

        let result = AttachedExtensionsFile::new(&file).load().await;
        assert!(matches!(result, Err(ExtensionsError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_static_registry_attach_detach() {
        let registry = StaticExtensions::new();
        registry.attach("@foo/bar", AttachedExtension::new("foobar"));
        assert_eq!(registry.load().await.unwrap().len(), 1);

        assert!(registry.detach("@foo/bar").is_some());
        assert!(registry.load().await.unwrap().is_empty());
    }

    #[test]
    fn test_source_dir() {
        let extension = AttachedExtension::new("foobar");
        assert_eq!(
            extension.source_dir(Path::new("/app/extensions")),
            PathBuf::from("/app/extensions/foobar/extension")
        );
    }
}
