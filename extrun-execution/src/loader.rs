//! Step loading
//!
//! The worker resolves an invocation to a [`StepLocation`] and asks a
//! [`StepLoader`] for the step behind it. [`StepRegistry`] is the built-in
//! loader: steps are compiled into the host binary and registered under
//! their extension id and extension-relative path.

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::step::Step;

/// Where an invocation's step lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLocation {
    pub extension_id: String,
    /// Path below the extension's `extension/` directory
    pub relative_path: String,
    /// Resolved file on disk
    pub file: PathBuf,
}

/// What a step module exports
#[derive(Clone)]
pub enum StepExport {
    Step(Arc<dyn Step>),
    /// A non-callable export
    Value(JsonValue),
}

impl std::fmt::Debug for StepExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepExport::Step(_) => f.write_str("StepExport::Step(..)"),
            StepExport::Value(value) => write!(f, "StepExport::Value({})", value),
        }
    }
}

/// Loading errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("No step registered for '{path}' in extension '{extension_id}'")]
    NotRegistered { extension_id: String, path: String },

    #[error("Failed to load step '{path}': {reason}")]
    Invalid { path: String, reason: String },
}

/// Resolves a location to its step export
pub trait StepLoader: Send + Sync {
    fn load(&self, location: &StepLocation) -> Result<StepExport, LoadError>;
}

/// Registry of compiled-in steps, keyed by extension id and relative path
#[derive(Clone, Default)]
pub struct StepRegistry {
    entries: Arc<RwLock<HashMap<(String, String), StepExport>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable step
    pub fn register(
        &self,
        extension_id: impl Into<String>,
        relative_path: &str,
        step: Arc<dyn Step>,
    ) -> &Self {
        self.insert(extension_id.into(), relative_path, StepExport::Step(step))
    }

    /// Register a non-callable export
    pub fn register_value(
        &self,
        extension_id: impl Into<String>,
        relative_path: &str,
        value: JsonValue,
    ) -> &Self {
        self.insert(extension_id.into(), relative_path, StepExport::Value(value))
    }

    fn insert(&self, extension_id: String, relative_path: &str, export: StepExport) -> &Self {
        let key = (extension_id, normalize(relative_path));
        self.entries.write().insert(key, export);
        self
    }

    pub fn contains(&self, extension_id: &str, relative_path: &str) -> bool {
        self.entries
            .read()
            .contains_key(&(extension_id.to_string(), normalize(relative_path)))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StepLoader for StepRegistry {
    fn load(&self, location: &StepLocation) -> Result<StepExport, LoadError> {
        let key = (
            location.extension_id.clone(),
            normalize(&location.relative_path),
        );
        self.entries
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| LoadError::NotRegistered {
                extension_id: location.extension_id.clone(),
                path: location.relative_path.clone(),
            })
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::callback_step;
    use serde_json::json;

    fn location(extension_id: &str, relative_path: &str) -> StepLocation {
        StepLocation {
            extension_id: extension_id.to_string(),
            relative_path: relative_path.to_string(),
            file: PathBuf::from(relative_path),
        }
    }

    #[test]
    fn test_register_and_load() {
        let registry = StepRegistry::new();
        registry
            .register("@foo/bar", "simple.js", callback_step(|call| {
                call.done.ok(json!(null));
            }))
            .register_value("@foo/bar", "./config.js", json!({"not": "callable"}));

        assert_eq!(registry.len(), 2);
        assert!(matches!(
            registry.load(&location("@foo/bar", "simple.js")),
            Ok(StepExport::Step(_))
        ));
        assert!(matches!(
            registry.load(&location("@foo/bar", "config.js")),
            Ok(StepExport::Value(_))
        ));
    }

    #[test]
    fn test_paths_are_normalized() {
        let registry = StepRegistry::new();
        registry.register_value("@foo/bar", "steps\\nested.js", json!(1));

        assert!(registry.contains("@foo/bar", "./steps/nested.js"));
        assert!(registry.contains("@foo/bar", "/steps/nested.js"));
    }

    #[test]
    fn test_missing_step() {
        let registry = StepRegistry::new();
        assert!(registry.is_empty());

        let err = registry.load(&location("@foo/bar", "missing.js")).unwrap_err();
        assert_eq!(
            err,
            LoadError::NotRegistered {
                extension_id: "@foo/bar".to_string(),
                path: "missing.js".to_string(),
            }
        );
    }

    #[test]
    fn test_extensions_do_not_share_steps() {
        let registry = StepRegistry::new();
        registry.register_value("@foo/bar", "simple.js", json!(1));

        assert!(registry.load(&location("@foo/baz", "simple.js")).is_err());
    }
}
