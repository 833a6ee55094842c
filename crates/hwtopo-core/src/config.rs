//! Topology configuration loading

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::object::ObjectType;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Unknown object type in type filter: {0}")]
    UnknownType(String),
}

/// How much of one object type discovery keeps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeFilter {
    #[default]
    KeepAll,
    KeepNone,
    /// Keep only objects that bring structure to the tree
    KeepStructure,
    /// Keep only objects considered important by their backend
    KeepImportant,
}

/// Backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Backends that must not run, by name
    #[serde(default)]
    pub disabled_backends: Vec<String>,
}

/// Main topology configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Route backend diagnostics to debug level instead of warnings
    #[serde(default)]
    pub hide_errors: bool,
    /// Per-type filters keyed by object type name
    #[serde(default)]
    pub type_filters: BTreeMap<String, TypeFilter>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl TopologyConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TopologyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded topology configuration");
        Ok(config)
    }

    /// Load configuration, or fall back to defaults when the file is missing
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            info!(
                path = %path.display(),
                "Configuration file not found, using defaults"
            );
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for name in self.type_filters.keys() {
            name.parse::<ObjectType>()
                .map_err(|_| ConfigError::UnknownType(name.clone()))?;
        }
        Ok(())
    }

    pub fn type_filter(&self, object_type: ObjectType) -> TypeFilter {
        self.type_filters
            .iter()
            .find(|(name, _)| name.parse::<ObjectType>().ok() == Some(object_type))
            .map(|(_, filter)| *filter)
            .unwrap_or_default()
    }

    pub fn set_type_filter(&mut self, object_type: ObjectType, filter: TypeFilter) {
        self.type_filters
            .retain(|name, _| name.parse::<ObjectType>().ok() != Some(object_type));
        self.type_filters
            .insert(object_type.as_str().to_string(), filter);
    }

    pub fn is_backend_disabled(&self, name: &str) -> bool {
        self.discovery
            .disabled_backends
            .iter()
            .any(|b| b.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_config() {
        let config = TopologyConfig::from_toml_str(
            r#"
hide_errors = true

[type_filters]
os_device = "keep_none"
PCIDev = "keep_important"

[discovery]
disabled_backends = ["levelzero"]
"#,
        )
        .unwrap();

        assert!(config.hide_errors);
        assert_eq!(config.type_filter(ObjectType::OsDevice), TypeFilter::KeepNone);
        assert_eq!(config.type_filter(ObjectType::PciDevice), TypeFilter::KeepImportant);
        assert_eq!(config.type_filter(ObjectType::Bridge), TypeFilter::KeepAll);
        assert!(config.is_backend_disabled("LevelZero"));
        assert!(!config.is_backend_disabled("pci"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = TopologyConfig::from_toml_str("[type_filters]\nwidget = \"keep_none\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType(name) if name == "widget"));
    }

    #[test]
    fn test_set_type_filter_replaces_alias() {
        let mut config = TopologyConfig::from_toml_str("[type_filters]\nos_device = \"keep_none\"\n").unwrap();
        config.set_type_filter(ObjectType::OsDevice, TypeFilter::KeepAll);
        assert_eq!(config.type_filters.len(), 1);
        assert_eq!(config.type_filter(ObjectType::OsDevice), TypeFilter::KeepAll);
    }

    #[test]
    fn test_load_or_default() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.toml");
        let config = TopologyConfig::load_or_default(&missing).unwrap();
        assert!(!config.hide_errors);

        let path = temp_dir.path().join("hwtopo.toml");
        std::fs::write(&path, "hide_errors = true\n").unwrap();
        let config = TopologyConfig::load_or_default(&path).unwrap();
        assert!(config.hide_errors);
    }
}
