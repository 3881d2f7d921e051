//! Extraction configuration

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::builtin;
use crate::error::{ExtractionError, ExtractionResult};
use crate::format::FormatRegistry;
use crate::loader::{DirectoryLoader, LayeredLoader, MemoryLoader};

/// Main extraction configuration, read from `extract.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Database connection URL
    pub database_url: String,

    /// Directory of `.sql` templates taking precedence over the embedded ones
    pub templates_dir: Option<PathBuf>,

    /// Format catalog replacing the embedded one
    pub formats_file: Option<PathBuf>,

    /// Keep the run's tables instead of dropping them afterwards
    pub keep_tables: bool,

    pub max_connections: u32,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            templates_dir: None,
            formats_file: None,
            keep_tables: false,
            max_connections: 5,
        }
    }
}

impl ExtractConfig {
    /// File name looked up in the working directory.
    pub const FILE_NAME: &'static str = "extract.toml";

    /// Load from `explicit` when given, else from the first existing
    /// candidate file, else defaults.
    pub fn load(explicit: Option<&Path>) -> ExtractionResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::candidates().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// `./extract.toml`, then `<config dir>/fishery-extraction/config.toml`.
    pub fn candidates() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(Self::FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("fishery-extraction").join("config.toml"));
        }
        paths
    }

    pub fn from_file(path: &Path) -> ExtractionResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)
            .map_err(|e| ExtractionError::config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> ExtractionResult<Self> {
        toml::from_str(content).map_err(|e| ExtractionError::config(e.to_string()))
    }

    /// The format catalog: `formats_file` when set, else the built-in one.
    pub fn registry(&self) -> ExtractionResult<FormatRegistry> {
        match &self.formats_file {
            Some(path) => FormatRegistry::from_toml(&std::fs::read_to_string(path)?),
            None => builtin::registry(),
        }
    }

    /// Embedded templates, overridden file by file by `templates_dir`.
    pub fn loader(&self) -> LayeredLoader<Option<DirectoryLoader>, MemoryLoader> {
        let overrides = self.templates_dir.as_ref().map(DirectoryLoader::new);
        LayeredLoader::new(overrides, builtin::templates())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ExtractConfig::parse("").unwrap();
        assert_eq!(config, ExtractConfig::default());
        assert_eq!(config.max_connections, 5);
        assert!(!config.keep_tables);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = ExtractConfig::parse(
            r#"
            database_url = "postgres://sumaris@localhost/sumaris"
            templates_dir = "/etc/extraction/templates"
            keep_tables = true
            "#,
        )
        .unwrap();
        assert_eq!(config.database_url, "postgres://sumaris@localhost/sumaris");
        assert_eq!(config.templates_dir, Some(PathBuf::from("/etc/extraction/templates")));
        assert!(config.keep_tables);
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let err = ExtractConfig::parse("keep_tables = \"yes\"").unwrap_err();
        assert!(matches!(err, ExtractionError::Config(_)));
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let err = ExtractConfig::load(Some(Path::new("/nonexistent/extract.toml"))).unwrap_err();
        assert!(matches!(err, ExtractionError::Io(_)));
    }

    #[test]
    fn test_candidates_start_with_working_directory() {
        assert_eq!(ExtractConfig::candidates()[0], PathBuf::from("extract.toml"));
    }
}
