use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collection::{Collection, CollectionRegistry};
use crate::detect::MismatchDetector;
use crate::error::{SyncError, SyncResult};
use crate::identity::MetadataDocReader;
use crate::paths::BaseDirs;
use crate::scan::{ScanOptions, DEFAULT_BATCH_SIZE};
use crate::validate::{CommandValidator, ValidatorConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub base_dirs: Vec<PathBuf>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub validator: Option<ValidatorConfig>,
    #[serde(default)]
    pub collections: Vec<Collection>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_dirs: Vec::new(),
            cache_dir: default_cache_dir(),
            jobs: default_jobs(),
            batch_size: default_batch_size(),
            validator: None,
            collections: Vec::new(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".catalog-sync-cache")
}

fn default_jobs() -> usize {
    4
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl SyncConfig {
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            SyncError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            SyncError::Configuration(format!("failed to parse {}: {err}", path.display()))
        })
    }

    pub fn base_dirs(&self) -> SyncResult<BaseDirs> {
        if self.base_dirs.is_empty() {
            return Err(SyncError::Configuration(
                "at least one base directory is required".to_string(),
            ));
        }
        BaseDirs::new(&self.base_dirs)
    }

    pub fn registry(&self) -> SyncResult<CollectionRegistry> {
        CollectionRegistry::new(self.collections.clone(), &self.base_dirs()?)
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            jobs: self.jobs,
            batch_size: self.batch_size,
            cancel_flag: None,
        }
    }

    pub fn detector(&self) -> MismatchDetector {
        let detector = MismatchDetector::new(Arc::new(MetadataDocReader));
        match self.validator.as_ref().and_then(CommandValidator::from_config) {
            Some(validator) => detector.with_validator(Arc::new(validator)),
            None => detector,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::SyncConfig;
    use crate::error::SyncError;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "base_dirs": ["/g/data"] }"#).expect("parse");
        assert_eq!(config.jobs, 4);
        assert_eq!(config.batch_size, 30);
        assert_eq!(config.cache_dir, PathBuf::from(".catalog-sync-cache"));
        assert!(config.registry().expect("registry").is_empty());
    }

    #[test]
    fn collections_are_validated_against_base_dirs() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("sync.json");
        fs::write(
            &path,
            r#"{
                "base_dirs": ["/g/data"],
                "collections": [
                    { "name": "ls8", "query": { "product": "ls8_nbar" },
                      "file_patterns": ["/g/data/ls8/**/*.yaml"], "trust": "disk" },
                    { "name": "stray", "file_patterns": ["/scratch/*.yaml"] }
                ]
            }"#,
        )
        .expect("write");

        let config = SyncConfig::load(&path).expect("load");
        assert_eq!(config.collections.len(), 2);
        assert!(matches!(config.registry(), Err(SyncError::Configuration(_))));
    }

    #[test]
    fn missing_base_dirs_is_a_configuration_error() {
        let config = SyncConfig::default();
        assert!(matches!(config.base_dirs(), Err(SyncError::Configuration(_))));
    }
}
