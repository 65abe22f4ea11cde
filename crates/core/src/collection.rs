use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::paths::BaseDirs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    #[default]
    None,
    Disk,
    Index,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogQuery(BTreeMap<String, String>);

impl CatalogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, fields: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| fields.get(key).is_some_and(|field| field == value))
    }

    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(&self.0).unwrap_or_default();
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }

    pub fn slug(&self) -> String {
        if self.0.is_empty() {
            return "all".to_string();
        }
        let joined = self
            .0
            .iter()
            .map(|(key, value)| format!("{key}_{value}"))
            .collect::<Vec<_>>()
            .join("-");
        sanitize(&joined)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub query: CatalogQuery,
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub unique: Vec<String>,
    #[serde(default)]
    pub trust: Trust,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl Collection {
    pub fn new(name: impl Into<String>, query: CatalogQuery, file_patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            query,
            file_patterns,
            unique: Vec::new(),
            trust: Trust::None,
            retention_days: None,
        }
    }

    pub fn cache_key(&self) -> String {
        let fingerprint = self.query.fingerprint();
        format!("{}-{}", sanitize(&self.name), &fingerprint[..16])
    }

    fn validate(&self, base_dirs: &BaseDirs) -> SyncResult<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Configuration(
                "collection name must not be empty".to_string(),
            ));
        }
        for pattern in &self.file_patterns {
            let root = pattern_root(pattern);
            if !root.is_absolute() {
                return Err(SyncError::Configuration(format!(
                    "collection {}: glob pattern must be absolute: {pattern}",
                    self.name
                )));
            }
            base_dirs.split_base(&root).map_err(|_| {
                SyncError::Configuration(format!(
                    "collection {}: pattern {pattern} is not under any registered base directory",
                    self.name
                ))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionRegistry {
    collections: BTreeMap<String, Collection>,
}

impl CollectionRegistry {
    pub fn new(collections: Vec<Collection>, base_dirs: &BaseDirs) -> SyncResult<Self> {
        let mut registry = BTreeMap::new();
        for collection in collections {
            collection.validate(base_dirs)?;
            if registry.contains_key(&collection.name) {
                return Err(SyncError::Configuration(format!(
                    "collection {} is defined more than once",
                    collection.name
                )));
            }
            registry.insert(collection.name.clone(), collection);
        }
        Ok(Self {
            collections: registry,
        })
    }

    pub fn get(&self, name: &str) -> SyncResult<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| SyncError::Configuration(format!("unknown collection: {name}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// Literal directory prefix of a glob pattern (everything before the first wildcard component).
pub fn pattern_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    for component in Path::new(pattern).components() {
        if let Component::Normal(part) = component {
            if has_glob_meta(&part.to_string_lossy()) {
                break;
            }
        }
        root.push(component.as_os_str());
    }
    root
}

pub fn has_glob_meta(text: &str) -> bool {
    text.chars()
        .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'))
}

fn sanitize(value: &str) -> String {
    let mut out = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    out.truncate(96);
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::{pattern_root, CatalogQuery, Collection, CollectionRegistry, Trust};
    use crate::error::SyncError;
    use crate::paths::BaseDirs;

    fn bases() -> BaseDirs {
        BaseDirs::new(["/g/data/rs0"]).expect("bases")
    }

    fn nbar() -> Collection {
        Collection::new(
            "ls8_nbar",
            CatalogQuery::new().with("product", "ls8_nbar"),
            vec!["/g/data/rs0/scenes/nbar/**/*.nc".to_string()],
        )
    }

    #[test]
    fn pattern_root_stops_at_first_wildcard() {
        assert_eq!(
            pattern_root("/g/data/rs0/scenes/*/2019/*.nc"),
            PathBuf::from("/g/data/rs0/scenes")
        );
        assert_eq!(
            pattern_root("/g/data/rs0/scenes/a.nc"),
            PathBuf::from("/g/data/rs0/scenes/a.nc")
        );
    }

    #[test]
    fn registry_rejects_patterns_outside_base_dirs() {
        let mut outside = nbar();
        outside.file_patterns = vec!["/scratch/tmp/*.nc".to_string()];
        assert!(matches!(
            CollectionRegistry::new(vec![outside], &bases()),
            Err(SyncError::Configuration(_))
        ));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        assert!(CollectionRegistry::new(vec![nbar(), nbar()], &bases()).is_err());
        let registry = CollectionRegistry::new(vec![nbar()], &bases()).expect("registry");
        assert_eq!(registry.get("ls8_nbar").expect("found").trust, Trust::None);
        assert!(registry.get("missing").is_err());
    }

    #[test]
    fn query_matching_and_cache_key_are_stable() {
        let query = CatalogQuery::new()
            .with("product", "ls8_nbar")
            .with("platform", "LANDSAT_8");
        let mut fields = BTreeMap::new();
        fields.insert("product".to_string(), "ls8_nbar".to_string());
        assert!(!query.matches(&fields));
        fields.insert("platform".to_string(), "LANDSAT_8".to_string());
        assert!(query.matches(&fields));

        let reordered = CatalogQuery::new()
            .with("platform", "LANDSAT_8")
            .with("product", "ls8_nbar");
        assert_eq!(query.fingerprint(), reordered.fingerprint());
        assert_eq!(query.slug(), "platform_LANDSAT_8-product_ls8_nbar");

        let collection = nbar();
        assert!(collection.cache_key().starts_with("ls8_nbar-"));
        assert_eq!(collection.cache_key(), nbar().cache_key());
    }

    #[test]
    fn collection_config_uses_defaults() {
        let collection: Collection = serde_json::from_str(
            r#"{"name": "ls7", "file_patterns": ["/g/data/rs0/ls7/*.nc"], "trust": "disk"}"#,
        )
        .expect("parses");
        assert_eq!(collection.trust, Trust::Disk);
        assert!(collection.query.is_empty());
        assert_eq!(collection.retention_days, None);
    }
}
