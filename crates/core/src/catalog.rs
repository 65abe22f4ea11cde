use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::collection::CatalogQuery;
use crate::error::{SyncError, SyncResult};
use crate::identity::{DatasetId, DatasetRecord};

pub trait Catalog {
    fn get(&self, id: &DatasetId) -> SyncResult<Option<DatasetRecord>>;

    fn datasets_for_uri(&self, uri: &str) -> SyncResult<Vec<DatasetRecord>>;

    fn iter_all_uris<'a>(
        &'a self,
        query: &CatalogQuery,
    ) -> SyncResult<Box<dyn Iterator<Item = String> + 'a>>;

    /// Returns `false` when the location was already recorded.
    fn add_location(&self, record: &DatasetRecord, uri: &str) -> SyncResult<bool>;

    /// Returns `false` when the location was not recorded.
    fn remove_location(&self, record: &DatasetRecord, uri: &str) -> SyncResult<bool>;

    fn add_dataset(&self, record: &DatasetRecord, uri: &str) -> SyncResult<()>;
}

/// Opens catalog connections. Each worker calls `connect` on its own thread.
pub trait CatalogConnector: Send + Sync {
    fn connect(&self) -> SyncResult<Box<dyn Catalog>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDataset {
    pub id: DatasetId,
    #[serde(default)]
    pub archived_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub locations: BTreeSet<String>,
}

impl CatalogDataset {
    pub fn new(id: DatasetId) -> Self {
        Self {
            id,
            archived_time: None,
            fields: BTreeMap::new(),
            locations: BTreeSet::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_location(mut self, uri: impl Into<String>) -> Self {
        self.locations.insert(uri.into());
        self
    }

    pub fn archived_at(mut self, time: DateTime<Utc>) -> Self {
        self.archived_time = Some(time);
        self
    }

    fn record(&self) -> DatasetRecord {
        DatasetRecord {
            id: self.id,
            archived_time: self.archived_time,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogSnapshot {
    #[serde(default)]
    datasets: Vec<CatalogDataset>,
}

#[derive(Debug, Default)]
struct CatalogState {
    datasets: BTreeMap<DatasetId, CatalogDataset>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
    connections: Arc<AtomicUsize>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datasets(datasets: impl IntoIterator<Item = CatalogDataset>) -> Self {
        let catalog = Self::new();
        for dataset in datasets {
            catalog.insert(dataset);
        }
        catalog
    }

    pub fn insert(&self, dataset: CatalogDataset) {
        if let Ok(mut state) = self.state.lock() {
            state.datasets.insert(dataset.id, dataset);
        }
    }

    pub fn dataset(&self, id: &DatasetId) -> Option<CatalogDataset> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.datasets.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.datasets.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connections_opened(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn load_snapshot(path: &Path) -> SyncResult<Self> {
        let text = fs::read_to_string(path)?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&text).map_err(|err| {
            SyncError::catalog(format!("failed to parse {}: {err}", path.display()))
        })?;
        Ok(Self::with_datasets(snapshot.datasets))
    }

    pub fn save_snapshot(&self, path: &Path) -> SyncResult<()> {
        let snapshot = CatalogSnapshot {
            datasets: self.lock()?.datasets.values().cloned().collect(),
        };
        let payload = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| SyncError::catalog(format!("failed to serialize snapshot: {err}")))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(&payload)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| SyncError::Io(err.error))?;
        Ok(())
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, CatalogState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::catalog("catalog store lock poisoned"))
    }
}

impl Catalog for MemoryCatalog {
    fn get(&self, id: &DatasetId) -> SyncResult<Option<DatasetRecord>> {
        Ok(self.lock()?.datasets.get(id).map(CatalogDataset::record))
    }

    fn datasets_for_uri(&self, uri: &str) -> SyncResult<Vec<DatasetRecord>> {
        Ok(self
            .lock()?
            .datasets
            .values()
            .filter(|dataset| dataset.locations.contains(uri))
            .map(CatalogDataset::record)
            .collect())
    }

    fn iter_all_uris<'a>(
        &'a self,
        query: &CatalogQuery,
    ) -> SyncResult<Box<dyn Iterator<Item = String> + 'a>> {
        let uris = self
            .lock()?
            .datasets
            .values()
            .filter(|dataset| query.matches(&dataset.fields))
            .flat_map(|dataset| dataset.locations.iter().cloned())
            .collect::<Vec<_>>();
        Ok(Box::new(uris.into_iter()))
    }

    fn add_location(&self, record: &DatasetRecord, uri: &str) -> SyncResult<bool> {
        let mut state = self.lock()?;
        let dataset = state
            .datasets
            .get_mut(&record.id)
            .ok_or_else(|| SyncError::catalog(format!("unknown dataset {}", record.id)))?;
        Ok(dataset.locations.insert(uri.to_string()))
    }

    fn remove_location(&self, record: &DatasetRecord, uri: &str) -> SyncResult<bool> {
        let mut state = self.lock()?;
        let dataset = state
            .datasets
            .get_mut(&record.id)
            .ok_or_else(|| SyncError::catalog(format!("unknown dataset {}", record.id)))?;
        Ok(dataset.locations.remove(uri))
    }

    fn add_dataset(&self, record: &DatasetRecord, uri: &str) -> SyncResult<()> {
        let mut state = self.lock()?;
        let dataset = state
            .datasets
            .entry(record.id)
            .or_insert_with(|| CatalogDataset::new(record.id));
        dataset.locations.insert(uri.to_string());
        debug!("indexed dataset {} at {}", record.id, uri);
        Ok(())
    }
}

impl CatalogConnector for MemoryCatalog {
    fn connect(&self) -> SyncResult<Box<dyn Catalog>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
pub(crate) struct RejectWrites(pub MemoryCatalog);

#[cfg(test)]
impl Catalog for RejectWrites {
    fn get(&self, id: &DatasetId) -> SyncResult<Option<DatasetRecord>> {
        self.0.get(id)
    }

    fn datasets_for_uri(&self, uri: &str) -> SyncResult<Vec<DatasetRecord>> {
        self.0.datasets_for_uri(uri)
    }

    fn iter_all_uris<'a>(
        &'a self,
        query: &CatalogQuery,
    ) -> SyncResult<Box<dyn Iterator<Item = String> + 'a>> {
        self.0.iter_all_uris(query)
    }

    fn add_location(&self, _record: &DatasetRecord, _uri: &str) -> SyncResult<bool> {
        Err(SyncError::catalog("catalog rejected write: connection lost"))
    }

    fn remove_location(&self, _record: &DatasetRecord, _uri: &str) -> SyncResult<bool> {
        Err(SyncError::catalog("catalog rejected write: connection lost"))
    }

    fn add_dataset(&self, _record: &DatasetRecord, _uri: &str) -> SyncResult<()> {
        Err(SyncError::catalog("catalog rejected write: connection lost"))
    }
}
