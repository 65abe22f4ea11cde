use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::Catalog;
use crate::error::SyncResult;
use crate::identity::{DatasetId, DatasetRecord, IdentityReader};
use crate::mismatch::Mismatch;
use crate::paths::uri_to_path;
use crate::validate::DatasetValidator;

#[derive(Clone)]
pub struct MismatchDetector {
    identity: Arc<dyn IdentityReader>,
    validator: Option<Arc<dyn DatasetValidator>>,
}

impl MismatchDetector {
    pub fn new(identity: Arc<dyn IdentityReader>) -> Self {
        Self {
            identity,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn DatasetValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn identity(&self) -> &Arc<dyn IdentityReader> {
        &self.identity
    }

    pub fn detect(&self, catalog: &dyn Catalog, uri: &str) -> SyncResult<Vec<Mismatch>> {
        let path = uri_to_path(uri)?;
        let indexed = catalog.datasets_for_uri(uri)?;

        // A path that vanished after listing is simply missing.
        let on_disk: Vec<DatasetId> = if fs::symlink_metadata(&path).is_err() {
            Vec::new()
        } else {
            let ids = match self.identity.read_ids(&path) {
                Ok(ids) => ids,
                Err(err) if err.is_vanished() => {
                    debug!("{uri} vanished while reading: {err}");
                    return Ok(missing_on_disk(indexed, uri));
                }
                Err(err) => {
                    debug!("unreadable dataset at {uri}: {err}");
                    return Ok(vec![Mismatch::UnreadableDataset {
                        uri: uri.to_string(),
                    }]);
                }
            };
            if let Some(validator) = &self.validator {
                if let Err(err) = validator.validate(&path) {
                    debug!("invalid dataset at {uri}: {err}");
                    return Ok(vec![Mismatch::InvalidDataset {
                        uri: uri.to_string(),
                    }]);
                }
            }
            ids
        };

        let on_disk_ids = on_disk.iter().copied().collect::<HashSet<_>>();
        let indexed_ids = indexed.iter().map(|record| record.id).collect::<HashSet<_>>();
        let mut mismatches = Vec::new();

        for dataset in indexed {
            if on_disk_ids.contains(&dataset.id) {
                if dataset.is_archived() {
                    mismatches.push(Mismatch::ArchivedDatasetOnDisk {
                        dataset,
                        uri: uri.to_string(),
                    });
                }
            } else {
                mismatches.push(Mismatch::LocationMissingOnDisk {
                    dataset,
                    uri: uri.to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for id in on_disk {
            if indexed_ids.contains(&id) || !seen.insert(id) {
                continue;
            }
            let mismatch = match catalog.get(&id)? {
                Some(dataset) => Mismatch::LocationNotIndexed {
                    dataset,
                    uri: uri.to_string(),
                },
                None => Mismatch::DatasetNotIndexed {
                    dataset: DatasetRecord::new(id),
                    uri: uri.to_string(),
                },
            };
            mismatches.push(mismatch);
        }

        Ok(mismatches)
    }
}

fn missing_on_disk(indexed: Vec<DatasetRecord>, uri: &str) -> Vec<Mismatch> {
    indexed
        .into_iter()
        .map(|dataset| Mismatch::LocationMissingOnDisk {
            dataset,
            uri: uri.to_string(),
        })
        .collect()
}
