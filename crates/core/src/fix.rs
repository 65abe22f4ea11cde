use std::fmt;
use std::fs;

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::{SyncError, SyncResult};
use crate::identity::{sidecar_candidates, DatasetRecord, IdentityError, IdentityReader};
use crate::mismatch::{Mismatch, MismatchKind};
use crate::model::{FixDecision, FixOutcome};
use crate::paths::{uri_to_path, BaseDirs};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOptions {
    #[serde(default)]
    pub index_missing: bool,
    #[serde(default)]
    pub trash_missing: bool,
    #[serde(default)]
    pub update_locations: bool,
    #[serde(default)]
    pub trash_archived: Option<u32>,
}

impl FixOptions {
    pub fn validate(&self) -> SyncResult<()> {
        if self.index_missing && self.trash_missing {
            return Err(SyncError::Configuration(
                "index_missing and trash_missing are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        !self.index_missing
            && !self.trash_missing
            && !self.update_locations
            && self.trash_archived.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    RemoveLocation,
    AddLocation,
    IndexDataset,
    TrashUnindexed,
    TrashArchived,
}

impl FixAction {
    pub fn is_enabled(self, options: &FixOptions) -> bool {
        match self {
            FixAction::RemoveLocation | FixAction::AddLocation => options.update_locations,
            FixAction::IndexDataset => options.index_missing,
            FixAction::TrashUnindexed => options.trash_missing,
            FixAction::TrashArchived => options.trash_archived.is_some(),
        }
    }
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FixAction::RemoveLocation => "remove_location",
            FixAction::AddLocation => "add_location",
            FixAction::IndexDataset => "index_dataset",
            FixAction::TrashUnindexed => "trash_unindexed",
            FixAction::TrashArchived => "trash_archived",
        };
        f.write_str(name)
    }
}

pub fn candidate_actions(kind: MismatchKind) -> &'static [FixAction] {
    match kind {
        MismatchKind::LocationMissingOnDisk => &[FixAction::RemoveLocation],
        MismatchKind::LocationNotIndexed => &[FixAction::AddLocation],
        MismatchKind::DatasetNotIndexed => &[FixAction::IndexDataset, FixAction::TrashUnindexed],
        MismatchKind::ArchivedDatasetOnDisk => &[FixAction::TrashArchived],
        MismatchKind::UnreadableDataset => &[FixAction::TrashUnindexed],
        MismatchKind::InvalidDataset => &[],
    }
}

pub struct MismatchFixer<'a> {
    catalog: &'a dyn Catalog,
    identity: &'a dyn IdentityReader,
    base_dirs: &'a BaseDirs,
    options: FixOptions,
    now: DateTime<Utc>,
    today: NaiveDate,
}

impl<'a> MismatchFixer<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        identity: &'a dyn IdentityReader,
        base_dirs: &'a BaseDirs,
        options: FixOptions,
    ) -> SyncResult<Self> {
        options.validate()?;
        Ok(Self {
            catalog,
            identity,
            base_dirs,
            options,
            now: Utc::now(),
            today: Local::now().date_naive(),
        })
    }

    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self.today = now.with_timezone(&Local).date_naive();
        self
    }

    pub fn options(&self) -> &FixOptions {
        &self.options
    }

    pub fn fix_all<I>(&self, mismatches: I) -> SyncResult<Vec<FixDecision>>
    where
        I: IntoIterator<Item = Mismatch>,
    {
        let mut decisions = Vec::new();
        for mismatch in mismatches {
            decisions.extend(self.fix(&mismatch)?);
        }
        Ok(decisions)
    }

    /// Catalog and filesystem failures abort with the failing mismatch attached;
    /// per-location resolution errors only skip that action.
    pub fn fix(&self, mismatch: &Mismatch) -> SyncResult<Vec<FixDecision>> {
        let mut decisions = Vec::new();
        for &action in candidate_actions(mismatch.kind()) {
            if !action.is_enabled(&self.options) {
                continue;
            }
            let decision = match self.apply(action, mismatch) {
                Ok((outcome, rationale)) => record_decision(action, mismatch, outcome, rationale),
                Err(err) if !err.is_fatal() => {
                    warn!("{action} skipped for {mismatch}: {err}");
                    record_decision(action, mismatch, FixOutcome::Skipped, err.to_string())
                }
                Err(err) => {
                    return Err(SyncError::FixFailed {
                        mismatch: Box::new(mismatch.clone()),
                        source: Box::new(err),
                    })
                }
            };
            info!(
                "{action} {:?} for {mismatch}: {}",
                decision.outcome, decision.rationale
            );
            decisions.push(decision);
        }
        Ok(decisions)
    }

    fn apply(&self, action: FixAction, mismatch: &Mismatch) -> SyncResult<(FixOutcome, String)> {
        let uri = mismatch.uri();
        match (action, mismatch.dataset()) {
            (FixAction::RemoveLocation, Some(dataset)) => {
                let changed = self.catalog.remove_location(dataset, uri)?;
                Ok(changed_outcome(
                    changed,
                    format!("removed {uri} from dataset {}", dataset.id),
                    "location was already absent",
                ))
            }
            (FixAction::AddLocation, Some(dataset)) => {
                let changed = self.catalog.add_location(dataset, uri)?;
                Ok(changed_outcome(
                    changed,
                    format!("added {uri} to dataset {}", dataset.id),
                    "location was already recorded",
                ))
            }
            (FixAction::IndexDataset, Some(dataset)) => self.index_dataset(dataset, uri),
            (FixAction::TrashUnindexed, _) => self.trash_unindexed(uri),
            (FixAction::TrashArchived, _) => self.trash_archived(uri),
            (action, None) => Err(SyncError::catalog(format!(
                "{action} requires a dataset but {} carries none",
                mismatch.kind()
            ))),
        }
    }

    fn index_dataset(&self, dataset: &DatasetRecord, uri: &str) -> SyncResult<(FixOutcome, String)> {
        let path = uri_to_path(uri)?;
        if fs::symlink_metadata(&path).is_err() {
            return Ok(vanished(uri));
        }
        let ids = match self.identity.read_ids(&path) {
            Ok(ids) => ids,
            Err(err) if err.is_vanished() || matches!(err, IdentityError::NoMetadata(_)) => {
                return Ok(vanished(uri))
            }
            Err(_) => {
                return Err(SyncError::IdentityMismatch {
                    uri: uri.to_string(),
                    expected: dataset.id,
                })
            }
        };
        if !ids.contains(&dataset.id) {
            return Err(SyncError::IdentityMismatch {
                uri: uri.to_string(),
                expected: dataset.id,
            });
        }

        if self.catalog.get(&dataset.id)?.is_some() {
            let changed = self.catalog.add_location(dataset, uri)?;
            return Ok(changed_outcome(
                changed,
                format!("dataset {} already indexed; added {uri}", dataset.id),
                "dataset already indexed at this location",
            ));
        }
        self.catalog.add_dataset(dataset, uri)?;
        Ok((
            FixOutcome::Applied,
            format!("indexed new dataset {} at {uri}", dataset.id),
        ))
    }

    fn trash_unindexed(&self, uri: &str) -> SyncResult<(FixOutcome, String)> {
        let claimants = self.catalog.datasets_for_uri(uri)?;
        if !claimants.is_empty() {
            return Ok((
                FixOutcome::Skipped,
                format!(
                    "{} catalog record(s) still claim this location",
                    claimants.len()
                ),
            ));
        }
        self.trash_location(uri)
    }

    fn trash_archived(&self, uri: &str) -> SyncResult<(FixOutcome, String)> {
        let min_age_hours = self.options.trash_archived.unwrap_or_default();
        let min_age = Duration::hours(i64::from(min_age_hours));
        let claimants = self.catalog.datasets_for_uri(uri)?;
        if claimants.is_empty() {
            return Ok((
                FixOutcome::Skipped,
                "no catalog record claims this location anymore".to_string(),
            ));
        }

        for claimant in &claimants {
            match claimant.archived_time {
                None => {
                    return Ok((
                        FixOutcome::Skipped,
                        format!("dataset {} at this location is still active", claimant.id),
                    ))
                }
                Some(archived) if self.now - archived < min_age => {
                    return Ok((
                        FixOutcome::Skipped,
                        format!(
                            "dataset {} archived {}h ago, less than {min_age_hours}h",
                            claimant.id,
                            (self.now - archived).num_hours()
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
        self.trash_location(uri)
    }

    fn trash_location(&self, uri: &str) -> SyncResult<(FixOutcome, String)> {
        let path = uri_to_path(uri)?;
        let sidecars = if path.is_file() {
            sidecar_candidates(&path)
                .into_iter()
                .filter(|candidate| fs::symlink_metadata(candidate).is_ok())
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        let moved = self.base_dirs.trash_path(&path, self.today)?;
        for sidecar in &sidecars {
            self.base_dirs.trash_path(sidecar, self.today)?;
        }
        Ok(changed_outcome(
            moved,
            format!("moved {} to trash", path.display()),
            "nothing left on disk to trash",
        ))
    }
}

fn changed_outcome(changed: bool, applied: String, unchanged: &str) -> (FixOutcome, String) {
    if changed {
        (FixOutcome::Applied, applied)
    } else {
        (FixOutcome::Unchanged, unchanged.to_string())
    }
}

fn vanished(uri: &str) -> (FixOutcome, String) {
    warn!("{uri} vanished before indexing");
    (
        FixOutcome::Skipped,
        "location vanished before indexing".to_string(),
    )
}

fn record_decision(
    action: FixAction,
    mismatch: &Mismatch,
    outcome: FixOutcome,
    rationale: String,
) -> FixDecision {
    FixDecision {
        action,
        kind: mismatch.kind(),
        uri: mismatch.uri().to_string(),
        dataset_id: mismatch.dataset().map(|dataset| dataset.id),
        outcome,
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    use super::{candidate_actions, FixAction, FixOptions, MismatchFixer};
    use crate::catalog::{Catalog, CatalogDataset, MemoryCatalog, RejectWrites};
    use crate::error::SyncError;
    use crate::identity::{DatasetId, DatasetRecord, MetadataDocReader};
    use crate::mismatch::{Mismatch, MismatchKind};
    use crate::model::FixOutcome;
    use crate::paths::{path_to_uri, BaseDirs};

    fn write_dataset(dir: &Path, name: &str, id: DatasetId) -> String {
        let path = dir.join(name);
        fs::write(&path, format!("id: {id}\n")).expect("write");
        path_to_uri(&path)
    }

    #[test]
    fn dispatch_table_covers_every_kind() {
        for kind in MismatchKind::ALL {
            let actions = candidate_actions(kind);
            match kind {
                MismatchKind::InvalidDataset => assert!(actions.is_empty()),
                _ => assert!(!actions.is_empty(), "{kind} has no action"),
            }
        }
        assert!(candidate_actions(MismatchKind::UnreadableDataset)
            .contains(&FixAction::TrashUnindexed));
    }

    #[test]
    fn index_and_trash_missing_are_exclusive() {
        let options = FixOptions {
            index_missing: true,
            trash_missing: true,
            ..FixOptions::default()
        };
        assert!(matches!(options.validate(), Err(SyncError::Configuration(_))));

        let catalog = MemoryCatalog::new();
        let bases = BaseDirs::new(["/g/data"]).expect("bases");
        assert!(MismatchFixer::new(&catalog, &MetadataDocReader, &bases, options).is_err());
    }

    #[test]
    fn disabled_actions_do_nothing() {
        let temp = TempDir::new().expect("tempdir");
        let id = DatasetId::random();
        let uri = write_dataset(temp.path(), "a.yaml", id);
        let catalog = MemoryCatalog::new();
        let bases = BaseDirs::new([temp.path()]).expect("bases");
        let fixer =
            MismatchFixer::new(&catalog, &MetadataDocReader, &bases, FixOptions::default())
                .expect("fixer");

        let decisions = fixer
            .fix(&Mismatch::DatasetNotIndexed {
                dataset: DatasetRecord::new(id),
                uri,
            })
            .expect("fix");
        assert!(decisions.is_empty());
        assert!(catalog.is_empty());
    }

    #[test]
    fn index_missing_refuses_mismatched_identity() {
        let temp = TempDir::new().expect("tempdir");
        let uri = write_dataset(temp.path(), "a.yaml", DatasetId::random());
        let catalog = MemoryCatalog::new();
        let bases = BaseDirs::new([temp.path()]).expect("bases");
        let options = FixOptions {
            index_missing: true,
            ..FixOptions::default()
        };
        let fixer = MismatchFixer::new(&catalog, &MetadataDocReader, &bases, options).expect("fixer");

        let err = fixer
            .fix(&Mismatch::DatasetNotIndexed {
                dataset: DatasetRecord::new(DatasetId::random()),
                uri,
            })
            .expect_err("identity differs");
        match err {
            SyncError::FixFailed { source, .. } => {
                assert!(matches!(*source, SyncError::IdentityMismatch { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(catalog.is_empty());
    }

    #[test]
    fn index_missing_skips_vanished_location() {
        let temp = TempDir::new().expect("tempdir");
        let gone = DatasetId::random();
        let kept = DatasetId::random();
        let gone_uri = write_dataset(temp.path(), "a.yaml", gone);
        let kept_uri = write_dataset(temp.path(), "b.yaml", kept);
        fs::remove_file(temp.path().join("a.yaml")).expect("remove");
        let catalog = MemoryCatalog::new();
        let bases = BaseDirs::new([temp.path()]).expect("bases");
        let options = FixOptions {
            index_missing: true,
            ..FixOptions::default()
        };
        let fixer = MismatchFixer::new(&catalog, &MetadataDocReader, &bases, options).expect("fixer");

        let decisions = fixer
            .fix_all([
                Mismatch::DatasetNotIndexed {
                    dataset: DatasetRecord::new(gone),
                    uri: gone_uri,
                },
                Mismatch::DatasetNotIndexed {
                    dataset: DatasetRecord::new(kept),
                    uri: kept_uri,
                },
            ])
            .expect("vanished file is not fatal");
        assert_eq!(decisions[0].outcome, FixOutcome::Skipped);
        assert!(decisions[0].rationale.contains("vanished"));
        assert_eq!(decisions[1].outcome, FixOutcome::Applied);
        assert!(catalog.dataset(&gone).is_none());
        assert!(catalog.dataset(&kept).is_some());
    }

    #[test]
    fn trashing_a_base_directory_is_skipped() {
        let temp = TempDir::new().expect("tempdir");
        let catalog = MemoryCatalog::new();
        let bases = BaseDirs::new([temp.path()]).expect("bases");
        let options = FixOptions {
            trash_missing: true,
            ..FixOptions::default()
        };
        let fixer = MismatchFixer::new(&catalog, &MetadataDocReader, &bases, options).expect("fixer");

        let decisions = fixer
            .fix(&Mismatch::UnreadableDataset {
                uri: path_to_uri(temp.path()),
            })
            .expect("refusal is not fatal");
        assert_eq!(decisions[0].outcome, FixOutcome::Skipped);
        assert!(temp.path().is_dir());
    }

    #[test]
    fn trash_missing_respects_sibling_claimants() {
        let temp = TempDir::new().expect("tempdir");
        let unknown = DatasetId::random();
        let sibling = DatasetId::random();
        let uri = write_dataset(temp.path(), "stack.yaml", unknown);
        let catalog =
            MemoryCatalog::with_datasets([CatalogDataset::new(sibling).with_location(&uri)]);
        let bases = BaseDirs::new([temp.path()]).expect("bases");
        let options = FixOptions {
            trash_missing: true,
            ..FixOptions::default()
        };
        let fixer = MismatchFixer::new(&catalog, &MetadataDocReader, &bases, options).expect("fixer");
        let mismatch = Mismatch::DatasetNotIndexed {
            dataset: DatasetRecord::new(unknown),
            uri: uri.clone(),
        };

        let decisions = fixer.fix(&mismatch).expect("fix");
        assert_eq!(decisions[0].outcome, FixOutcome::Skipped);
        assert!(temp.path().join("stack.yaml").exists());

        catalog
            .remove_location(&DatasetRecord::new(sibling), &uri)
            .expect("release");
        let decisions = fixer.fix(&mismatch).expect("fix");
        assert_eq!(decisions[0].outcome, FixOutcome::Applied);
        assert!(!temp.path().join("stack.yaml").exists());
    }

    #[test]
    fn trashing_a_data_file_takes_its_sidecar() {
        let temp = TempDir::new().expect("tempdir");
        let data = temp.path().join("tile.nc");
        fs::write(&data, b"netcdf").expect("write");
        fs::write(temp.path().join("tile.nc.meta.yaml"), "id: [broken\n").expect("write");
        let catalog = MemoryCatalog::new();
        let bases = BaseDirs::new([temp.path()]).expect("bases");
        let options = FixOptions {
            trash_missing: true,
            ..FixOptions::default()
        };
        let fixer = MismatchFixer::new(&catalog, &MetadataDocReader, &bases, options)
            .expect("fixer")
            .with_clock(Utc::now());

        let decisions = fixer
            .fix(&Mismatch::UnreadableDataset {
                uri: path_to_uri(&data),
            })
            .expect("fix");
        assert_eq!(decisions[0].outcome, FixOutcome::Applied);
        assert!(!data.exists());
        assert!(!temp.path().join("tile.nc.meta.yaml").exists());
    }

    #[test]
    fn trash_archived_boundary_is_inclusive() {
        let temp = TempDir::new().expect("tempdir");
        let id = DatasetId::random();
        let uri = write_dataset(temp.path(), "old.yaml", id);
        let now = Utc::now();
        let catalog = MemoryCatalog::with_datasets([CatalogDataset::new(id)
            .with_location(&uri)
            .archived_at(now - Duration::hours(72))]);
        let bases = BaseDirs::new([temp.path()]).expect("bases");
        let mismatch = Mismatch::ArchivedDatasetOnDisk {
            dataset: DatasetRecord::new(id),
            uri,
        };

        let too_soon = FixOptions {
            trash_archived: Some(72),
            ..FixOptions::default()
        };
        let fixer = MismatchFixer::new(&catalog, &MetadataDocReader, &bases, too_soon)
            .expect("fixer")
            .with_clock(now - Duration::seconds(1));
        assert_eq!(fixer.fix(&mismatch).expect("fix")[0].outcome, FixOutcome::Skipped);
        assert!(temp.path().join("old.yaml").exists());

        let fixer = fixer.with_clock(now);
        assert_eq!(fixer.fix(&mismatch).expect("fix")[0].outcome, FixOutcome::Applied);
        assert!(!temp.path().join("old.yaml").exists());
    }

    #[test]
    fn catalog_write_failure_is_fatal_and_names_the_mismatch() {
        let id = DatasetId::random();
        let catalog = RejectWrites(MemoryCatalog::with_datasets([
            CatalogDataset::new(id).with_location("file:///g/data/a.yaml")
        ]));
        let bases = BaseDirs::new(["/g/data"]).expect("bases");
        let options = FixOptions {
            update_locations: true,
            ..FixOptions::default()
        };
        let fixer = MismatchFixer::new(&catalog, &MetadataDocReader, &bases, options).expect("fixer");

        let err = fixer
            .fix_all([Mismatch::LocationMissingOnDisk {
                dataset: DatasetRecord::new(id),
                uri: "file:///g/data/a.yaml".to_string(),
            }])
            .expect_err("write fails");
        assert!(err.to_string().contains("location_missing_on_disk"));
        assert_eq!(
            catalog.datasets_for_uri("file:///g/data/a.yaml").expect("lookup").len(),
            1
        );
    }
}
