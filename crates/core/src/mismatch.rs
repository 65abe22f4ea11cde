use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::identity::{DatasetId, DatasetRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    LocationMissingOnDisk,
    LocationNotIndexed,
    DatasetNotIndexed,
    ArchivedDatasetOnDisk,
    UnreadableDataset,
    InvalidDataset,
}

impl MismatchKind {
    pub const ALL: [MismatchKind; 6] = [
        MismatchKind::LocationMissingOnDisk,
        MismatchKind::LocationNotIndexed,
        MismatchKind::DatasetNotIndexed,
        MismatchKind::ArchivedDatasetOnDisk,
        MismatchKind::UnreadableDataset,
        MismatchKind::InvalidDataset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MismatchKind::LocationMissingOnDisk => "location_missing_on_disk",
            MismatchKind::LocationNotIndexed => "location_not_indexed",
            MismatchKind::DatasetNotIndexed => "dataset_not_indexed",
            MismatchKind::ArchivedDatasetOnDisk => "archived_dataset_on_disk",
            MismatchKind::UnreadableDataset => "unreadable_dataset",
            MismatchKind::InvalidDataset => "invalid_dataset",
        }
    }
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mismatch {
    /// The catalog places the dataset at `uri` but the disk does not hold it there.
    LocationMissingOnDisk { dataset: DatasetRecord, uri: String },
    /// The disk holds a known dataset at a location the catalog does not list.
    LocationNotIndexed { dataset: DatasetRecord, uri: String },
    /// The disk holds a dataset the catalog has never seen.
    DatasetNotIndexed { dataset: DatasetRecord, uri: String },
    /// The disk still holds a dataset the catalog marks archived.
    ArchivedDatasetOnDisk { dataset: DatasetRecord, uri: String },
    UnreadableDataset { uri: String },
    InvalidDataset { uri: String },
}

impl Mismatch {
    pub fn kind(&self) -> MismatchKind {
        match self {
            Mismatch::LocationMissingOnDisk { .. } => MismatchKind::LocationMissingOnDisk,
            Mismatch::LocationNotIndexed { .. } => MismatchKind::LocationNotIndexed,
            Mismatch::DatasetNotIndexed { .. } => MismatchKind::DatasetNotIndexed,
            Mismatch::ArchivedDatasetOnDisk { .. } => MismatchKind::ArchivedDatasetOnDisk,
            Mismatch::UnreadableDataset { .. } => MismatchKind::UnreadableDataset,
            Mismatch::InvalidDataset { .. } => MismatchKind::InvalidDataset,
        }
    }

    pub fn dataset(&self) -> Option<&DatasetRecord> {
        match self {
            Mismatch::LocationMissingOnDisk { dataset, .. }
            | Mismatch::LocationNotIndexed { dataset, .. }
            | Mismatch::DatasetNotIndexed { dataset, .. }
            | Mismatch::ArchivedDatasetOnDisk { dataset, .. } => Some(dataset),
            Mismatch::UnreadableDataset { .. } | Mismatch::InvalidDataset { .. } => None,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            Mismatch::LocationMissingOnDisk { uri, .. }
            | Mismatch::LocationNotIndexed { uri, .. }
            | Mismatch::DatasetNotIndexed { uri, .. }
            | Mismatch::ArchivedDatasetOnDisk { uri, .. }
            | Mismatch::UnreadableDataset { uri }
            | Mismatch::InvalidDataset { uri } => uri,
        }
    }

    pub fn to_record(&self) -> MismatchRecord {
        MismatchRecord {
            kind: self.kind(),
            dataset_id: self.dataset().map(|dataset| dataset.id),
            uri: self.uri().to_string(),
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dataset() {
            Some(dataset) => write!(f, "{}({}, {})", self.kind(), dataset.id, self.uri()),
            None => write!(f, "{}({})", self.kind(), self.uri()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchRecord {
    pub kind: MismatchKind,
    pub dataset_id: Option<DatasetId>,
    pub uri: String,
}

impl TryFrom<MismatchRecord> for Mismatch {
    type Error = String;

    fn try_from(record: MismatchRecord) -> Result<Self, Self::Error> {
        let MismatchRecord {
            kind,
            dataset_id,
            uri,
        } = record;
        Ok(match (kind, dataset_id) {
            (MismatchKind::LocationMissingOnDisk, Some(id)) => Mismatch::LocationMissingOnDisk {
                dataset: DatasetRecord::new(id),
                uri,
            },
            (MismatchKind::LocationNotIndexed, Some(id)) => Mismatch::LocationNotIndexed {
                dataset: DatasetRecord::new(id),
                uri,
            },
            (MismatchKind::DatasetNotIndexed, Some(id)) => Mismatch::DatasetNotIndexed {
                dataset: DatasetRecord::new(id),
                uri,
            },
            (MismatchKind::ArchivedDatasetOnDisk, Some(id)) => Mismatch::ArchivedDatasetOnDisk {
                dataset: DatasetRecord::new(id),
                uri,
            },
            (MismatchKind::UnreadableDataset, None) => Mismatch::UnreadableDataset { uri },
            (MismatchKind::InvalidDataset, None) => Mismatch::InvalidDataset { uri },
            (kind @ (MismatchKind::UnreadableDataset | MismatchKind::InvalidDataset), Some(_)) => {
                return Err(format!("{kind} must not carry a dataset_id"))
            }
            (kind, None) => return Err(format!("{kind} requires a dataset_id")),
        })
    }
}

pub struct MismatchLogWriter {
    writer: BufWriter<File>,
}

impl MismatchLogWriter {
    pub fn create(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, mismatch: &Mismatch) -> SyncResult<()> {
        let line = serde_json::to_string(&mismatch.to_record()).map_err(|err| {
            SyncError::MismatchLog {
                line: 0,
                message: err.to_string(),
            }
        })?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn read_mismatch_log(path: &Path) -> SyncResult<Vec<Mismatch>> {
    let raw = fs::read_to_string(path)?;
    let mut out = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let line_error = |message: String| SyncError::MismatchLog {
            line: index + 1,
            message,
        };
        let record: MismatchRecord =
            serde_json::from_str(trimmed).map_err(|err| line_error(err.to_string()))?;
        out.push(Mismatch::try_from(record).map_err(line_error)?);
    }
    Ok(out)
}
