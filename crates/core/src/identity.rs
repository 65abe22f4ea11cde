use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DIRECTORY_METADATA_NAMES: &[&str] = &[
    "dataset-metadata.yaml",
    "dataset-metadata.yml",
    "dataset-metadata.json",
];
pub const SIDECAR_SUFFIXES: &[&str] = &[".meta.yaml", ".meta.yml", ".meta.json"];
const METADATA_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(Uuid);

impl DatasetId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DatasetId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: DatasetId,
    #[serde(default)]
    pub archived_time: Option<DateTime<Utc>>,
}

impl DatasetRecord {
    pub fn new(id: DatasetId) -> Self {
        Self {
            id,
            archived_time: None,
        }
    }

    pub fn archived(id: DatasetId, archived_time: DateTime<Utc>) -> Self {
        Self {
            id,
            archived_time: Some(archived_time),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_time.is_some()
    }
}

impl PartialEq for DatasetRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DatasetRecord {}

impl Hash for DatasetRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no metadata document found for {}", .0.display())]
    NoMetadata(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("expected exactly one dataset id at {}, found {found}", path.display())]
    NotSingular { path: PathBuf, found: usize },
}

impl IdentityError {
    pub fn is_vanished(&self) -> bool {
        match self {
            IdentityError::NoMetadata(path) => fs::symlink_metadata(path).is_err(),
            IdentityError::Read { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub trait IdentityReader: Send + Sync {
    fn read_ids(&self, path: &Path) -> Result<Vec<DatasetId>, IdentityError>;

    fn read_single_id(&self, path: &Path) -> Result<DatasetId, IdentityError> {
        single_id(path, self.read_ids(path)?)
    }
}

pub fn single_id(path: &Path, ids: Vec<DatasetId>) -> Result<DatasetId, IdentityError> {
    match ids.as_slice() {
        [only] => Ok(*only),
        _ => Err(IdentityError::NotSingular {
            path: path.to_path_buf(),
            found: ids.len(),
        }),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetadataDocReader;

impl IdentityReader for MetadataDocReader {
    fn read_ids(&self, path: &Path) -> Result<Vec<DatasetId>, IdentityError> {
        let document = metadata_path_for(path)
            .ok_or_else(|| IdentityError::NoMetadata(path.to_path_buf()))?;
        let text = fs::read_to_string(&document).map_err(|source| IdentityError::Read {
            path: document.clone(),
            source,
        })?;
        parse_document_ids(&document, &text)
    }
}

pub fn metadata_path_for(path: &Path) -> Option<PathBuf> {
    if path.is_dir() {
        return DIRECTORY_METADATA_NAMES
            .iter()
            .map(|name| path.join(name))
            .find(|candidate| candidate.is_file());
    }

    if is_metadata_document(path) && path.is_file() {
        return Some(path.to_path_buf());
    }

    sidecar_candidates(path)
        .into_iter()
        .find(|candidate| candidate.is_file())
}

pub fn sidecar_candidates(path: &Path) -> Vec<PathBuf> {
    let Some(file_name) = path.file_name() else {
        return Vec::new();
    };
    let file_name = file_name.to_string_lossy();
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| path.with_file_name(format!("{file_name}{suffix}")))
        .collect()
}

fn is_metadata_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            METADATA_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

pub fn parse_document_ids(document: &Path, text: &str) -> Result<Vec<DatasetId>, IdentityError> {
    let parse_error = |message: String| IdentityError::Parse {
        path: document.to_path_buf(),
        message,
    };

    let mut ids = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|err| parse_error(format!("document {}: {err}", index + 1)))?;
        if value.is_null() {
            continue;
        }
        let id = value
            .get("id")
            .and_then(serde_yaml::Value::as_str)
            .ok_or_else(|| parse_error(format!("document {} has no string id", index + 1)))?;
        let id = id
            .parse::<DatasetId>()
            .map_err(|err| parse_error(format!("document {}: invalid id {id:?}: {err}", index + 1)))?;
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;

    use chrono::Utc;
    use tempfile::TempDir;

    use super::{
        metadata_path_for, parse_document_ids, DatasetId, DatasetRecord, IdentityError,
        IdentityReader, MetadataDocReader,
    };

    const ID_A: &str = "5f0e3a0c-8a43-4b1d-9b1c-6d1e1f0c0a01";
    const ID_B: &str = "5f0e3a0c-8a43-4b1d-9b1c-6d1e1f0c0a02";

    #[test]
    fn records_compare_by_id_only() {
        let id: DatasetId = ID_A.parse().expect("uuid");
        let plain = DatasetRecord::new(id);
        let archived = DatasetRecord::archived(id, Utc::now());
        assert_eq!(plain, archived);

        let set = [plain, archived].into_iter().collect::<HashSet<_>>();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn parses_multi_document_stream() {
        let text = format!("id: {ID_A}\nproduct: ls8_nbar\n---\nid: {ID_B}\n");
        let ids = parse_document_ids(Path::new("x.yaml"), &text).expect("parses");
        assert_eq!(
            ids,
            vec![
                ID_A.parse::<DatasetId>().expect("a"),
                ID_B.parse::<DatasetId>().expect("b")
            ]
        );
    }

    #[test]
    fn rejects_documents_without_valid_id() {
        assert!(matches!(
            parse_document_ids(Path::new("x.yaml"), "product: ls8\n"),
            Err(IdentityError::Parse { .. })
        ));
        assert!(matches!(
            parse_document_ids(Path::new("x.yaml"), "id: not-a-uuid\n"),
            Err(IdentityError::Parse { .. })
        ));
        assert!(parse_document_ids(Path::new("x.yaml"), "id: [unclosed\n").is_err());
    }

    #[test]
    fn finds_directory_document_and_sidecar() {
        let temp = TempDir::new().expect("tempdir");
        let dataset_dir = temp.path().join("scene");
        fs::create_dir_all(&dataset_dir).expect("mkdir");
        fs::write(
            dataset_dir.join("dataset-metadata.yaml"),
            format!("id: {ID_A}\n"),
        )
        .expect("write");

        let data_file = temp.path().join("tile.nc");
        fs::write(&data_file, b"netcdf").expect("write");
        fs::write(temp.path().join("tile.nc.meta.json"), format!("{{\"id\": \"{ID_B}\"}}"))
            .expect("write");

        let reader = MetadataDocReader;
        assert_eq!(
            reader.read_single_id(&dataset_dir).expect("dir id").to_string(),
            ID_A
        );
        assert_eq!(
            reader.read_single_id(&data_file).expect("sidecar id").to_string(),
            ID_B
        );
        assert_eq!(
            metadata_path_for(&data_file),
            Some(temp.path().join("tile.nc.meta.json"))
        );
    }

    #[test]
    fn missing_metadata_is_an_error() {
        let temp = TempDir::new().expect("tempdir");
        let data_file = temp.path().join("orphan.tif");
        fs::write(&data_file, b"tiff").expect("write");
        assert!(matches!(
            MetadataDocReader.read_ids(&data_file),
            Err(IdentityError::NoMetadata(_))
        ));
    }

    #[test]
    fn only_not_found_counts_as_vanished() {
        let temp = TempDir::new().expect("tempdir");
        let gone = temp.path().join("gone.yaml");
        let err = MetadataDocReader.read_ids(&gone).expect_err("gone");
        assert!(err.is_vanished());

        let present = temp.path().join("orphan.tif");
        fs::write(&present, b"tiff").expect("write");
        let err = MetadataDocReader.read_ids(&present).expect_err("no sidecar");
        assert!(!err.is_vanished());

        let denied = IdentityError::Read {
            path: present,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(!denied.is_vanished());
    }

    #[test]
    fn single_id_requires_exactly_one() {
        let temp = TempDir::new().expect("tempdir");
        let doc = temp.path().join("two.yaml");
        fs::write(&doc, format!("id: {ID_A}\n---\nid: {ID_B}\n")).expect("write");
        assert!(matches!(
            MetadataDocReader.read_single_id(&doc),
            Err(IdentityError::NotSingular { found: 2, .. })
        ));
    }
}
