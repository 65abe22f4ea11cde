use std::path::PathBuf;

use thiserror::Error;

use crate::identity::DatasetId;
use crate::mismatch::Mismatch;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("path {} is not under any registered base directory", .0.display())]
    PathResolution(PathBuf),
    #[error("refusing to trash base directory {}", .0.display())]
    TrashRefused(PathBuf),
    #[error("unsupported location uri: {0}")]
    UnsupportedUri(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("failed to fix {mismatch}: {source}")]
    FixFailed {
        mismatch: Box<Mismatch>,
        #[source]
        source: Box<SyncError>,
    },
    #[error("{uri} does not contain dataset {expected}")]
    IdentityMismatch { uri: String, expected: DatasetId },
    #[error("path-set cache {}: {message}", path.display())]
    Cache { path: PathBuf, message: String },
    #[error("mismatch log line {line}: {message}")]
    MismatchLog { line: usize, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Errors scoped to one URI; the run continues past them.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SyncError::PathResolution(_)
                | SyncError::TrashRefused(_)
                | SyncError::UnsupportedUri(_)
        )
    }

    pub fn catalog(message: impl Into<String>) -> Self {
        SyncError::Catalog(message.into())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::SyncError;

    #[test]
    fn per_uri_errors_are_not_fatal() {
        assert!(!SyncError::PathResolution(PathBuf::from("/elsewhere")).is_fatal());
        assert!(!SyncError::TrashRefused(PathBuf::from("/g/data")).is_fatal());
        assert!(!SyncError::UnsupportedUri("s3://bucket/key".to_string()).is_fatal());
        assert!(SyncError::catalog("connection reset").is_fatal());
        assert!(SyncError::Configuration("bad".to_string()).is_fatal());
    }
}
