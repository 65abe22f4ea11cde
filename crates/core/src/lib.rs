pub mod catalog;
pub mod collection;
pub mod config;
pub mod detect;
pub mod doctor;
pub mod error;
pub mod fix;
pub mod identity;
pub mod markdown;
pub mod mismatch;
pub mod model;
pub mod paths;
pub mod pathset;
pub mod scan;
pub mod sync;
pub mod validate;

pub use catalog::{Catalog, CatalogConnector, CatalogDataset, MemoryCatalog};
pub use collection::{CatalogQuery, Collection, CollectionRegistry, Trust};
pub use config::SyncConfig;
pub use detect::MismatchDetector;
pub use doctor::{collect_doctor_info, BaseDirStatus, CollectionCacheStatus, DoctorInfo};
pub use error::{SyncError, SyncResult};
pub use fix::{candidate_actions, FixAction, FixOptions, MismatchFixer};
pub use identity::{DatasetId, DatasetRecord, IdentityError, IdentityReader, MetadataDocReader};
pub use markdown::render_markdown_summary;
pub use mismatch::{read_mismatch_log, Mismatch, MismatchKind, MismatchLogWriter, MismatchRecord};
pub use model::{
    FixDecision, FixOutcome, MismatchKindCount, SyncMetrics, SyncPhase, SyncProgressEvent,
    SyncReport, REPORT_VERSION,
};
pub use paths::{path_to_uri, uri_to_path, BaseDirs};
pub use pathset::{PathSet, PathSetBuild, PathSetBuilder};
pub use scan::{scan_for_mismatches, MismatchStream, ScanOptions};
pub use sync::{SyncEngine, SyncRequest};
pub use validate::{CommandValidator, DatasetValidator, ValidationError, ValidatorConfig};
