pub mod service;

pub use service::{
    load_report, CancelSyncResponse, SyncService, SyncSessionSnapshot, SyncSessionStatus,
    SyncStartRequest,
};
