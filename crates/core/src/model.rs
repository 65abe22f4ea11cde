use serde::{Deserialize, Serialize};

use crate::collection::Trust;
use crate::fix::{FixAction, FixOptions};
use crate::identity::DatasetId;
use crate::mismatch::MismatchKind;

pub const REPORT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    pub report_version: String,
    pub generated_at: String,
    pub run_id: String,
    pub collection: String,
    #[serde(default)]
    pub trust: Trust,
    pub fix_options: FixOptions,
    #[serde(default)]
    pub metrics: SyncMetrics,
    #[serde(default)]
    pub mismatch_counts: Vec<MismatchKindCount>,
    #[serde(default)]
    pub decisions: Vec<FixDecision>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn count_for(&self, kind: MismatchKind) -> u64 {
        self.mismatch_counts
            .iter()
            .find(|count| count.kind == kind)
            .map(|count| count.mismatches)
            .unwrap_or(0)
    }

    pub fn total_mismatches(&self) -> u64 {
        self.mismatch_counts.iter().map(|count| count.mismatches).sum()
    }

    pub fn applied_count(&self) -> usize {
        self.decisions
            .iter()
            .filter(|decision| decision.outcome == FixOutcome::Applied)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyncMetrics {
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub locations: u64,
    #[serde(default)]
    pub path_set_from_cache: bool,
    #[serde(default)]
    pub jobs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MismatchKindCount {
    pub kind: MismatchKind,
    pub mismatches: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixDecision {
    pub action: FixAction,
    pub kind: MismatchKind,
    pub uri: String,
    pub dataset_id: Option<DatasetId>,
    pub outcome: FixOutcome,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    Applied,
    Unchanged,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    BuildingPathSet,
    Detecting,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncProgressEvent {
    pub seq: u64,
    pub run_id: String,
    pub collection: String,
    pub phase: SyncPhase,
    pub mismatches: u64,
    pub fixes_applied: u64,
    pub timestamp: String,
}
