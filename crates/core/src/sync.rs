use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogConnector};
use crate::collection::{Collection, Trust};
use crate::config::SyncConfig;
use crate::detect::MismatchDetector;
use crate::error::SyncResult;
use crate::fix::{FixOptions, MismatchFixer};
use crate::mismatch::{read_mismatch_log, Mismatch, MismatchKind, MismatchLogWriter};
use crate::model::{
    FixDecision, FixOutcome, MismatchKindCount, SyncMetrics, SyncPhase, SyncProgressEvent, SyncReport,
    REPORT_VERSION,
};
use crate::pathset::PathSetBuilder;
use crate::paths::BaseDirs;
use crate::scan::{scan_for_mismatches, ScanOptions};

const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub fix: FixOptions,
    /// Every detected mismatch is appended here before any fix is attempted.
    pub mismatch_log: Option<PathBuf>,
    pub force_rebuild: bool,
    pub run_id: Option<String>,
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

pub struct SyncEngine {
    base_dirs: BaseDirs,
    connector: Arc<dyn CatalogConnector>,
    detector: Arc<MismatchDetector>,
    cache_dir: PathBuf,
    scan_options: ScanOptions,
    now: Option<DateTime<Utc>>,
}

impl SyncEngine {
    pub fn new(
        base_dirs: BaseDirs,
        connector: Arc<dyn CatalogConnector>,
        detector: MismatchDetector,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_dirs,
            connector,
            detector: Arc::new(detector),
            cache_dir: cache_dir.into(),
            scan_options: ScanOptions::default(),
            now: None,
        }
    }

    pub fn from_config(config: &SyncConfig, connector: Arc<dyn CatalogConnector>) -> SyncResult<Self> {
        Ok(Self::new(
            config.base_dirs()?,
            connector,
            config.detector(),
            config.cache_dir.clone(),
        )
        .with_scan_options(config.scan_options()))
    }

    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.scan_options = options;
        self
    }

    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn base_dirs(&self) -> &BaseDirs {
        &self.base_dirs
    }

    pub fn run(&self, collection: &Collection, request: &SyncRequest) -> SyncResult<SyncReport> {
        self.run_with_callbacks(collection, request, |_| {}, |_| {})
    }

    pub fn run_with_callbacks<M, E>(
        &self,
        collection: &Collection,
        request: &SyncRequest,
        mut on_mismatch: M,
        mut on_event: E,
    ) -> SyncResult<SyncReport>
    where
        M: FnMut(&Mismatch),
        E: FnMut(SyncProgressEvent),
    {
        request.fix.validate()?;
        let mut scan_options = self.scan_options.clone();
        if request.cancel_flag.is_some() {
            scan_options.cancel_flag = request.cancel_flag.clone();
        }
        scan_options.validate()?;

        let started = Instant::now();
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut progress = Progress::new(&run_id, &collection.name);
        let mut warnings = Vec::new();
        info!(
            "sync {run_id}: collection {} (trust {:?})",
            collection.name, collection.trust
        );

        progress.emit(&mut on_event, SyncPhase::BuildingPathSet);
        let mut builder = PathSetBuilder::new(&self.cache_dir).force_rebuild(request.force_rebuild);
        if let Some(now) = self.now {
            builder = builder.with_clock(now);
        }
        let build = {
            let catalog = self.connector.connect()?;
            builder.build(collection, catalog.as_ref())?
        };
        let locations = build.path_set.len() as u64;

        let mut log = request
            .mismatch_log
            .as_deref()
            .map(MismatchLogWriter::create)
            .transpose()?;

        progress.emit(&mut on_event, SyncPhase::Detecting);
        let stream = scan_for_mismatches(
            Arc::new(build.path_set),
            Arc::clone(&self.connector),
            Arc::clone(&self.detector),
            &scan_options,
        )?;

        let writer = if request.fix.is_empty() {
            None
        } else {
            Some(self.connector.connect()?)
        };
        let fixer = match writer.as_deref() {
            Some(catalog) => Some(self.fixer(catalog, &request.fix)?),
            None => None,
        };

        let mut counts: BTreeMap<MismatchKind, u64> = BTreeMap::new();
        let mut decisions: Vec<FixDecision> = Vec::new();
        for item in stream {
            let mismatch = match item {
                Ok(mismatch) => mismatch,
                Err(err) if !err.is_fatal() => {
                    warn!("{err}");
                    warnings.push(err.to_string());
                    continue;
                }
                Err(err) => return Err(err),
            };

            on_mismatch(&mismatch);
            *counts.entry(mismatch.kind()).or_insert(0) += 1;
            if let Some(log) = log.as_mut() {
                log.append(&mismatch)?;
            }
            if let Some(fixer) = &fixer {
                decisions.extend(fixer.fix(&mismatch)?);
            }

            progress.mismatches += 1;
            progress.fixes_applied = applied(&decisions);
            if progress.mismatches % PROGRESS_EVERY == 0 {
                progress.emit(&mut on_event, SyncPhase::Detecting);
            }
        }

        if scan_options
            .cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            warnings.push("run cancelled before every location was checked".to_string());
        }
        progress.emit(&mut on_event, SyncPhase::Done);

        let report = SyncReport {
            report_version: REPORT_VERSION.to_string(),
            generated_at: timestamp(),
            run_id,
            collection: collection.name.clone(),
            trust: collection.trust,
            fix_options: request.fix.clone(),
            metrics: SyncMetrics {
                elapsed_ms: started.elapsed().as_millis() as u64,
                locations,
                path_set_from_cache: build.from_cache,
                jobs: scan_options.jobs as u64,
            },
            mismatch_counts: kind_counts(&counts),
            decisions,
            warnings,
        };
        info!(
            "sync {}: {} mismatch(es), {} fix(es) applied",
            report.run_id,
            report.total_mismatches(),
            report.applied_count()
        );
        Ok(report)
    }

    pub fn fix_from_log(&self, path: &Path, options: &FixOptions) -> SyncResult<SyncReport> {
        options.validate()?;
        let started = Instant::now();
        let mismatches = read_mismatch_log(path)?;
        info!(
            "replaying {} mismatch(es) from {}",
            mismatches.len(),
            path.display()
        );

        let catalog = self.connector.connect()?;
        let fixer = self.fixer(catalog.as_ref(), options)?;
        let mut counts: BTreeMap<MismatchKind, u64> = BTreeMap::new();
        let mut decisions = Vec::new();
        for mismatch in &mismatches {
            *counts.entry(mismatch.kind()).or_insert(0) += 1;
            decisions.extend(fixer.fix(mismatch)?);
        }

        Ok(SyncReport {
            report_version: REPORT_VERSION.to_string(),
            generated_at: timestamp(),
            run_id: Uuid::new_v4().to_string(),
            collection: path.display().to_string(),
            trust: Trust::None,
            fix_options: options.clone(),
            metrics: SyncMetrics {
                elapsed_ms: started.elapsed().as_millis() as u64,
                locations: mismatches.len() as u64,
                path_set_from_cache: false,
                jobs: 0,
            },
            mismatch_counts: kind_counts(&counts),
            decisions,
            warnings: Vec::new(),
        })
    }

    fn fixer<'a>(
        &'a self,
        catalog: &'a dyn Catalog,
        options: &FixOptions,
    ) -> SyncResult<MismatchFixer<'a>> {
        let fixer = MismatchFixer::new(
            catalog,
            &**self.detector.identity(),
            &self.base_dirs,
            options.clone(),
        )?;
        Ok(match self.now {
            Some(now) => fixer.with_clock(now),
            None => fixer,
        })
    }
}

struct Progress {
    run_id: String,
    collection: String,
    seq: u64,
    mismatches: u64,
    fixes_applied: u64,
}

impl Progress {
    fn new(run_id: &str, collection: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            collection: collection.to_string(),
            seq: 0,
            mismatches: 0,
            fixes_applied: 0,
        }
    }

    fn emit<E>(&mut self, on_event: &mut E, phase: SyncPhase)
    where
        E: FnMut(SyncProgressEvent),
    {
        self.seq = self.seq.saturating_add(1);
        on_event(SyncProgressEvent {
            seq: self.seq,
            run_id: self.run_id.clone(),
            collection: self.collection.clone(),
            phase,
            mismatches: self.mismatches,
            fixes_applied: self.fixes_applied,
            timestamp: timestamp(),
        });
    }
}

fn applied(decisions: &[FixDecision]) -> u64 {
    decisions
        .iter()
        .filter(|decision| decision.outcome == FixOutcome::Applied)
        .count() as u64
}

fn kind_counts(counts: &BTreeMap<MismatchKind, u64>) -> Vec<MismatchKindCount> {
    MismatchKind::ALL
        .iter()
        .map(|kind| MismatchKindCount {
            kind: *kind,
            mismatches: counts.get(kind).copied().unwrap_or(0),
        })
        .collect()
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
