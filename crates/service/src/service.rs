use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread;

use anyhow::{anyhow, Context, Result};
use catalog_sync_core::{
    collect_doctor_info, CatalogConnector, CollectionRegistry, DoctorInfo, FixOptions,
    SyncConfig, SyncEngine, SyncProgressEvent, SyncReport, SyncRequest,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStartRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub collection: String,
    #[serde(default)]
    pub fix: FixOptions,
    #[serde(default)]
    pub mismatch_log: Option<PathBuf>,
    #[serde(default)]
    pub force_rebuild: bool,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncSessionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSessionSnapshot {
    pub run_id: String,
    pub collection: String,
    pub status: SyncSessionStatus,
    pub report_path: Option<PathBuf>,
    pub error: Option<String>,
    pub total_events: u64,
    pub mismatches: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSyncResponse {
    pub run_id: String,
    pub status: SyncSessionStatus,
}

#[derive(Debug, Clone)]
struct SyncSession {
    collection: String,
    status: SyncSessionStatus,
    report_path: Option<PathBuf>,
    report: Option<SyncReport>,
    error: Option<String>,
    events: Vec<SyncProgressEvent>,
    mismatches: u64,
    cancel_flag: Arc<AtomicBool>,
}

type Sessions = Arc<Mutex<HashMap<String, SyncSession>>>;

pub struct SyncService {
    config: SyncConfig,
    registry: CollectionRegistry,
    connector: Arc<dyn CatalogConnector>,
    sessions: Sessions,
}

impl SyncService {
    pub fn new(config: SyncConfig, connector: Arc<dyn CatalogConnector>) -> Result<Self> {
        let registry = config
            .registry()
            .context("failed to build collection registry")?;
        Ok(Self {
            config,
            registry,
            connector,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn start_sync(&self, request: SyncStartRequest) -> Result<String> {
        let collection = self.registry.get(&request.collection)?.clone();
        request.fix.validate()?;
        let engine = SyncEngine::from_config(&self.config, Arc::clone(&self.connector))?;

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel_flag = Arc::new(AtomicBool::new(false));
        {
            let mut sessions = lock(&self.sessions)?;
            if sessions.contains_key(&run_id) {
                return Err(anyhow!("sync session already exists: {run_id}"));
            }
            sessions.insert(
                run_id.clone(),
                SyncSession {
                    collection: collection.name.clone(),
                    status: SyncSessionStatus::Running,
                    report_path: request.output.clone(),
                    report: None,
                    error: None,
                    events: Vec::new(),
                    mismatches: 0,
                    cancel_flag: Arc::clone(&cancel_flag),
                },
            );
        }

        let sessions = Arc::clone(&self.sessions);
        let thread_run_id = run_id.clone();
        thread::spawn(move || {
            let sync_request = SyncRequest {
                fix: request.fix,
                mismatch_log: request.mismatch_log,
                force_rebuild: request.force_rebuild,
                run_id: Some(thread_run_id.clone()),
                cancel_flag: Some(Arc::clone(&cancel_flag)),
            };

            let run_result = engine.run_with_callbacks(
                &collection,
                &sync_request,
                |_| update(&sessions, &thread_run_id, |session| session.mismatches += 1),
                |event| update(&sessions, &thread_run_id, |session| session.events.push(event)),
            );

            let outcome = run_result
                .context("sync run failed")
                .and_then(|report| {
                    if let Some(path) = &request.output {
                        write_report(&report, path)?;
                    }
                    Ok(report)
                });

            update(&sessions, &thread_run_id, |session| match outcome {
                Ok(report) => {
                    session.report = Some(report);
                    session.status = if cancel_flag.load(Ordering::Relaxed) {
                        SyncSessionStatus::Cancelled
                    } else {
                        SyncSessionStatus::Completed
                    };
                    session.error = None;
                }
                Err(err) => {
                    warn!("sync {thread_run_id} failed: {err:#}");
                    session.status = SyncSessionStatus::Failed;
                    session.error = Some(format!("{err:#}"));
                }
            });
        });

        info!("started sync {run_id}");
        Ok(run_id)
    }

    pub fn poll_events(&self, run_id: &str, from_seq: u64) -> Result<Vec<SyncProgressEvent>> {
        let sessions = lock(&self.sessions)?;
        let session = find(&sessions, run_id)?;
        Ok(session
            .events
            .iter()
            .filter(|event| event.seq > from_seq)
            .cloned()
            .collect())
    }

    pub fn get_session(&self, run_id: &str) -> Result<SyncSessionSnapshot> {
        let sessions = lock(&self.sessions)?;
        let session = find(&sessions, run_id)?;
        Ok(SyncSessionSnapshot {
            run_id: run_id.to_string(),
            collection: session.collection.clone(),
            status: session.status.clone(),
            report_path: session.report_path.clone(),
            error: session.error.clone(),
            total_events: session.events.len() as u64,
            mismatches: session.mismatches,
        })
    }

    pub fn get_report(&self, run_id: &str) -> Result<Option<SyncReport>> {
        let sessions = lock(&self.sessions)?;
        Ok(find(&sessions, run_id)?.report.clone())
    }

    /// Stops queueing new locations; work already handed to workers still completes.
    pub fn cancel(&self, run_id: &str) -> Result<CancelSyncResponse> {
        let mut sessions = lock(&self.sessions)?;
        let session = sessions
            .get_mut(run_id)
            .ok_or_else(|| anyhow!("sync session not found: {run_id}"))?;

        session.cancel_flag.store(true, Ordering::Relaxed);
        if session.status == SyncSessionStatus::Running {
            session.status = SyncSessionStatus::Cancelled;
        }

        Ok(CancelSyncResponse {
            run_id: run_id.to_string(),
            status: session.status.clone(),
        })
    }

    pub fn doctor(&self) -> DoctorInfo {
        collect_doctor_info(&self.config)
    }
}

pub fn load_report(path: impl AsRef<Path>) -> Result<SyncReport> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read report {}", path.display()))?;
    let report: SyncReport = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(report)
}

fn write_report(report: &SyncReport, path: &Path) -> Result<()> {
    let payload =
        serde_json::to_string_pretty(report).context("failed to serialize report payload")?;
    fs::write(path, payload).with_context(|| format!("failed to write report to {}", path.display()))
}

fn lock(sessions: &Sessions) -> Result<MutexGuard<'_, HashMap<String, SyncSession>>> {
    sessions
        .lock()
        .map_err(|_| anyhow!("sync session registry lock poisoned"))
}

fn find<'a>(
    sessions: &'a HashMap<String, SyncSession>,
    run_id: &str,
) -> Result<&'a SyncSession> {
    sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("sync session not found: {run_id}"))
}

fn update<F>(sessions: &Sessions, run_id: &str, apply: F)
where
    F: FnOnce(&mut SyncSession),
{
    if let Ok(mut sessions) = sessions.lock() {
        if let Some(session) = sessions.get_mut(run_id) {
            apply(session);
        }
    }
}
