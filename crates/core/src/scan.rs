use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::catalog::CatalogConnector;
use crate::detect::MismatchDetector;
use crate::error::{SyncError, SyncResult};
use crate::mismatch::Mismatch;
use crate::pathset::PathSet;

pub const DEFAULT_BATCH_SIZE: usize = 30;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub jobs: usize,
    pub batch_size: usize,
    /// Stops handing out new batches; batches already taken still finish.
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel_flag: None,
        }
    }
}

impl ScanOptions {
    pub fn validate(&self) -> SyncResult<()> {
        if self.jobs == 0 {
            return Err(SyncError::Configuration(
                "jobs must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Configuration(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

pub type ScanItem = SyncResult<Mismatch>;

pub struct MismatchStream {
    receiver: Receiver<ScanItem>,
    handles: Vec<JoinHandle<()>>,
}

impl Iterator for MismatchStream {
    type Item = ScanItem;

    fn next(&mut self) -> Option<Self::Item> {
        match self.receiver.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                for handle in self.handles.drain(..) {
                    if handle.join().is_err() {
                        error!("scan worker panicked; its remaining batch was lost");
                    }
                }
                None
            }
        }
    }
}

/// Runs the detector over every URI in `path_set` on `options.jobs` worker threads.
///
/// Each worker opens its own catalog connection through `connector`; callers
/// should drop any connection they hold before calling this.
pub fn scan_for_mismatches(
    path_set: Arc<PathSet>,
    connector: Arc<dyn CatalogConnector>,
    detector: Arc<MismatchDetector>,
    options: &ScanOptions,
) -> SyncResult<MismatchStream> {
    options.validate()?;
    info!(
        "scanning {} locations with {} worker(s), batches of {}",
        path_set.len(),
        options.jobs,
        options.batch_size
    );

    let (batch_tx, batch_rx) = bounded::<Vec<String>>(options.jobs * 2);
    let (result_tx, result_rx) = unbounded::<ScanItem>();
    let mut handles = Vec::with_capacity(options.jobs + 1);

    let feeder_options = options.clone();
    handles.push(thread::spawn(move || {
        feed_batches(&path_set, &feeder_options, &batch_tx)
    }));

    for worker in 0..options.jobs {
        let batch_rx = batch_rx.clone();
        let result_tx = result_tx.clone();
        let connector = Arc::clone(&connector);
        let detector = Arc::clone(&detector);
        handles.push(thread::spawn(move || {
            run_worker(worker, &*connector, &detector, &batch_rx, &result_tx)
        }));
    }

    Ok(MismatchStream {
        receiver: result_rx,
        handles,
    })
}

fn feed_batches(path_set: &PathSet, options: &ScanOptions, batch_tx: &Sender<Vec<String>>) {
    let mut batch = Vec::with_capacity(options.batch_size);
    for uri in path_set.iter() {
        batch.push(uri.to_string());
        if batch.len() < options.batch_size {
            continue;
        }
        if options.is_cancelled() {
            info!("scan cancelled; no further batches queued");
            return;
        }
        let full = std::mem::replace(&mut batch, Vec::with_capacity(options.batch_size));
        if batch_tx.send(full).is_err() {
            return;
        }
    }
    if !batch.is_empty() && !options.is_cancelled() {
        let _ = batch_tx.send(batch);
    }
}

fn run_worker(
    worker: usize,
    connector: &dyn CatalogConnector,
    detector: &MismatchDetector,
    batch_rx: &Receiver<Vec<String>>,
    result_tx: &Sender<ScanItem>,
) {
    let catalog = match connector.connect() {
        Ok(catalog) => catalog,
        Err(err) => {
            let _ = result_tx.send(Err(err));
            return;
        }
    };
    debug!("scan worker {worker} connected");

    for batch in batch_rx.iter() {
        for uri in &batch {
            match detector.detect(catalog.as_ref(), uri) {
                Ok(mismatches) => {
                    for mismatch in mismatches {
                        if result_tx.send(Ok(mismatch)).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let fatal = err.is_fatal();
                    if result_tx.send(Err(err)).is_err() || fatal {
                        return;
                    }
                }
            }
        }
    }
    debug!("scan worker {worker} finished");
}
