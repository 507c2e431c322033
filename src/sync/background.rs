//! Background reconciliation job — periodic, single-flight, out-of-band.
//!
//! Runs on its own thread so it never blocks the online read/write path.
//! At most one pass executes at a time; shutdown is graceful via a flag
//! checked between short sleeps.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::reconcile::reconcile;
use crate::backend::StorageBackend;
use crate::db::sqlite::open_database;
use crate::models::SchemaStore;

/// Sleep granularity for shutdown responsiveness (5 seconds).
const SLEEP_GRANULARITY_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Path of the authoritative store database.
    pub store_path: PathBuf,
    /// Seconds between passes.
    pub interval_secs: u64,
}

/// Handle for the background reconciliation thread.
///
/// Supports graceful shutdown via `shutdown()` or automatic cleanup on
/// `Drop`.
pub struct ReconcilerHandle {
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Request graceful shutdown. A pass in flight completes, but no new
    /// pass starts.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Whether a pass is currently executing.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Start the reconciliation job on a dedicated thread.
pub fn start_reconciler<B, S>(
    config: ReconcilerConfig,
    backend: Arc<B>,
    schemas: Arc<S>,
) -> ReconcilerHandle
where
    B: StorageBackend + 'static,
    S: SchemaStore + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    let running_flag = running.clone();

    let handle = std::thread::spawn(move || {
        tracing::info!(
            interval_secs = config.interval_secs,
            "Reconciliation job started"
        );
        reconciler_loop(&config, backend.as_ref(), schemas.as_ref(), &shutdown_flag, &running_flag);
    });

    ReconcilerHandle {
        shutdown,
        running,
        handle: Some(handle),
    }
}

fn reconciler_loop<B: StorageBackend>(
    config: &ReconcilerConfig,
    backend: &B,
    schemas: &dyn SchemaStore,
    shutdown: &AtomicBool,
    running: &AtomicBool,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Reconciliation runtime failed to start");
            return;
        }
    };

    while !shutdown.load(Ordering::Relaxed) {
        // Sleep in small increments for responsive shutdown
        let steps = (config.interval_secs / SLEEP_GRANULARITY_SECS).max(1);
        for _ in 0..steps {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("Reconciliation job shutting down");
                return;
            }
            std::thread::sleep(Duration::from_secs(
                SLEEP_GRANULARITY_SECS.min(config.interval_secs),
            ));
        }

        // Single-flight: skip the tick if a pass is somehow still marked
        // as running.
        if running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Reconciliation pass still in flight; skipping tick");
            continue;
        }

        let result = open_database(&config.store_path)
            .map_err(crate::sync::SyncError::from)
            .and_then(|conn| runtime.block_on(reconcile(&conn, backend, schemas)));
        running.store(false, Ordering::SeqCst);

        match result {
            Ok(report) if report.faults_found > 0 => {
                tracing::warn!(
                    faults = report.faults_found,
                    reprojected = report.documents_reprojected,
                    "Reconciliation healed consistency faults"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation pass failed");
            }
        }
    }
    tracing::info!("Reconciliation job shutting down");
}
