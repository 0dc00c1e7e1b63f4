use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, RunReport};

/// Performs a single run, for use under an external scheduler.
pub async fn run_once(orchestrator: &Orchestrator) -> RunReport {
    info!("starting tracking run");
    orchestrator.run().await
}

/// Runs immediately, then on every tick of `cron_schedule` until Ctrl-C.
pub async fn create_and_run_scheduler(
    cron_schedule: &str,
    orchestrator: Arc<Orchestrator>,
) -> Result<()> {
    let mut scheduler = JobScheduler::new().await?;
    let in_progress = Arc::new(Mutex::new(()));

    let job_orchestrator = orchestrator.clone();
    let job_guard = in_progress.clone();
    let job = Job::new_async(cron_schedule, move |_uuid, _l| {
        let orchestrator = job_orchestrator.clone();
        let guard = job_guard.clone();
        Box::pin(async move {
            run_exclusive(&orchestrator, &guard).await;
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    info!(schedule = cron_schedule, "scheduler started");

    run_exclusive(&orchestrator, &in_progress).await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.shutdown().await?;

    // Let an in-flight run finish before the ledger is closed.
    let _idle = in_progress.lock().await;
    Ok(())
}

/// Runs unless another run holds `in_progress`; returns `None` when skipped.
pub async fn run_exclusive(orchestrator: &Orchestrator, in_progress: &Mutex<()>) -> Option<RunReport> {
    let Ok(_running) = in_progress.try_lock() else {
        warn!("previous run still in progress, skipping tick");
        return None;
    };
    Some(run_once(orchestrator).await)
}
