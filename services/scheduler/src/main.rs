//! subdist demo
//!
//! Runs an in-process cluster: seeds work items and workers, keeps adding
//! both on a timer, and lets the master rebalance as the topology grows.
//! Every change of the assignment table is logged. Ctrl+C stops all workers.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use subdist_scheduler::{Config, IdleHandler, ItemId, Scheduler, SchedulerResult, WorkerId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        initial_items = config.initial_items,
        initial_workers = config.initial_workers,
        max_workers = config.max_workers,
        rebalance_interval_ms = config.rebalance_interval.as_millis() as u64,
        reconcile_interval_ms = config.reconcile_interval.as_millis() as u64,
        "Starting subdist demo"
    );

    let scheduler = Scheduler::in_memory(Arc::new(IdleHandler), config.scheduler_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut next_item = 1;
    while next_item <= config.initial_items {
        scheduler.register_work_item(item_id(next_item)?).await?;
        next_item += 1;
    }

    let mut workers = JoinSet::new();
    let mut next_worker = WorkerId::new(1);
    while next_worker.value() <= config.initial_workers {
        spawn_worker(&mut workers, &scheduler, next_worker, &shutdown_rx);
        next_worker = next_worker.next();
    }

    let mut item_growth = config.item_growth_interval.map(growth_timer);
    let mut worker_growth = config.worker_growth_interval.map(growth_timer);

    // Wait for shutdown signal, growing the cluster meanwhile
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received shutdown signal");
                break;
            }
            _ = tick(&mut item_growth) => {
                scheduler.register_work_item(item_id(next_item)?).await?;
                info!(item = next_item, "Added work item");
                next_item += 1;
            }
            _ = tick(&mut worker_growth) => {
                if next_worker.value() > config.max_workers {
                    info!(max_workers = config.max_workers, "Worker limit reached, no more growth");
                    worker_growth = None;
                    continue;
                }
                spawn_worker(&mut workers, &scheduler, next_worker, &shutdown_rx);
                info!(worker_id = %next_worker, "Added worker");
                next_worker = next_worker.next();
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let grace = config.stop_timeout + Duration::from_secs(1);
    let drained = tokio::time::timeout(grace, async {
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Worker exited with error"),
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Workers did not stop in time, aborting");
        workers.abort_all();
    }

    info!("subdist demo shutdown complete");
    Ok(())
}

fn item_id(n: u32) -> Result<ItemId> {
    Ok(ItemId::new(format!("{n:03}"))?)
}

fn spawn_worker(
    workers: &mut JoinSet<SchedulerResult<()>>,
    scheduler: &Scheduler,
    worker: WorkerId,
    shutdown: &watch::Receiver<bool>,
) {
    let scheduler = scheduler.clone();
    let shutdown = shutdown.clone();
    workers.spawn(async move { scheduler.start_worker(worker, shutdown).await });
}

fn growth_timer(period: Duration) -> Interval {
    interval_at(Instant::now() + period, period)
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}
