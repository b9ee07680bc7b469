//! Periodic intake, compute and expiry activities
//!
//! Each activity is its own task with its own interval. None of them touches
//! the registry directly; they only send commands through the
//! [`EngineHandle`]. All of them stop when the shutdown watch flips to `true`.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::engine::EngineHandle;
use crate::core::RawDetection;
use crate::processing::DetectionBatcher;
use crate::utils::clock::Clock;
use crate::utils::config::ScheduleConfig;

/// Batch the detection feed and hand closed batches to the registry
///
/// On shutdown every detection already in the feed is batched, registered
/// and computed before the task returns.
pub(crate) async fn run_intake(
    handle: EngineHandle,
    mut feed: mpsc::Receiver<RawDetection>,
    clock: Arc<dyn Clock>,
    schedule: ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batcher = DetectionBatcher::new(schedule.detection_window());
    let mut ticker = interval(schedule.intake_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut feed_open = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            detection = feed.recv(), if feed_open => match detection {
                Some(detection) => batcher.push(detection),
                None => {
                    debug!("detection feed closed");
                    feed_open = false;
                }
            },
            _ = ticker.tick() => {
                let batches = batcher.flush(clock.now());
                if let Err(err) = handle.ingest(batches).await {
                    warn!(error = %err, "intake stopped");
                    return;
                }
            }
        }
    }

    while let Ok(detection) = feed.try_recv() {
        batcher.push(detection);
    }
    let batches = batcher.drain();
    let remaining = batches.len();
    let result = match handle.ingest(batches).await {
        Ok(()) => handle.compute_pending().await.map(|_| ()),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => info!(batches = remaining, "intake drained"),
        Err(err) => warn!(error = %err, "could not drain intake"),
    }
}

pub(crate) async fn run_compute(
    handle: EngineHandle,
    schedule: ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(schedule.compute_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = handle.compute_pending().await {
                    warn!(error = %err, "compute stopped");
                    break;
                }
            }
        }
    }
}

pub(crate) async fn run_expiry(
    handle: EngineHandle,
    schedule: ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(schedule.expiry_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = handle.expire_stale().await {
                    warn!(error = %err, "expiry stopped");
                    break;
                }
            }
        }
    }
}
