//! Single-owner registry worker and its request/response handle
//!
//! One task owns the [`DeviceRegistry`]. Scheduled activities and callers talk
//! to it through an mpsc command channel with oneshot replies, so every
//! registry operation runs to completion before the next one starts.
//! PositionUpdates fan out on a bounded broadcast channel; a lagging
//! subscriber loses updates instead of stalling the worker.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::algorithms::ZoneIndex;
use crate::api::scheduler;
use crate::api::types::CycleReport;
use crate::core::{DeviceId, PositionSample, PositionUpdate, RawDetection, SignalReading, ZoneId};
use crate::processing::DetectionBatch;
use crate::registry::{AnonymizedExport, DeviceRegistry, DeviceSnapshot, RegistryStatistics};
use crate::utils::clock::Clock;
use crate::utils::config::{EngineConfig, FacilityLayout};
use crate::validation::error::{ConfigError, EngineError, EngineResult, RegistryError};

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    Ingest {
        batches: Vec<DetectionBatch>,
        now: DateTime<Utc>,
    },
    ComputePending {
        now: DateTime<Utc>,
        reply: Reply<CycleReport>,
    },
    Expire {
        now: DateTime<Utc>,
        timeout: Duration,
        reply: Reply<Vec<DeviceId>>,
    },
    ActiveDevices {
        now: DateTime<Utc>,
        window: Duration,
        reply: Reply<Vec<DeviceSnapshot>>,
    },
    ZoneOccupancy {
        reply: Reply<std::collections::BTreeMap<ZoneId, usize>>,
    },
    DevicesInZone {
        zone: ZoneId,
        now: DateTime<Utc>,
        window: Duration,
        reply: Reply<Vec<DeviceId>>,
    },
    Trajectory {
        device_id: DeviceId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        reply: Reply<Result<Vec<PositionSample>, RegistryError>>,
    },
    Device {
        device_id: DeviceId,
        reply: Reply<Option<DeviceSnapshot>>,
    },
    Statistics {
        now: DateTime<Utc>,
        window: Duration,
        reply: Reply<RegistryStatistics>,
    },
    Export {
        now: DateTime<Utc>,
        reply: Reply<AnonymizedExport>,
    },
    /// Stop accepting commands; those already queued still run
    Shutdown,
}

/// Owns the registry and the batches waiting for the next compute cycle
struct RegistryWorker {
    registry: DeviceRegistry,
    /// Registered batches per device, oldest first
    pending: HashMap<DeviceId, Vec<Vec<SignalReading>>>,
    updates: broadcast::Sender<PositionUpdate>,
}

impl RegistryWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(zones = self.registry.zones().zones().len(), "registry worker started");

        while let Some(command) = commands.recv().await {
            if let Command::Shutdown = command {
                debug!("registry worker draining queued commands");
                commands.close();
                continue;
            }
            self.handle(command);
        }

        info!(tracked = self.registry.len(), "registry worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Ingest { batches, now } => self.ingest(batches, now),
            Command::ComputePending { now, reply } => {
                let _ = reply.send(self.compute_pending(now));
            }
            Command::Expire { now, timeout, reply } => {
                let expired = self.registry.expire_stale(now, timeout);
                for id in &expired {
                    self.pending.remove(id);
                }
                let _ = reply.send(expired);
            }
            Command::ActiveDevices { now, window, reply } => {
                let _ = reply.send(self.registry.active_devices(now, window));
            }
            Command::ZoneOccupancy { reply } => {
                let _ = reply.send(self.registry.zone_occupancy());
            }
            Command::DevicesInZone { zone, now, window, reply } => {
                let _ = reply.send(self.registry.devices_in_zone(&zone, now, window));
            }
            Command::Trajectory { device_id, start, end, reply } => {
                let _ = reply.send(self.registry.trajectory(&device_id, start, end));
            }
            Command::Device { device_id, reply } => {
                let _ = reply.send(self.registry.device(&device_id));
            }
            Command::Statistics { now, window, reply } => {
                let _ = reply.send(self.registry.statistics(now, window));
            }
            Command::Export { now, reply } => {
                let _ = reply.send(self.registry.export(now));
            }
            Command::Shutdown => {}
        }
    }

    fn ingest(&mut self, batches: Vec<DetectionBatch>, now: DateTime<Utc>) {
        for batch in batches {
            let (device_id, _) = self.registry.register_or_update(
                &batch.raw_address,
                batch.device_name.as_deref(),
                &batch.readings,
                now,
            );
            self.pending.entry(device_id).or_default().push(batch.readings);
        }
    }

    fn compute_pending(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        let mut pending: Vec<(DeviceId, Vec<Vec<SignalReading>>)> = self.pending.drain().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        for (device_id, batches) in pending {
            for readings in batches {
                // Observation time of the batch, never ahead of the clock
                let at = readings
                    .iter()
                    .map(|r| r.timestamp)
                    .max()
                    .map_or(now, |t| t.min(now));

                match self.registry.compute_position(&device_id, &readings, at) {
                    Ok(Some(sample)) => {
                        report.computed += 1;
                        // No subscribers is not an error
                        let _ = self.updates.send(PositionUpdate::from_sample(device_id.clone(), &sample));
                    }
                    Ok(None) => report.skipped += 1,
                    Err(err) => {
                        debug!(error = %err, "pending batch dropped");
                        report.skipped += 1;
                    }
                }
            }
        }

        if report.computed + report.skipped > 0 {
            debug!(computed = report.computed, skipped = report.skipped, "compute cycle finished");
        }
        report
    }
}

/// Cloneable request/response access to the registry worker
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::WorkerUnavailable)?;
        response.await.map_err(|_| EngineError::WorkerUnavailable)
    }

    pub(crate) async fn ingest(&self, batches: Vec<DetectionBatch>) -> EngineResult<()> {
        if batches.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        self.commands
            .send(Command::Ingest { batches, now })
            .await
            .map_err(|_| EngineError::WorkerUnavailable)
    }

    /// Run one compute cycle over every registered batch
    pub async fn compute_pending(&self) -> EngineResult<CycleReport> {
        let now = self.clock.now();
        self.request(|reply| Command::ComputePending { now, reply }).await
    }

    /// Expiry sweep with the configured timeout
    pub async fn expire_stale(&self) -> EngineResult<Vec<DeviceId>> {
        let now = self.clock.now();
        let timeout = self.config.registry.expiry_timeout();
        self.request(|reply| Command::Expire { now, timeout, reply }).await
    }

    pub async fn active_devices(&self, window: Duration) -> EngineResult<Vec<DeviceSnapshot>> {
        let now = self.clock.now();
        self.request(|reply| Command::ActiveDevices { now, window, reply }).await
    }

    pub async fn zone_occupancy(&self) -> EngineResult<std::collections::BTreeMap<ZoneId, usize>> {
        self.request(|reply| Command::ZoneOccupancy { reply }).await
    }

    pub async fn devices_in_zone(&self, zone: ZoneId, window: Duration) -> EngineResult<Vec<DeviceId>> {
        let now = self.clock.now();
        self.request(|reply| Command::DevicesInZone { zone, now, window, reply }).await
    }

    pub async fn trajectory(
        &self,
        device_id: DeviceId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<PositionSample>> {
        Ok(self
            .request(|reply| Command::Trajectory { device_id, start, end, reply })
            .await??)
    }

    pub async fn device(&self, device_id: DeviceId) -> EngineResult<Option<DeviceSnapshot>> {
        self.request(|reply| Command::Device { device_id, reply }).await
    }

    /// Statistics over the configured active window
    pub async fn statistics(&self) -> EngineResult<RegistryStatistics> {
        let now = self.clock.now();
        let window = self.config.registry.active_window();
        self.request(|reply| Command::Statistics { now, window, reply }).await
    }

    pub async fn export(&self) -> EngineResult<AnonymizedExport> {
        let now = self.clock.now();
        self.request(|reply| Command::Export { now, reply }).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Running positioning engine: registry worker plus scheduled activities
pub struct Engine {
    handle: EngineHandle,
    feed: mpsc::Sender<RawDetection>,
    updates: broadcast::Sender<PositionUpdate>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    worker: JoinHandle<()>,
}

impl Engine {
    /// Validate configuration and geometry, then spawn the worker and the
    /// intake, compute and expiry tasks on the current tokio runtime
    pub fn start(
        config: EngineConfig,
        layout: &FacilityLayout,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let zones = Arc::new(ZoneIndex::from_layout(layout)?);
        let registry = DeviceRegistry::new(&config, zones)?;
        let config = Arc::new(config);
        let schedule = config.schedule.clone();

        let (command_tx, command_rx) = mpsc::channel(schedule.command_channel_capacity);
        let (feed_tx, feed_rx) = mpsc::channel(schedule.feed_channel_capacity);
        let (updates, _) = broadcast::channel(schedule.update_channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = RegistryWorker {
            registry,
            pending: HashMap::new(),
            updates: updates.clone(),
        };
        let worker = tokio::spawn(worker.run(command_rx));

        let handle = EngineHandle {
            commands: command_tx,
            clock: Arc::clone(&clock),
            config: Arc::clone(&config),
        };

        let tasks = vec![
            tokio::spawn(scheduler::run_intake(
                handle.clone(),
                feed_rx,
                clock,
                schedule.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(scheduler::run_compute(handle.clone(), schedule.clone(), shutdown_rx.clone())),
            tokio::spawn(scheduler::run_expiry(handle.clone(), schedule, shutdown_rx)),
        ];

        info!(
            receivers = layout.receivers.len(),
            zones = layout.zones.len(),
            "positioning engine started"
        );

        Ok(Self {
            handle,
            feed: feed_tx,
            updates,
            shutdown_tx,
            tasks,
            worker,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Sender for the raw detection feed
    pub fn feed(&self) -> mpsc::Sender<RawDetection> {
        self.feed.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionUpdate> {
        self.updates.subscribe()
    }

    /// Cooperative shutdown
    ///
    /// The scheduled tasks stop, detections already fed are batched, registered
    /// and computed, and the worker finishes every queued command before the
    /// registry is dropped. Returns the final anonymized export.
    pub async fn shutdown(self) -> EngineResult<AnonymizedExport> {
        let Engine {
            handle,
            feed,
            updates,
            shutdown_tx,
            tasks,
            worker,
        } = self;
        drop(feed);

        let _ = shutdown_tx.send(true);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "scheduled task ended abnormally");
            }
        }

        let export = handle.export().await;
        let _ = handle.commands.send(Command::Shutdown).await;
        drop(handle);
        drop(updates);

        if let Err(err) = worker.await {
            warn!(error = %err, "registry worker ended abnormally");
            return Err(EngineError::WorkerUnavailable);
        }

        info!("positioning engine stopped");
        export
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use crate::utils::config::{FacilityDimensions, ReceiverConfig, ZoneConfig};
    use chrono::TimeZone;

    fn layout() -> FacilityLayout {
        FacilityLayout {
            facility: FacilityDimensions { width: 20.0, height: 15.0 },
            receivers: vec![
                ReceiverConfig { id: "r1".into(), position: [0.0, 0.0] },
                ReceiverConfig { id: "r2".into(), position: [20.0, 0.0] },
                ReceiverConfig { id: "r3".into(), position: [10.0, 15.0] },
            ],
            zones: vec![ZoneConfig {
                id: "floor".into(),
                name: None,
                polygon: vec![[0.0, 0.0], [20.0, 0.0], [20.0, 15.0], [0.0, 15.0]],
            }],
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_flushes_fed_detections() {
        let clock = ManualClock::new(t0());
        let engine = Engine::start(EngineConfig::default(), &layout(), Arc::new(clock.clone())).unwrap();
        let mut updates = engine.subscribe();

        let feed = engine.feed();
        for (receiver, dbm) in [("r1", -62.0), ("r2", -75.0), ("r3", -72.0)] {
            feed.send(RawDetection::new("AA:BB:CC:DD:EE:FF", receiver, dbm, t0()))
                .await
                .unwrap();
        }
        drop(feed);

        let export = engine.shutdown().await.unwrap();
        assert_eq!(export.devices.len(), 1);

        let update = updates.recv().await.unwrap();
        assert_eq!(update.device_id, export.devices[0].device_id);
        assert_eq!(update.zone_id, ZoneId::new("floor"));
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let clock = ManualClock::new(t0());
        let engine = Engine::start(EngineConfig::default(), &layout(), Arc::new(clock)).unwrap();
        let handle = engine.handle();
        assert!(handle.zone_occupancy().await.is_ok());

        engine.shutdown().await.unwrap();
        assert!(matches!(handle.statistics().await, Err(EngineError::WorkerUnavailable)));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_geometry() {
        let mut bad = layout();
        bad.receivers.push(ReceiverConfig { id: "r1".into(), position: [1.0, 1.0] });
        let result = Engine::start(EngineConfig::default(), &bad, Arc::new(ManualClock::new(t0())));
        assert!(matches!(result, Err(ConfigError::DuplicateReceiver(_))));
    }
}
