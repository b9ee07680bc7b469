use beacon_positioning::core::{DeviceType, PositionUpdate, RawDetection, ZoneId};
use beacon_positioning::utils::config::{FacilityDimensions, ReceiverConfig, ZoneConfig};
use beacon_positioning::{Clock, Engine, EngineConfig, FacilityLayout, ManualClock};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

fn layout() -> FacilityLayout {
    FacilityLayout {
        facility: FacilityDimensions { width: 20.0, height: 15.0 },
        receivers: vec![
            ReceiverConfig { id: "r1".into(), position: [0.0, 0.0] },
            ReceiverConfig { id: "r2".into(), position: [20.0, 0.0] },
            ReceiverConfig { id: "r3".into(), position: [10.0, 15.0] },
        ],
        zones: vec![
            ZoneConfig {
                id: "west".into(),
                name: Some("West wing".into()),
                polygon: vec![[0.0, 0.0], [10.0, 0.0], [10.0, 15.0], [0.0, 15.0]],
            },
            ZoneConfig {
                id: "east".into(),
                name: None,
                polygon: vec![[10.0, 0.0], [20.0, 0.0], [20.0, 15.0], [10.0, 15.0]],
            },
        ],
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.schedule.intake_interval_ms = 10;
    config.schedule.compute_interval_ms = 20;
    config.schedule.detection_window_ms = 100;
    // Sweeps only run when a test asks for one
    config.schedule.expiry_interval_ms = 3_600_000;
    config
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
}

async fn feed_cycle(engine: &Engine, address: &str, at: DateTime<Utc>) {
    let feed = engine.feed();
    for (receiver, dbm) in [("r1", -62.0), ("r2", -75.0), ("r3", -72.0)] {
        feed.send(RawDetection::new(address, receiver, dbm, at)).await.unwrap();
    }
}

async fn next_update(updates: &mut broadcast::Receiver<PositionUpdate>) -> PositionUpdate {
    tokio::time::timeout(std::time::Duration::from_secs(5), updates.recv())
        .await
        .expect("timed out waiting for a position update")
        .expect("update stream closed")
}

#[tokio::test]
async fn test_detections_flow_to_classified_updates() {
    let clock = ManualClock::new(t0());
    let engine = Engine::start(fast_config(), &layout(), Arc::new(clock.clone())).unwrap();
    let mut updates = engine.subscribe();

    feed_cycle(&engine, ADDRESS, t0()).await;
    engine
        .feed()
        .send(RawDetection::new(ADDRESS, "r1", -62.0, t0()).with_device_name("Galaxy Tab S9"))
        .await
        .unwrap();
    clock.advance(Duration::milliseconds(200));

    let update = next_update(&mut updates).await;
    assert_eq!(update.zone_id, ZoneId::new("west"));
    assert!(update.x >= 0.0 && update.x <= 20.0);
    assert!(update.y >= 0.0 && update.y <= 15.0);
    assert_eq!(update.timestamp, t0());

    let handle = engine.handle();
    let occupancy = handle.zone_occupancy().await.unwrap();
    assert_eq!(occupancy.get(&ZoneId::new("west")), Some(&1));
    assert_eq!(occupancy.get(&ZoneId::new("east")), Some(&0));

    let in_west = handle.devices_in_zone(ZoneId::new("west"), Duration::minutes(5)).await.unwrap();
    assert_eq!(in_west, vec![update.device_id.clone()]);

    let trajectory = handle.trajectory(update.device_id.clone(), None, None).await.unwrap();
    assert_eq!(trajectory.len(), 1);

    let stats = handle.statistics().await.unwrap();
    assert_eq!(stats.tracked_devices, 1);
    assert_eq!(stats.active_devices, 1);
    assert_eq!(stats.device_types.get(&DeviceType::Tablet), Some(&1));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_updates_for_one_device_are_time_ordered() {
    let clock = ManualClock::new(t0());
    let engine = Engine::start(fast_config(), &layout(), Arc::new(clock.clone())).unwrap();
    let mut updates = engine.subscribe();

    let mut seen = Vec::new();
    for cycle in 0..3 {
        let at = t0() + Duration::seconds(cycle * 2);
        clock.set(at);
        feed_cycle(&engine, ADDRESS, at).await;
        clock.set(at + Duration::milliseconds(200));
        seen.push(next_update(&mut updates).await);
    }

    assert!(seen.windows(2).all(|w| w[0].device_id == w[1].device_id));
    assert!(seen.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let snapshot = engine.handle().device(seen[0].device_id.clone()).await.unwrap().unwrap();
    assert_eq!(snapshot.samples, 3);
    assert_eq!(snapshot.total_detections, 9);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expiry_and_salt_rotation() {
    let clock = ManualClock::new(t0());
    let engine = Engine::start(fast_config(), &layout(), Arc::new(clock.clone())).unwrap();
    let handle = engine.handle();
    let mut updates = engine.subscribe();

    feed_cycle(&engine, ADDRESS, t0()).await;
    clock.advance(Duration::milliseconds(200));
    let first = next_update(&mut updates).await;

    clock.set(t0() + Duration::days(1));
    let expired = handle.expire_stale().await.unwrap();
    assert_eq!(expired, vec![first.device_id.clone()]);
    assert!(handle.active_devices(Duration::days(2)).await.unwrap().is_empty());

    let next_day = clock.now();
    feed_cycle(&engine, ADDRESS, next_day).await;
    clock.advance(Duration::milliseconds(200));
    let second = next_update(&mut updates).await;

    assert_ne!(second.device_id, first.device_id);
    let snapshot = handle.device(second.device_id.clone()).await.unwrap().unwrap();
    assert_eq!(snapshot.samples, 1);
    assert!(handle.device(first.device_id).await.unwrap().is_none());

    let export = engine.shutdown().await.unwrap();
    assert_eq!(export.devices.len(), 1);
    assert!(!serde_json::to_string(&export).unwrap().contains(ADDRESS));
}
