use fleetctl::api::{Device, Op, SimulatedDeviceControl, Simulator};
use fleetctl::core::{MirrorOrchestrator, MirrorRecord, MirrorStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn setup(ids: &[&str]) -> (MirrorOrchestrator, Simulator, Vec<Device>) {
    let (control, simulator) = SimulatedDeviceControl::new();
    let devices = ids
        .iter()
        .map(|id| {
            simulator.add_device(id, &format!("Device {id}"));
            Device::new(*id, format!("Device {id}"))
        })
        .collect();
    (MirrorOrchestrator::new(Arc::new(control)), simulator, devices)
}

fn record<'a>(records: &'a [MirrorRecord], id: &str) -> &'a MirrorRecord {
    records
        .iter()
        .find(|r| r.device_id == id)
        .unwrap_or_else(|| panic!("no record for {id}"))
}

/// Poll until `check` holds for the current records.
async fn wait_until(mirror: &MirrorOrchestrator, check: impl Fn(&[MirrorRecord]) -> bool) {
    timeout(Duration::from_secs(1), async {
        loop {
            if check(mirror.records().await.as_slice()) {
                return;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("timeout waiting for records");
}

#[tokio::test]
async fn test_missing_id_fails_without_a_call() {
    let (mirror, simulator, mut devices) = setup(&["d1"]);
    devices.push(Device::new("", "Nameless"));

    mirror.start(&devices).await;

    let records = mirror.records().await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].status, MirrorStatus::Error);
    assert_eq!(records[1].error.as_deref(), Some("missing device id"));
    assert_eq!(simulator.calls_for(Op::StartMirroring), vec!["d1"]);
}

#[tokio::test]
async fn test_start_partial_failure_and_busy_flag() {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    simulator.set_address("d1", Some("host:1234"));
    simulator.fail(Op::StartMirroring, "d2", 500, Some("encoder busy"));
    let gate = simulator.hold(Op::StartMirroring, "d2");

    let task = tokio::spawn({
        let mirror = mirror.clone();
        async move { mirror.start(&devices).await }
    });

    gate.arrived().await;
    wait_until(&mirror, |records| {
        records
            .iter()
            .any(|r| r.device_id == "d1" && r.status == MirrorStatus::Playing)
    })
    .await;
    assert!(mirror.is_busy());

    gate.release();
    timeout(Duration::from_secs(1), task)
        .await
        .expect("timeout")
        .expect("start task panicked");
    assert!(!mirror.is_busy());

    let records = mirror.records().await;
    let d1 = record(&records, "d1");
    assert_eq!(d1.payload.as_deref(), Some("http://host:1234"));
    let d2 = record(&records, "d2");
    assert_eq!(d2.status, MirrorStatus::Error);
    assert_eq!(d2.error.as_deref(), Some("encoder busy"));
    assert!(!d2.is_loading);
}

#[tokio::test]
async fn test_success_without_address_is_an_error() {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    simulator.set_address("d1", None);
    simulator.set_address("d2", Some("https://cdn.example/live/d2.flv"));

    mirror.start(&devices).await;

    let records = mirror.records().await;
    assert_eq!(record(&records, "d1").error.as_deref(), Some("mirroring failed"));
    assert_eq!(
        record(&records, "d2").payload.as_deref(),
        Some("https://cdn.example/live/d2.flv")
    );
}

#[tokio::test]
async fn test_pause_touches_only_playing_records() {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    simulator.fail_unavailable(Op::StartMirroring, "d2");
    mirror.start(&devices).await;

    let paused = mirror.pause_all(None).await;

    assert_eq!(paused, 1);
    assert_eq!(simulator.calls_for(Op::StopMirroring), vec!["d1"]);
    let records = mirror.records().await;
    let d1 = record(&records, "d1");
    assert_eq!(d1.status, MirrorStatus::Paused);
    assert!(d1.payload.is_none());
    assert_eq!(record(&records, "d2").error.as_deref(), Some("mirroring failed"));
}

#[tokio::test]
async fn test_resume_gets_a_fresh_address() {
    let (mirror, _simulator, devices) = setup(&["d1", "d2"]);
    mirror.start(&devices).await;
    let before = record(&mirror.records().await, "d1").payload.clone();

    mirror.pause_all(None).await;
    let resumed = mirror.resume_all(Some(&["d1".to_string()])).await;

    assert_eq!(resumed, 1);
    let records = mirror.records().await;
    let d1 = record(&records, "d1");
    assert_eq!(d1.status, MirrorStatus::Playing);
    assert_ne!(d1.payload, before);
    assert_eq!(record(&records, "d2").status, MirrorStatus::Paused);
}

#[tokio::test]
async fn test_stop_with_one_failure_removes_nothing() {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    mirror.start(&devices).await;
    mirror.pause_all(Some(&["d2".to_string()])).await;
    simulator.fail(Op::StopMirroring, "d2", 500, Some("device offline"));

    let outcome = mirror.stop_all(None).await;

    assert_eq!(outcome.removed, 0);
    assert_eq!(outcome.failed, vec!["d2"]);
    let records = mirror.records().await;
    assert_eq!(records.len(), 2);
    let d1 = record(&records, "d1");
    assert_eq!(d1.status, MirrorStatus::Playing);
    assert!(!d1.is_loading);
    let d2 = record(&records, "d2");
    assert_eq!(d2.status, MirrorStatus::Error);
    assert_eq!(d2.error.as_deref(), Some("device offline"));
}

#[tokio::test]
async fn test_stop_success_removes_records_including_orphans() {
    let (mirror, simulator, mut devices) = setup(&["d1", "d2"]);
    devices.push(Device::new("", "Orphan"));
    mirror.start(&devices).await;

    let outcome = mirror.stop_all(None).await;

    assert_eq!(outcome.removed, 3);
    assert!(outcome.failed.is_empty());
    assert!(mirror.records().await.is_empty());
    assert!(!simulator.is_mirroring("d1"));
    assert!(!mirror.summary().await.can_stop());
}

/// Start `d1` and `d2` with pinned addresses, letting the start calls
/// resolve in the order given.
async fn start_resolving_in(order: [&str; 2]) -> Vec<MirrorRecord> {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    simulator.set_address("d1", Some("10.0.0.1:5555"));
    simulator.set_address("d2", Some("10.0.0.2:5555"));
    let first = simulator.hold(Op::StartMirroring, order[0]);
    let second = simulator.hold(Op::StartMirroring, order[1]);

    let task = tokio::spawn({
        let mirror = mirror.clone();
        async move { mirror.start(&devices).await }
    });

    first.arrived().await;
    second.arrived().await;
    first.release();
    wait_until(&mirror, |records| {
        records
            .iter()
            .any(|r| r.device_id == order[0] && r.status == MirrorStatus::Playing)
    })
    .await;
    second.release();
    timeout(Duration::from_secs(1), task)
        .await
        .expect("timeout")
        .expect("start task panicked");

    assert!(!mirror.is_busy());
    mirror.records().await
}

#[tokio::test]
async fn test_start_resolution_order_does_not_matter() {
    let forward = start_resolving_in(["d1", "d2"]).await;
    let reversed = start_resolving_in(["d2", "d1"]).await;

    assert_eq!(forward, reversed);
    assert_eq!(
        record(&forward, "d2").payload.as_deref(),
        Some("http://10.0.0.2:5555")
    );
    assert!(forward.iter().all(|r| r.status == MirrorStatus::Playing && !r.is_loading));
}

#[tokio::test]
async fn test_failed_pause_is_an_error_not_playing() {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    mirror.start(&devices).await;
    simulator.fail(Op::StopMirroring, "d1", 500, Some("stuck"));

    let paused = mirror.pause_all(None).await;

    assert_eq!(paused, 2);
    let records = mirror.records().await;
    let d1 = record(&records, "d1");
    assert_eq!(d1.status, MirrorStatus::Error);
    assert_eq!(d1.error.as_deref(), Some("stuck"));
    assert!(d1.payload.is_none());
    assert!(!d1.is_loading);
    assert_eq!(record(&records, "d2").status, MirrorStatus::Paused);

    // Errors are not resumable; only a new batch retries them.
    assert_eq!(mirror.resume_all(None).await, 1);
    assert_eq!(record(&mirror.records().await, "d1").status, MirrorStatus::Error);
}

#[tokio::test]
async fn test_failed_resume_is_an_error() {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    mirror.start(&devices).await;
    mirror.pause_all(None).await;
    simulator.fail(Op::StartMirroring, "d2", 500, Some("nope"));

    let resumed = mirror.resume_all(None).await;

    assert_eq!(resumed, 2);
    let records = mirror.records().await;
    assert_eq!(record(&records, "d1").status, MirrorStatus::Playing);
    let d2 = record(&records, "d2");
    assert_eq!(d2.status, MirrorStatus::Error);
    assert_eq!(d2.error.as_deref(), Some("nope"));
    assert!(d2.payload.is_none());
}

#[tokio::test]
async fn test_pause_leaves_paused_and_errored_records_alone() {
    let (mirror, simulator, devices) = setup(&["d1", "d2", "d3"]);
    simulator.fail_unavailable(Op::StartMirroring, "d3");
    mirror.start(&devices).await;
    mirror.pause_all(Some(&["d2".to_string()])).await;
    let before = mirror.records().await;

    let paused = mirror.pause_all(None).await;

    assert_eq!(paused, 1);
    assert_eq!(simulator.calls_for(Op::StopMirroring), vec!["d2", "d1"]);
    let after = mirror.records().await;
    assert_eq!(record(&after, "d2"), record(&before, "d2"));
    assert_eq!(record(&after, "d3"), record(&before, "d3"));
    assert_eq!(record(&after, "d1").status, MirrorStatus::Paused);
}

#[tokio::test]
async fn test_stale_pause_is_discarded_after_restart() {
    let (mirror, simulator, devices) = setup(&["d1"]);
    mirror.start(&devices).await;
    let gate = simulator.hold(Op::StopMirroring, "d1");

    let pause = tokio::spawn({
        let mirror = mirror.clone();
        async move { mirror.pause_all(None).await }
    });
    gate.arrived().await;

    mirror.start(&devices).await;
    gate.release();
    assert_eq!(pause.await.expect("pause task panicked"), 1);

    let records = mirror.records().await;
    let d1 = record(&records, "d1");
    assert_eq!(d1.status, MirrorStatus::Playing);
    assert!(d1.payload.is_some());
    assert!(!d1.is_loading);
}

#[tokio::test]
async fn test_teardown_stops_everything() {
    let (mirror, simulator, devices) = setup(&["d1", "d2"]);
    mirror.start(&devices).await;
    assert!(simulator.is_mirroring("d2"));

    timeout(Duration::from_secs(1), mirror.teardown())
        .await
        .expect("timeout")
        .expect("teardown task panicked");

    assert!(mirror.records().await.is_empty());
    assert!(!simulator.is_mirroring("d1"));
    assert!(!simulator.is_mirroring("d2"));
}
