use fleetctl::api::{
    Call, DeviceControl, DeviceQuery, DeviceUpdate, NewDevice, Op, SimulatedDeviceControl,
};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_unknown_device_is_a_remote_error() {
    let (control, _simulator) = SimulatedDeviceControl::new();

    let err = control.start_mirroring("ghost").await.unwrap_err();

    assert_eq!(err.server_message(), Some("device ghost not found"));
}

#[tokio::test]
async fn test_crud_keeps_group_counts_in_sync() {
    let (control, simulator) = SimulatedDeviceControl::new();
    simulator.seed_demo_fleet();

    control
        .create_device(&NewDevice {
            name: "Spare".into(),
            group_id: Some("field".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(simulator.group("field").unwrap().device_count, 4);

    control
        .update_device("dev-01", &DeviceUpdate::assign_group("lab"))
        .await
        .unwrap();
    let device = simulator.device("dev-01").unwrap();
    assert_eq!(device.group_name.as_deref(), Some("Lab"));
    assert!(device.updated_at.is_some());
    assert_eq!(simulator.group("lab").unwrap().device_count, 4);
    assert_eq!(simulator.group("field").unwrap().device_count, 3);

    control.delete_device("dev-02").await.unwrap();
    assert_eq!(simulator.group("lab").unwrap().device_count, 3);
    assert_eq!(simulator.device_count(), 6);
}

#[tokio::test]
async fn test_assigning_unknown_group_fails() {
    let (control, simulator) = SimulatedDeviceControl::new();
    simulator.seed_demo_fleet();

    let err = control
        .update_device("dev-01", &DeviceUpdate::assign_group("nowhere"))
        .await
        .unwrap_err();

    assert_eq!(err.server_message(), Some("group nowhere not found"));
    assert_eq!(
        simulator.device("dev-01").unwrap().group_id.as_deref(),
        Some("field")
    );
}

#[tokio::test]
async fn test_calls_are_recorded_in_order() {
    let (control, simulator) = SimulatedDeviceControl::new();
    simulator.add_device("d1", "One");

    control.start_mirroring("d1").await.unwrap();
    control.list_groups().await.unwrap();
    control.stop_mirroring("d1").await.unwrap();

    assert_eq!(
        simulator.calls(),
        vec![
            Call {
                op: Op::StartMirroring,
                target: "d1".into()
            },
            Call {
                op: Op::ListGroups,
                target: String::new()
            },
            Call {
                op: Op::StopMirroring,
                target: "d1".into()
            },
        ]
    );
}

#[tokio::test]
async fn test_latency_applies_to_every_call() {
    let (control, simulator) = SimulatedDeviceControl::new();
    simulator.seed_demo_fleet();
    let control = control.with_latency(Duration::from_millis(20));

    let started = Instant::now();
    let page = control
        .search_devices(&DeviceQuery::first_page(10))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(page.records.len(), 6);
}

#[tokio::test]
async fn test_cleared_failures_stop_applying() {
    let (control, simulator) = SimulatedDeviceControl::new();
    simulator.add_device("d1", "One");
    simulator.fail_unavailable(Op::StopMirroring, "d1");

    assert!(control.stop_mirroring("d1").await.is_err());
    simulator.clear_failures();
    assert!(control.stop_mirroring("d1").await.is_ok());
}

#[tokio::test]
async fn test_page_far_past_the_end_is_empty() {
    let (control, simulator) = SimulatedDeviceControl::new();
    simulator.seed_demo_fleet();
    let mut query = DeviceQuery::first_page(100_000);
    query.page = 100_000;

    let page = control.search_devices(&query).await.unwrap();

    assert!(page.records.is_empty());
    assert_eq!(page.total, 6);
    assert_eq!(page.page, 100_000);
}
