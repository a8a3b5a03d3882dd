//! In-memory device fleet.
//!
//! `SimulatedDeviceControl` implements [`DeviceControl`] without a network.
//! The paired [`Simulator`] handle seeds devices and injects failures. It can
//! also hold individual calls behind a [`Gate`], so callers can decide the
//! order in which concurrent calls resolve.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, oneshot};
use uuid::Uuid;

use super::models::{
    Device, DeviceQuery, DeviceUpdate, Group, GroupUpdate, NewDevice, NewGroup, PackageInfo, Page,
    ShellEntry, ShellOutput, ShellRequest, ShellResults,
};
use super::{ApiError, DeviceControl};

/// Remote operations the simulator can record, fail or hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    StartMirroring,
    StopMirroring,
    BatchShell,
    InstallPackage,
    UninstallPackage,
    ListPackages,
    SearchDevices,
    CreateDevice,
    UpdateDevice,
    DeleteDevice,
    ListGroups,
    CreateGroup,
    UpdateGroup,
    DeleteGroup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    /// Device or group id; the joined device ids for batch shell.
    pub target: String,
}

#[derive(Debug, Clone)]
enum Failure {
    Remote { code: i64, message: Option<String> },
    Unavailable,
}

impl Failure {
    fn to_error(&self) -> ApiError {
        match self {
            Failure::Remote { code, message } => ApiError::Remote {
                code: *code,
                message: message.clone(),
            },
            Failure::Unavailable => ApiError::Status {
                status: 503,
                body: "service unavailable".to_string(),
            },
        }
    }
}

struct PendingHold {
    release: oneshot::Receiver<()>,
    arrived: Arc<Notify>,
}

#[derive(Default)]
struct FleetState {
    devices: Vec<Device>,
    groups: Vec<Group>,
    packages: HashMap<String, Vec<PackageInfo>>,
    mirroring: HashSet<String>,
    addresses: HashMap<String, Option<String>>,
    failures: HashMap<(Op, String), Failure>,
    shell_batch_failure: Option<Failure>,
    shell_override: Option<ShellResults>,
    holds: HashMap<(Op, String), VecDeque<PendingHold>>,
    calls: Vec<Call>,
    next_id: u64,
    next_port: u16,
}

impl FleetState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn group_name(&self, group_id: Option<&str>) -> Option<String> {
        let group_id = group_id?;
        self.groups
            .iter()
            .find(|g| g.id == group_id)
            .map(|g| g.name.clone())
    }

    fn device_mut(&mut self, device_id: &str) -> Result<&mut Device, ApiError> {
        self.devices
            .iter_mut()
            .find(|d| d.id == device_id)
            .ok_or_else(|| not_found("device", device_id))
    }

    fn has_device(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| d.id == device_id)
    }

    fn refresh_group_counts(&mut self) {
        for group in &mut self.groups {
            group.device_count = self
                .devices
                .iter()
                .filter(|d| d.group_id.as_deref() == Some(group.id.as_str()))
                .count() as u32;
        }
    }
}

fn not_found(kind: &str, id: &str) -> ApiError {
    ApiError::Remote {
        code: 404,
        message: Some(format!("{kind} {id} not found")),
    }
}

/// Handle returned by [`Simulator::hold`].
pub struct Gate {
    release: oneshot::Sender<()>,
    arrived: Arc<Notify>,
}

impl Gate {
    /// Wait until the held call has reached the simulator.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    /// Let the held call continue.
    pub fn release(self) {
        let _ = self.release.send(());
    }
}

/// Control handle for a [`SimulatedDeviceControl`].
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<FleetState>>,
}

impl Simulator {
    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_device(&self, id: &str, name: &str) {
        let mut state = self.lock();
        let ip = format!("10.0.0.{}", state.devices.len() + 10);
        state.devices.push(Device {
            id: id.to_string(),
            name: Some(name.to_string()),
            serial: Some(format!("SN{}", id.to_uppercase())),
            ip: Some(ip),
            model: Some("Simulated".to_string()),
            android_version: Some("13".to_string()),
            online: true,
            created_at: Some(Utc::now()),
            ..Default::default()
        });
    }

    pub fn add_group(&self, id: &str, name: &str) {
        let mut state = self.lock();
        state.groups.push(Group {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        });
    }

    pub fn add_package(&self, device_id: &str, package_name: &str) {
        self.lock()
            .packages
            .entry(device_id.to_string())
            .or_default()
            .push(PackageInfo {
                package_name: package_name.to_string(),
                version_name: Some("1.0".to_string()),
                version_code: Some(1),
            });
    }

    /// A small fleet for `--simulation` runs.
    pub fn seed_demo_fleet(&self) {
        self.add_group("lab", "Lab");
        self.add_group("field", "Field");
        for n in 1..=6 {
            let id = format!("dev-{n:02}");
            self.add_device(&id, &format!("Handset {n}"));
            let group = if n % 2 == 0 { "lab" } else { "field" };
            let mut state = self.lock();
            if let Ok(device) = state.device_mut(&id) {
                device.group_id = Some(group.to_string());
            }
            let name = state.group_name(Some(group));
            if let Ok(device) = state.device_mut(&id) {
                device.group_name = name;
            }
            state.refresh_group_counts();
        }
        self.add_package("dev-01", "com.example.kiosk");
    }

    /// Make the start-mirroring call for `device_id` return `address`.
    pub fn set_address(&self, device_id: &str, address: Option<&str>) {
        self.lock()
            .addresses
            .insert(device_id.to_string(), address.map(str::to_string));
    }

    /// Fail every `op` call for `target` with an error envelope.
    pub fn fail(&self, op: Op, target: &str, code: i64, message: Option<&str>) {
        self.lock().failures.insert(
            (op, target.to_string()),
            Failure::Remote {
                code,
                message: message.map(str::to_string),
            },
        );
    }

    /// Fail every `op` call for `target` below the envelope level.
    pub fn fail_unavailable(&self, op: Op, target: &str) {
        self.lock()
            .failures
            .insert((op, target.to_string()), Failure::Unavailable);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.shell_batch_failure = None;
    }

    /// Fail the whole batch shell call with a top-level error code.
    pub fn fail_shell_batch(&self, code: i64, message: Option<&str>) {
        self.lock().shell_batch_failure = Some(Failure::Remote {
            code,
            message: message.map(str::to_string),
        });
    }

    /// Answer batch shell calls with a fixed result map.
    pub fn set_shell_results(&self, results: ShellResults) {
        self.lock().shell_override = Some(results);
    }

    /// Hold the next `op` call for `target` until the gate is released.
    pub fn hold(&self, op: Op, target: &str) -> Gate {
        let (tx, rx) = oneshot::channel();
        let arrived = Arc::new(Notify::new());
        self.lock()
            .holds
            .entry((op, target.to_string()))
            .or_default()
            .push_back(PendingHold {
                release: rx,
                arrived: arrived.clone(),
            });
        Gate {
            release: tx,
            arrived,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, op: Op) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    pub fn is_mirroring(&self, device_id: &str) -> bool {
        self.lock().mirroring.contains(device_id)
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
    }

    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn group(&self, group_id: &str) -> Option<Group> {
        self.lock()
            .groups
            .iter()
            .find(|g| g.id == group_id)
            .cloned()
    }
}

pub struct SimulatedDeviceControl {
    state: Arc<Mutex<FleetState>>,
    latency: Duration,
}

impl SimulatedDeviceControl {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(FleetState {
            next_port: 5555,
            ..Default::default()
        }));
        (
            Self {
                state: state.clone(),
                latency: Duration::ZERO,
            },
            Simulator { state },
        )
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call, then wait for latency and any gate placed on it.
    /// Returns the injected failure for `(op, target)`, if one is set once
    /// the call is let through.
    async fn enter(&self, op: Op, target: &str) -> Result<(), ApiError> {
        let hold = {
            let mut state = self.lock();
            state.calls.push(Call {
                op,
                target: target.to_string(),
            });
            state
                .holds
                .get_mut(&(op, target.to_string()))
                .and_then(VecDeque::pop_front)
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(hold) = hold {
            hold.arrived.notify_one();
            // A dropped gate releases the call as well.
            let _ = hold.release.await;
        }

        match self.lock().failures.get(&(op, target.to_string())) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceControl for SimulatedDeviceControl {
    async fn start_mirroring(&self, device_id: &str) -> Result<Option<String>, ApiError> {
        self.enter(Op::StartMirroring, device_id).await?;

        let mut state = self.lock();
        if !state.has_device(device_id) {
            return Err(not_found("device", device_id));
        }
        state.mirroring.insert(device_id.to_string());

        if let Some(address) = state.addresses.get(device_id) {
            return Ok(address.clone());
        }

        let ip = state
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .and_then(|d| d.ip.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        state.next_port += 1;
        Ok(Some(format!("{ip}:{}", state.next_port)))
    }

    async fn stop_mirroring(&self, device_id: &str) -> Result<(), ApiError> {
        self.enter(Op::StopMirroring, device_id).await?;
        self.lock().mirroring.remove(device_id);
        Ok(())
    }

    async fn batch_shell(&self, request: &ShellRequest) -> Result<ShellResults, ApiError> {
        self.enter(Op::BatchShell, &request.device_ids.join(","))
            .await?;

        let state = self.lock();
        if let Some(failure) = &state.shell_batch_failure {
            return Err(failure.to_error());
        }
        if let Some(results) = &state.shell_override {
            return Ok(results.clone());
        }

        let mut results = ShellResults::new();
        for device_id in &request.device_ids {
            let output = match state.failures.get(&(Op::BatchShell, device_id.clone())) {
                Some(Failure::Remote { code, message }) => ShellOutput {
                    code: *code,
                    result: None,
                    message: message.clone(),
                },
                // Unreachable devices are simply missing from the response.
                Some(Failure::Unavailable) => continue,
                None if !state.has_device(device_id) => continue,
                None => ShellOutput {
                    code: 0,
                    result: Some(format!("{device_id}$ {}\n", request.command)),
                    message: None,
                },
            };

            results.insert(
                Uuid::now_v7().to_string(),
                ShellEntry {
                    device_id: device_id.clone(),
                    result: Some(output),
                },
            );
        }
        Ok(results)
    }

    async fn install_package(&self, device_id: &str, package_url: &str) -> Result<(), ApiError> {
        self.enter(Op::InstallPackage, device_id).await?;

        let mut state = self.lock();
        if !state.has_device(device_id) {
            return Err(not_found("device", device_id));
        }
        let package_name = package_url
            .rsplit('/')
            .next()
            .unwrap_or(package_url)
            .trim_end_matches(".apk")
            .to_string();
        let packages = state.packages.entry(device_id.to_string()).or_default();
        packages.retain(|p| p.package_name != package_name);
        packages.push(PackageInfo {
            package_name,
            version_name: None,
            version_code: None,
        });
        Ok(())
    }

    async fn uninstall_package(
        &self,
        device_id: &str,
        package_name: &str,
    ) -> Result<(), ApiError> {
        self.enter(Op::UninstallPackage, device_id).await?;

        let mut state = self.lock();
        let packages = state.packages.entry(device_id.to_string()).or_default();
        let before = packages.len();
        packages.retain(|p| p.package_name != package_name);
        if packages.len() == before {
            return Err(not_found("package", package_name));
        }
        Ok(())
    }

    async fn list_packages(&self, device_id: &str) -> Result<Vec<PackageInfo>, ApiError> {
        self.enter(Op::ListPackages, device_id).await?;

        let state = self.lock();
        if !state.has_device(device_id) {
            return Err(not_found("device", device_id));
        }
        Ok(state.packages.get(device_id).cloned().unwrap_or_default())
    }

    async fn search_devices(&self, query: &DeviceQuery) -> Result<Page<Device>, ApiError> {
        self.enter(Op::SearchDevices, "").await?;

        let state = self.lock();
        let keyword = query
            .keyword
            .as_deref()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty());

        let matching: Vec<&Device> = state
            .devices
            .iter()
            .filter(|d| match &query.group_id {
                Some(group_id) => d.group_id.as_deref() == Some(group_id.as_str()),
                None => true,
            })
            .filter(|d| match &keyword {
                Some(keyword) => [&d.name, &d.serial, &d.ip]
                    .into_iter()
                    .flatten()
                    .any(|field| field.to_lowercase().contains(keyword)),
                None => true,
            })
            .collect();

        let page = query.page.max(1);
        let page_size = query.page_size.max(1);
        let records = matching
            .iter()
            .skip((page as usize - 1).saturating_mul(page_size as usize))
            .take(page_size as usize)
            .map(|d| (*d).clone())
            .collect();

        Ok(Page {
            records,
            total: matching.len() as u64,
            page,
            page_size,
        })
    }

    async fn create_device(&self, device: &NewDevice) -> Result<(), ApiError> {
        self.enter(Op::CreateDevice, &device.name).await?;

        let mut state = self.lock();
        let id = state.next_id("dev");
        let group_name = state.group_name(device.group_id.as_deref());
        state.devices.push(Device {
            id,
            name: Some(device.name.clone()),
            serial: device.serial.clone(),
            group_id: device.group_id.clone(),
            group_name,
            ip: device.ip.clone(),
            model: device.model.clone(),
            remark: device.remark.clone(),
            created_at: Some(Utc::now()),
            ..Default::default()
        });
        state.refresh_group_counts();
        Ok(())
    }

    async fn update_device(&self, device_id: &str, update: &DeviceUpdate) -> Result<(), ApiError> {
        self.enter(Op::UpdateDevice, device_id).await?;

        let mut state = self.lock();
        let group_name = match &update.group_id {
            Some(group_id) => Some(
                state
                    .group_name(Some(group_id))
                    .ok_or_else(|| not_found("group", group_id))?,
            ),
            None => None,
        };

        let device = state.device_mut(device_id)?;
        if let Some(name) = &update.name {
            device.name = Some(name.clone());
        }
        if let Some(group_id) = &update.group_id {
            device.group_id = Some(group_id.clone());
            device.group_name = group_name;
        }
        if let Some(ip) = &update.ip {
            device.ip = Some(ip.clone());
        }
        if let Some(model) = &update.model {
            device.model = Some(model.clone());
        }
        if let Some(remark) = &update.remark {
            device.remark = Some(remark.clone());
        }
        device.updated_at = Some(Utc::now());
        state.refresh_group_counts();
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), ApiError> {
        self.enter(Op::DeleteDevice, device_id).await?;

        let mut state = self.lock();
        if !state.has_device(device_id) {
            return Err(not_found("device", device_id));
        }
        state.devices.retain(|d| d.id != device_id);
        state.mirroring.remove(device_id);
        state.refresh_group_counts();
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, ApiError> {
        self.enter(Op::ListGroups, "").await?;
        Ok(self.lock().groups.clone())
    }

    async fn create_group(&self, group: &NewGroup) -> Result<(), ApiError> {
        self.enter(Op::CreateGroup, &group.name).await?;

        let mut state = self.lock();
        if state.groups.iter().any(|g| g.name == group.name) {
            return Err(ApiError::Remote {
                code: 409,
                message: Some(format!("group {} already exists", group.name)),
            });
        }
        let id = state.next_id("group");
        state.groups.push(Group {
            id,
            name: group.name.clone(),
            description: group.description.clone(),
            device_count: 0,
        });
        Ok(())
    }

    async fn update_group(&self, group_id: &str, update: &GroupUpdate) -> Result<(), ApiError> {
        self.enter(Op::UpdateGroup, group_id).await?;

        let mut state = self.lock();
        let group = state
            .groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| not_found("group", group_id))?;
        if let Some(name) = &update.name {
            group.name = name.clone();
        }
        if let Some(description) = &update.description {
            group.description = Some(description.clone());
        }

        let name = group.name.clone();
        for device in &mut state.devices {
            if device.group_id.as_deref() == Some(group_id) {
                device.group_name = Some(name.clone());
            }
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<(), ApiError> {
        self.enter(Op::DeleteGroup, group_id).await?;

        let mut state = self.lock();
        if !state.groups.iter().any(|g| g.id == group_id) {
            return Err(not_found("group", group_id));
        }
        state.groups.retain(|g| g.id != group_id);
        for device in &mut state.devices {
            if device.group_id.as_deref() == Some(group_id) {
                device.group_id = None;
                device.group_name = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_mirroring_returns_address_without_scheme() {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.add_device("d1", "One");

        let address = control.start_mirroring("d1").await.unwrap().unwrap();
        assert!(address.starts_with("10.0.0."));
        assert!(!address.contains("://"));
        assert!(simulator.is_mirroring("d1"));

        control.stop_mirroring("d1").await.unwrap();
        assert!(!simulator.is_mirroring("d1"));
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_remote_error() {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.add_device("d1", "One");
        simulator.fail(Op::StartMirroring, "d1", 500, Some("encoder busy"));

        let err = control.start_mirroring("d1").await.unwrap_err();
        assert_eq!(err.server_message(), Some("encoder busy"));
        assert_eq!(simulator.calls_for(Op::StartMirroring), vec!["d1"]);
    }

    #[tokio::test]
    async fn held_call_waits_for_release() {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.add_device("d1", "One");
        let gate = simulator.hold(Op::StopMirroring, "d1");

        let control = Arc::new(control);
        let task = tokio::spawn({
            let control = control.clone();
            async move { control.stop_mirroring("d1").await }
        });

        gate.arrived().await;
        assert!(!task.is_finished());
        gate.release();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn search_filters_by_keyword_and_group() {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.seed_demo_fleet();

        let mut query = DeviceQuery::first_page(2);
        query.group_id = Some("lab".into());
        let page = control.search_devices(&query).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.records.len(), 2);

        query.page = 2;
        let page = control.search_devices(&query).await.unwrap();
        assert_eq!(page.records.len(), 1);

        let mut query = DeviceQuery::first_page(20);
        query.keyword = Some("handset 3".into());
        let page = control.search_devices(&query).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "dev-03");
    }

    #[tokio::test]
    async fn batch_shell_keys_results_by_opaque_id() {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.add_device("d1", "One");
        simulator.add_device("d2", "Two");
        simulator.fail(Op::BatchShell, "d2", 127, Some("not found"));

        let results = control
            .batch_shell(&ShellRequest {
                device_ids: vec!["d1".into(), "d2".into(), "ghost".into()],
                command: "uptime".into(),
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.keys().all(|k| k != "d1" && k != "d2"));
        let d2 = results.values().find(|e| e.device_id == "d2").unwrap();
        assert_eq!(d2.result.as_ref().unwrap().code, 127);
    }
}
