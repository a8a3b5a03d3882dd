//! Package install and uninstall across a set of devices.
//!
//! Unlike shell, the backend has no batch endpoint for packages: each device
//! gets its own call and its own record.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use super::OrchestratorError;
use super::record::{BatchSummary, TaskRecord, TaskStatus, failure_reason};
use super::store::{Dispatch, RecordStore};
use crate::api::{ApiError, Device, DeviceControl, PackageInfo};

pub const INSTALL_FAILED: &str = "install failed";
pub const UNINSTALL_FAILED: &str = "uninstall failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageAction {
    Install,
    Uninstall,
}

impl PackageAction {
    fn default_error(self) -> &'static str {
        match self {
            PackageAction::Install => INSTALL_FAILED,
            PackageAction::Uninstall => UNINSTALL_FAILED,
        }
    }
}

#[derive(Clone)]
pub struct PackageOrchestrator {
    control: Arc<dyn DeviceControl>,
    store: RecordStore<TaskStatus>,
}

impl PackageOrchestrator {
    pub fn new(control: Arc<dyn DeviceControl>) -> Self {
        Self {
            control,
            store: RecordStore::new(),
        }
    }

    pub fn store(&self) -> &RecordStore<TaskStatus> {
        &self.store
    }

    pub async fn records(&self) -> Vec<TaskRecord> {
        self.store.snapshot().await
    }

    pub async fn summary(&self) -> BatchSummary<TaskStatus> {
        self.store.summary().await
    }

    pub fn is_busy(&self) -> bool {
        self.store.is_busy()
    }

    /// Install the package at `package_url` on every device.
    pub async fn install(
        &self,
        devices: &[Device],
        package_url: &str,
    ) -> Result<BatchSummary<TaskStatus>, OrchestratorError> {
        self.run(devices, package_url, PackageAction::Install).await
    }

    /// Remove `package_name` from every device.
    pub async fn uninstall(
        &self,
        devices: &[Device],
        package_name: &str,
    ) -> Result<BatchSummary<TaskStatus>, OrchestratorError> {
        self.run(devices, package_name, PackageAction::Uninstall)
            .await
    }

    pub async fn list_packages(&self, device_id: &str) -> Result<Vec<PackageInfo>, ApiError> {
        self.control.list_packages(device_id).await
    }

    async fn run(
        &self,
        devices: &[Device],
        package: &str,
        action: PackageAction,
    ) -> Result<BatchSummary<TaskStatus>, OrchestratorError> {
        let package = package.trim();
        if package.is_empty() {
            return Err(OrchestratorError::Validation(
                "package must not be blank".to_string(),
            ));
        }
        if devices.is_empty() {
            return Err(OrchestratorError::Validation(
                "no devices selected".to_string(),
            ));
        }

        let _busy = self.store.begin_action();

        let dispatched = self
            .store
            .apply(|set| {
                set.reset(devices, TaskStatus::Executing);
                let keys = set.select(None, |r| r.has_device_id());
                set.dispatch(&keys, |_| {})
            })
            .await;

        info!(?action, package, devices = dispatched.len(), "Running package batch");
        join_all(dispatched.iter().map(|d| self.run_one(d, package, action))).await;

        let summary = self.store.summary().await;
        info!(?action, summary = %summary, "Package batch finished");
        Ok(summary)
    }

    async fn run_one(&self, dispatch: &Dispatch, package: &str, action: PackageAction) {
        let result = match action {
            PackageAction::Install => {
                self.control
                    .install_package(&dispatch.device_id, package)
                    .await
            }
            PackageAction::Uninstall => {
                self.control
                    .uninstall_package(&dispatch.device_id, package)
                    .await
            }
        };
        if let Err(e) = &result {
            warn!(device_id = %dispatch.device_id, ?action, error = %e, "Package operation failed");
        }

        self.store
            .resolve(dispatch, |record| match result {
                Ok(()) => record.succeed(TaskStatus::Success, Some(package.to_string())),
                Err(e) => record.fail(failure_reason(&e, action.default_error())),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Op, SimulatedDeviceControl};

    #[tokio::test]
    async fn install_resolves_each_device_on_its_own() {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.add_device("d1", "One");
        simulator.add_device("d2", "Two");
        simulator.fail(Op::InstallPackage, "d2", 500, None);
        let packages = PackageOrchestrator::new(Arc::new(control));

        let devices = vec![Device::new("d1", "One"), Device::new("d2", "Two")];
        let summary = packages
            .install(&devices, "https://cdn.example/app.apk")
            .await
            .unwrap();

        assert_eq!(summary.count(TaskStatus::Success), 1);
        assert_eq!(summary.count(TaskStatus::Error), 1);
        let records = packages.records().await;
        assert_eq!(records[1].error.as_deref(), Some(INSTALL_FAILED));
        assert!(!packages.is_busy());
    }

    #[tokio::test]
    async fn blank_package_is_rejected_without_calls() {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.add_device("d1", "One");
        let packages = PackageOrchestrator::new(Arc::new(control));

        let err = packages
            .uninstall(&[Device::new("d1", "One")], "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(simulator.calls().is_empty());
        assert!(packages.records().await.is_empty());
    }
}
