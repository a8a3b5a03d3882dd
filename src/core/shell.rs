//! Batch shell execution.
//!
//! The backend batches shell commands itself, so one command for N devices
//! is a single call. The response is keyed by opaque result ids and is
//! matched back to records by device id.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::OrchestratorError;
use super::record::{BatchSummary, MISSING_DEVICE_ID, TaskRecord, TaskStatus, failure_reason};
use super::store::RecordStore;
use crate::api::{Device, DeviceControl, ShellEntry, ShellRequest, ShellResults};

pub const EXECUTION_FAILED: &str = "execution failed";
pub const NO_RESPONSE: &str = "no response received";

#[derive(Clone)]
pub struct ShellOrchestrator {
    control: Arc<dyn DeviceControl>,
    store: RecordStore<TaskStatus>,
}

/// Outcome for one device, taken from its entry in the batch response.
fn entry_outcome(entry: Option<&ShellEntry>) -> Result<String, String> {
    let Some(entry) = entry else {
        return Err(NO_RESPONSE.to_string());
    };
    let Some(output) = &entry.result else {
        return Err(EXECUTION_FAILED.to_string());
    };

    if output.code == 0 {
        return Ok(output.result.clone().unwrap_or_default());
    }

    let reason = [&output.message, &output.result]
        .into_iter()
        .flatten()
        .map(|m| m.trim())
        .find(|m| !m.is_empty())
        .unwrap_or(EXECUTION_FAILED);
    Err(reason.to_string())
}

/// Index entries by device id; the first entry for a device wins.
fn index_by_device(results: &ShellResults) -> HashMap<&str, &ShellEntry> {
    let mut entries: Vec<(&String, &ShellEntry)> = results.iter().collect();
    // Result ids are opaque; sort them so duplicates resolve deterministically.
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut by_device = HashMap::new();
    for (_, entry) in entries {
        by_device.entry(entry.device_id.as_str()).or_insert(entry);
    }
    by_device
}

impl ShellOrchestrator {
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

    /// Show `devices` as idle, replacing the current records.
    pub async fn load(&self, devices: &[Device]) {
        self.store
            .apply(|set| set.reset(devices, TaskStatus::Idle))
            .await;
    }

    /// Run `command` on every device in `devices` with one batch call.
    ///
    /// A blank command or an empty device list is rejected before anything
    /// changes. Remote failures never surface as `Err`; they end up in the
    /// affected records.
    pub async fn execute(
        &self,
        devices: &[Device],
        command: &str,
    ) -> Result<BatchSummary<TaskStatus>, OrchestratorError> {
        if command.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "command must not be blank".to_string(),
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
                set.dispatch(&keys, |r| {
                    r.status = TaskStatus::Executing;
                    r.payload = None;
                    r.error = None;
                })
            })
            .await;

        if dispatched.is_empty() {
            warn!(error = MISSING_DEVICE_ID, "No device in the batch has an id");
            return Ok(self.store.summary().await);
        }

        let request = ShellRequest {
            device_ids: dispatched.iter().map(|d| d.device_id.clone()).collect(),
            command: command.to_string(),
        };
        info!(devices = request.device_ids.len(), command = %request.command, "Executing batch shell");

        let response = self.control.batch_shell(&request).await;

        let summary = self
            .store
            .apply(|set| {
                match &response {
                    Ok(results) => {
                        let by_device = index_by_device(results);
                        for dispatch in &dispatched {
                            let outcome =
                                entry_outcome(by_device.get(dispatch.device_id.as_str()).copied());
                            let Some(record) = set.current_mut(dispatch) else {
                                continue;
                            };
                            match outcome {
                                Ok(output) => record.succeed(TaskStatus::Success, Some(output)),
                                Err(message) => record.fail(message),
                            }
                        }
                    }
                    Err(e) => {
                        let message = failure_reason(e, EXECUTION_FAILED);
                        for dispatch in &dispatched {
                            if let Some(record) = set.current_mut(dispatch) {
                                record.fail(message.clone());
                            }
                        }
                    }
                }
                set.summary()
            })
            .await;

        match &response {
            Ok(_) => info!(summary = %summary, "Batch shell finished"),
            Err(e) => warn!(error = %e, "Batch shell failed"),
        }
        Ok(summary)
    }

    /// Reset every record to `idle`. Local only; results still in flight
    /// for the previous execution are discarded when they arrive.
    pub async fn clear(&self) {
        self.store
            .apply(|set| {
                let keys = set.select(None, |_| true);
                for key in &keys {
                    set.invalidate(key);
                    if let Some(record) = set.get_mut(key) {
                        record.status = TaskStatus::Idle;
                        record.payload = None;
                        record.error = None;
                        record.is_loading = false;
                    }
                }
            })
            .await;
    }
}
