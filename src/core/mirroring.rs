//! Batch screen mirroring.
//!
//! Per device: `connecting -> playing`, `playing -> paused`,
//! `paused -> connecting -> playing`, anything `-> error`, and removal on a
//! successful stop. Errors are only retried by starting a new batch.

use std::sync::{Arc, LazyLock};

use futures::future::join_all;
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::record::{BatchSummary, MirrorRecord, MirrorStatus, failure_reason};
use super::store::{Dispatch, RecordStore};
use crate::api::{ApiError, Device, DeviceControl};

pub const MIRRORING_FAILED: &str = "mirroring failed";
pub const STOP_FAILED: &str = "failed to stop mirroring";

static SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("scheme pattern is valid")
});

/// Prefix `http://` when the address carries no scheme. Nothing else is
/// checked; a bad host fails later, when the stream is fetched.
pub fn normalize_address(address: &str) -> String {
    if SCHEME.is_match(address) {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Records dropped from the batch.
    pub removed: usize,
    /// Device ids whose stop call failed; nothing is removed when non-empty.
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct MirrorOrchestrator {
    control: Arc<dyn DeviceControl>,
    store: RecordStore<MirrorStatus>,
}

impl MirrorOrchestrator {
    pub fn new(control: Arc<dyn DeviceControl>) -> Self {
        Self {
            control,
            store: RecordStore::new(),
        }
    }

    pub fn store(&self) -> &RecordStore<MirrorStatus> {
        &self.store
    }

    pub async fn records(&self) -> Vec<MirrorRecord> {
        self.store.snapshot().await
    }

    pub async fn summary(&self) -> BatchSummary<MirrorStatus> {
        self.store.summary().await
    }

    pub fn is_busy(&self) -> bool {
        self.store.is_busy()
    }

    /// Start a new batch for `devices`, replacing the current one. Returns
    /// once every start call has settled.
    pub async fn start(&self, devices: &[Device]) {
        let _busy = self.store.begin_action();

        let dispatched = self
            .store
            .apply(|set| {
                set.reset(devices, MirrorStatus::Connecting);
                let keys = set.select(None, |r| r.has_device_id());
                set.dispatch(&keys, |_| {})
            })
            .await;

        info!(
            devices = devices.len(),
            dispatched = dispatched.len(),
            "Starting batch mirroring"
        );

        join_all(dispatched.iter().map(|d| self.connect(d))).await;

        let summary = self.store.summary().await;
        info!(summary = %summary, "Batch mirroring started");
    }

    /// Pause the `playing` records in `scope` (all records when `None`).
    /// Returns how many pause calls were issued.
    pub async fn pause_all(&self, scope: Option<&[String]>) -> usize {
        let _busy = self.store.begin_action();

        let dispatched = self
            .store
            .apply(|set| {
                let keys = set.select(scope, |r| r.status == MirrorStatus::Playing);
                set.dispatch(&keys, |_| {})
            })
            .await;

        if dispatched.is_empty() {
            return 0;
        }
        info!(devices = dispatched.len(), "Pausing mirroring");

        join_all(dispatched.iter().map(|d| self.pause(d))).await;
        dispatched.len()
    }

    /// Resume the `paused` records in `scope`. Returns how many start calls
    /// were issued.
    pub async fn resume_all(&self, scope: Option<&[String]>) -> usize {
        let _busy = self.store.begin_action();

        let dispatched = self
            .store
            .apply(|set| {
                let keys = set.select(scope, |r| r.status == MirrorStatus::Paused);
                set.dispatch(&keys, |r| r.status = MirrorStatus::Connecting)
            })
            .await;

        if dispatched.is_empty() {
            return 0;
        }
        info!(devices = dispatched.len(), "Resuming mirroring");

        join_all(dispatched.iter().map(|d| self.connect(d))).await;
        dispatched.len()
    }

    /// Stop every record in `scope`, whatever its status.
    ///
    /// Records are removed only if every stop call succeeds. On any failure
    /// the failed records turn `error` and the rest keep their status, so a
    /// device that may still be streaming never disappears from view.
    pub async fn stop_all(&self, scope: Option<&[String]>) -> StopOutcome {
        let _busy = self.store.begin_action();

        let (dispatched, idless) = self
            .store
            .apply(|set| {
                let keys = set.select(scope, |_| true);
                let (with_id, idless): (Vec<String>, Vec<String>) = keys
                    .into_iter()
                    .partition(|key| set.get(key).is_some_and(|r| r.has_device_id()));
                (set.dispatch(&with_id, |_| {}), idless)
            })
            .await;

        if dispatched.is_empty() && idless.is_empty() {
            return StopOutcome::default();
        }
        info!(devices = dispatched.len(), "Stopping mirroring");

        let results = join_all(dispatched.iter().map(|d| async move {
            let result = self.control.stop_mirroring(&d.device_id).await;
            if let Err(e) = &result {
                warn!(device_id = %d.device_id, error = %e, "Failed to stop mirroring");
            }
            (d, result)
        }))
        .await;

        let failed: Vec<String> = results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(d, _)| d.device_id.clone())
            .collect();

        let removed = self
            .store
            .apply(|set| {
                if failed.is_empty() {
                    let mut removed = 0;
                    for (dispatch, _) in &results {
                        if set.is_current(dispatch) && set.remove(&dispatch.key).is_some() {
                            removed += 1;
                        }
                    }
                    for key in &idless {
                        if set.remove(key).is_some() {
                            removed += 1;
                        }
                    }
                    return removed;
                }

                for (dispatch, result) in &results {
                    let Some(record) = set.current_mut(dispatch) else {
                        continue;
                    };
                    record.is_loading = false;
                    if let Err(e) = result {
                        record.fail(failure_reason(e, STOP_FAILED));
                    }
                }
                0
            })
            .await;

        StopOutcome { removed, failed }
    }

    /// Best-effort stop of the whole batch, for when its view goes away.
    ///
    /// Runs in the background; failures are logged, never returned.
    pub fn teardown(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.stop_all(None).await;
            if outcome.failed.is_empty() {
                info!(removed = outcome.removed, "Mirroring torn down");
            } else {
                warn!(
                    failed = ?outcome.failed,
                    "Mirroring teardown left devices running"
                );
            }
        })
    }

    async fn connect(&self, dispatch: &Dispatch) {
        let result = self.control.start_mirroring(&dispatch.device_id).await;
        let address = match result {
            Ok(Some(address)) if !address.is_empty() => Ok(normalize_address(&address)),
            Ok(_) => Err(MIRRORING_FAILED.to_string()),
            Err(e) => {
                warn!(device_id = %dispatch.device_id, error = %e, "Failed to start mirroring");
                Err(failure_reason(&e, MIRRORING_FAILED))
            }
        };

        self.store
            .resolve(dispatch, |record| match address {
                Ok(address) => record.succeed(MirrorStatus::Playing, Some(address)),
                Err(message) => record.fail(message),
            })
            .await;
    }

    async fn pause(&self, dispatch: &Dispatch) {
        let result: Result<(), ApiError> = self.control.stop_mirroring(&dispatch.device_id).await;
        if let Err(e) = &result {
            warn!(device_id = %dispatch.device_id, error = %e, "Failed to pause mirroring");
        }

        self.store
            .resolve(dispatch, |record| match result {
                Ok(()) => record.succeed(MirrorStatus::Paused, None),
                Err(e) => {
                    record.fail(failure_reason(&e, MIRRORING_FAILED));
                    record.payload = None;
                }
            })
            .await;
    }
}
