//! Per-device operation records and the summary derived from them.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::Serialize;

use crate::api::{ApiError, Device};

pub const UNNAMED_DEVICE: &str = "unnamed device";
pub const MISSING_DEVICE_ID: &str = "missing device id";

/// Status enum carried by an [`OperationRecord`].
pub trait RecordStatus: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every variant, in display order.
    const ALL: &'static [Self];

    fn error() -> Self;

    fn as_str(&self) -> &'static str;
}

/// Screen-mirroring state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    Connecting,
    Playing,
    Paused,
    Error,
}

impl RecordStatus for MirrorStatus {
    const ALL: &'static [Self] = &[Self::Connecting, Self::Playing, Self::Paused, Self::Error];

    fn error() -> Self {
        Self::Error
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

/// State of a one-shot task (shell command, package install) on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Executing,
    Success,
    Error,
}

impl RecordStatus for TaskStatus {
    const ALL: &'static [Self] = &[Self::Idle, Self::Executing, Self::Success, Self::Error];

    fn error() -> Self {
        Self::Error
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord<S> {
    pub device_id: String,
    pub device_name: String,
    pub status: S,
    /// Playback URL for mirroring, captured output for tasks.
    pub payload: Option<String>,
    pub error: Option<String>,
    pub is_loading: bool,
    /// Ticket of the call currently allowed to resolve this record.
    #[serde(skip)]
    pub(crate) ticket: u64,
}

pub type MirrorRecord = OperationRecord<MirrorStatus>;
pub type TaskRecord = OperationRecord<TaskStatus>;

impl<S: RecordStatus> OperationRecord<S> {
    /// Records for devices without an id start out failed.
    pub fn new(device: &Device, initial: S) -> Self {
        let device_name = device
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNNAMED_DEVICE)
            .to_string();

        let mut record = Self {
            device_id: device.id.clone(),
            device_name,
            status: initial,
            payload: None,
            error: None,
            is_loading: false,
            ticket: 0,
        };
        if !record.has_device_id() {
            record.fail(MISSING_DEVICE_ID);
        }
        record
    }

    pub fn has_device_id(&self) -> bool {
        !self.device_id.is_empty()
    }

    pub(crate) fn succeed(&mut self, status: S, payload: Option<String>) {
        self.status = status;
        self.payload = payload;
        self.error = None;
        self.is_loading = false;
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.status = S::error();
        self.error = Some(message.into());
        self.is_loading = false;
    }
}

/// The server's reason when there is one, `default` otherwise.
pub fn failure_reason(err: &ApiError, default: &str) -> String {
    err.server_message()
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

/// Per-status counts over a record set. Always derived, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary<S: RecordStatus> {
    counts: HashMap<S, usize>,
    pub total: usize,
    pub loading: usize,
}

impl<S: RecordStatus> BatchSummary<S> {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a OperationRecord<S>>) -> Self {
        let mut summary = Self {
            counts: HashMap::new(),
            total: 0,
            loading: 0,
        };
        for record in records {
            *summary.counts.entry(record.status).or_default() += 1;
            summary.total += 1;
            if record.is_loading {
                summary.loading += 1;
            }
        }
        summary
    }

    pub fn count(&self, status: S) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

impl BatchSummary<MirrorStatus> {
    pub fn can_pause(&self) -> bool {
        self.count(MirrorStatus::Playing) > 0
    }

    pub fn can_resume(&self) -> bool {
        self.count(MirrorStatus::Paused) > 0
    }

    pub fn can_stop(&self) -> bool {
        self.total > 0
    }
}

impl BatchSummary<TaskStatus> {
    pub fn is_settled(&self) -> bool {
        self.count(TaskStatus::Executing) == 0
    }
}

impl<S: RecordStatus> fmt::Display for BatchSummary<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = S::ALL
            .iter()
            .map(|status| format!("{} {}", status.as_str(), self.count(*status)))
            .collect();
        write!(f, "{} ({} total)", parts.join(", "), self.total)
    }
}
