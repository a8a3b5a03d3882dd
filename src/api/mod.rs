//! Device-control API client.
//!
//! [`DeviceControl`] is the seam between the orchestration core and the
//! remote fleet. Two implementations exist:
//!
//! - [`HttpDeviceControl`]: REST client for the real device-control service
//! - [`SimulatedDeviceControl`]: in-memory fleet driven by a [`Simulator`]

mod envelope;
mod http;
pub mod models;
mod simulated;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AppConfig;

pub use envelope::{Envelope, SUCCESS_CODE};
pub use http::HttpDeviceControl;
pub use models::{
    Device, DeviceQuery, DeviceUpdate, Group, GroupUpdate, NewDevice, NewGroup, PackageInfo, Page,
    ShellEntry, ShellOutput, ShellRequest, ShellResults,
};
pub use simulated::{Call, Gate, Op, SimulatedDeviceControl, Simulator};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("remote call failed with code {code}: {}", .message.as_deref().unwrap_or("no message"))]
    Remote { code: i64, message: Option<String> },

    #[error("invalid API configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// The reason the server gave, if the failure came from the server.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Remote { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

/// Operations the fleet exposes. Every method maps to one remote call.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Start mirroring; returns the playback address, which may lack a scheme.
    async fn start_mirroring(&self, device_id: &str) -> Result<Option<String>, ApiError>;

    async fn stop_mirroring(&self, device_id: &str) -> Result<(), ApiError>;

    /// Run one command on many devices in a single server-side batch.
    async fn batch_shell(&self, request: &ShellRequest) -> Result<ShellResults, ApiError>;

    async fn install_package(&self, device_id: &str, package_url: &str) -> Result<(), ApiError>;

    async fn uninstall_package(&self, device_id: &str, package_name: &str)
    -> Result<(), ApiError>;

    async fn list_packages(&self, device_id: &str) -> Result<Vec<PackageInfo>, ApiError>;

    async fn search_devices(&self, query: &DeviceQuery) -> Result<Page<Device>, ApiError>;

    async fn create_device(&self, device: &NewDevice) -> Result<(), ApiError>;

    async fn update_device(&self, device_id: &str, update: &DeviceUpdate) -> Result<(), ApiError>;

    async fn delete_device(&self, device_id: &str) -> Result<(), ApiError>;

    async fn list_groups(&self) -> Result<Vec<Group>, ApiError>;

    async fn create_group(&self, group: &NewGroup) -> Result<(), ApiError>;

    async fn update_group(&self, group_id: &str, update: &GroupUpdate) -> Result<(), ApiError>;

    async fn delete_group(&self, group_id: &str) -> Result<(), ApiError>;
}

/// Pick the backend for the given configuration.
pub fn create_client(config: &AppConfig) -> Result<Arc<dyn DeviceControl>, ApiError> {
    if config.simulation {
        let (control, simulator) = SimulatedDeviceControl::new();
        simulator.seed_demo_fleet();
        return Ok(Arc::new(control.with_latency(std::time::Duration::from_millis(150))));
    }

    Ok(Arc::new(HttpDeviceControl::new(&config.api)?))
}
