use std::sync::Arc;

use crate::api::{self, ApiError, DeviceControl};
use crate::config::AppConfig;
use crate::core::{Directory, MirrorOrchestrator, PackageOrchestrator, ShellOrchestrator};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub control: Arc<dyn DeviceControl>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self, ApiError> {
        let control = api::create_client(&config)?;
        Ok(Self::with_control(config, control))
    }

    pub fn with_control(config: AppConfig, control: Arc<dyn DeviceControl>) -> Self {
        Self {
            config: Arc::new(config),
            control,
        }
    }

    pub fn mirror(&self) -> MirrorOrchestrator {
        MirrorOrchestrator::new(self.control.clone())
    }

    pub fn shell(&self) -> ShellOrchestrator {
        ShellOrchestrator::new(self.control.clone())
    }

    pub fn packages(&self) -> PackageOrchestrator {
        PackageOrchestrator::new(self.control.clone())
    }

    pub fn directory(&self) -> Directory {
        Directory::new(self.control.clone(), self.config.page_size)
    }
}
