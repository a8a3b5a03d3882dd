//! Device and group directory: the current page, filters and selection.
//!
//! Every successful mutation is followed by a full refetch of the current
//! page; nothing is patched locally.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::api::{
    ApiError, Device, DeviceControl, DeviceQuery, DeviceUpdate, Group, GroupUpdate, NewDevice,
    NewGroup, Page,
};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("{failed} of {total} device updates failed: {first}")]
    Batch {
        failed: usize,
        total: usize,
        first: ApiError,
    },
}

pub struct Directory {
    control: Arc<dyn DeviceControl>,
    query: DeviceQuery,
    page: Page<Device>,
    groups: Vec<Group>,
    selection: Vec<String>,
}

impl Directory {
    pub fn new(control: Arc<dyn DeviceControl>, page_size: u32) -> Self {
        Self {
            control,
            query: DeviceQuery::first_page(page_size.max(1)),
            page: Page::default(),
            groups: Vec::new(),
            selection: Vec::new(),
        }
    }

    pub fn query(&self) -> &DeviceQuery {
        &self.query
    }

    pub fn page(&self) -> &Page<Device> {
        &self.page
    }

    pub fn devices(&self) -> &[Device] {
        &self.page.records
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Fetch the current page and the group list.
    pub async fn refresh(&mut self) -> Result<(), DirectoryError> {
        let (page, groups) = futures::try_join!(
            self.control.search_devices(&self.query),
            self.control.list_groups()
        )?;
        self.page = page;
        self.groups = groups;
        Ok(())
    }

    /// Every device matching the current filters, across all pages. The
    /// current page is left as it is.
    pub async fn load_all(&self) -> Result<Vec<Device>, DirectoryError> {
        let mut query = self.query.clone();
        query.page = 1;

        let mut devices = Vec::new();
        loop {
            let page = self.control.search_devices(&query).await?;
            let fetched = page.records.len();
            devices.extend(page.records);
            if fetched == 0 || devices.len() as u64 >= page.total {
                break;
            }
            query.page += 1;
        }
        Ok(devices)
    }

    pub async fn set_keyword(&mut self, keyword: Option<&str>) -> Result<(), DirectoryError> {
        self.query.keyword = keyword
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        self.query.page = 1;
        self.refresh().await
    }

    pub async fn set_group_filter(&mut self, group_id: Option<&str>) -> Result<(), DirectoryError> {
        self.query.group_id = group_id.filter(|g| !g.is_empty()).map(str::to_string);
        self.query.page = 1;
        self.refresh().await
    }

    pub async fn set_page(&mut self, page: u32) -> Result<(), DirectoryError> {
        self.query.page = page.max(1);
        self.refresh().await
    }

    pub fn selection(&self) -> &[String] {
        &self.selection
    }

    pub fn select<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            if !id.is_empty() && !self.selection.contains(&id) {
                self.selection.push(id);
            }
        }
    }

    pub fn deselect(&mut self, ids: &[String]) {
        self.selection.retain(|id| !ids.contains(id));
    }

    pub fn select_all_on_page(&mut self) {
        let ids: Vec<String> = self.page.records.iter().map(|d| d.id.clone()).collect();
        self.select(ids);
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Selected devices on the current page, in page order.
    pub fn selected_devices(&self) -> Vec<Device> {
        self.page
            .records
            .iter()
            .filter(|d| self.selection.contains(&d.id))
            .cloned()
            .collect()
    }

    pub async fn create_device(&mut self, device: &NewDevice) -> Result<(), DirectoryError> {
        if device.name.trim().is_empty() {
            return Err(DirectoryError::Validation(
                "device name must not be blank".to_string(),
            ));
        }
        self.control.create_device(device).await?;
        self.refresh().await
    }

    pub async fn update_device(
        &mut self,
        device_id: &str,
        update: &DeviceUpdate,
    ) -> Result<(), DirectoryError> {
        require_id(device_id)?;
        require_changes(update)?;
        self.control.update_device(device_id, update).await?;
        self.refresh().await
    }

    pub async fn delete_device(&mut self, device_id: &str) -> Result<(), DirectoryError> {
        require_id(device_id)?;
        self.control.delete_device(device_id).await?;
        self.selection.retain(|id| id != device_id);
        self.refresh().await
    }

    pub async fn create_group(&mut self, group: &NewGroup) -> Result<(), DirectoryError> {
        if group.name.trim().is_empty() {
            return Err(DirectoryError::Validation(
                "group name must not be blank".to_string(),
            ));
        }
        self.control.create_group(group).await?;
        self.refresh().await
    }

    pub async fn update_group(
        &mut self,
        group_id: &str,
        update: &GroupUpdate,
    ) -> Result<(), DirectoryError> {
        require_id(group_id)?;
        self.control.update_group(group_id, update).await?;
        self.refresh().await
    }

    pub async fn delete_group(&mut self, group_id: &str) -> Result<(), DirectoryError> {
        require_id(group_id)?;
        self.control.delete_group(group_id).await?;
        if self.query.group_id.as_deref() == Some(group_id) {
            self.query.group_id = None;
            self.query.page = 1;
        }
        self.refresh().await
    }

    /// Apply `update` to every device in `ids`, one concurrent call each.
    ///
    /// There is no atomic multi-device endpoint, so some devices may be
    /// updated while others fail; any failure is reported as one error.
    pub async fn batch_update(
        &mut self,
        ids: &[String],
        update: &DeviceUpdate,
    ) -> Result<(), DirectoryError> {
        if ids.is_empty() {
            return Err(DirectoryError::Validation(
                "no devices selected".to_string(),
            ));
        }
        require_changes(update)?;

        info!(devices = ids.len(), "Updating devices");
        let results = join_all(
            ids.iter()
                .map(|id| self.control.update_device(id, update)),
        )
        .await;

        let total = results.len();
        let mut errors = results.into_iter().filter_map(Result::err);
        if let Some(first) = errors.next() {
            let failed = 1 + errors.count();
            warn!(failed, total, error = %first, "Batch device update failed");
            return Err(DirectoryError::Batch {
                failed,
                total,
                first,
            });
        }

        self.refresh().await
    }

    pub async fn batch_assign_group(
        &mut self,
        ids: &[String],
        group_id: &str,
    ) -> Result<(), DirectoryError> {
        require_id(group_id)?;
        self.batch_update(ids, &DeviceUpdate::assign_group(group_id))
            .await
    }
}

fn require_id(id: &str) -> Result<(), DirectoryError> {
    if id.trim().is_empty() {
        return Err(DirectoryError::Validation("id must not be blank".to_string()));
    }
    Ok(())
}

fn require_changes(update: &DeviceUpdate) -> Result<(), DirectoryError> {
    if update.is_empty() {
        return Err(DirectoryError::Validation("nothing to update".to_string()));
    }
    Ok(())
}
