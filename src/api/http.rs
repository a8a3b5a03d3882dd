use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::envelope::Envelope;
use super::models::{
    Device, DeviceQuery, DeviceUpdate, Group, GroupUpdate, NewDevice, NewGroup, PackageInfo, Page,
    ShellRequest, ShellResults,
};
use super::{ApiError, DeviceControl};
use crate::config::ApiConfig;

pub struct HttpDeviceControl {
    base_url: String,
    client: reqwest::Client,
}

/// Update body: the changed fields plus the id they apply to.
#[derive(Serialize)]
struct IdentifiedUpdate<'a, T: Serialize> {
    id: &'a str,
    #[serde(flatten)]
    fields: &'a T,
}

impl HttpDeviceControl {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ApiError::Config(format!("token is not a valid header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope = serde_json::from_str(&body)?;
        envelope.into_result()
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ApiError> {
        debug!(path, "POST");
        self.send(self.client.post(self.url(path)).json(body)).await
    }

    /// POST where only the envelope code matters.
    async fn post_unit(&self, path: &str, body: &impl Serialize) -> Result<(), ApiError> {
        let _: serde_json::Value = self.post(path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for HttpDeviceControl {
    async fn start_mirroring(&self, device_id: &str) -> Result<Option<String>, ApiError> {
        self.post("device/screen/start", &json!({ "deviceId": device_id }))
            .await
    }

    async fn stop_mirroring(&self, device_id: &str) -> Result<(), ApiError> {
        self.post_unit("device/screen/stop", &json!({ "deviceId": device_id }))
            .await
    }

    async fn batch_shell(&self, request: &ShellRequest) -> Result<ShellResults, ApiError> {
        let results: Option<ShellResults> = self.post("device/shell/batch", request).await?;
        Ok(results.unwrap_or_default())
    }

    async fn install_package(&self, device_id: &str, package_url: &str) -> Result<(), ApiError> {
        self.post_unit(
            "device/package/install",
            &json!({ "deviceId": device_id, "packageUrl": package_url }),
        )
        .await
    }

    async fn uninstall_package(
        &self,
        device_id: &str,
        package_name: &str,
    ) -> Result<(), ApiError> {
        self.post_unit(
            "device/package/uninstall",
            &json!({ "deviceId": device_id, "packageName": package_name }),
        )
        .await
    }

    async fn list_packages(&self, device_id: &str) -> Result<Vec<PackageInfo>, ApiError> {
        let request = self
            .client
            .get(self.url("device/package/list"))
            .query(&[("deviceId", device_id)]);
        let packages: Option<Vec<PackageInfo>> = self.send(request).await?;
        Ok(packages.unwrap_or_default())
    }

    async fn search_devices(&self, query: &DeviceQuery) -> Result<Page<Device>, ApiError> {
        let request = self.client.get(self.url("device/page")).query(query);
        let page: Option<Page<Device>> = self.send(request).await?;
        Ok(page.unwrap_or_default())
    }

    async fn create_device(&self, device: &NewDevice) -> Result<(), ApiError> {
        self.post_unit("device", device).await
    }

    async fn update_device(&self, device_id: &str, update: &DeviceUpdate) -> Result<(), ApiError> {
        let body = IdentifiedUpdate {
            id: device_id,
            fields: update,
        };
        let request = self
            .client
            .put(self.url(&format!("device/{device_id}")))
            .json(&body);
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(&format!("device/{device_id}")));
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, ApiError> {
        let request = self.client.get(self.url("group/list"));
        let groups: Option<Vec<Group>> = self.send(request).await?;
        Ok(groups.unwrap_or_default())
    }

    async fn create_group(&self, group: &NewGroup) -> Result<(), ApiError> {
        self.post_unit("group", group).await
    }

    async fn update_group(&self, group_id: &str, update: &GroupUpdate) -> Result<(), ApiError> {
        let body = IdentifiedUpdate {
            id: group_id,
            fields: update,
        };
        let request = self
            .client
            .put(self.url(&format!("group/{group_id}")))
            .json(&body);
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(&format!("group/{group_id}")));
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slashes() {
        let control = HttpDeviceControl::new(&ApiConfig {
            base_url: "http://fleet.local/api/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            control.url("/device/screen/start"),
            "http://fleet.local/api/device/screen/start"
        );
    }

    #[test]
    fn rejects_token_that_cannot_be_a_header() {
        let result = HttpDeviceControl::new(&ApiConfig {
            token: Some("bad\ntoken".into()),
            ..Default::default()
        });
        assert!(matches!(result, Err(ApiError::Config(_))));
    }

    #[test]
    fn update_body_carries_id_and_changed_fields() {
        let update = DeviceUpdate::assign_group("g2");
        let body = IdentifiedUpdate {
            id: "d1",
            fields: &update,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"id": "d1", "groupId": "g2"})
        );
    }
}
