//! Generic REST/JSON implementation of [`super::VmsClient`].
//!
//! Talks a plain `POST /session`, `GET /vms/{path}`, `GET /vms/{id}/devices`
//! dialect. This is deliberately not bound to any particular hypervisor's
//! SOAP/XML management API — a host with a different VMS wire protocol
//! implements `VmsClient` itself and plugs it into the orchestrator in
//! place of this client.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ExportLease, FileItem, ListOutcome, VmMetadata, VmSummary, VmsClient, VmsError};
use crate::config::VmsConfig;

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct VmResponse {
    id: String,
    path: String,
    power_state: String,
}

#[derive(Debug, Deserialize)]
struct ListVmsResponse {
    vms: Vec<VmResponse>,
    #[serde(default)]
    skipped: u32,
}

#[derive(Debug, Deserialize)]
struct DeviceResponse {
    device_url: String,
    file_name: String,
    size: u64,
    is_disk: bool,
}

#[derive(Debug, Deserialize)]
struct DescriptorResponse {
    descriptor_id: String,
}

#[derive(Debug, Deserialize)]
struct LeaseResponse {
    lease_id: String,
    files: Vec<DeviceResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataResponse {
    #[serde(default)]
    annotations: std::collections::HashMap<String, String>,
    guest_os: Option<String>,
    cpu_count: Option<u32>,
    memory_mb: Option<u64>,
    firmware: Option<String>,
    os_version: Option<String>,
    #[serde(default)]
    secure_boot: bool,
}

pub struct HttpVmsClient {
    http: reqwest::Client,
    base_url: url::Url,
    config: VmsConfig,
    token: RwLock<Option<String>>,
}

impl HttpVmsClient {
    pub fn new(config: VmsConfig) -> Result<Self, VmsError> {
        let base_url = url::Url::parse(&config.url)
            .map_err(|e| VmsError::Request(format!("invalid VMS url: {e}")))?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()
            .map_err(|e| VmsError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            config,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> Result<url::Url, VmsError> {
        self.base_url
            .join(path)
            .map_err(|e| VmsError::Request(format!("bad path '{path}': {e}")))
    }

    fn token_header(&self) -> Result<String, VmsError> {
        self.token
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| VmsError::AuthFailed("not authenticated".into()))
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<T, VmsError> {
        let url = self.url(path)?;
        let mut builder = self.http.request(method, url);
        if let Ok(token) = self.token_header() {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| VmsError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VmsError::NotFound(path.to_string()));
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(VmsError::AuthFailed(format!(
                "VMS rejected request to {path} with {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(VmsError::Request(format!(
                "{path} returned {}",
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| VmsError::Protocol(format!("{path}: {e}")))
    }
}

#[async_trait]
impl VmsClient for HttpVmsClient {
    async fn authenticate(&self) -> Result<(), VmsError> {
        let url = self.url("session")?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| VmsError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(VmsError::AuthFailed("invalid credentials".into()));
        }
        if !response.status().is_success() {
            return Err(VmsError::AuthFailed(format!(
                "session request returned {}",
                response.status()
            )));
        }

        let body: SessionResponse = response
            .json()
            .await
            .map_err(|e| VmsError::Protocol(e.to_string()))?;
        *self.token.write().unwrap() = Some(body.token);
        debug!("authenticated against VMS");
        Ok(())
    }

    async fn find_vm(&self, path: &str) -> Result<VmSummary, VmsError> {
        let encoded = urlencoding_lite(path);
        let vm: VmResponse = self
            .request(reqwest::Method::GET, &format!("vms/{encoded}"))
            .await?;
        Ok(VmSummary {
            id: vm.id,
            path: vm.path,
            power_state: vm.power_state,
        })
    }

    async fn list_vms(&self, folder: &str) -> Result<ListOutcome, VmsError> {
        let encoded = urlencoding_lite(folder);
        let resp: ListVmsResponse = self
            .request(reqwest::Method::GET, &format!("vms?folder={encoded}"))
            .await?;
        if resp.skipped > 0 {
            warn!(folder, skipped = resp.skipped, "some VMs could not be listed");
        }
        Ok(ListOutcome {
            vms: resp
                .vms
                .into_iter()
                .map(|v| VmSummary {
                    id: v.id,
                    path: v.path,
                    power_state: v.power_state,
                })
                .collect(),
            skipped: resp.skipped,
        })
    }

    async fn list_devices(&self, vm_id: &str) -> Result<Vec<FileItem>, VmsError> {
        let resp: Vec<DeviceResponse> = self
            .request(reqwest::Method::GET, &format!("vms/{vm_id}/devices"))
            .await?;
        Ok(resp
            .into_iter()
            .map(|d| FileItem {
                device_url: d.device_url,
                file_name: d.file_name,
                size: d.size,
                is_disk: d.is_disk,
            })
            .collect())
    }

    async fn remove_device(&self, vm_id: &str, device_url: &str) -> Result<(), VmsError> {
        let encoded = urlencoding_lite(device_url);
        let url = self.url(&format!("vms/{vm_id}/devices/{encoded}"))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(self.token_header()?)
            .send()
            .await
            .map_err(|e| VmsError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VmsError::Request(format!(
                "remove_device returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn create_descriptor(&self, vm_id: &str) -> Result<String, VmsError> {
        let resp: DescriptorResponse = self
            .request(reqwest::Method::POST, &format!("vms/{vm_id}/descriptor"))
            .await?;
        Ok(resp.descriptor_id)
    }

    async fn start_export_lease(&self, vm_id: &str) -> Result<ExportLease, VmsError> {
        let resp: LeaseResponse = self
            .request(reqwest::Method::POST, &format!("vms/{vm_id}/export-lease"))
            .await?;
        Ok(ExportLease {
            lease_id: resp.lease_id,
            files: resp
                .files
                .into_iter()
                .map(|f| FileItem {
                    device_url: f.device_url,
                    file_name: f.file_name,
                    size: f.size,
                    is_disk: f.is_disk,
                })
                .collect(),
        })
    }

    async fn complete_lease(&self, lease_id: &str) -> Result<(), VmsError> {
        let _: serde_json::Value = self
            .request(reqwest::Method::POST, &format!("leases/{lease_id}/complete"))
            .await
            .or_else(|err| match err {
                VmsError::Protocol(_) => Ok(serde_json::Value::Null),
                other => Err(other),
            })?;
        Ok(())
    }

    async fn abort_lease(&self, lease_id: &str) -> Result<(), VmsError> {
        let url = self.url(&format!("leases/{lease_id}/abort"))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token_header()?)
            .send()
            .await
            .map_err(|e| VmsError::Request(e.to_string()))?;
        if !response.status().is_success() {
            warn!(lease_id, status = %response.status(), "abort_lease returned non-success");
        }
        Ok(())
    }

    async fn vm_metadata(&self, vm_id: &str) -> Result<VmMetadata, VmsError> {
        let resp: MetadataResponse = self
            .request(reqwest::Method::GET, &format!("vms/{vm_id}/metadata"))
            .await?;
        Ok(VmMetadata {
            annotations: resp.annotations,
            guest_os: resp.guest_os,
            cpu_count: resp.cpu_count,
            memory_mb: resp.memory_mb,
            firmware: resp.firmware,
            os_version: resp.os_version,
            secure_boot: resp.secure_boot,
        })
    }
}

/// Minimal path-segment escaping; this client's dialect only ever needs
/// `/` encoded, never full RFC 3986 query escaping.
fn urlencoding_lite(segment: &str) -> String {
    segment.replace('/', "%2F")
}

#[allow(dead_code)]
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
