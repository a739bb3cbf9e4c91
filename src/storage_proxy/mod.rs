//! Storage-proxy HTTP client.
//!
//! The storage proxy manages vfolder/volume mounts out of process; this
//! crate only needs to ask it to mount/unmount volumes for a kernel before
//! Stage C (start) and after termination. Built on `reqwest`, already a
//! teacher dependency for outbound HTTP calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Error, KernelId, Result};

#[derive(Debug, Clone, Serialize)]
struct MountRequest<'a> {
    kernel_id: &'a str,
    vfolder_ids: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
struct MountResponse {
    mounted: bool,
}

#[async_trait]
pub trait StorageProxyClient: Send + Sync {
    async fn mount(&self, kernel_id: &KernelId, vfolder_ids: &[String]) -> Result<()>;
    async fn unmount(&self, kernel_id: &KernelId) -> Result<()>;
}

pub struct HttpStorageProxyClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpStorageProxyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl StorageProxyClient for HttpStorageProxyClient {
    async fn mount(&self, kernel_id: &KernelId, vfolder_ids: &[String]) -> Result<()> {
        let url = format!("{}/mounts", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&MountRequest {
                kernel_id: kernel_id.as_str(),
                vfolder_ids,
            })
            .send()
            .await
            .map_err(|e| Error::storage_backend(format!("mount request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::storage_backend(format!(
                "storage proxy returned {} for kernel {kernel_id}",
                response.status()
            )));
        }

        let body: MountResponse = response
            .json()
            .await
            .map_err(|e| Error::storage_backend(format!("invalid mount response: {e}")))?;
        if !body.mounted {
            return Err(Error::storage_backend(format!(
                "storage proxy declined to mount volumes for kernel {kernel_id}"
            )));
        }
        Ok(())
    }

    async fn unmount(&self, kernel_id: &KernelId) -> Result<()> {
        let url = format!("{}/mounts/{}", self.base_url, kernel_id.as_str());
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| Error::storage_backend(format!("unmount request failed: {e}")))?;

        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::storage_backend(format!(
                "storage proxy returned {} unmounting kernel {kernel_id}",
                response.status()
            )));
        }
        Ok(())
    }
}
