//! Kernel provisioning over the gateway's HTTP API.

use std::fmt;

use serde_json::Value;
use tracing::info;

use crate::config::KernelAddress;

/// Error type for kernel creation.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The gateway answered with a non-2xx status.
    #[error("unexpected response status: {0}")]
    Status(u16),
    /// The gateway answered 2xx with no body.
    #[error("empty response")]
    EmptyBody,
    /// The response body is not JSON.
    #[error("invalid JSON response: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// A required field was absent from the response body.
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
}

/// Opaque kernel id handed out by the gateway. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelIdentity(String);

impl KernelIdentity {
    /// Wrap an id, rejecting empty or blank values.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return None;
        }
        Some(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Creates kernels on one gateway.
#[derive(Clone, Debug)]
pub struct KernelProvisioner {
    http: reqwest::Client,
    address: KernelAddress,
}

impl KernelProvisioner {
    #[must_use]
    pub fn new(address: KernelAddress) -> Self {
        Self { http: reqwest::Client::new(), address }
    }

    /// `POST /api/kernels` with `{"name": kernel_name}` and return the new kernel's id.
    ///
    /// No retry is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Status`] for non-2xx responses,
    /// [`ProvisionError::EmptyBody`] / [`ProvisionError::InvalidJson`] for
    /// unusable bodies, and [`ProvisionError::MissingField`] when `id` is
    /// absent, not a string, or empty.
    pub async fn create(&self, kernel_name: &str) -> Result<KernelIdentity, ProvisionError> {
        let url = format!("http://{}/api/kernels", self.address);
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "name": kernel_name }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(ProvisionError::EmptyBody);
        }

        // Body also carries name, last_activity, execution_state and connections.
        let body = serde_json::from_str::<Value>(&body)?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .and_then(KernelIdentity::new)
            .ok_or(ProvisionError::MissingField("id"))?;

        info!(kernel_name, kernel_id = %id, "created kernel");
        Ok(id)
    }
}

#[cfg(test)]
#[path = "provision_test.rs"]
mod tests;
