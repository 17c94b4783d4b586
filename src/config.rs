//! Gateway connection settings resolved once before connecting.
//!
//! Raw values come from the command line (or their environment fallbacks) and
//! may be absent or partial. Everything is defaulted and validated here so the
//! provisioner and session client only ever see a complete [`GatewayConfig`].

use std::fmt;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_KERNEL_NAME: &str = "python";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid gateway address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid gateway port in {0:?}")]
    InvalidPort(String),
}

/// `host:port` of the kernel gateway. Always carries a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelAddress(String);

impl KernelAddress {
    /// Resolve a raw address, defaulting the host and port where missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if the address contains
    /// whitespace or a path, and [`ConfigError::InvalidPort`] if the port is
    /// not a valid `u16`.
    pub fn resolve(raw: Option<&str>) -> Result<Self, ConfigError> {
        let trimmed = raw.map(str::trim).unwrap_or_default();
        if trimmed.is_empty() {
            return Ok(Self(format!("{DEFAULT_HOST}:{DEFAULT_PORT}")));
        }
        if trimmed.contains(char::is_whitespace) || trimmed.contains('/') {
            return Err(ConfigError::InvalidAddress(trimmed.to_owned()));
        }

        let Some((host, port)) = trimmed.rsplit_once(':') else {
            return Ok(Self(format!("{trimmed}:{DEFAULT_PORT}")));
        };
        if host.is_empty() {
            return Err(ConfigError::InvalidAddress(trimmed.to_owned()));
        }
        if port.parse::<u16>().is_err() {
            return Err(ConfigError::InvalidPort(trimmed.to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub address: KernelAddress,
    pub kernel_name: String,
    /// Existing kernel to attach to. A new kernel is provisioned when absent.
    pub kernel_id: Option<String>,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
}

impl GatewayConfig {
    /// Build a config from optional raw values.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be resolved.
    pub fn new(
        address: Option<&str>,
        kernel_name: Option<&str>,
        kernel_id: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let address = KernelAddress::resolve(address)?;
        let kernel_name = non_empty(kernel_name).unwrap_or(DEFAULT_KERNEL_NAME).to_owned();
        let kernel_id = non_empty(kernel_id).map(ToOwned::to_owned);

        Ok(Self {
            address,
            kernel_name,
            kernel_id,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            reply_timeout: Duration::from_secs(DEFAULT_REPLY_TIMEOUT_SECS),
        })
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect_timeout: Duration, reply_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.reply_timeout = reply_timeout;
        self
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
