//! Client for running code on a remote kernel behind a kernel gateway.
//!
//! A kernel is provisioned over HTTP (or an existing one reused), then a
//! websocket channel to it carries `execute_request` envelopes. Replies arrive
//! unordered on the same socket and are correlated back to the single pending
//! request by `parent_header.msg_id`.

pub mod config;
pub mod envelope;
pub mod pending;
pub mod provision;
pub mod session;

#[cfg(test)]
mod stub_gateway;

use tracing::info;

pub use config::{ConfigError, GatewayConfig, KernelAddress};
pub use provision::{KernelIdentity, KernelProvisioner, ProvisionError};
pub use session::{ChannelState, SessionClient, SessionError, SessionEvent};

/// Error returned by [`open_session`].
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("kernel provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Reuse the configured kernel or provision a new one, and prepare a client for it.
///
/// The returned client is not connected yet.
///
/// # Errors
///
/// Returns [`OpenError::Provision`] if a kernel had to be created and that
/// failed, or [`OpenError::Session`] if the channel URI cannot be built.
pub async fn open_session(config: &GatewayConfig) -> Result<SessionClient, OpenError> {
    let kernel = match config.kernel_id.as_deref().and_then(KernelIdentity::new) {
        Some(kernel) => {
            info!(kernel_id = %kernel, "reusing kernel");
            kernel
        }
        None => {
            KernelProvisioner::new(config.address.clone())
                .create(&config.kernel_name)
                .await?
        }
    };
    Ok(SessionClient::new(&config.address, &kernel)?)
}
