use std::time::Duration;

use clap::Parser;
use gateway_client::config::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_REPLY_TIMEOUT_SECS};
use gateway_client::{ConfigError, GatewayConfig, OpenError, SessionClient, SessionError, open_session};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("could not open {0} within {1:?}")]
    Connect(String, Duration),
}

#[derive(Parser, Debug)]
#[command(name = "gateway-client", about = "Run code on a kernel gateway kernel")]
struct Cli {
    /// Gateway `host[:port]`; defaults to localhost:8888.
    #[arg(long, env = "GATEWAY_ADDRESS")]
    address: Option<String>,

    #[arg(long, env = "GATEWAY_KERNEL_NAME")]
    kernel_name: Option<String>,

    /// Attach to this kernel instead of creating one.
    #[arg(long, env = "GATEWAY_KERNEL_ID")]
    kernel_id: Option<String>,

    #[arg(long, env = "GATEWAY_CONNECT_TIMEOUT_SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout_secs: u64,

    #[arg(long, env = "GATEWAY_REPLY_TIMEOUT_SECS", default_value_t = DEFAULT_REPLY_TIMEOUT_SECS)]
    reply_timeout_secs: u64,

    #[arg(default_value = "print('Hello gateway')")]
    code: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = GatewayConfig::new(
        cli.address.as_deref(),
        cli.kernel_name.as_deref(),
        cli.kernel_id.as_deref(),
    )?
    .with_timeouts(
        Duration::from_secs(cli.connect_timeout_secs),
        Duration::from_secs(cli.reply_timeout_secs),
    );

    let mut client = open_session(&config).await?;
    let outcome = run_exchange(&mut client, &config, &cli.code).await;
    client.close().await;
    outcome
}

async fn run_exchange(
    client: &mut SessionClient,
    config: &GatewayConfig,
    code: &str,
) -> Result<(), CliError> {
    if !client.connect(config.connect_timeout).await {
        return Err(CliError::Connect(client.uri().to_string(), config.connect_timeout));
    }

    let msg_id = client.send(code).await?;
    info!(%msg_id, "sent execute request");

    match client.wait_reply(Some(config.reply_timeout)).await {
        Some(text) => print!("{text}"),
        None => warn!(%msg_id, timeout = ?config.reply_timeout, "no reply before timeout; outcome unknown"),
    }
    Ok(())
}
