//! snowball-responder: answers snowball commands from a snowbridge host.
//!
//! Connects to `SNOWBRIDGE_ENDPOINT` (default `127.0.0.1:25333`) and keeps
//! reattaching until interrupted.

mod keywords;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use snowbridge::ResponderConfig;
use snowbridge::logging::{LogSettings, init_tracing};
use snowbridge::responder::run_with_reconnect;

use crate::keywords::KeywordHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&LogSettings::from_env());
    let config = ResponderConfig::from_env()?;
    info!(
        endpoint = %config.endpoint,
        name = %config.name,
        "snowball-responder {}",
        env!("CARGO_PKG_VERSION")
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, shutting down...");
                signal_token.cancel();
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGINT"),
        }
    });

    run_with_reconnect(&config, Arc::new(KeywordHandler), shutdown).await;
    Ok(())
}
