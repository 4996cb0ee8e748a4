//! Runs one bridged chat session in the terminal.
//!
//! Usage: `cli-bridge [CONFIG_FILE] [PROJECT_DIR]`
//!
//! Lines typed on stdin go to the assistant CLI; every response envelope is
//! printed to stdout as one JSON line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use cli_bridge::{BridgeConfig, CommandLauncher, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .or_else(|| std::env::var("CLI_BRIDGE_CONFIG").ok())
        .map(PathBuf::from);
    let project_path = args.next().map(PathBuf::from);

    let config = BridgeConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    resilience::init_logging(Some(config.logging.clone()))?;

    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(CommandLauncher::new()))?);
    let session_id = resilience::new_correlation_id();
    let mut stream = orchestrator
        .start_session(&session_id, project_path)
        .await
        .context("failed to start session")?;

    info!(session_id = %session_id, "Session ready, reading input from stdin");

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = input.next_line(), if input_open => match line {
                Ok(Some(text)) => {
                    if let Err(e) = orchestrator.send_message(&session_id, &text).await {
                        warn!(code = e.code(), error = %e, "Message not delivered");
                    }
                }
                Ok(None) => {
                    info!("Input closed, waiting for remaining output");
                    input_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read input");
                    input_open = false;
                }
            },
            item = stream.next_envelope() => match item {
                Some(Ok(envelope)) => println!("{}", serde_json::to_string(&envelope)?),
                Some(Err(e)) => {
                    error!(code = e.code(), error = %e, "Session output ended with an error");
                    println!("{}", serde_json::to_string(&e.to_structured())?);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
