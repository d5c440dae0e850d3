use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

mod config;
mod functions;
mod schema;
mod services;
mod state;
#[cfg(test)]
mod testing;

use config::Config;
use functions::router::{audit_close, run_router};
use functions::watchdog::run_watchdog;
use functions::worker::run_worker;
use schema::{CloseReason, TextPacket};
use services::radio::SharedRadio;
use services::{AuditLog, ConsoleRadio, OllamaClient};
use state::{Ctx, WorkQueue};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        std::env::var("OPERATOR_CONFIG").unwrap_or_else(|_| "operator.toml".to_string());
    let config = Arc::new(Config::load(Path::new(&config_path))?);

    if config.radio.channel_name.trim().is_empty() {
        anyhow::bail!("radio channel name is not configured");
    }

    // failing to bring up the radio is the one fatal condition past config
    let (radio, inbound): (SharedRadio, mpsc::UnboundedReceiver<TextPacket>) =
        match config.radio.device.as_str() {
            "console" => {
                let (radio, inbound) = ConsoleRadio::spawn(config.radio.channel_index);
                (radio, inbound)
            }
            other => anyhow::bail!(
                "no radio driver linked for device {other}; set radio.device = \"console\" \
                 or wire a RadioLink implementation for the hardware"
            ),
        };

    let llm = Arc::new(OllamaClient::new(&config.llm)?);
    let audit = AuditLog::open(Path::new(&config.switchboard.audit_log_path)).await?;

    let (queue, work) = WorkQueue::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Ctx::new(
        config.clone(),
        radio,
        llm,
        audit.clone(),
        queue,
        shutdown_rx,
    );

    audit
        .record(
            "system",
            serde_json::json!({
                "event": "start",
                "device": config.radio.device,
                "channel": config.radio.channel_index,
                "model": config.llm.model,
                "responders": config.responder_ids().len(),
            }),
        )
        .await;
    tracing::info!(
        device = %config.radio.device,
        channel = config.radio.channel_index,
        model = %config.llm.model,
        "operator online"
    );

    let router = tokio::spawn(run_router(ctx.clone(), inbound));
    let worker = tokio::spawn(run_worker(ctx.clone(), work));
    let watchdog = tokio::spawn(run_watchdog(ctx.clone()));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);

    let closed = ctx
        .state
        .lock()
        .await
        .close_all(CloseReason::Shutdown, Utc::now());
    let trace = Uuid::new_v4();
    for session in &closed {
        audit_close(&ctx, trace, session).await;
    }
    audit
        .record(
            "system",
            serde_json::json!({ "event": "shutdown", "closed_sessions": closed.len() }),
        )
        .await;

    let _ = tokio::join!(router, worker, watchdog);
    Ok(())
}
