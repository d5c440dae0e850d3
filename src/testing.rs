//! Shared fixtures for switchboard tests: a capturing radio, a scripted
//! model, a temp audit sink, and zeroed link pacing so tests run fast.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Config;
use crate::schema::TextPacket;
use crate::services::AuditLog;
use crate::services::llm::testing::ScriptedLlm;
use crate::services::radio::testing::MockRadio;
use crate::state::{Ctx, WorkQueue, WorkReceiver};

pub struct TestBed {
    pub ctx: Ctx,
    pub radio: Arc<MockRadio>,
    pub llm: Arc<ScriptedLlm>,
    pub work: WorkReceiver,
    pub audit_path: PathBuf,
    pub shutdown: watch::Sender<bool>,
    pub dir: tempfile::TempDir,
}

/// Defaults with three mapped responders and all pacing zeroed.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.switchboard.chunk_delay_secs = 0;
    config.switchboard.send_spacing_secs = 0;
    config.responders.insert("ems".to_string(), "!ems_node".to_string());
    config.responders.insert("fire".to_string(), "!fire_node".to_string());
    config
        .responders
        .insert("police".to_string(), "!police_node".to_string());
    config
}

pub fn packet(from: &str, text: &str) -> TextPacket {
    TextPacket {
        text: text.to_string(),
        from: from.to_string(),
        channel: 0,
        rx_time: Utc::now(),
    }
}

impl TestBed {
    pub async fn new() -> Self {
        Self::with(test_config(), ScriptedLlm::new(vec![])).await
    }

    pub async fn with(config: Config, llm: ScriptedLlm) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit_path = dir.path().join("audit.jsonl");
        let audit = AuditLog::open(&audit_path).await.expect("audit log");

        let radio = Arc::new(MockRadio::new());
        radio.add_node("!fire_node", "Fire Desk", None);
        radio.add_node("!police_node", "Police Desk", None);
        radio.add_node("!ems_node", "EMS Desk", None);

        let llm = Arc::new(llm);
        let (queue, work) = WorkQueue::new();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let ctx = Ctx::new(
            Arc::new(config),
            radio.clone(),
            llm.clone(),
            audit,
            queue,
            shutdown_rx,
        );

        Self {
            ctx,
            radio,
            llm,
            work,
            audit_path,
            shutdown,
            dir,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Event `type` fields in write order.
    pub fn audit_types(&self) -> Vec<String> {
        let Ok(content) = std::fs::read_to_string(&self.audit_path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|record| record["type"].as_str().map(ToString::to_string))
            .collect()
    }
}
