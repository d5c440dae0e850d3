use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only JSONL event sink. Holds its own lock, distinct from the state
/// guard, so a slow filesystem can never stall dispatch.
#[derive(Clone)]
pub struct AuditLog {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl AuditLog {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Write one event. `payload` fields are flattened into the record next
    /// to the mandatory `ts` and `type`. Sink errors are logged and dropped;
    /// auditing must never take the switchboard down.
    pub async fn record(&self, kind: &str, payload: serde_json::Value) {
        let mut record = serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "type": kind,
        });
        if let (Some(record_map), Some(payload_map)) = (record.as_object_mut(), payload.as_object())
        {
            for (key, value) in payload_map {
                record_map.insert(key.clone(), value.clone());
            }
        }

        let mut line = record.to_string();
        line.push('\n');

        let mut file = self.file.lock().await;
        // flush per record: tokio file writes complete in the background and
        // an audit line must be durable once `record` returns
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::error!(kind, error = %e, "audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit = AuditLog::open(&path).await.unwrap();

        audit
            .record("rx", serde_json::json!({ "from": "!n1", "text": "!ping" }))
            .await;
        audit.record("system", serde_json::json!({ "event": "start" })).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "rx");
        assert_eq!(first["from"], "!n1");
        assert!(first["ts"].as_str().unwrap().ends_with('Z'));

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "system");
        assert_eq!(second["event"], "start");
    }

    #[tokio::test]
    async fn open_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let first = AuditLog::open(&path).await.unwrap();
        first.record("system", serde_json::json!({})).await;
        drop(first);

        let second = AuditLog::open(&path).await.unwrap();
        second.record("system", serde_json::json!({})).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
