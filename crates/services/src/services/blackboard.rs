use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use ts_rs::TS;

/// Shared keyed store for agent coordination. Keys are unique, last write
/// wins, values are opaque JSON. No TTL.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct BlackboardEntry {
    pub key: String,
    #[ts(type = "unknown")]
    pub value: serde_json::Value,
    pub writer_agent: String,
    #[ts(type = "Date")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct Blackboard {
    entries: RwLock<HashMap<String, BlackboardEntry>>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        writer: impl Into<String>,
    ) {
        let key = key.into();
        let entry = BlackboardEntry {
            key: key.clone(),
            value,
            writer_agent: writer.into(),
            timestamp: Utc::now(),
        };
        tracing::debug!(key = %entry.key, writer = %entry.writer_agent, "blackboard write");
        self.entries.write().await.insert(key, entry);
    }

    pub async fn read(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    pub async fn entry(&self, key: &str) -> Option<BlackboardEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, BlackboardEntry> {
        self.entries.read().await.clone()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
