use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// One entry of a workflow's log stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
pub struct LogChunk {
    #[ts(type = "Date")]
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub line: String,
}

impl LogChunk {
    pub fn now(step: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step: step.into(),
            line: line.into(),
        }
    }
}
