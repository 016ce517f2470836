use async_trait::async_trait;

/// One metered operation, before it is stamped and persisted.
#[derive(Debug, Clone)]
pub struct CostDraft {
    pub operation: String,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub virtual_cost_usd: f64,
    pub metadata: serde_json::Value,
}

/// Where cost records go. The ledger service implements this against the
/// database; tests count or drop them.
#[async_trait]
pub trait CostSink: Send + Sync {
    async fn record(&self, draft: CostDraft);
}

pub struct NoopCostSink;

#[async_trait]
impl CostSink for NoopCostSink {
    async fn record(&self, _draft: CostDraft) {}
}
