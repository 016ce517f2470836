use async_trait::async_trait;
use db::{
    DBService,
    models::cost_record::{CostRecord, CreateCostRecord},
};
use llm::{CostDraft, CostSink};

/// Cost And Latency Tracking: append-only persistence for every LLM call,
/// tool call, and agent operation. Aggregation is derived downstream.
#[derive(Clone)]
pub struct CostLedger {
    db: DBService,
}

impl CostLedger {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    pub async fn append(&self, draft: CostDraft) -> Result<CostRecord, sqlx::Error> {
        CostRecord::create(
            &self.db.pool,
            &CreateCostRecord {
                operation: draft.operation,
                duration_ms: draft.duration_ms as i64,
                tokens_in: draft.tokens_in as i64,
                tokens_out: draft.tokens_out as i64,
                virtual_cost_usd: draft.virtual_cost_usd,
                metadata: Some(draft.metadata),
            },
        )
        .await
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<CostRecord>, sqlx::Error> {
        CostRecord::recent(&self.db.pool, limit).await
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        CostRecord::count(&self.db.pool).await
    }
}

#[async_trait]
impl CostSink for CostLedger {
    async fn record(&self, draft: CostDraft) {
        if let Err(err) = self.append(draft).await {
            tracing::error!(error = %err, "failed to append cost record");
        }
    }
}
