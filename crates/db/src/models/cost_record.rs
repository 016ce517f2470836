use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// One row per LLM call, tool call, or agent operation (CALT).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct CostRecord {
    pub id: Uuid,
    #[ts(type = "Date")]
    pub recorded_at: DateTime<Utc>,
    pub operation: String,
    pub duration_ms: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub virtual_cost_usd: f64,
    #[ts(type = "unknown")]
    pub metadata: Option<sqlx::types::Json<serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateCostRecord {
    pub operation: String,
    pub duration_ms: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub virtual_cost_usd: f64,
    #[ts(type = "unknown")]
    pub metadata: Option<serde_json::Value>,
}

const SELECT_COLUMNS: &str =
    "id, recorded_at, operation, duration_ms, tokens_in, tokens_out, virtual_cost_usd, metadata";

impl CostRecord {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateCostRecord,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, CostRecord>(&format!(
            "INSERT INTO cost_records (id, recorded_at, operation, duration_ms, tokens_in, \
                 tokens_out, virtual_cost_usd, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(Utc::now())
        .bind(&data.operation)
        .bind(data.duration_ms)
        .bind(data.tokens_in)
        .bind(data.tokens_out)
        .bind(data.virtual_cost_usd)
        .bind(data.metadata.clone().map(sqlx::types::Json))
        .fetch_one(pool)
        .await
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cost_records")
            .fetch_one(pool)
            .await
    }

    pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, CostRecord>(&format!(
            "SELECT {SELECT_COLUMNS} FROM cost_records ORDER BY recorded_at DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::DBService;

    use super::*;

    #[tokio::test]
    async fn append_and_read_back() {
        let db = DBService::new_in_memory().await.unwrap();

        let record = CostRecord::create(
            &db.pool,
            &CreateCostRecord {
                operation: "llm.generate".to_string(),
                duration_ms: 420,
                tokens_in: 12,
                tokens_out: 48,
                virtual_cost_usd: 0.00012,
                metadata: Some(serde_json::json!({"model": "qwen2.5-coder:14b"})),
            },
        )
        .await
        .unwrap();
        assert_eq!(record.operation, "llm.generate");

        assert_eq!(CostRecord::count(&db.pool).await.unwrap(), 1);
        let recent = CostRecord::recent(&db.pool, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(
            recent[0]
                .metadata
                .as_ref()
                .unwrap()
                .0
                .get("model")
                .and_then(|v| v.as_str()),
            Some("qwen2.5-coder:14b")
        );
    }
}
