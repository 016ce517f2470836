pub mod catalog;
pub mod client;
pub mod cost;
pub mod pool;

pub use catalog::{Capability, ModelCatalog, ModelHandle, ModelTier};
pub use client::{ChatOutput, GenerationParams, LlmClient, LlmError};
pub use cost::{CostDraft, CostSink, NoopCostSink};
pub use pool::{LlmPool, PoolSettings};
