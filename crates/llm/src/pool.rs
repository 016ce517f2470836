use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::{mpsc, oneshot};

use crate::{
    catalog::{ModelCatalog, ModelTier},
    client::{GenerationParams, LlmClient, LlmError, estimate_tokens},
    cost::{CostDraft, CostSink},
};

/// Flat virtual pricing; real billing is out of scope, the ledger only needs
/// a comparable magnitude.
const VIRTUAL_USD_PER_1K_TOKENS: f64 = 0.002;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub tier: ModelTier,
    pub batch_window: Duration,
    pub max_batch: usize,
    pub call_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            tier: ModelTier::Balanced,
            batch_window: Duration::from_millis(50),
            max_batch: 5,
            call_timeout: Duration::from_secs(120),
        }
    }
}

struct QueuedGeneration {
    model: Option<String>,
    prompt: String,
    params: GenerationParams,
    reply: oneshot::Sender<Result<String, LlmError>>,
}

/// Batching front for the inference backend.
///
/// `generate` parks callers on per-request completion handles while a single
/// background worker drains the queue every batch window (or when the batch
/// size cap is hit) and issues the collected requests concurrently. Ordering
/// between callers is not preserved.
pub struct LlmPool {
    client: Arc<LlmClient>,
    catalog: Arc<RwLock<ModelCatalog>>,
    settings: PoolSettings,
    sink: Arc<dyn CostSink>,
    tx: mpsc::UnboundedSender<QueuedGeneration>,
}

fn virtual_cost(tokens: u64) -> f64 {
    tokens as f64 / 1000.0 * VIRTUAL_USD_PER_1K_TOKENS
}

impl LlmPool {
    pub fn new(
        client: LlmClient,
        catalog: ModelCatalog,
        settings: PoolSettings,
        sink: Arc<dyn CostSink>,
    ) -> Self {
        let client = Arc::new(client);
        let catalog = Arc::new(RwLock::new(catalog));
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_batch_worker(
            client.clone(),
            catalog.clone(),
            settings.clone(),
            sink.clone(),
            rx,
        );
        Self {
            client,
            catalog,
            settings,
            sink,
            tx,
        }
    }

    pub fn tier(&self) -> ModelTier {
        self.settings.tier
    }

    pub fn catalog(&self) -> Arc<RwLock<ModelCatalog>> {
        self.catalog.clone()
    }

    /// Queued, batched text generation. With no `model`, the active tier's
    /// primary is used with a one-deep next-in-tier fallback; a pinned model
    /// is honored without fallback.
    pub async fn generate(
        &self,
        prompt: impl Into<String>,
        model: Option<String>,
        params: GenerationParams,
    ) -> Result<String, LlmError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueuedGeneration {
                model,
                prompt: prompt.into(),
                params,
                reply,
            })
            .map_err(|_| LlmError::Unavailable("batch worker stopped".to_string()))?;
        rx.await
            .map_err(|_| LlmError::Unavailable("request dropped by batch worker".to_string()))?
    }

    /// Streaming bypasses the batch queue; chunks arrive as the backend
    /// produces them and dropping the stream cancels the call. One cost
    /// record is emitted when the stream finishes (or is dropped).
    pub async fn stream(
        &self,
        prompt: impl Into<String>,
        model: Option<String>,
        params: GenerationParams,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        let prompt = prompt.into();
        let model = match model {
            Some(model) => model,
            None => {
                let catalog = self
                    .catalog
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                catalog
                    .primary(self.settings.tier)
                    .map(|m| m.id)
                    .ok_or_else(|| {
                        LlmError::Unavailable("no models configured for tier".to_string())
                    })?
            }
        };

        let inner = self.client.chat_stream(&model, &prompt, &params).await?;
        let guard = Arc::new(StreamCostGuard {
            sink: self.sink.clone(),
            model,
            start: Instant::now(),
            tokens_in: estimate_tokens(&prompt),
            tokens_out: Mutex::new(0),
        });
        let mapped = inner.map(move |chunk| {
            if let Ok(text) = &chunk {
                let mut tokens = guard
                    .tokens_out
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *tokens += estimate_tokens(text);
            }
            chunk
        });
        Ok(mapped.boxed())
    }

    /// Reconciles the catalog's loaded flags against the backend tags.
    pub async fn refresh_loaded(&self) -> Result<(), LlmError> {
        let tags = self.client.list_models().await?;
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .mark_loaded_from(&tags);
        Ok(())
    }

    pub async fn pull_model(&self, name: &str) -> Result<(), LlmError> {
        self.client.pull_model(name).await
    }

    pub async fn embeddings(&self, model: &str, input: &str) -> Result<Vec<f32>, LlmError> {
        self.client.embeddings(model, input).await
    }
}

struct StreamCostGuard {
    sink: Arc<dyn CostSink>,
    model: String,
    start: Instant,
    tokens_in: u64,
    tokens_out: Mutex<u64>,
}

impl Drop for StreamCostGuard {
    fn drop(&mut self) {
        let tokens_out = *self
            .tokens_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let draft = CostDraft {
            operation: "llm.stream".to_string(),
            duration_ms: self.start.elapsed().as_millis() as u64,
            tokens_in: self.tokens_in,
            tokens_out,
            virtual_cost_usd: virtual_cost(self.tokens_in + tokens_out),
            metadata: serde_json::json!({ "model": self.model }),
        };
        let sink = self.sink.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { sink.record(draft).await });
        }
    }
}

fn spawn_batch_worker(
    client: Arc<LlmClient>,
    catalog: Arc<RwLock<ModelCatalog>>,
    settings: PoolSettings,
    sink: Arc<dyn CostSink>,
    mut rx: mpsc::UnboundedReceiver<QueuedGeneration>,
) {
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let window = tokio::time::sleep(settings.batch_window);
            tokio::pin!(window);
            while batch.len() < settings.max_batch {
                tokio::select! {
                    _ = &mut window => break,
                    next = rx.recv() => match next {
                        Some(item) => batch.push(item),
                        None => break,
                    },
                }
            }
            tracing::debug!(size = batch.len(), "dispatching generation batch");
            // The backend has no true batch endpoint; queued requests are
            // issued concurrently and each caller gets its own result.
            for item in batch {
                tokio::spawn(execute_queued(
                    client.clone(),
                    catalog.clone(),
                    settings.clone(),
                    sink.clone(),
                    item,
                ));
            }
        }
    });
}

async fn execute_queued(
    client: Arc<LlmClient>,
    catalog: Arc<RwLock<ModelCatalog>>,
    settings: PoolSettings,
    sink: Arc<dyn CostSink>,
    item: QueuedGeneration,
) {
    let attempts: Vec<String> = match &item.model {
        Some(model) => vec![model.clone()],
        None => {
            let catalog = catalog.read().unwrap_or_else(PoisonError::into_inner);
            let mut chain = Vec::with_capacity(2);
            if let Some(primary) = catalog.primary(settings.tier) {
                if let Some(next) = catalog.next_in_tier(settings.tier, &primary.id) {
                    chain.push(next.id);
                }
                chain.insert(0, primary.id);
            }
            chain
        }
    };

    if attempts.is_empty() {
        let _ = item.reply.send(Err(LlmError::Unavailable(
            "no models configured for tier".to_string(),
        )));
        return;
    }

    let mut last_err = None;
    for (index, model) in attempts.iter().enumerate() {
        match attempt_generate(
            &client,
            &sink,
            &settings,
            model,
            &item.prompt,
            &item.params,
            index > 0,
        )
        .await
        {
            Ok(text) => {
                let _ = item.reply.send(Ok(text));
                return;
            }
            Err(err) => {
                tracing::warn!(model, error = %err, "generation attempt failed");
                last_err = Some(err);
            }
        }
    }
    let _ = item.reply.send(Err(last_err.unwrap_or_else(|| {
        LlmError::Unavailable("generation produced no attempts".to_string())
    })));
}

/// One backend attempt; always emits exactly one cost record before
/// returning, success or not.
async fn attempt_generate(
    client: &LlmClient,
    sink: &Arc<dyn CostSink>,
    settings: &PoolSettings,
    model: &str,
    prompt: &str,
    params: &GenerationParams,
    fallback: bool,
) -> Result<String, LlmError> {
    let start = Instant::now();
    let result = match tokio::time::timeout(
        settings.call_timeout,
        client.chat(model, prompt, params),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout),
    };

    let (tokens_in, tokens_out, failed, error) = match &result {
        Ok(output) => (
            output.tokens_in.unwrap_or_else(|| estimate_tokens(prompt)),
            output
                .tokens_out
                .unwrap_or_else(|| estimate_tokens(&output.text)),
            false,
            None,
        ),
        Err(err) => (estimate_tokens(prompt), 0, true, Some(err.to_string())),
    };
    sink.record(CostDraft {
        operation: "llm.generate".to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        tokens_in,
        tokens_out,
        virtual_cost_usd: virtual_cost(tokens_in + tokens_out),
        metadata: serde_json::json!({
            "model": model,
            "failed": failed,
            "fallback": fallback,
            "error": error,
        }),
    })
    .await;

    result.map(|output| output.text)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    use super::*;

    struct CountingSink {
        records: Mutex<Vec<CostDraft>>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(Vec::new()),
            })
        }

        fn drain(&self) -> Vec<CostDraft> {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl CostSink for CountingSink {
        async fn record(&self, draft: CostDraft) {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(draft);
        }
    }

    fn ok_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2}
        })
    }

    fn pool(server: &MockServer, sink: Arc<CountingSink>) -> LlmPool {
        LlmPool::new(
            LlmClient::new(server.uri()).unwrap(),
            ModelCatalog::builtin(),
            PoolSettings {
                batch_window: Duration::from_millis(5),
                ..Default::default()
            },
            sink,
        )
    }

    #[tokio::test]
    async fn falls_back_to_next_in_tier_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(
                serde_json::json!({"model": "qwen2.5-coder:14b"}),
            ))
            .respond_with(ResponseTemplate::new(500).set_body_string("primary down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(
                serde_json::json!({"model": "qwen2.5-coder:7b"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("patched")))
            .mount(&server)
            .await;

        let sink = CountingSink::new();
        let pool = pool(&server, sink.clone());

        let text = pool
            .generate("fix bug", None, GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(text, "patched");

        let records = sink.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].metadata["failed"], serde_json::json!(true));
        assert_eq!(records[1].metadata["failed"], serde_json::json!(false));
        assert_eq!(records[1].metadata["fallback"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn pinned_model_does_not_fall_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let sink = CountingSink::new();
        let pool = pool(&server, sink.clone());

        let err = pool
            .generate(
                "hi",
                Some("glm4:9b".to_string()),
                GenerationParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 500, .. }));
        assert_eq!(sink.drain().len(), 1);
    }

    #[tokio::test]
    async fn stream_yields_chunks_and_records_cost() {
        use futures::StreamExt;

        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"chunk \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"stream\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let sink = CountingSink::new();
        let pool = pool(&server, sink.clone());

        let stream = pool
            .stream("stream me", None, GenerationParams::default())
            .await
            .unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.join(""), "chunk stream");

        // The cost record lands once the stream is dropped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = sink.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, "llm.stream");
        assert_eq!(records[0].tokens_out, 2);
    }

    #[tokio::test]
    async fn concurrent_callers_each_get_their_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("done")))
            .mount(&server)
            .await;

        let sink = CountingSink::new();
        let pool = Arc::new(pool(&server, sink.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.generate("hi", None, GenerationParams::default()).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "done");
        }
        // One record per call (P7), no fallbacks involved.
        assert_eq!(sink.drain().len(), 4);
    }
}
