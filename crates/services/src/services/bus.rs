use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures::future::BoxFuture;
use tokio::sync::{RwLock, mpsc};

pub type Handler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, ()> + Send + Sync>;

struct QueuedTask {
    task_type: String,
    payload: serde_json::Value,
}

struct BusInner {
    subscribers: RwLock<HashMap<String, Vec<Handler>>>,
    queue: mpsc::UnboundedSender<QueuedTask>,
}

/// Lightweight pub/sub plus a FIFO background queue.
///
/// Handlers run as detached tasks, concurrently and independently of the
/// publisher; a failing handler cannot affect its siblings. `enqueue` feeds
/// a single background loop that re-publishes each payload on
/// `worker:<task_type>`.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<QueuedTask>();
        let inner = Arc::new(BusInner {
            subscribers: RwLock::new(HashMap::new()),
            queue,
        });
        let worker: Weak<BusInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let Some(bus) = worker.upgrade() else { break };
                tracing::debug!(task_type = %task.task_type, "processing background task");
                bus.publish(&format!("worker:{}", task.task_type), task.payload)
                    .await;
            }
        });
        Self { inner }
    }

    pub async fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let topic = topic.into();
        let handler: Handler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.inner
            .subscribers
            .write()
            .await
            .entry(topic)
            .or_default()
            .push(handler);
    }

    /// Non-blocking; handlers are dispatched as detached tasks.
    pub async fn publish(&self, topic: &str, msg: serde_json::Value) {
        self.inner.publish(topic, msg).await;
    }

    /// Pushes onto the FIFO worker queue.
    pub fn enqueue(&self, task_type: impl Into<String>, payload: serde_json::Value) {
        let task = QueuedTask {
            task_type: task_type.into(),
            payload,
        };
        if self.inner.queue.send(task).is_err() {
            tracing::warn!("bus worker stopped, dropping enqueued task");
        }
    }
}

impl BusInner {
    async fn publish(&self, topic: &str, msg: serde_json::Value) {
        let handlers = self
            .subscribers
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let msg = msg.clone();
            tokio::spawn(async move { handler(msg).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        for name in ["a", "b"] {
            let tx = tx.clone();
            bus.subscribe("workflow:completed", move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(format!("{name}:{}", msg["id"]));
                }
            })
            .await;
        }

        bus.publish("workflow:completed", serde_json::json!({"id": 7}))
            .await;

        let mut got = vec![
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap(),
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec!["a:7".to_string(), "b:7".to_string()]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_affect_others() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();

        bus.subscribe("t", |_| async { panic!("handler died") }).await;
        let tx2 = tx.clone();
        bus.subscribe("t", move |_| {
            let tx = tx2.clone();
            async move {
                let _ = tx.send(1);
            }
        })
        .await;

        bus.publish("t", serde_json::json!({})).await;
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(1));
    }

    #[tokio::test]
    async fn enqueue_republishes_on_worker_topic() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();

        bus.subscribe("worker:reindex", move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        })
        .await;

        bus.enqueue("reindex", serde_json::json!({"project": "p1"}));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got["project"], "p1");
    }
}
