//! Applies queries and checkpoints the source position, in strict dequeue
//! order, from a single bounded queue.
//!
//! One channel carries both item kinds — a batch of queries and a position
//! checkpoint — because the checkpoint for a batch must never be durable
//! before the batch itself has actually been applied. A single consumer
//! draining a single queue is what keeps that ordering true without extra
//! coordination.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mymy_position::SaveRequest;
use mymy_query::Query;
use mymy_state::{StateError, StateSaver};

/// Bounded queue capacity between the producer (rule dispatch) and this
/// crate's consumer loop.
pub const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink rejected query: {0}")]
    Rejected(String),
}

/// The downstream the executor applies rendered SQL against. Stands in for a
/// real SQL client with its own connection pool and retry policy, which is
/// out of scope here.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn apply(&self, sql: &str, args: &[Value]) -> Result<(), SinkError>;
}

/// A [`Sink`] that discards every query it's handed. Lets a daemon wire up
/// the full apply path before a production SQL client is plugged in.
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn apply(&self, _sql: &str, _args: &[Value]) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("query render error: {0}")]
    Query(#[from] mymy_query::QueryError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("executor queue is closed")]
    Closed,
}

enum ExecutorItem {
    Save(SaveRequest),
    Batch(Vec<Query>),
}

/// Handle the producer side holds. Cloning shares the same underlying queue
/// and consumer task.
#[derive(Clone)]
pub struct ApplyExecutor {
    tx: mpsc::Sender<ExecutorItem>,
    last_synced_at: Arc<AtomicI64>,
}

impl ApplyExecutor {
    /// Spawns the consumer loop and returns a handle plus its join handle.
    /// The loop exits either when every clone of the handle is dropped and
    /// the queue drains, or when `cancel` fires — the latter is what lets a
    /// supervisor awaiting this join handle alongside its producer's run
    /// loop actually observe it resolve once a fatal error elsewhere in the
    /// pipeline cancels the shared token, instead of waiting forever on a
    /// sender that's still open.
    pub fn spawn(
        sink: Arc<dyn Sink>,
        state_saver: Arc<dyn StateSaver>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<Result<(), ExecutorError>>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let last_synced_at = Arc::new(AtomicI64::new(0));

        let handle = tokio::spawn(Self::run(rx, sink, state_saver, last_synced_at.clone(), cancel));

        (ApplyExecutor { tx, last_synced_at }, handle)
    }

    async fn run(
        mut rx: mpsc::Receiver<ExecutorItem>,
        sink: Arc<dyn Sink>,
        state_saver: Arc<dyn StateSaver>,
        last_synced_at: Arc<AtomicI64>,
        cancel: CancellationToken,
    ) -> Result<(), ExecutorError> {
        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = cancel.cancelled() => break,
            };
            let Some(item) = item else { break };

            match item {
                ExecutorItem::Save(req) => {
                    state_saver.save(req.position, req.force)?;
                }
                ExecutorItem::Batch(queries) => {
                    for query in queries {
                        let (sql, args) = query.to_sql()?;
                        sink.apply(&sql, &args).await?;
                    }
                }
            }
            last_synced_at.store(now_unix(), Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn apply_batch(&self, queries: Vec<Query>) -> Result<(), ExecutorError> {
        if queries.is_empty() {
            return Ok(());
        }
        self.tx
            .send(ExecutorItem::Batch(queries))
            .await
            .map_err(|_| ExecutorError::Closed)
    }

    pub async fn save_position(&self, req: SaveRequest) -> Result<(), ExecutorError> {
        self.tx
            .send(ExecutorItem::Save(req))
            .await
            .map_err(|_| ExecutorError::Closed)
    }

    /// Unix timestamp of the last item this executor finished processing, 0
    /// before anything has been applied. Feeds the "synced seconds ago"
    /// gauge.
    pub fn last_synced_at(&self) -> i64 {
        self.last_synced_at.load(Ordering::SeqCst)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
