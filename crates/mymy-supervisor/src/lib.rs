//! Lifecycle state machine tying a source, a rule registry, an apply
//! executor and a state saver together into one runnable replication
//! process.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mymy_executor::{ApplyExecutor, ExecutorError};
use mymy_handler::HandlerError;
use mymy_position::{Position, SaveRequest};
use mymy_rules::RuleRegistry;
use mymy_source::{DumpTailSource, SourceCallbacks, SourceError, SourceEvent};
use mymy_state::{StateError, StateSaver};

/// Mirrors the `mymy_state` gauge contract: `Stopped = 0`, `Dumping = 1`,
/// `Running = 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicationState {
    Stopped = 0,
    Dumping = 1,
    Running = 2,
}

impl From<u8> for ReplicationState {
    fn from(v: u8) -> Self {
        match v {
            1 => ReplicationState::Dumping,
            2 => ReplicationState::Running,
            _ => ReplicationState::Stopped,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("unsupported master position: expected a position matching gtid_mode")]
    UnsupportedPosition,
    #[error("apply executor task panicked")]
    ExecutorTaskPanicked,
}

/// Joins every fatal error observed during a run, mirroring upstream's
/// combine-all-fatal-errors behaviour on shutdown.
#[derive(Debug)]
pub struct MultiError(pub Vec<SupervisorError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no errors");
        }
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl MultiError {
    pub fn combine(errors: Vec<SupervisorError>) -> Option<MultiError> {
        if errors.is_empty() {
            None
        } else {
            Some(MultiError(errors))
        }
    }
}

/// Ties a [`DumpTailSource`], a [`RuleRegistry`], an [`ApplyExecutor`] and a
/// [`StateSaver`] into one runnable process.
pub struct Supervisor {
    source: Arc<dyn DumpTailSource>,
    rules: Arc<RuleRegistry>,
    executor: ApplyExecutor,
    state_saver: Arc<dyn StateSaver>,
    gtid_mode: bool,

    state: AtomicU8,
    dumping: AtomicBool,
    running: AtomicBool,
    closed: AtomicBool,

    seconds_behind_master: Arc<AtomicU32>,
    synced_seconds_ago: Arc<AtomicI64>,

    cancel: CancellationToken,
    first_error: std::sync::Mutex<Option<SupervisorError>>,
    exec_handle: tokio::sync::Mutex<Option<JoinHandle<Result<(), ExecutorError>>>>,
}

impl Supervisor {
    /// `cancel` must be the same token passed to the [`ApplyExecutor::spawn`]
    /// call that produced `executor`/`exec_handle` — this supervisor and the
    /// executor task stop on the same signal, whichever observes a fatal
    /// error first.
    pub fn new(
        source: Arc<dyn DumpTailSource>,
        rules: Arc<RuleRegistry>,
        executor: ApplyExecutor,
        exec_handle: JoinHandle<Result<(), ExecutorError>>,
        state_saver: Arc<dyn StateSaver>,
        gtid_mode: bool,
        cancel: CancellationToken,
    ) -> Self {
        Supervisor {
            source,
            rules,
            executor,
            state_saver,
            gtid_mode,
            state: AtomicU8::new(ReplicationState::Stopped as u8),
            dumping: AtomicBool::new(false),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            seconds_behind_master: Arc::new(AtomicU32::new(0)),
            synced_seconds_ago: Arc::new(AtomicI64::new(0)),
            cancel,
            first_error: std::sync::Mutex::new(None),
            exec_handle: tokio::sync::Mutex::new(Some(exec_handle)),
        }
    }

    /// Records the first fatal error seen and signals cancellation. A
    /// handler or sink apply error is fatal to the whole run, not just the
    /// row that triggered it — subsequent calls are no-ops, only the first
    /// error is kept.
    fn record_fatal(&self, error: SupervisorError) {
        let mut slot = self.first_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.cancel.cancel();
    }

    fn set_state(&self, state: ReplicationState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn state(&self) -> ReplicationState {
        ReplicationState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn dumping(&self) -> bool {
        self.dumping.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Seconds behind the head of the source's change stream.
    pub fn delay(&self) -> u32 {
        self.source.delay()
    }

    pub fn seconds_behind_master(&self) -> u32 {
        self.seconds_behind_master.load(Ordering::SeqCst)
    }

    pub fn synced_seconds_ago(&self) -> i64 {
        self.synced_seconds_ago.load(Ordering::SeqCst)
    }

    fn enter_dumping(self: &Arc<Self>) {
        self.dumping.store(true, Ordering::SeqCst);
        self.set_state(ReplicationState::Dumping);
    }

    fn enter_running(self: &Arc<Self>) {
        self.dumping.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.set_state(ReplicationState::Running);
    }

    fn enter_stopped(self: &Arc<Self>) {
        self.dumping.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.set_state(ReplicationState::Stopped);
    }

    fn spawn_observability_tasks(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let lag = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    this.seconds_behind_master.store(this.source.delay(), Ordering::SeqCst);
                }
            })
        };

        let synced = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let synced_at = this.executor.last_synced_at();
                    if synced_at > 0 {
                        let now = now_unix();
                        this.synced_seconds_ago.store(now - synced_at, Ordering::SeqCst);
                    }
                }
            })
        };

        (lag, synced)
    }

    /// Runs the replication process to completion: dumps, tails, and applies
    /// until `close` is called or a fatal error is raised from either the
    /// source's run loop or this supervisor's own dispatch path.
    pub async fn run(self: Arc<Self>) -> Result<(), MultiError> {
        self.enter_dumping();

        let lag_task = self.spawn_observability_tasks();

        let wait_dump = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.source.wait_dump_done().await;
                this.enter_running();
            })
        };

        let pos = self.state_saver.position();
        let expected = if self.gtid_mode {
            Position::empty_gtid()
        } else {
            Position::zero_binlog()
        };
        if !pos.same_variant(&expected) {
            self.enter_stopped();
            return Err(MultiError(vec![SupervisorError::UnsupportedPosition]));
        }

        let exec_handle = self.exec_handle.lock().await.take();
        let source_run = self.source.run(pos, self.as_ref(), self.cancel.clone());
        tokio::pin!(source_run);

        // A fatal handler or sink error cancels `self.cancel` from
        // `on_event`/the executor task; whichever of the producer or the
        // executor notices first wins the race below and cancellation stops
        // the other. Both sides are always awaited to completion so neither
        // task is left dangling.
        if let Some(mut handle) = exec_handle {
            tokio::select! {
                run_result = &mut source_run => {
                    if let Err(e) = run_result {
                        self.record_fatal(SupervisorError::from(e));
                    }
                    self.cancel.cancel();
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => self.record_fatal(SupervisorError::from(e)),
                        Err(_) => self.record_fatal(SupervisorError::ExecutorTaskPanicked),
                    }
                }
                exec_result = &mut handle => {
                    match exec_result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => self.record_fatal(SupervisorError::from(e)),
                        Err(_) => self.record_fatal(SupervisorError::ExecutorTaskPanicked),
                    }
                    self.cancel.cancel();
                    if let Err(e) = (&mut source_run).await {
                        self.record_fatal(SupervisorError::from(e));
                    }
                }
            }
        } else if let Err(e) = source_run.await {
            self.record_fatal(SupervisorError::from(e));
        }

        self.enter_stopped();
        let _ = wait_dump.await;
        lag_task.0.abort();
        lag_task.1.abort();

        let errors = match self.first_error.lock().unwrap().take() {
            Some(e) => vec![e],
            None => Vec::new(),
        };

        match MultiError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Idempotent: the first call signals cancellation, closes the source
    /// and flushes a final checkpoint; subsequent calls are no-ops.
    pub async fn close(&self) -> Result<(), MultiError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();

        let mut errors = Vec::new();
        if let Err(e) = self.source.close().await {
            errors.push(SupervisorError::from(e));
        }
        if let Err(e) = self.state_saver.close() {
            errors.push(SupervisorError::from(e));
        }

        match MultiError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SourceCallbacks for Supervisor {
    async fn on_event(&self, event: SourceEvent) -> Result<(), SourceError> {
        match event {
            SourceEvent::TableChanged(info) => {
                // A table-changed notification for a table with no rule is
                // not fatal — there's nothing registered to refresh.
                let _ = self.rules.refresh(&info.schema, &info.table, info.pks, info.cols);
            }
            SourceEvent::Rows(rows_event) => {
                let queries = self.rules.with_rule_mut(&rows_event.source.schema, &rows_event.source.table, |rule| {
                    rule.handler.on_rows(&rows_event)
                });
                match queries {
                    Some(Ok(queries)) => {
                        if let Err(e) = self.executor.apply_batch(queries).await {
                            self.record_fatal(SupervisorError::from(e));
                        }
                    }
                    Some(Err(e)) => {
                        self.record_fatal(SupervisorError::from(e));
                    }
                    None => {}
                }
            }
            SourceEvent::PositionSynced { position, force } => {
                if let Err(e) = self.executor.save_position(SaveRequest { position, force }).await {
                    self.record_fatal(SupervisorError::from(e));
                }
            }
        }
        Ok(())
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
