//! The boundary between this crate and the upstream source log.
//!
//! A real implementation would dump the source tables and then tail the
//! binlog (or equivalent change stream), decoding wire events into
//! [`SourceEvent`]s. That decoding is out of scope here: this crate defines
//! only the trait contract a production source would satisfy and the
//! callback shape it drives. `mymy-testkit` supplies a scripted
//! implementation for tests.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mymy_position::Position;
use mymy_schema::{RowsEvent, SourceInfo};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source requires the full binlog row image; current setting is {0}")]
    RowImageNotFull(String),
    #[error("source connection error: {0}")]
    Connection(String),
    #[error("source already closed")]
    Closed,
}

/// A decoded change-stream event, handed to [`SourceCallbacks`] as the source
/// reads past the dump phase.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// The source already re-read the table's current column layout before
    /// raising this — `info` carries the fresh pks/cols a rule should adopt.
    TableChanged(SourceInfo),
    Rows(RowsEvent),
    PositionSynced { position: Position, force: bool },
}

/// Driven by a [`DumpTailSource`] as it produces events. Implemented by the
/// supervisor; kept separate from `DumpTailSource` so the source can be
/// exercised without a live supervisor in tests.
#[async_trait]
pub trait SourceCallbacks: Send + Sync {
    async fn on_event(&self, event: SourceEvent) -> Result<(), SourceError>;
}

/// A source capable of a dump-then-tail handoff from a starting [`Position`].
#[async_trait]
pub trait DumpTailSource: Send + Sync {
    /// Must be satisfied before `run` is called; a source that cannot
    /// guarantee full row images cannot support update/delete replication.
    fn check_full_row_image(&self) -> Result<(), SourceError>;

    /// Runs the dump, then tails the change stream, pushing events to
    /// `callbacks` until `close` is called, `cancel` is signalled (a fatal
    /// handler or sink error observed elsewhere in the pipeline), or a
    /// fatal error occurs here. Implementations must observe `cancel`
    /// between events and stop producing once it fires — a handler error is
    /// fatal to the whole run, not just the row that triggered it.
    async fn run(
        &self,
        from: Position,
        callbacks: &(dyn SourceCallbacks + Send + Sync),
        cancel: CancellationToken,
    ) -> Result<(), SourceError>;

    /// Resolves once the initial dump phase has completed.
    async fn wait_dump_done(&self);

    /// Seconds the source is currently behind the head of the change
    /// stream, for the `mymy_seconds_behind_master` gauge.
    fn delay(&self) -> u32;

    async fn close(&self) -> Result<(), SourceError>;
}

/// A [`DumpTailSource`] that never produces a row event: the dump phase
/// completes immediately and the tail phase idles until closed. Lets a
/// daemon wire up the full supervisor lifecycle — dump/running transitions,
/// checkpoint flush on shutdown — before a production source that actually
/// speaks the wire protocol is plugged in.
pub struct NullSource {
    dump_done: tokio::sync::Notify,
    closed: tokio::sync::Notify,
}

impl NullSource {
    pub fn new() -> Self {
        NullSource {
            dump_done: tokio::sync::Notify::new(),
            closed: tokio::sync::Notify::new(),
        }
    }
}

impl Default for NullSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DumpTailSource for NullSource {
    fn check_full_row_image(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn run(
        &self,
        _from: Position,
        _callbacks: &(dyn SourceCallbacks + Send + Sync),
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        self.dump_done.notify_one();
        tokio::select! {
            _ = self.closed.notified() => {}
            _ = cancel.cancelled() => {}
        }
        Ok(())
    }

    async fn wait_dump_done(&self) {
        self.dump_done.notified().await;
    }

    fn delay(&self) -> u32 {
        0
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.closed.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCallbacks(AtomicUsize);

    #[async_trait]
    impl SourceCallbacks for CountingCallbacks {
        async fn on_event(&self, _event: SourceEvent) -> Result<(), SourceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn callbacks_trait_object_is_invokable() {
        let cb = CountingCallbacks(AtomicUsize::new(0));
        cb.on_event(SourceEvent::TableChanged(SourceInfo {
            schema: "city".into(),
            table: "users".into(),
            pks: vec![],
            cols: vec![],
        }))
        .await
        .unwrap();
        assert_eq!(cb.0.load(Ordering::SeqCst), 1);
    }
}
