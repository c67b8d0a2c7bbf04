//! Test doubles for exercising the replication pipeline without a live
//! upstream or downstream database.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use mymy_executor::{Sink, SinkError};
use mymy_position::Position;
use mymy_schema::RowsEvent;
use mymy_source::{DumpTailSource, SourceCallbacks, SourceError, SourceEvent};

/// Records every `(sql, args)` pair handed to it, in order. Can be
/// configured to fail on a specific call for retry/error-path tests.
pub struct InMemorySink {
    applied: Mutex<Vec<(String, Vec<Value>)>>,
    fail_at: Option<usize>,
}

impl InMemorySink {
    pub fn new() -> Self {
        InMemorySink {
            applied: Mutex::new(Vec::new()),
            fail_at: None,
        }
    }

    pub fn failing_at(call_index: usize) -> Self {
        InMemorySink {
            applied: Mutex::new(Vec::new()),
            fail_at: Some(call_index),
        }
    }

    pub fn applied(&self) -> Vec<(String, Vec<Value>)> {
        self.applied.lock().unwrap().clone()
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn apply(&self, sql: &str, args: &[Value]) -> Result<(), SinkError> {
        let mut applied = self.applied.lock().unwrap();
        if self.fail_at == Some(applied.len()) {
            return Err(SinkError::Rejected(format!("scripted failure applying: {sql}")));
        }
        applied.push((sql.to_string(), args.to_vec()));
        Ok(())
    }
}

/// One step of a [`ScriptedSource`]'s fixed playback sequence.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(SourceEvent),
    DumpDone,
}

/// A [`DumpTailSource`] that replays a fixed, pre-recorded sequence of
/// events — no network connection, no binlog wire decoding.
pub struct ScriptedSource {
    script: Vec<ScriptStep>,
    dump_done: tokio::sync::Notify,
    delay: std::sync::atomic::AtomicU32,
}

impl ScriptedSource {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        ScriptedSource {
            script,
            dump_done: tokio::sync::Notify::new(),
            delay: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn set_delay(&self, seconds: u32) {
        self.delay.store(seconds, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl DumpTailSource for ScriptedSource {
    fn check_full_row_image(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn run(
        &self,
        _from: Position,
        callbacks: &(dyn SourceCallbacks + Send + Sync),
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        for step in &self.script {
            if cancel.is_cancelled() {
                break;
            }
            match step {
                ScriptStep::Event(event) => callbacks.on_event(event.clone()).await?,
                ScriptStep::DumpDone => self.dump_done.notify_one(),
            }
        }
        Ok(())
    }

    async fn wait_dump_done(&self) {
        self.dump_done.notified().await;
    }

    fn delay(&self) -> u32 {
        self.delay.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Convenience constructor for a [`SourceEvent::Rows`] script step.
pub fn rows_step(event: RowsEvent) -> ScriptStep {
    ScriptStep::Event(SourceEvent::Rows(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mymy_query::Action;
    use mymy_schema::{Column, ColumnType, SourceInfo};
    use serde_json::json;

    struct NullCallbacks;

    #[async_trait]
    impl SourceCallbacks for NullCallbacks {
        async fn on_event(&self, _event: SourceEvent) -> Result<(), SourceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn in_memory_sink_records_applied_queries() {
        let sink = InMemorySink::new();
        sink.apply("INSERT INTO t (id) VALUES (?)", &[json!(1)]).await.unwrap();
        assert_eq!(sink.applied().len(), 1);
    }

    #[tokio::test]
    async fn in_memory_sink_fails_at_configured_call() {
        let sink = InMemorySink::failing_at(1);
        sink.apply("INSERT INTO t (id) VALUES (?)", &[json!(1)]).await.unwrap();
        let err = sink.apply("INSERT INTO t (id) VALUES (?)", &[json!(2)]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn scripted_source_replays_events_in_order() {
        let event = RowsEvent {
            action: Action::Insert,
            source: SourceInfo {
                schema: "city".into(),
                table: "users".into(),
                pks: vec![Column::new(0, "id", ColumnType::Number)],
                cols: vec![],
            },
            rows: vec![vec![json!(1)]],
        };
        let source = ScriptedSource::new(vec![rows_step(event), ScriptStep::DumpDone]);
        source
            .run(Position::zero_binlog(), &NullCallbacks, CancellationToken::new())
            .await
            .unwrap();
        source.wait_dump_done().await;
    }
}
