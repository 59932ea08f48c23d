//! Trace span correlation for one run.
//!
//! Every node execution and every HTTP attempt opens a span and closes
//! it with a status. Events from concurrent branches funnel through a
//! single mpsc channel, so there is no shared mutable buffer; an
//! external sink consumes the receiver. A disabled sink drops events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Generate a new span id (short hex form of a v4 uuid).
pub fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Kind of span in the trace stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    TestCase,
    Component,
    Script,
    HttpCall,
    HttpAttempt,
}

/// A span lifecycle event, keyed by run id and node path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    SpanStart {
        run_id: String,
        span_id: String,
        parent_span_id: Option<String>,
        kind: SpanKind,
        /// Slash-separated node path, e.g.
        /// `case checkout/component cart/script add-item`.
        node_path: String,
        started_at: DateTime<Utc>,
    },
    SpanEnd {
        run_id: String,
        span_id: String,
        /// Terminal status label (`PASSED`, `FAILED`, `ERROR`,
        /// `SKIPPED`, or an HTTP status code for attempts).
        status: String,
        duration_ms: u64,
    },
}

/// Clone-able handle that fans span events into the run's channel.
#[derive(Debug, Clone)]
pub struct TraceSink {
    tx: Option<mpsc::UnboundedSender<TraceEvent>>,
}

impl TraceSink {
    /// Sink wired to a channel; the receiver side is handed to the
    /// external tracing consumer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TraceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event. A closed or disabled channel is not an error;
    /// tracing must never fail a run.
    pub fn emit(&self, event: TraceEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn span_start(
        &self,
        run_id: &str,
        span_id: &str,
        parent_span_id: Option<&str>,
        kind: SpanKind,
        node_path: &str,
    ) {
        self.emit(TraceEvent::SpanStart {
            run_id: run_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: parent_span_id.map(|s| s.to_string()),
            kind,
            node_path: node_path.to_string(),
            started_at: Utc::now(),
        });
    }

    pub fn span_end(
        &self,
        run_id: &str,
        span_id: &str,
        status: &str,
        duration_ms: u64,
    ) {
        self.emit(TraceEvent::SpanEnd {
            run_id: run_id.to_string(),
            span_id: span_id.to_string(),
            status: status.to_string(),
            duration_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_ids_are_unique() {
        let a = new_span_id();
        let b = new_span_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn test_events_arrive_in_emit_order() {
        let (sink, mut rx) = TraceSink::channel();
        sink.span_start("r1", "s1", None, SpanKind::Script, "script a");
        sink.span_end("r1", "s1", "PASSED", 5);
        drop(sink);

        match rx.recv().await.unwrap() {
            TraceEvent::SpanStart {
                span_id, node_path, ..
            } => {
                assert_eq!(span_id, "s1");
                assert_eq!(node_path, "script a");
            }
            other => panic!("expected SpanStart, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            TraceEvent::SpanEnd { status, .. } => {
                assert_eq!(status, "PASSED")
            }
            other => panic!("expected SpanEnd, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_disabled_sink_drops_events() {
        let sink = TraceSink::disabled();
        // must not panic or block
        sink.span_start("r1", "s1", None, SpanKind::HttpCall, "p");
        sink.span_end("r1", "s1", "200", 1);
    }

    #[tokio::test]
    async fn test_concurrent_emitters_share_one_channel() {
        let (sink, mut rx) = TraceSink::channel();
        let mut handles = Vec::new();
        for i in 0..8 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                sink.span_end("r1", &format!("s{i}"), "PASSED", 0);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        drop(sink);

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 8);
    }
}
