//! Ring-buffered operational event metrics.
//!
//! Every node records structured events (elections, role changes, client
//! requests, commits, state-machine applies, snapshots) into a bounded
//! in-memory buffer, exported as JSON or CSV through the `/metrics/*`
//! surface. When the buffer is full the oldest events are dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::core::unix_millis;

/// Maximum events kept in the buffer.
const MAX_BUFFER_SIZE: usize = 10_000;

/// One recorded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEvent {
    /// Unix-epoch milliseconds.
    pub timestamp_ms: u64,
    pub node_id: u64,
    /// E.g. "ELECTION_START", "WRITE_REQUEST", "ROLE_CHANGE".
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl MetricsEvent {
    pub fn csv_header() -> &'static str {
        "timestamp_ms,node_id,event_type,term,previous,current,latency_ms,details"
    }

    pub fn to_csv(&self) -> String {
        fn cell<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(|v| v.to_string()).unwrap_or_default()
        }
        format!(
            "{},{},{},{},{},{},{},{}",
            self.timestamp_ms,
            self.node_id,
            self.event_type,
            cell(&self.term),
            cell(&self.previous),
            cell(&self.current),
            cell(&self.latency_ms),
            cell(&self.details),
        )
    }
}

/// Bounded collector of operational events.
pub struct MetricsCollector {
    node_id: u64,
    buffer: Mutex<VecDeque<MetricsEvent>>,
}

/// Shared collector handle.
pub type SharedMetrics = Arc<MetricsCollector>;

impl MetricsCollector {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, event: MetricsEvent) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() >= MAX_BUFFER_SIZE {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    fn event(&self, event_type: &str) -> MetricsEvent {
        MetricsEvent {
            timestamp_ms: unix_millis(),
            node_id: self.node_id,
            event_type: event_type.to_string(),
            term: None,
            previous: None,
            current: None,
            latency_ms: None,
            details: None,
        }
    }

    pub fn record_election_started(&self, term: u64, reason: &str) {
        let mut event = self.event("ELECTION_START");
        event.term = Some(term);
        event.details = Some(reason.to_string());
        self.record(event);
    }

    pub fn record_election_finished(&self, term: u64, outcome: &str) {
        let mut event = self.event("ELECTION_END");
        event.term = Some(term);
        event.details = Some(outcome.to_string());
        self.record(event);
    }

    pub fn record_role_change(&self, previous: &str, current: &str, term: u64) {
        let mut event = self.event("ROLE_CHANGE");
        event.term = Some(term);
        event.previous = Some(previous.to_string());
        event.current = Some(current.to_string());
        self.record(event);
    }

    pub fn record_write_request(&self, key: &str, outcome: &str, latency_ms: u64) {
        let mut event = self.event("WRITE_REQUEST");
        event.previous = Some(key.to_string());
        event.current = Some(outcome.to_string());
        event.latency_ms = Some(latency_ms);
        self.record(event);
    }

    pub fn record_read_request(&self, key: &str, outcome: &str, latency_ms: u64) {
        let mut event = self.event("READ_REQUEST");
        event.previous = Some(key.to_string());
        event.current = Some(outcome.to_string());
        event.latency_ms = Some(latency_ms);
        self.record(event);
    }

    /// A log entry reached the commit index. `latency_ms` is the time
    /// since the entry was accepted into the leader's log, so the event
    /// stream traces each write from PENDING through commit.
    pub fn record_commit(&self, index: u64, term: u64, latency_ms: u64) {
        let mut event = self.event("LOG_COMMIT");
        event.term = Some(term);
        event.latency_ms = Some(latency_ms);
        event.details = Some(format!("index={}", index));
        self.record(event);
    }

    /// A committed entry was applied to the state machine. `latency_ms`
    /// is measured from the entry's acceptance, completing the
    /// PENDING -> committed -> applied trace.
    pub fn record_state_apply(&self, index: u64, term: u64, latency_ms: u64) {
        let mut event = self.event("STATE_MACHINE_APPLY");
        event.term = Some(term);
        event.latency_ms = Some(latency_ms);
        event.details = Some(format!("index={}", index));
        self.record(event);
    }

    pub fn record_snapshot_created(&self, last_included_index: u64, term: u64) {
        let mut event = self.event("SNAPSHOT_CREATED");
        event.term = Some(term);
        event.details = Some(format!("last_included_index={}", last_included_index));
        self.record(event);
    }

    pub fn events(&self) -> Vec<MetricsEvent> {
        self.buffer.lock().unwrap().iter().cloned().collect()
    }

    pub fn export_csv(&self) -> String {
        let buffer = self.buffer.lock().unwrap();
        let mut csv = String::from(MetricsEvent::csv_header());
        csv.push('\n');
        for event in buffer.iter() {
            csv.push_str(&event.to_csv());
            csv.push('\n');
        }
        csv
    }

    pub fn clear(&self) {
        self.buffer.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().unwrap().is_empty()
    }
}

/// Status payload for `/metrics/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsStatus {
    pub buffer_size: usize,
    pub max_size: usize,
}

/// Build the `/metrics/*` router.
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics/events", get(handle_events))
        .route("/metrics/export", get(handle_export))
        .route("/metrics/status", get(handle_status))
        .route("/metrics/clear", delete(handle_clear))
        .with_state(metrics)
}

async fn handle_events(State(metrics): State<SharedMetrics>) -> Json<Vec<MetricsEvent>> {
    Json(metrics.events())
}

async fn handle_export(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"metrics.csv\"",
            ),
        ],
        metrics.export_csv(),
    )
}

async fn handle_status(State(metrics): State<SharedMetrics>) -> Json<MetricsStatus> {
    Json(MetricsStatus {
        buffer_size: metrics.len(),
        max_size: MAX_BUFFER_SIZE,
    })
}

async fn handle_clear(State(metrics): State<SharedMetrics>) -> StatusCode {
    metrics.clear();
    StatusCode::OK
}
