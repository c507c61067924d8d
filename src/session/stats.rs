use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::ConnectionState;
use crate::turn::TurnState;

/// Statistics about a conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    /// Backend the transport is connected through
    pub backend: String,

    pub connection_state: ConnectionState,

    pub turn_state: TurnState,

    /// When the session started
    pub started_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Model turns that completed normally
    pub turns_completed: u64,

    /// Model turns discarded by barge-in
    pub turns_interrupted: u64,

    /// Microphone fragments produced / delivered / dropped by the queue
    pub fragments_captured: u64,
    pub fragments_sent: u64,
    pub fragments_dropped: u64,

    /// Inbound frames that could not be interpreted
    pub protocol_errors: u64,

    /// Number of transcript events observed
    pub transcript_events_count: usize,

    /// Times playback was invoked on the output
    pub playback_invocations: u64,
}

/// Counters updated by the dispatcher
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub turns_completed: AtomicU64,
    pub turns_interrupted: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl SessionCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}
