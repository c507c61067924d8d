//! Typed session events delivered to observers (UI, transcript persistence)
//!
//! Every state change of a session is published as one [`SessionEvent`] on the
//! session's [`EventBus`]. Observers subscribe and receive events in publish
//! order; a subscriber that falls behind loses the oldest events rather than
//! slowing the session down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUS_CAPACITY: usize = 256;

/// Kind of content carried by a `message` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    Connected { backend: String },
    Message {
        #[serde(rename = "type")]
        kind: MessageKind,
        /// Full accumulated text for text, the fragment's base64 payload for audio
        content: String,
        is_complete: bool,
    },
    TurnComplete { turn: u64 },
    Interrupted { turn: u64 },

    SttStart,
    SttInterim { transcript: String },
    SttFinal { transcript: String },
    SttEnd,
    SttError { error: String, message: String, fatal: bool },

    TtsStart { text: String },
    TtsEnd,
    TtsError { error: String },

    AudioQueued { message: String },
    AudioStart { turn: u64, bytes: usize },
    AudioEnd { turn: u64 },
    AudioError { error: String },

    CaptureStarted,
    CaptureStopped,
    CaptureError { error: String, message: String },

    Error { error: String },
    Close { reason: String },
}

impl SessionEvent {
    /// Topic name as seen by observers
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Message { .. } => "message",
            Self::TurnComplete { .. } => "turn-complete",
            Self::Interrupted { .. } => "interrupted",
            Self::SttStart => "stt-start",
            Self::SttInterim { .. } => "stt-interim",
            Self::SttFinal { .. } => "stt-final",
            Self::SttEnd => "stt-end",
            Self::SttError { .. } => "stt-error",
            Self::TtsStart { .. } => "tts-start",
            Self::TtsEnd => "tts-end",
            Self::TtsError { .. } => "tts-error",
            Self::AudioQueued { .. } => "audio-queued",
            Self::AudioStart { .. } => "audio-start",
            Self::AudioEnd { .. } => "audio-end",
            Self::AudioError { .. } => "audio-error",
            Self::CaptureStarted => "capture-started",
            Self::CaptureStopped => "capture-stopped",
            Self::CaptureError { .. } => "capture-error",
            Self::Error { .. } => "error",
            Self::Close { .. } => "close",
        }
    }
}

/// Pub/sub fan-out of session events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        debug!("event: {}", event.topic());
        // No subscribers is fine; events are advisory
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
