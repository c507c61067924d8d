use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RecognitionError;

/// What a running recognizer reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionSignal {
    Interim(String),
    Final(String),
    /// Natural end of an utterance or recognition session
    End,
    Error(RecognitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Interim,
    Final,
}

/// A transcript produced by speech recognition. Not persisted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Interim,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            kind: TranscriptKind::Final,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == TranscriptKind::Final
    }
}

/// Speech-to-text engine
///
/// One `start` opens one recognition run; the returned receiver ends (or
/// yields `End`) when the run finishes.
#[async_trait::async_trait]
pub trait Recognizer: Send + Sync {
    async fn start(
        &mut self,
        language: &str,
    ) -> Result<mpsc::Receiver<RecognitionSignal>, RecognitionError>;

    async fn stop(&mut self);

    /// Get engine name for logging
    fn name(&self) -> &str;
}
