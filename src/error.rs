//! Error taxonomy for the voice session engine
//!
//! Capture, recognition and playback errors are reported to observers as
//! events and never cross component boundaries as panics or `?` failures of
//! the session itself. Only transport-level fatal errors end a session.

use std::time::Duration;
use thiserror::Error;

/// Transport and connection failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Recoverable by the caller (retry is the caller's decision)
    #[error("transient connection error: {0}")]
    Transient(String),

    /// The session cannot continue on this transport
    #[error("fatal connection error: {0}")]
    Fatal(String),

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("connection is closed")]
    Closed,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no backends configured")]
    NoBackends,
}

impl ConnectionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

/// Microphone capture failures. All are fatal to capture; text input stays usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no capture device found")]
    DeviceNotFound,

    #[error("capture device is busy")]
    DeviceBusy { retry_hint: Duration },

    #[error("unsupported capture constraints: requested {requested}, supported {supported}")]
    UnsupportedConstraints { requested: String, supported: String },

    #[error("capture device error: {0}")]
    Device(String),
}

impl CaptureError {
    /// Every class ends the current capture attempt. `DeviceBusy` may succeed
    /// on a later, explicit start; see [`CaptureError::retry_hint`].
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// How long to wait before starting again, for errors that may clear
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::DeviceBusy { retry_hint } => Some(*retry_hint),
            _ => None,
        }
    }

    /// Message suitable for showing to the learner
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => {
                "Microphone access was denied. Allow microphone access to talk, or keep typing."
                    .to_string()
            }
            Self::DeviceNotFound => {
                "No microphone was found. Connect a microphone to use voice input.".to_string()
            }
            Self::DeviceBusy { retry_hint } => format!(
                "The microphone is in use by another application. Try again in {} seconds.",
                retry_hint.as_secs().max(1)
            ),
            Self::UnsupportedConstraints {
                requested,
                supported,
            } => format!(
                "Your microphone does not support {}. Supported: {}.",
                requested, supported
            ),
            Self::Device(detail) => format!("The microphone stopped working: {}", detail),
        }
    }
}

/// Speech recognition failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    #[error("no speech detected")]
    NoSpeech,

    #[error("audio capture failed during recognition")]
    AudioCapture,

    #[error("speech recognition not allowed")]
    NotAllowed,

    #[error("recognition device unavailable: {0}")]
    Device(String),

    #[error("recognition engine error: {0}")]
    Engine(String),
}

impl RecognitionError {
    /// Errors the loop recovers from by restarting after the configured delay
    pub fn should_restart(&self) -> bool {
        matches!(self, Self::NoSpeech | Self::AudioCapture)
    }

    /// Errors that stop the loop for good
    pub fn is_fatal(&self) -> bool {
        !self.should_restart()
    }

    /// Stable kind string used in `stt-error` events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoSpeech => "no-speech",
            Self::AudioCapture => "audio-capture",
            Self::NotAllowed => "not-allowed",
            Self::Device(_) => "device",
            Self::Engine(_) => "engine",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::NoSpeech => "No speech was detected. Still listening.".to_string(),
            Self::AudioCapture => "Audio capture hiccup. Listening again shortly.".to_string(),
            Self::NotAllowed => {
                "Speech recognition is not allowed. Enable it in your settings to speak."
                    .to_string()
            }
            Self::Device(detail) => format!("Speech recognition device failed: {}", detail),
            Self::Engine(detail) => format!("Speech recognition stopped: {}", detail),
        }
    }
}

/// Playback failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Fatal for that turn's audio; the text transcript is unaffected
    #[error("failed to decode audio: {0}")]
    DecodeFailure(String),

    /// Recoverable through an explicit user gesture (`enable_audio`)
    #[error("autoplay blocked by platform policy")]
    AutoplayBlocked,

    #[error("audio output error: {0}")]
    Output(String),
}

impl PlaybackError {
    /// Everything except a blocked autoplay loses the item
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AutoplayBlocked)
    }
}

/// Inbound frames that could not be interpreted. Logged and dropped.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
}
