//! Continuous speech-to-text with automatic restart
//!
//! The recognizer engine is an external collaborator behind [`Recognizer`];
//! [`SpeechRecognitionLoop`] keeps it listening for the life of a session.

mod recognizer;
mod speech_loop;

pub use recognizer::{RecognitionSignal, Recognizer, TranscriptEvent, TranscriptKind};
pub use speech_loop::{RecognitionConfig, SpeechRecognitionLoop};
