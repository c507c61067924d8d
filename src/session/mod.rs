//! Conversation session management
//!
//! This module provides the `Session` abstraction that ties together:
//! - The duplex transport to the model backend
//! - Microphone capture and continuous speech recognition
//! - Turn taking, response text aggregation and audio assembly
//! - Playback and teardown of every resource on close

mod config;
mod dispatcher;
mod session;
mod stats;
mod teardown;

pub use config::SessionConfig;
pub use session::{Session, SessionBuilder};
pub use stats::SessionStats;
