//! HTTP API server for external control of conversation sessions
//!
//! - POST /sessions - Connect a new session
//! - GET /sessions/:id - Session status
//! - POST /sessions/:id/text - Send a user text turn
//! - POST /sessions/:id/capture/start, /capture/stop - Microphone control
//! - POST /sessions/:id/audio/enable - User gesture for playback
//! - POST /sessions/:id/end - Close the session
//! - GET /sessions/:id/stats, /transcript - Queries
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::{AppState, SessionTemplate};
