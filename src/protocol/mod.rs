//! Duplex transport to the model backend
//!
//! - `messages`: outbound and inbound frame shapes
//! - `backend`: the `Backend` seam, credentials, channel link
//! - `websocket`: WebSocket implementation of `Backend`
//! - `connection`: `SessionConnection`, fallback connect and idempotent close

pub mod backend;
pub mod connection;
pub mod messages;
pub mod websocket;

pub use backend::{
    AuthProvider, Backend, Credentials, EnvAuthProvider, OutboundMessage, StaticAuthProvider,
    TransportEvent, TransportLink,
};
pub use connection::{ConnectionState, SessionConnection};
pub use messages::{ClientFrame, ContentPart, InlineData, ServerContent, ServerFrame};
pub use websocket::WebSocketBackend;
