use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::{AuthProvider, Backend, OutboundMessage, TransportEvent};
use super::messages::ClientFrame;
use crate::audio::{AudioFragment, FragmentSink};
use crate::error::ConnectionError;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Error,
}

/// Owns the outbound half of the session's duplex transport
///
/// Inbound traffic is delivered separately as a stream of [`TransportEvent`]s
/// returned from [`SessionConnection::connect`]. The connection never
/// reconnects on its own.
pub struct SessionConnection {
    backend: String,
    outbound: mpsc::Sender<OutboundMessage>,
    state: Arc<Mutex<ConnectionState>>,
    closed: AtomicBool,
    send_timeout: Duration,
    frames_sent: AtomicU64,
}

impl SessionConnection {
    /// Connect through the first backend in `backends` that accepts.
    ///
    /// Backends are tried in declaration order, each bounded by the
    /// configured connect timeout. The setup frame is sent before returning.
    pub async fn connect(
        backends: &[Arc<dyn Backend>],
        config: &SessionConfig,
        auth: &dyn AuthProvider,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), ConnectionError> {
        if backends.is_empty() {
            return Err(ConnectionError::NoBackends);
        }

        let connect_timeout = config.connect_timeout();
        let credentials = tokio::time::timeout(connect_timeout, auth.credentials())
            .await
            .map_err(|_| ConnectionError::Timeout {
                operation: "credentials",
                after: connect_timeout,
            })??;

        let mut last_err = ConnectionError::NoBackends;

        for backend in backends {
            debug!("Trying backend {}", backend.name());

            let attempt =
                tokio::time::timeout(connect_timeout, backend.connect(config, &credentials)).await;

            let link = match attempt {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    warn!("Backend {} failed: {}", backend.name(), e);
                    last_err = e;
                    continue;
                }
                Err(_) => {
                    warn!(
                        "Backend {} timed out after {}ms",
                        backend.name(),
                        connect_timeout.as_millis()
                    );
                    last_err = ConnectionError::Timeout {
                        operation: "connect",
                        after: connect_timeout,
                    };
                    continue;
                }
            };

            let connection = Self {
                backend: backend.name().to_string(),
                outbound: link.outbound,
                state: Arc::new(Mutex::new(ConnectionState::Connecting)),
                closed: AtomicBool::new(false),
                send_timeout: config.send_timeout(),
                frames_sent: AtomicU64::new(0),
            };

            if let Err(e) = connection.send_frame(&config.setup_frame()).await {
                warn!("Backend {} rejected setup: {}", backend.name(), e);
                last_err = e;
                continue;
            }

            connection.set_state(ConnectionState::Connected);
            info!("Session transport ready via {}", connection.backend);
            return Ok((connection, link.inbound));
        }

        Err(last_err)
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        self.send_frame(&ClientFrame::user_text(text)).await
    }

    pub async fn send_audio(&self, fragment: &AudioFragment) -> Result<(), ConnectionError> {
        self.send_frame(&ClientFrame::audio(fragment)).await
    }

    pub async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let json = frame
            .to_json()
            .map_err(|e| ConnectionError::Fatal(format!("failed to encode frame: {}", e)))?;

        tokio::time::timeout(self.send_timeout, self.outbound.send(OutboundMessage::Frame(json)))
            .await
            .map_err(|_| ConnectionError::Timeout {
                operation: "send",
                after: self.send_timeout,
            })?
            .map_err(|_| ConnectionError::Closed)?;

        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Close the transport. Safe in any state; returns `false` if already closed.
    pub async fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("Closing transport to {}: {}", self.backend, reason);

        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != ConnectionState::Error {
                *state = ConnectionState::Closed;
            }
        }

        let close = OutboundMessage::Close(reason.to_string());
        match tokio::time::timeout(self.send_timeout, self.outbound.send(close)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Transport already gone"),
            Err(_) => warn!("Close frame not accepted within {}ms", self.send_timeout.as_millis()),
        }
        true
    }

    /// Record a fatal transport error
    pub fn mark_error(&self) {
        self.set_state(ConnectionState::Error);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        debug!("Connection state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

#[async_trait::async_trait]
impl FragmentSink for SessionConnection {
    async fn send_audio(&self, fragment: AudioFragment) -> Result<(), ConnectionError> {
        SessionConnection::send_audio(self, &fragment).await
    }
}
