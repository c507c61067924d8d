use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::session::SessionConfig;

/// Credentials used to open a transport. Opaque to the session engine.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Supplies credentials for each connection attempt
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    async fn credentials(&self) -> Result<Credentials, ConnectionError>;
}

/// Reads an API key from an environment variable at connect time
pub struct EnvAuthProvider {
    var: String,
}

impl EnvAuthProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait::async_trait]
impl AuthProvider for EnvAuthProvider {
    async fn credentials(&self) -> Result<Credentials, ConnectionError> {
        match std::env::var(&self.var) {
            Ok(key) if !key.trim().is_empty() => Ok(Credentials {
                api_key: Some(key.trim().to_string()),
                bearer_token: None,
            }),
            _ => Err(ConnectionError::Auth(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

/// Fixed credentials, for embedding and tests
pub struct StaticAuthProvider {
    credentials: Credentials,
}

impl StaticAuthProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn anonymous() -> Self {
        Self::new(Credentials::default())
    }
}

#[async_trait::async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn credentials(&self) -> Result<Credentials, ConnectionError> {
        Ok(self.credentials.clone())
    }
}

/// What the session asks the transport to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// A serialized client frame
    Frame(String),
    /// Close the transport with a reason
    Close(String),
}

/// What the transport reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(ConnectionError),
    Closed { reason: String },
}

/// Channel pair connecting a session to an open transport
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// A model backend reachable over a duplex transport
///
/// Sessions hold an ordered list of backends and use the first one that
/// connects.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn connect(
        &self,
        config: &SessionConfig,
        credentials: &Credentials,
    ) -> Result<TransportLink, ConnectionError>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}
