// WebSocket transport to a hosted model backend
//
// One connection carries JSON frames both ways. Reading and writing run as
// separate tasks bridged to the session through a `TransportLink`.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, error, info, warn};

use super::backend::{Backend, Credentials, OutboundMessage, TransportEvent, TransportLink};
use crate::error::ConnectionError;
use crate::session::SessionConfig;

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

pub struct WebSocketBackend {
    name: String,
    /// Overrides `SessionConfig::transport_endpoint` when set
    endpoint: Option<String>,
    connect_timeout: Duration,
}

impl WebSocketBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn build_request(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<tungstenite::handshake::client::Request, ConnectionError> {
        let url = match &credentials.api_key {
            Some(key) => {
                let sep = if endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", endpoint, sep, key)
            }
            None => endpoint.to_string(),
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectionError::Fatal(format!("invalid endpoint {}: {}", endpoint, e)))?;

        if let Some(token) = &credentials.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ConnectionError::Auth(format!("invalid bearer token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }
}

fn classify_connect_error(err: tungstenite::Error) -> ConnectionError {
    match &err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            if code == 401 || code == 403 {
                ConnectionError::Auth(format!("handshake rejected with {}", code))
            } else if resp.status().is_server_error() {
                ConnectionError::Transient(format!("handshake failed with {}", code))
            } else {
                ConnectionError::Fatal(format!("handshake failed with {}", code))
            }
        }
        tungstenite::Error::Url(_) => ConnectionError::Fatal(err.to_string()),
        _ => ConnectionError::Transient(err.to_string()),
    }
}

#[async_trait::async_trait]
impl Backend for WebSocketBackend {
    async fn connect(
        &self,
        config: &SessionConfig,
        credentials: &Credentials,
    ) -> Result<TransportLink, ConnectionError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .unwrap_or(&config.transport_endpoint);

        info!("Connecting to {} at {}", self.name, endpoint);

        let request = self.build_request(endpoint, credentials)?;

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ConnectionError::Timeout {
                operation: "connect",
                after: self.connect_timeout,
            })?
            .map_err(classify_connect_error)?;

        info!("Connected to {} successfully", self.name);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(INBOUND_CAPACITY);

        let _ = in_tx.send(TransportEvent::Open).await;

        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match msg {
                    OutboundMessage::Frame(json) => {
                        debug!("ws -> {} bytes", json.len());
                        if let Err(e) = ws_tx.send(tungstenite::Message::Text(json)).await {
                            error!("WebSocket send failed: {}", e);
                            let _ = writer_events
                                .send(TransportEvent::Error(ConnectionError::Fatal(e.to_string())))
                                .await;
                            break;
                        }
                    }
                    OutboundMessage::Close(reason) => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.into(),
                        };
                        if let Err(e) = ws_tx.send(tungstenite::Message::Close(Some(frame))).await {
                            debug!("Close frame not delivered: {}", e);
                        }
                        break;
                    }
                }
            }
            let _ = ws_tx.close().await;
            debug!("WebSocket writer finished");
        });

        tokio::spawn(async move {
            let mut close_reason = None;

            while let Some(msg) = ws_rx.next().await {
                let event = match msg {
                    Ok(tungstenite::Message::Text(text)) => TransportEvent::Message(text),
                    Ok(tungstenite::Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(tungstenite::Message::Close(frame)) => {
                        close_reason = Some(
                            frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by peer".to_string()),
                        );
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        error!("WebSocket receive failed: {}", e);
                        TransportEvent::Error(ConnectionError::Fatal(e.to_string()))
                    }
                };

                let fatal = matches!(event, TransportEvent::Error(_));
                if in_tx.send(event).await.is_err() || fatal {
                    break;
                }
            }

            let reason = close_reason.unwrap_or_else(|| "stream ended".to_string());
            let _ = in_tx.send(TransportEvent::Closed { reason }).await;
            debug!("WebSocket reader finished");
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
