use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::audio::{AudioCaptureSource, PlaybackSink};
use crate::events::{EventBus, SessionEvent};
use crate::protocol::SessionConnection;
use crate::recognition::SpeechRecognitionLoop;

/// Everything a live session holds that must be released on close
pub(crate) struct Resources {
    pub session_id: String,
    pub connection: Arc<SessionConnection>,
    pub capture: Option<AudioCaptureSource>,
    pub recognition: Option<SpeechRecognitionLoop>,
    pub playback: PlaybackSink,
    pub events: EventBus,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Resources {
    pub fn new(
        session_id: String,
        connection: Arc<SessionConnection>,
        capture: Option<AudioCaptureSource>,
        recognition: Option<SpeechRecognitionLoop>,
        playback: PlaybackSink,
        events: EventBus,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let resources = Self {
            session_id,
            connection,
            capture,
            recognition,
            playback,
            events,
            closed: AtomicBool::new(false),
            shutdown,
        };
        (resources, shutdown_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release every resource exactly once. Returns `false` if already torn down.
    ///
    /// The dispatcher is signalled first so no inbound frame is handled while
    /// components shut down. Then: capture, recognition, playback, transport.
    /// Observers get a single `close` event after all of them are released.
    pub async fn teardown(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("Tearing down session {}: {}", self.session_id, reason);
        self.shutdown.send_replace(true);

        if let Some(capture) = &self.capture {
            capture.shutdown().await;
        }
        if let Some(recognition) = &self.recognition {
            recognition.stop().await;
        }
        self.playback.close();
        self.connection.close(reason).await;

        self.events.publish(SessionEvent::Close {
            reason: reason.to_string(),
        });

        info!("Session {} closed", self.session_id);
        true
    }
}
