use super::config::SessionConfig;
use super::dispatcher::{Command, Dispatcher, DispatcherInputs};
use super::stats::{SessionCounters, SessionStats};
use super::teardown::Resources;
use crate::audio::{
    AudioCaptureSource, AudioOutput, CaptureConfig, CaptureDevice, FragmentSink, PlaybackSink,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::error::{CaptureError, ConnectionError};
use crate::events::{EventBus, SessionEvent};
use crate::protocol::{AuthProvider, Backend, ConnectionState, SessionConnection, StaticAuthProvider};
use crate::recognition::{RecognitionConfig, Recognizer, SpeechRecognitionLoop, TranscriptEvent};
use crate::turn::TurnState;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const COMMAND_CAPACITY: usize = 32;
const TRANSCRIPT_CAPACITY: usize = 64;

/// A live conversation with the model backend
///
/// Created through [`Session::builder`]. All inbound traffic is handled by a
/// single dispatcher task; the methods here either issue commands to it or
/// act on the session's components directly.
pub struct Session {
    config: SessionConfig,
    resources: Arc<Resources>,
    commands: mpsc::Sender<Command>,
    counters: Arc<SessionCounters>,
    transcript_log: Arc<Mutex<Vec<TranscriptEvent>>>,
    turn_state: watch::Receiver<TurnState>,
    started_at: chrono::DateTime<chrono::Utc>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

pub struct SessionBuilder {
    config: SessionConfig,
    output: Arc<dyn AudioOutput>,
    backends: Vec<Arc<dyn Backend>>,
    auth: Arc<dyn AuthProvider>,
    capture: Option<(Box<dyn CaptureDevice>, CaptureConfig)>,
    queue_capacity: usize,
    recognizer: Option<(Box<dyn Recognizer>, RecognitionConfig)>,
    require_user_gesture: bool,
    speak_text_turns: bool,
    events: Option<EventBus>,
}

impl SessionBuilder {
    /// Add a backend. Backends are tried in the order they were added.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn Backend>>) -> Self {
        self.backends.extend(backends);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn capture_device(mut self, device: Box<dyn CaptureDevice>, config: CaptureConfig) -> Self {
        self.capture = Some((device, config));
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Attach a speech recognizer. Its language is always the session's
    /// `SessionConfig::language`, whatever `config.language` holds.
    pub fn recognizer(mut self, recognizer: Box<dyn Recognizer>, config: RecognitionConfig) -> Self {
        self.recognizer = Some((recognizer, config));
        self
    }

    /// Hold playback until [`Session::enable_audio`] is called
    pub fn require_user_gesture(mut self, required: bool) -> Self {
        self.require_user_gesture = required;
        self
    }

    /// Speak completed text when a turn carried no audio
    pub fn speak_text_turns(mut self, enabled: bool) -> Self {
        self.speak_text_turns = enabled;
        self
    }

    /// Publish on an existing bus, so subscribers can attach before connect
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Connect and start the session
    pub async fn start(self) -> Result<Session, ConnectionError> {
        let config = self.config;
        info!("Starting session: {}", config.session_id);

        let events = self.events.unwrap_or_default();

        let (connection, inbound) =
            SessionConnection::connect(&self.backends, &config, self.auth.as_ref()).await?;
        let connection = Arc::new(connection);

        let capture = self.capture.map(|(device, capture_config)| {
            let sink: Arc<dyn FragmentSink> = connection.clone();
            AudioCaptureSource::new(device, capture_config, self.queue_capacity, sink, events.clone())
        });
        let capture_watch = capture.as_ref().map(|c| c.watch());

        let (transcripts_tx, transcripts_rx) = mpsc::channel(TRANSCRIPT_CAPACITY);
        let recognition = self.recognizer.map(|(recognizer, mut recognition_config)| {
            recognition_config.language = config.language.clone();
            SpeechRecognitionLoop::new(recognizer, recognition_config, events.clone(), transcripts_tx)
        });

        let playback = PlaybackSink::new(self.output, events.clone(), self.require_user_gesture);

        let (resources, shutdown) = Resources::new(
            config.session_id.clone(),
            connection,
            capture,
            recognition,
            playback,
            events,
        );
        let resources = Arc::new(resources);

        let counters = Arc::new(SessionCounters::default());
        let transcript_log = Arc::new(Mutex::new(Vec::new()));
        let (turn_state_tx, turn_state) = watch::channel(TurnState::Idle);
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let dispatcher = Dispatcher::new(
            Arc::clone(&resources),
            Arc::clone(&counters),
            Arc::clone(&transcript_log),
            turn_state_tx,
            self.speak_text_turns,
        );
        let handle = tokio::spawn(dispatcher.run(DispatcherInputs {
            inbound,
            commands: commands_rx,
            transcripts: transcripts_rx,
            capture: capture_watch,
            shutdown,
        }));

        let session = Session {
            config,
            resources,
            commands,
            counters,
            transcript_log,
            turn_state,
            started_at: Utc::now(),
            dispatcher: tokio::sync::Mutex::new(Some(handle)),
        };

        if let Some(recognition) = &session.resources.recognition {
            recognition.start().await;
        }

        if session.config.auto_start_capture {
            if let Err(e) = session.start_capture().await {
                // Text input stays usable without a microphone
                warn!("Auto-start capture failed: {}", e);
            }
        }

        info!("Session {} started", session.config.session_id);
        Ok(session)
    }
}

impl Session {
    pub fn builder(config: SessionConfig, output: Arc<dyn AudioOutput>) -> SessionBuilder {
        SessionBuilder {
            config,
            output,
            backends: Vec::new(),
            auth: Arc::new(StaticAuthProvider::anonymous()),
            capture: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            recognizer: None,
            require_user_gesture: false,
            speak_text_turns: true,
            events: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.resources.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.resources.events.subscribe()
    }

    /// Send a user text message as a complete turn
    pub async fn send_text(&self, text: &str) -> Result<(), ConnectionError> {
        if self.resources.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendText {
                text: text.to_string(),
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Closed)?;

        let bound = self.config.send_timeout() * 2;
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::Timeout {
                operation: "send_text",
                after: bound,
            }),
        }
    }

    /// Start microphone capture. Returns `Ok(false)` when already capturing.
    pub async fn start_capture(&self) -> Result<bool, CaptureError> {
        if self.resources.is_closed() {
            return Err(CaptureError::Device("session is closed".to_string()));
        }
        match &self.resources.capture {
            Some(capture) => capture.start().await,
            None => Err(CaptureError::DeviceNotFound),
        }
    }

    /// Stop microphone capture. Returns `Ok(false)` when not capturing.
    pub async fn stop_capture(&self) -> Result<bool, CaptureError> {
        match &self.resources.capture {
            Some(capture) => capture.stop().await,
            None => Ok(false),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.resources
            .capture
            .as_ref()
            .map(|c| c.is_capturing())
            .unwrap_or(false)
    }

    pub async fn start_recognition(&self) -> bool {
        match &self.resources.recognition {
            Some(recognition) if !self.resources.is_closed() => recognition.start().await,
            _ => false,
        }
    }

    pub async fn stop_recognition(&self) -> bool {
        match &self.resources.recognition {
            Some(recognition) => recognition.stop().await,
            None => false,
        }
    }

    /// User gesture: release queued playback
    pub fn enable_audio(&self) {
        self.resources.playback.enable_audio();
    }

    pub fn stop_playback(&self) {
        self.resources.playback.stop();
    }

    /// Close the session. Idempotent; returns `false` if it was already closed.
    pub async fn close(&self, reason: &str) -> bool {
        let first = self.resources.teardown(reason).await;

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Dispatcher task panicked: {}", e);
            }
        }
        first
    }

    /// Close the session and return its final statistics
    pub async fn end_session(&self, reason: &str) -> SessionStats {
        info!("Ending session: {}", self.config.session_id);
        self.close(reason).await;
        let stats = self.stats();
        info!(
            "Session {} ended: {} turns completed, {} interrupted, {:.1}s",
            stats.session_id, stats.turns_completed, stats.turns_interrupted, stats.duration_secs
        );
        stats
    }

    pub fn is_closed(&self) -> bool {
        self.resources.is_closed()
    }

    pub fn turn_state(&self) -> TurnState {
        *self.turn_state.borrow()
    }

    /// Wait until the turn state machine settles in `state`
    pub async fn wait_for_turn_state(&self, state: TurnState) -> bool {
        let mut rx = self.turn_state.clone();
        let reached = rx.wait_for(|current| *current == state).await.is_ok();
        reached
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.resources.connection.state()
    }

    /// Transcripts observed so far, oldest first
    pub fn transcript(&self) -> Vec<TranscriptEvent> {
        self.transcript_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn stats(&self) -> SessionStats {
        let duration = Utc::now().signed_duration_since(self.started_at);
        let capture = self.resources.capture.as_ref();

        SessionStats {
            session_id: self.config.session_id.clone(),
            backend: self.resources.connection.backend().to_string(),
            connection_state: self.connection_state(),
            turn_state: self.turn_state(),
            started_at: self.started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            turns_completed: SessionCounters::read(&self.counters.turns_completed),
            turns_interrupted: SessionCounters::read(&self.counters.turns_interrupted),
            fragments_captured: capture.map(|c| c.fragments_captured()).unwrap_or(0),
            fragments_sent: capture.map(|c| c.fragments_sent()).unwrap_or(0),
            fragments_dropped: capture.map(|c| c.fragments_dropped()).unwrap_or(0),
            protocol_errors: SessionCounters::read(&self.counters.protocol_errors),
            transcript_events_count: self
                .transcript_log
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .len(),
            playback_invocations: self.resources.playback.invocations(),
        }
    }
}
