use crate::audio::{AudioOutput, CaptureConfig, FileCaptureDevice, WavFileOutput};
use crate::error::ConnectionError;
use crate::protocol::{AuthProvider, Backend, StaticAuthProvider};
use crate::recognition::Recognizer;
use crate::session::{Session, SessionConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

type RecognizerFactory = Arc<dyn Fn() -> Box<dyn Recognizer> + Send + Sync>;

/// How new sessions are wired when created over HTTP
pub struct SessionTemplate {
    pub base: SessionConfig,
    pub backends: Vec<Arc<dyn Backend>>,
    pub auth: Arc<dyn AuthProvider>,
    /// Each session plays into its own subdirectory
    pub output_dir: PathBuf,
    pub realtime_output: bool,
    pub retain_output: bool,
    pub require_user_gesture: bool,
    /// WAV file used as the microphone, if any
    pub capture_file: Option<PathBuf>,
    pub capture: CaptureConfig,
    pub queue_capacity: usize,
    pub recognizer: Option<RecognizerFactory>,
    pub recognition: crate::recognition::RecognitionConfig,
}

impl SessionTemplate {
    pub fn new(base: SessionConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            base,
            backends: Vec::new(),
            auth: Arc::new(StaticAuthProvider::anonymous()),
            output_dir: output_dir.into(),
            realtime_output: true,
            retain_output: false,
            require_user_gesture: false,
            capture_file: None,
            capture: CaptureConfig::default(),
            queue_capacity: crate::audio::DEFAULT_QUEUE_CAPACITY,
            recognizer: None,
            recognition: Default::default(),
        }
    }

    pub async fn start(&self, config: SessionConfig) -> Result<Session, ConnectionError> {
        let output = WavFileOutput::new(self.output_dir.join(&config.session_id))
            .map_err(|e| ConnectionError::Fatal(format!("playback output: {}", e)))?
            .with_realtime(self.realtime_output)
            .with_retain(self.retain_output);
        let output: Arc<dyn AudioOutput> = Arc::new(output);

        let mut builder = Session::builder(config, output)
            .backends(self.backends.iter().cloned())
            .auth(Arc::clone(&self.auth))
            .queue_capacity(self.queue_capacity)
            .require_user_gesture(self.require_user_gesture);

        if let Some(path) = &self.capture_file {
            builder = builder.capture_device(
                Box::new(FileCaptureDevice::new(path.clone())),
                self.capture.clone(),
            );
        }
        if let Some(factory) = &self.recognizer {
            builder = builder.recognizer(factory(), self.recognition.clone());
        }

        builder.start().await
    }
}

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Active conversation sessions (session_id → session)
    pub sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    pub template: Arc<SessionTemplate>,
}

impl AppState {
    pub fn new(template: SessionTemplate) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            template: Arc::new(template),
        }
    }
}
