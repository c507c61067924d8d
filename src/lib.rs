pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod protocol;
pub mod recognition;
pub mod session;
pub mod text;
pub mod turn;

pub use audio::{
    AssembledAudio, AudioAssembler, AudioCaptureSource, AudioFile, AudioFormat, AudioFragment,
    AudioFrame, AudioOutput, CaptureConfig, CaptureDevice, FileCaptureDevice, PlaybackItem,
    PlaybackSink, WavFileOutput,
};
pub use config::Config;
pub use error::{CaptureError, ConnectionError, PlaybackError, ProtocolError, RecognitionError};
pub use events::{EventBus, MessageKind, SessionEvent};
pub use http::{create_router, AppState};
pub use protocol::{
    AuthProvider, Backend, ConnectionState, EnvAuthProvider, SessionConnection,
    StaticAuthProvider, WebSocketBackend,
};
pub use recognition::{
    RecognitionConfig, RecognitionSignal, Recognizer, SpeechRecognitionLoop, TranscriptEvent,
};
pub use session::{Session, SessionBuilder, SessionConfig, SessionStats};
pub use text::TextStreamAggregator;
pub use turn::{TurnState, TurnStateMachine};
