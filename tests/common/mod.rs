// Test doubles shared by the integration tests
//
// - MockBackend: in-memory transport; the test plays the server side
// - RecordingOutput: AudioOutput that records what it was asked to play
// - MockMic: CaptureDevice fed by the test
// - ScriptedRecognizer: Recognizer replaying scripted runs

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use voice_session::audio::{AssembledAudio, AudioFrame, AudioOutput, CaptureConfig, CaptureDevice};
use voice_session::error::{CaptureError, ConnectionError, PlaybackError, RecognitionError};
use voice_session::protocol::{
    Backend, Credentials, OutboundMessage, TransportEvent, TransportLink,
};
use voice_session::recognition::{RecognitionSignal, Recognizer};
use voice_session::{SessionConfig, SessionEvent};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Transport
// ============================================================================

/// Server side of an in-memory transport
pub struct MockServer {
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub inbound: mpsc::Sender<TransportEvent>,
}

impl MockServer {
    /// Next JSON frame the client sent
    pub async fn next_frame(&mut self) -> Result<Value> {
        loop {
            let message = tokio::time::timeout(WAIT, self.outbound.recv())
                .await?
                .ok_or_else(|| anyhow!("client hung up"))?;
            match message {
                OutboundMessage::Frame(json) => return Ok(serde_json::from_str(&json)?),
                OutboundMessage::Close(_) => return Err(anyhow!("client closed")),
            }
        }
    }

    /// Next frame that is not the setup frame or microphone audio
    pub async fn next_content_frame(&mut self) -> Result<Value> {
        loop {
            let frame = self.next_frame().await?;
            if frame.get("clientContent").is_some() {
                return Ok(frame);
            }
        }
    }

    /// Wait for the client's close, skipping any frames before it
    pub async fn expect_close(&mut self) -> Result<String> {
        loop {
            let message = tokio::time::timeout(WAIT, self.outbound.recv())
                .await?
                .ok_or_else(|| anyhow!("client hung up without close"))?;
            if let OutboundMessage::Close(reason) = message {
                return Ok(reason);
            }
        }
    }

    pub async fn send(&self, frame: Value) -> Result<()> {
        self.inbound
            .send(TransportEvent::Message(frame.to_string()))
            .await
            .map_err(|_| anyhow!("session stopped reading"))
    }

    pub async fn send_raw(&self, raw: &str) -> Result<()> {
        self.inbound
            .send(TransportEvent::Message(raw.to_string()))
            .await
            .map_err(|_| anyhow!("session stopped reading"))
    }

    pub async fn send_event(&self, event: TransportEvent) -> Result<()> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| anyhow!("session stopped reading"))
    }
}

pub struct MockBackend {
    name: String,
    failure: Option<ConnectionError>,
    outbound_capacity: usize,
    server: Mutex<Option<MockServer>>,
    pub attempts: AtomicUsize,
    pub last_credentials: Mutex<Option<Credentials>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failure: None,
            outbound_capacity: 256,
            server: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            last_credentials: Mutex::new(None),
        })
    }

    pub fn failing(name: &str, error: ConnectionError) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failure: Some(error),
            outbound_capacity: 256,
            server: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            last_credentials: Mutex::new(None),
        })
    }

    /// A backend whose outbound buffer holds only `capacity` frames until the
    /// test reads them; sends beyond that wait out the send timeout.
    pub fn with_outbound_capacity(name: &str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failure: None,
            outbound_capacity: capacity,
            server: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            last_credentials: Mutex::new(None),
        })
    }

    pub fn take_server(&self) -> Result<MockServer> {
        self.server
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("backend {} was never connected", self.name))
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    async fn connect(
        &self,
        _config: &SessionConfig,
        credentials: &Credentials,
    ) -> Result<TransportLink, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_credentials.lock().unwrap() = Some(credentials.clone());

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        inbound_tx
            .send(TransportEvent::Open)
            .await
            .map_err(|_| ConnectionError::Closed)?;

        *self.server.lock().unwrap() = Some(MockServer {
            outbound: outbound_rx,
            inbound: inbound_tx,
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Server frames
// ============================================================================

pub fn text_part(text: &str) -> Value {
    json!({"serverContent": {"modelTurn": {"parts": [{"text": text}]}}})
}

pub fn audio_part(mime: &str, pcm: &[u8]) -> Value {
    use base64::Engine;
    let data = base64::engine::general_purpose::STANDARD.encode(pcm);
    json!({"serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": mime, "data": data}}]}}})
}

pub fn turn_complete() -> Value {
    json!({"serverContent": {"turnComplete": true}})
}

pub fn interrupted() -> Value {
    json!({"serverContent": {"interrupted": true}})
}

// ============================================================================
// Events
// ============================================================================

/// Collect events until one matches `until` (inclusive)
pub async fn collect_until(
    rx: &mut broadcast::Receiver<SessionEvent>,
    until: impl Fn(&SessionEvent) -> bool,
) -> Result<Vec<SessionEvent>> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .map_err(|_| anyhow!("timed out; saw {:?}", seen))??;
        let done = until(&event);
        seen.push(event);
        if done {
            return Ok(seen);
        }
    }
}

/// Events already delivered, without waiting
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

// ============================================================================
// Playback
// ============================================================================

#[derive(Default)]
pub struct RecordingOutput {
    pub played: Mutex<Vec<AssembledAudio>>,
    pub spoken: Mutex<Vec<String>>,
    pub releases: AtomicUsize,
    /// Remaining plays that fail with AutoplayBlocked
    pub block_autoplay: AtomicUsize,
    pub play_delay: Mutex<Duration>,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let output = Self::default();
        *output.play_delay.lock().unwrap() = delay;
        Arc::new(output)
    }

    pub fn played(&self) -> Vec<AssembledAudio> {
        self.played.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, audio: &AssembledAudio) -> Result<(), PlaybackError> {
        let blocked = self
            .block_autoplay
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blocked {
            return Err(PlaybackError::AutoplayBlocked);
        }

        let delay = *self.play_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.played.lock().unwrap().push(audio.clone());
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<(), PlaybackError> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "recording"
    }
}

// ============================================================================
// Capture
// ============================================================================

#[derive(Clone, Default)]
pub struct MicHandle {
    feeder: Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl MicHandle {
    pub async fn feed(&self, samples: Vec<i16>, sample_rate: u32) -> Result<()> {
        let tx = self
            .feeder
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("microphone not open"))?;
        tx.send(AudioFrame {
            samples,
            sample_rate,
            channels: 1,
            timestamp_ms: 0,
        })
        .await
        .map_err(|_| anyhow!("capture stopped reading"))
    }

    /// Simulate the device ending its stream
    pub fn unplug(&self) {
        self.feeder.lock().unwrap().take();
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.feeder.lock().unwrap().is_some()
    }
}

pub struct MockMic {
    handle: MicHandle,
    failure: Option<CaptureError>,
}

impl MockMic {
    pub fn new() -> (Box<Self>, MicHandle) {
        let handle = MicHandle::default();
        (
            Box::new(Self {
                handle: handle.clone(),
                failure: None,
            }),
            handle,
        )
    }

    pub fn failing(error: CaptureError) -> (Box<Self>, MicHandle) {
        let handle = MicHandle::default();
        (
            Box::new(Self {
                handle: handle.clone(),
                failure: Some(error),
            }),
            handle,
        )
    }
}

#[async_trait::async_trait]
impl CaptureDevice for MockMic {
    async fn open(&mut self, _config: &CaptureConfig) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let mut feeder = self.handle.feeder.lock().unwrap();
        if feeder.is_some() {
            return Err(CaptureError::DeviceBusy {
                retry_hint: Duration::from_millis(100),
            });
        }
        let (tx, rx) = mpsc::channel(64);
        *feeder = Some(tx);
        self.handle.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        if self.handle.feeder.lock().unwrap().take().is_some() {
            self.handle.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    fn name(&self) -> &str {
        "mock-mic"
    }
}

// ============================================================================
// Recognition
// ============================================================================

pub enum Run {
    /// `start` itself fails
    FailStart(RecognitionError),
    /// Deliver these signals, then end the run by dropping the sender
    Signals(Vec<RecognitionSignal>),
}

#[derive(Clone, Default)]
pub struct RecognizerProbe {
    pub starts: Arc<Mutex<Vec<Instant>>>,
    pub languages: Arc<Mutex<Vec<String>>>,
    pub stops: Arc<AtomicUsize>,
}

impl RecognizerProbe {
    pub fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Language of every engine start, in order
    pub fn languages(&self) -> Vec<String> {
        self.languages.lock().unwrap().clone()
    }
}

/// Replays scripted runs; once the script is exhausted it listens silently forever
pub struct ScriptedRecognizer {
    script: VecDeque<Run>,
    probe: RecognizerProbe,
    idle: Option<mpsc::Sender<RecognitionSignal>>,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<Run>) -> (Box<Self>, RecognizerProbe) {
        let probe = RecognizerProbe::default();
        (
            Box::new(Self {
                script: script.into(),
                probe: probe.clone(),
                idle: None,
            }),
            probe,
        )
    }
}

#[async_trait::async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn start(
        &mut self,
        language: &str,
    ) -> Result<mpsc::Receiver<RecognitionSignal>, RecognitionError> {
        self.probe.starts.lock().unwrap().push(Instant::now());
        self.probe.languages.lock().unwrap().push(language.to_string());

        match self.script.pop_front() {
            Some(Run::FailStart(error)) => Err(error),
            Some(Run::Signals(signals)) => {
                let (tx, rx) = mpsc::channel(signals.len().max(1));
                for signal in signals {
                    // Capacity covers the whole run
                    let _ = tx.try_send(signal);
                }
                Ok(rx)
            }
            None => {
                let (tx, rx) = mpsc::channel(1);
                self.idle = Some(tx);
                Ok(rx)
            }
        }
    }

    async fn stop(&mut self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        self.idle = None;
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
