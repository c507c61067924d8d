use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::assembler::AssembledAudio;
use crate::error::PlaybackError;
use crate::events::{EventBus, SessionEvent};

const AUTOPLAY_QUEUED_MESSAGE: &str = "Audio is ready. Tap to enable sound.";

/// Something the sink can play
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackItem {
    /// An assembled WAV container for one model turn
    Audio(AssembledAudio),
    /// Full text of a completed turn, to be spoken
    Speech(String),
}

/// Platform audio output
#[async_trait::async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play a container to completion
    async fn play(&self, audio: &AssembledAudio) -> Result<(), PlaybackError>;

    /// Synthesize and speak text to completion
    async fn speak(&self, text: &str) -> Result<(), PlaybackError>;

    /// Release temporary resources of in-flight playback. Must not defer.
    fn release(&self);

    fn name(&self) -> &str;
}

struct SinkState {
    enabled: bool,
    pending: VecDeque<PlaybackItem>,
    /// Cleared by the worker under the lock when it runs out of work
    running: bool,
    /// Set once by `close`; later items are refused
    closed: bool,
    worker: Option<JoinHandle<()>>,
}

/// Plays assembled audio and completed text, respecting autoplay policy
///
/// Items play one at a time in submission order. While audio is not enabled
/// (the platform requires a user gesture) items are held and an
/// `audio-queued` event is emitted; `enable_audio` releases them.
pub struct PlaybackSink {
    output: Arc<dyn AudioOutput>,
    events: EventBus,
    state: Arc<Mutex<SinkState>>,
    invocations: Arc<AtomicU64>,
}

impl PlaybackSink {
    pub fn new(output: Arc<dyn AudioOutput>, events: EventBus, require_user_gesture: bool) -> Self {
        info!(
            "Playback sink initialized: {} (user gesture required: {})",
            output.name(),
            require_user_gesture
        );

        Self {
            output,
            events,
            state: Arc::new(Mutex::new(SinkState {
                enabled: !require_user_gesture,
                pending: VecDeque::new(),
                running: false,
                closed: false,
                worker: None,
            })),
            invocations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an item. Items submitted after `close` are dropped.
    pub fn play(&self, item: PlaybackItem) {
        let mut state = lock(&self.state);
        if state.closed {
            debug!("Playback closed, dropping item");
            return;
        }
        state.pending.push_back(item);

        if !state.enabled {
            debug!("Autoplay not enabled, queued {} item(s)", state.pending.len());
            self.events.publish(SessionEvent::AudioQueued {
                message: AUTOPLAY_QUEUED_MESSAGE.to_string(),
            });
            return;
        }

        self.ensure_worker(&mut state);
    }

    /// Explicit user gesture: allow playback and drain anything queued
    pub fn enable_audio(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        if !state.enabled {
            info!("Audio playback enabled by user gesture");
        }
        state.enabled = true;
        if !state.pending.is_empty() {
            self.ensure_worker(&mut state);
        }
    }

    /// Cancel in-flight playback, drop queued items, release resources now
    pub fn stop(&self) {
        let (worker, dropped) = {
            let mut state = lock(&self.state);
            let dropped = state.pending.len();
            state.pending.clear();
            state.running = false;
            (state.worker.take(), dropped)
        };

        if let Some(worker) = worker {
            worker.abort();
            debug!("Aborted in-flight playback ({} queued item(s) dropped)", dropped);
        }
        self.output.release();
    }

    /// Stop for good: nothing plays after this returns
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.stop();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.state).running
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Number of times the output was asked to play or speak
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn ensure_worker(&self, state: &mut SinkState) {
        if state.running {
            return;
        }
        state.running = true;

        let output = Arc::clone(&self.output);
        let events = self.events.clone();
        let shared = Arc::clone(&self.state);
        let invocations = Arc::clone(&self.invocations);

        state.worker = Some(tokio::spawn(async move {
            loop {
                let next = {
                    let mut state = lock(&shared);
                    let next = if state.enabled {
                        state.pending.pop_front()
                    } else {
                        None
                    };
                    if next.is_none() {
                        state.running = false;
                    }
                    next
                };
                let Some(item) = next else {
                    break;
                };

                invocations.fetch_add(1, Ordering::SeqCst);
                let outcome = play_item(output.as_ref(), &events, &item).await;
                if matches!(&outcome, Err(e) if !e.is_fatal()) {
                    warn!("Autoplay blocked by platform, waiting for user gesture");
                    let mut state = lock(&shared);
                    state.enabled = false;
                    state.running = false;
                    state.pending.push_front(item);
                    events.publish(SessionEvent::AudioQueued {
                        message: AUTOPLAY_QUEUED_MESSAGE.to_string(),
                    });
                    break;
                }
            }
        }));
    }
}

async fn play_item(
    output: &dyn AudioOutput,
    events: &EventBus,
    item: &PlaybackItem,
) -> Result<(), PlaybackError> {
    match item {
        PlaybackItem::Audio(audio) => {
            events.publish(SessionEvent::AudioStart {
                turn: audio.turn,
                bytes: audio.bytes.len(),
            });
            match output.play(audio).await {
                Ok(()) => {
                    events.publish(SessionEvent::AudioEnd { turn: audio.turn });
                    Ok(())
                }
                Err(PlaybackError::AutoplayBlocked) => Err(PlaybackError::AutoplayBlocked),
                Err(e) => {
                    error!("Playback of turn {} failed: {}", audio.turn, e);
                    events.publish(SessionEvent::AudioError {
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        }
        PlaybackItem::Speech(text) => {
            events.publish(SessionEvent::TtsStart { text: text.clone() });
            match output.speak(text).await {
                Ok(()) => {
                    events.publish(SessionEvent::TtsEnd);
                    Ok(())
                }
                Err(PlaybackError::AutoplayBlocked) => Err(PlaybackError::AutoplayBlocked),
                Err(e) => {
                    error!("Speech synthesis failed: {}", e);
                    events.publish(SessionEvent::TtsError {
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        }
    }
}

fn lock(state: &Mutex<SinkState>) -> std::sync::MutexGuard<'_, SinkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writes each container to a file for the duration of its playback
///
/// The file is the temporary resource: it is deleted when playback finishes
/// and immediately on `release`. With `retain` set, finished files are kept
/// as a recording of the conversation.
pub struct WavFileOutput {
    dir: PathBuf,
    realtime: bool,
    retain: bool,
    current: Mutex<Option<PathBuf>>,
}

impl WavFileOutput {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            realtime: true,
            retain: false,
            current: Mutex::new(None),
        })
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Path of the file currently playing, if any
    pub fn current_file(&self) -> Option<PathBuf> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn take_current(&self) -> Option<PathBuf> {
        self.current.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

#[async_trait::async_trait]
impl AudioOutput for WavFileOutput {
    async fn play(&self, audio: &AssembledAudio) -> Result<(), PlaybackError> {
        // Validate the container the same way a player would
        hound::WavReader::new(std::io::Cursor::new(&audio.bytes))
            .map_err(|e| PlaybackError::DecodeFailure(e.to_string()))?;

        let path = self
            .dir
            .join(format!("turn-{:04}-{}.wav", audio.turn, uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &audio.bytes)
            .await
            .map_err(|e| PlaybackError::Output(format!("{}: {}", path.display(), e)))?;

        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(path.clone());
        info!(
            "Playing turn {} ({:.2}s) via {}",
            audio.turn,
            audio.duration().as_secs_f64(),
            path.display()
        );

        if self.realtime {
            tokio::time::sleep(audio.duration()).await;
        }

        if let Some(done) = self.take_current() {
            if !self.retain {
                if let Err(e) = tokio::fs::remove_file(&done).await {
                    warn!("Failed to remove {}: {}", done.display(), e);
                }
            }
        }
        Ok(())
    }

    async fn speak(&self, text: &str) -> Result<(), PlaybackError> {
        info!("Speaking: {}", text);
        Ok(())
    }

    fn release(&self) {
        if let Some(path) = self.take_current() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to release {}: {}", path.display(), e);
            } else {
                debug!("Released {}", path.display());
            }
        }
    }

    fn name(&self) -> &str {
        "WAV file output"
    }
}
