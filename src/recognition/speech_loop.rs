use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::recognizer::{RecognitionSignal, Recognizer, TranscriptEvent};
use crate::error::RecognitionError;
use crate::events::{EventBus, SessionEvent};

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// BCP-47 language tag passed to the engine
    pub language: String,
    /// Delay before restarting after a recoverable error
    pub restart_delay: Duration,
    /// Upper bound on a single engine start
    pub start_timeout: Duration,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            restart_delay: DEFAULT_RESTART_DELAY,
            start_timeout: Duration::from_secs(5),
        }
    }
}

enum RunOutcome {
    Ended,
    Failed(RecognitionError),
    Stopped,
}

struct Run {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Keeps a recognizer listening until explicitly stopped
///
/// - natural end of a run: restart immediately
/// - `no-speech` / `audio-capture`: restart after `restart_delay`
/// - anything else: stop permanently and report a fatal `stt-error`
///
/// Every restart checks the stop flag first so a `stop` racing a pending
/// restart always wins.
pub struct SpeechRecognitionLoop {
    recognizer: Arc<Mutex<Box<dyn Recognizer>>>,
    config: RecognitionConfig,
    events: EventBus,
    transcripts: mpsc::Sender<TranscriptEvent>,
    stopped: Arc<AtomicBool>,
    starts: Arc<AtomicU64>,
    run: Mutex<Option<Run>>,
}

impl SpeechRecognitionLoop {
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        config: RecognitionConfig,
        events: EventBus,
        transcripts: mpsc::Sender<TranscriptEvent>,
    ) -> Self {
        Self {
            recognizer: Arc::new(Mutex::new(recognizer)),
            config,
            events,
            transcripts,
            stopped: Arc::new(AtomicBool::new(true)),
            starts: Arc::new(AtomicU64::new(0)),
            run: Mutex::new(None),
        }
    }

    /// Start listening. Returns `false` if already running.
    pub async fn start(&self) -> bool {
        let mut run = self.run.lock().await;
        if let Some(current) = run.as_ref() {
            if !current.task.is_finished() {
                return false;
            }
        }

        self.stopped.store(false, Ordering::SeqCst);
        let stop = Arc::new(Notify::new());

        let task = tokio::spawn(drive(
            Arc::clone(&self.recognizer),
            self.config.clone(),
            self.events.clone(),
            self.transcripts.clone(),
            Arc::clone(&self.stopped),
            Arc::clone(&self.starts),
            Arc::clone(&stop),
        ));

        *run = Some(Run { stop, task });
        info!("Speech recognition loop started ({})", self.config.language);
        true
    }

    /// Stop listening and cancel any pending restart. Returns `false` if idle.
    pub async fn stop(&self) -> bool {
        self.stopped.store(true, Ordering::SeqCst);

        let Some(run) = self.run.lock().await.take() else {
            return false;
        };
        run.stop.notify_one();

        let bound = self.config.start_timeout + Duration::from_secs(1);
        let mut task = run.task;
        match tokio::time::timeout(bound, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Recognition task panicked: {}", e),
            Err(_) => {
                warn!("Recognition loop did not stop within {}ms, aborting", bound.as_millis());
                task.abort();
            }
        }

        info!("Speech recognition loop stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }

    /// Engine starts performed so far (first start plus restarts)
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }
}

async fn drive(
    recognizer: Arc<Mutex<Box<dyn Recognizer>>>,
    config: RecognitionConfig,
    events: EventBus,
    transcripts: mpsc::Sender<TranscriptEvent>,
    stopped: Arc<AtomicBool>,
    starts: Arc<AtomicU64>,
    stop: Arc<Notify>,
) {
    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }

        let started = {
            let mut engine = recognizer.lock().await;
            tokio::time::timeout(config.start_timeout, engine.start(&config.language)).await
        };
        starts.fetch_add(1, Ordering::SeqCst);

        let outcome = match started {
            Err(_) => RunOutcome::Failed(RecognitionError::Engine(format!(
                "start timed out after {}ms",
                config.start_timeout.as_millis()
            ))),
            Ok(Err(e)) => RunOutcome::Failed(e),
            Ok(Ok(signals)) => {
                events.publish(SessionEvent::SttStart);
                let outcome = listen(signals, &events, &transcripts, &stop).await;
                recognizer.lock().await.stop().await;
                events.publish(SessionEvent::SttEnd);
                outcome
            }
        };

        match outcome {
            RunOutcome::Stopped => break,
            RunOutcome::Ended => {
                debug!("Recognition run ended, restarting");
            }
            RunOutcome::Failed(e) if e.should_restart() => {
                warn!(
                    "Recognition error ({}), restarting in {}ms",
                    e.kind(),
                    config.restart_delay.as_millis()
                );
                events.publish(SessionEvent::SttError {
                    error: e.kind().to_string(),
                    message: e.user_message(),
                    fatal: e.is_fatal(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(config.restart_delay) => {}
                    _ = stop.notified() => break,
                }
            }
            RunOutcome::Failed(e) => {
                error!("Recognition stopped permanently: {}", e);
                stopped.store(true, Ordering::SeqCst);
                events.publish(SessionEvent::SttError {
                    error: e.kind().to_string(),
                    message: e.user_message(),
                    fatal: e.is_fatal(),
                });
                break;
            }
        }
    }
}

async fn listen(
    mut signals: mpsc::Receiver<RecognitionSignal>,
    events: &EventBus,
    transcripts: &mpsc::Sender<TranscriptEvent>,
    stop: &Notify,
) -> RunOutcome {
    loop {
        let signal = tokio::select! {
            signal = signals.recv() => signal,
            _ = stop.notified() => return RunOutcome::Stopped,
        };

        match signal {
            Some(RecognitionSignal::Interim(text)) => {
                events.publish(SessionEvent::SttInterim {
                    transcript: text.clone(),
                });
                let _ = transcripts.send(TranscriptEvent::interim(text)).await;
            }
            Some(RecognitionSignal::Final(text)) => {
                info!("Recognized: {}", text);
                events.publish(SessionEvent::SttFinal {
                    transcript: text.clone(),
                });
                if transcripts.send(TranscriptEvent::final_text(text)).await.is_err() {
                    debug!("Transcript consumer gone");
                }
            }
            Some(RecognitionSignal::Error(e)) => return RunOutcome::Failed(e),
            Some(RecognitionSignal::End) | None => return RunOutcome::Ended,
        }
    }
}
