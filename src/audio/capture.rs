use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{AudioFragment, AudioFrame, CaptureConfig, CaptureDevice};
use super::format::AudioFormat;
use super::queue::FragmentQueue;
use crate::error::{CaptureError, ConnectionError};
use crate::events::{EventBus, SessionEvent};

/// Destination for captured fragments (the session transport)
#[async_trait::async_trait]
pub trait FragmentSink: Send + Sync {
    async fn send_audio(&self, fragment: AudioFragment) -> Result<(), ConnectionError>;
}

struct CaptureState {
    device: Box<dyn CaptureDevice>,
    capture_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
}

/// Captures microphone input in fixed windows and forwards encoded fragments
///
/// Capture never waits on the network: completed chunks go into a bounded
/// drop-oldest [`FragmentQueue`] drained by a separate forwarding task.
pub struct AudioCaptureSource {
    config: CaptureConfig,
    state: Mutex<CaptureState>,
    queue: FragmentQueue,
    sink: Arc<dyn FragmentSink>,
    events: EventBus,
    capturing_tx: watch::Sender<bool>,
    fragments_captured: Arc<AtomicU64>,
    fragments_sent: Arc<AtomicU64>,
}

impl AudioCaptureSource {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        config: CaptureConfig,
        queue_capacity: usize,
        sink: Arc<dyn FragmentSink>,
        events: EventBus,
    ) -> Self {
        let (capturing_tx, _) = watch::channel(false);

        info!(
            "Capture source initialized: {} ({}Hz, {}ch, {}ms chunks, queue={})",
            device.name(),
            config.sample_rate,
            config.channels,
            config.chunk_duration_ms,
            queue_capacity
        );

        Self {
            config,
            state: Mutex::new(CaptureState {
                device,
                capture_task: None,
                forward_task: None,
            }),
            queue: FragmentQueue::new(queue_capacity),
            sink,
            events,
            capturing_tx,
            fragments_captured: Arc::new(AtomicU64::new(0)),
            fragments_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start capturing. Returns `Ok(false)` when already capturing.
    pub async fn start(&self) -> Result<bool, CaptureError> {
        let mut state = self.state.lock().await;

        if let Some(task) = &state.capture_task {
            if !task.is_finished() {
                debug!("Capture already running");
                return Ok(false);
            }
        }

        // A previous run ended on its own; release it before reopening
        if state.capture_task.take().is_some() {
            state.device.close().await?;
        }

        if self.queue.is_closed() {
            return Err(CaptureError::Device("capture source shut down".to_string()));
        }

        let frames = match state.device.open(&self.config).await {
            Ok(rx) => rx,
            Err(e) => {
                match e.retry_hint() {
                    Some(hint) => error!(
                        "Failed to open {}: {} (retry in {}ms)",
                        state.device.name(),
                        e,
                        hint.as_millis()
                    ),
                    None => error!("Failed to open {}: {}", state.device.name(), e),
                }
                self.events.publish(SessionEvent::CaptureError {
                    error: e.to_string(),
                    message: e.user_message(),
                });
                return Err(e);
            }
        };

        if state.forward_task.is_none() {
            state.forward_task = Some(self.spawn_forwarder());
        }

        state.capture_task = Some(self.spawn_chunker(frames));
        self.capturing_tx.send_replace(true);
        self.events.publish(SessionEvent::CaptureStarted);

        info!("Audio capture started on {}", state.device.name());
        Ok(true)
    }

    /// Stop capturing and release the device. Returns `Ok(false)` when idle.
    pub async fn stop(&self) -> Result<bool, CaptureError> {
        let mut state = self.state.lock().await;

        let Some(task) = state.capture_task.take() else {
            return Ok(false);
        };

        info!("Stopping audio capture on {}", state.device.name());

        // Closing the device ends the frame stream; the chunker flushes its tail
        let closed = state.device.close().await;
        if let Err(e) = task.await {
            error!("Capture task panicked: {}", e);
        }

        self.capturing_tx.send_replace(false);
        self.events.publish(SessionEvent::CaptureStopped);
        closed.map(|_| true)
    }

    /// Stop capture and the forwarder for good
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!("Capture stop during shutdown failed: {}", e);
        }

        self.queue.close();
        let forward = self.state.lock().await.forward_task.take();
        if let Some(task) = forward {
            if let Err(e) = task.await {
                error!("Forward task panicked: {}", e);
            }
        }
    }

    pub fn is_capturing(&self) -> bool {
        *self.capturing_tx.borrow()
    }

    /// Observe capture activity (true while frames are flowing)
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.capturing_tx.subscribe()
    }

    pub fn fragments_captured(&self) -> u64 {
        self.fragments_captured.load(Ordering::SeqCst)
    }

    pub fn fragments_sent(&self) -> u64 {
        self.fragments_sent.load(Ordering::SeqCst)
    }

    pub fn fragments_dropped(&self) -> u64 {
        self.queue.dropped()
    }

    fn spawn_chunker(&self, mut frames: mpsc::Receiver<AudioFrame>) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let format = self.config.format();
        let per_chunk = self.config.samples_per_chunk().max(1);
        let captured = Arc::clone(&self.fragments_captured);
        let capturing_tx = self.capturing_tx.clone();

        tokio::spawn(async move {
            let mut pending: Vec<i16> = Vec::with_capacity(per_chunk);

            while let Some(frame) = frames.recv().await {
                pending.extend_from_slice(&frame.samples);

                while pending.len() >= per_chunk {
                    let rest = pending.split_off(per_chunk);
                    enqueue(&queue, &pending, &format, &captured);
                    pending = rest;
                }
            }

            // Input ended: send whatever is left so the utterance is complete
            if !pending.is_empty() {
                enqueue(&queue, &pending, &format, &captured);
            }

            capturing_tx.send_replace(false);
            debug!("Capture chunker finished");
        })
    }

    fn spawn_forwarder(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let sink = Arc::clone(&self.sink);
        let sent = Arc::clone(&self.fragments_sent);

        tokio::spawn(async move {
            while let Some(fragment) = queue.pop().await {
                match sink.send_audio(fragment).await {
                    Ok(()) => {
                        sent.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(ConnectionError::Closed) => {
                        debug!("Transport closed, discarding queued audio");
                        queue.clear();
                    }
                    Err(e) => {
                        warn!("Failed to send audio fragment: {}", e);
                    }
                }
            }
            debug!("Audio forwarder finished");
        })
    }
}

fn enqueue(queue: &FragmentQueue, samples: &[i16], format: &AudioFormat, captured: &AtomicU64) {
    queue.push(AudioFragment::from_samples(samples, format));
    let n = captured.fetch_add(1, Ordering::SeqCst) + 1;
    debug!("Captured fragment {} ({} samples)", n, samples.len());
}
