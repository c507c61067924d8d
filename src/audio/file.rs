use anyhow::{Context, Result};
use hound::WavReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::backend::{AudioFrame, CaptureConfig, CaptureDevice};
use crate::error::CaptureError;

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)
            .context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            anyhow::bail!(
                "Expected 16-bit integer PCM, got {}-bit {:?}",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds = samples.len() as f64 /
            (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Convert to the capture format by averaging channels to mono and decimating.
    ///
    /// Only integer downsampling ratios and mono (or unchanged) channel layouts
    /// are supported.
    pub fn convert(&self, sample_rate: u32, channels: u16) -> Result<Vec<i16>, CaptureError> {
        let unsupported = || CaptureError::UnsupportedConstraints {
            requested: format!("{}Hz {}ch", sample_rate, channels),
            supported: format!(
                "{}Hz {}ch or an integer fraction of it in mono",
                self.sample_rate, self.channels
            ),
        };

        if sample_rate == 0 || sample_rate > self.sample_rate || self.sample_rate % sample_rate != 0 {
            return Err(unsupported());
        }
        if channels != self.channels && channels != 1 {
            return Err(unsupported());
        }

        let mono: Vec<i16> = if channels == 1 && self.channels > 1 {
            self.samples
                .chunks(self.channels as usize)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                    (sum / frame.len() as i32) as i16
                })
                .collect()
        } else {
            self.samples.clone()
        };

        let ratio = (self.sample_rate / sample_rate) as usize;
        if ratio == 1 {
            return Ok(mono);
        }

        // Decimate whole frames so interleaving survives
        let frame_len = channels as usize;
        Ok(mono
            .chunks(frame_len)
            .step_by(ratio)
            .flatten()
            .copied()
            .collect())
    }
}

/// Replays a WAV file as if it were a microphone
pub struct FileCaptureDevice {
    path: PathBuf,
    /// Pace frames at real time (false delivers as fast as the consumer reads)
    realtime: bool,
    task: Option<JoinHandle<()>>,
}

impl FileCaptureDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            realtime: true,
            task: None,
        }
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

#[async_trait::async_trait]
impl CaptureDevice for FileCaptureDevice {
    async fn open(
        &mut self,
        config: &CaptureConfig,
    ) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::DeviceBusy {
                retry_hint: Duration::from_secs(1),
            });
        }
        if !self.path.exists() {
            return Err(CaptureError::DeviceNotFound);
        }

        let file = AudioFile::open(&self.path).map_err(|e| CaptureError::Device(e.to_string()))?;
        let samples = file.convert(config.sample_rate, config.channels)?;

        let per_frame = (config.sample_rate as u64 * config.channels as u64
            * config.buffer_duration_ms.max(1)
            / 1000)
            .max(1) as usize;
        let frame_interval = Duration::from_millis(config.buffer_duration_ms.max(1));
        let sample_rate = config.sample_rate;
        let channels = config.channels;
        let realtime = self.realtime;

        let (tx, rx) = mpsc::channel(100);

        info!(
            "File capture started: {} ({}Hz, {}ch, realtime={})",
            self.path.display(),
            sample_rate,
            channels,
            realtime
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frame_interval);
            let mut timestamp_ms = 0u64;

            for chunk in samples.chunks(per_frame) {
                if realtime {
                    interval.tick().await;
                }

                let frame = AudioFrame {
                    samples: chunk.to_vec(),
                    sample_rate,
                    channels,
                    timestamp_ms,
                };
                timestamp_ms += frame.duration_ms();

                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        self.task = Some(task);
        Ok(rx)
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("File capture task failed: {}", e);
                }
            }
            info!("File capture closed: {}", self.path.display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}
