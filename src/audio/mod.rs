pub mod assembler;
pub mod backend;
pub mod capture;
pub mod container;
pub mod file;
pub mod format;
pub mod playback;
pub mod queue;

pub use assembler::{AssembledAudio, AudioAssembler};
pub use backend::{AudioFragment, AudioFrame, CaptureConfig, CaptureDevice};
pub use capture::{AudioCaptureSource, FragmentSink};
pub use container::{wav_header, wrap_pcm, WAV_HEADER_LEN};
pub use file::{AudioFile, FileCaptureDevice};
pub use format::AudioFormat;
pub use playback::{AudioOutput, PlaybackItem, PlaybackSink, WavFileOutput};
pub use queue::{FragmentQueue, DEFAULT_QUEUE_CAPACITY};
