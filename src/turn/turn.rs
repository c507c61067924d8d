use serde::{Deserialize, Serialize};

use crate::audio::AudioFragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One piece of turn content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    Audio(AudioFragment),
}

impl Part {
    pub fn is_audio(&self) -> bool {
        matches!(self, Part::Audio(_))
    }
}

/// A contiguous unit of conversation content, bounded by completion or interruption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub ordinal: u64,
    pub role: Role,
    pub parts: Vec<Part>,
    pub is_complete: bool,
    pub interrupted: bool,
}

impl Turn {
    pub fn new(ordinal: u64, role: Role) -> Self {
        Self {
            ordinal,
            role,
            parts: Vec::new(),
            is_complete: false,
            interrupted: false,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.is_complete && !self.interrupted
    }

    pub fn has_audio(&self) -> bool {
        self.parts.iter().any(Part::is_audio)
    }

    pub fn audio_part_count(&self) -> usize {
        self.parts.iter().filter(|p| p.is_audio()).count()
    }

    pub fn text_part_count(&self) -> usize {
        self.parts.len() - self.audio_part_count()
    }
}
