use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::messages::{
    ClientFrame, Content, ContentPart, GenerationConfig, PrebuiltVoiceConfig, Setup, SpeechConfig,
    VoiceConfig,
};

const DEFAULT_TUTOR_INSTRUCTION: &str =
    "You are a patient, encouraging language tutor holding a spoken conversation.";

/// Configuration for one conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unique session identifier (e.g., "conversation-2b1f...")
    pub session_id: String,

    /// WebSocket URL of the model backend
    pub transport_endpoint: String,

    /// Model identifier sent in the setup frame
    pub model_id: String,

    /// Prebuilt voice used for spoken replies
    pub voice_profile: String,

    /// Base tutor instruction; language and level guidance is appended
    pub system_instruction: String,

    /// Language the learner is practicing
    pub target_language: String,

    /// Learner proficiency (e.g., "beginner", "intermediate")
    pub user_level: String,

    /// Start microphone capture as soon as the transport is up
    pub auto_start_capture: bool,

    /// Speech recognition language tag
    pub language: String,

    /// Bound on connecting (per backend attempt)
    pub connect_timeout_ms: u64,

    /// Bound on handing one frame to the transport
    pub send_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("conversation-{}", uuid::Uuid::new_v4()),
            transport_endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent".to_string(),
            model_id: "models/gemini-2.0-flash-exp".to_string(),
            voice_profile: "Puck".to_string(),
            system_instruction: String::new(),
            target_language: "en".to_string(),
            user_level: "beginner".to_string(),
            auto_start_capture: false,
            language: "en-US".to_string(),
            connect_timeout_ms: 10_000,
            send_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    /// Full system instruction including language and level guidance
    pub fn composed_instruction(&self) -> String {
        let base = if self.system_instruction.trim().is_empty() {
            DEFAULT_TUTOR_INSTRUCTION
        } else {
            self.system_instruction.trim()
        };

        format!(
            "{}\nConverse in the language with code '{}'. The learner's level is {}: \
             adapt vocabulary, grammar and speaking pace to it, and gently correct mistakes.",
            base, self.target_language, self.user_level
        )
    }

    /// First frame sent on a fresh transport
    pub fn setup_frame(&self) -> ClientFrame {
        ClientFrame::Setup(Setup {
            model: self.model_id.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice_profile.clone(),
                        },
                    },
                }),
            },
            system_instruction: Some(Content {
                role: None,
                parts: vec![ContentPart::text(self.composed_instruction())],
            }),
        })
    }
}
