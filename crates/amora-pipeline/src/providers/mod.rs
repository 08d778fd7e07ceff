//! External collaborators the pipeline talks to, behind traits.
//!
//! Each trait has one HTTP implementation here and an in-memory fake in
//! `crate::testing`.

mod challenge;
mod llm;
mod vision;
mod voice;

pub use challenge::TurnstileVerifier;
pub use llm::{LlmChain, OpenAiCompatLlm};
pub use vision::{FfmpegFrameSampler, HttpVisionProvider};
pub use voice::{ElevenLabsTts, OpenAiCompatStt};

use amora_types::models::Label;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One rendered conversation turn sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Chat-completion model. Returns the raw assistant text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String>;
}

/// Human-presence challenge check, consulted once per permit mint.
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<bool>;
}

/// Image moderation and scene labelling.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn explicit_labels(&self, image: Bytes) -> Result<Vec<Label>>;

    async fn scene_labels(&self, image: Bytes) -> Result<Vec<Label>>;
}

/// Pulls one still frame out of a video for moderation.
#[async_trait]
pub trait FrameSampler: Send + Sync {
    async fn sample_frame(&self, video: Bytes) -> Result<Bytes>;
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn transcribe(&self, audio: Bytes, file_name: &str) -> Result<String>;
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Synthesize `text` with `voice_id`, returning mp3 bytes.
    async fn synthesize(&self, voice_id: &str, text: &str) -> Result<Bytes>;
}
