use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scope every send permit is minted for.
pub const SEND_SCOPE: &str = "chat:send";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    /// Kinds that carry an object-storage key.
    pub fn has_media(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "ai" => Some(Self::Ai),
            _ => None,
        }
    }
}

/// Free-tier counters. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRemaining {
    pub text: i64,
    pub media: i64,
    pub audio: i64,
}

/// Recently shown reply asset keys, newest last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSeen {
    #[serde(default)]
    pub image: Vec<String>,
    #[serde(default)]
    pub video: Vec<String>,
    #[serde(default)]
    pub audio: Vec<String>,
}

impl MediaSeen {
    pub fn list(&self, kind: MessageKind) -> &[String] {
        match kind {
            MessageKind::Image => &self.image,
            MessageKind::Video => &self.video,
            MessageKind::Audio => &self.audio,
            MessageKind::Text => &[],
        }
    }

    pub fn most_recent(&self, kind: MessageKind) -> Option<&str> {
        self.list(kind).last().map(String::as_str)
    }

    /// Append `key`, moving it to the end if already present, and drop the
    /// oldest entries beyond `cap`.
    pub fn push(&mut self, kind: MessageKind, key: &str, cap: usize) {
        let list = match kind {
            MessageKind::Image => &mut self.image,
            MessageKind::Video => &mut self.video,
            MessageKind::Audio => &mut self.audio,
            MessageKind::Text => return,
        };
        list.retain(|k| k != key);
        list.push(key.to_string());
        if list.len() > cap {
            let excess = list.len() - cap;
            list.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Companion {
    pub id: Uuid,
    pub name: String,
    pub avatar_key: Option<String>,
    pub voice_id: Option<String>,
    pub persona: String,
    pub premium_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub companion_id: Uuid,
    pub companion_name: String,
    pub companion_avatar_key: Option<String>,
    pub companion_voice_id: Option<String>,
    pub persona: String,
    pub free_remaining: FreeRemaining,
    pub premium_active: bool,
    pub girl_premium_only: bool,
    pub last_message_text: Option<String>,
    pub last_message_kind: Option<MessageKind>,
    pub last_message_sender: Option<Sender>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub heavy_cooldown_until: Option<DateTime<Utc>>,
    pub media_seen: MediaSeen,
    pub cleared_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of the message being replied to, frozen at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub id: Uuid,
    pub sender: Sender,
    pub kind: MessageKind,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub sender: Sender,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub media_key: Option<String>,
    pub duration_ms: Option<i64>,
    pub transcript: Option<String>,
    pub media_summary: Option<String>,
    pub liked_by_user: bool,
    pub liked_by_ai: bool,
    pub ai_error: bool,
    pub reply_to: Option<ReplySnapshot>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub uses_left: i64,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
    pub premium_at_mint: bool,
}

impl Permit {
    pub fn is_valid(&self, scope: &str, now: DateTime<Utc>) -> bool {
        self.uses_left > 0 && now < self.expires_at && self.scope == scope
    }
}

/// Admin-curated reply asset. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: Uuid,
    pub companion_id: Uuid,
    pub kind: MessageKind,
    pub media_key: String,
    pub description: String,
    pub tags: String,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    /// Percentage in `0.0..=100.0`.
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInsight {
    pub message_id: Uuid,
    pub explicit_labels: Vec<Label>,
    pub scene_labels: Vec<Label>,
    pub method: String,
    pub created_at: DateTime<Utc>,
}
