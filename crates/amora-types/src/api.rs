use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{FreeRemaining, MessageKind, ReplySnapshot, Sender};

// -- JWT Claims --

/// JWT claims issued by the account service. Only `sub` is trusted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Permits --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MintPermitRequest {
    pub challenge_token: String,
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PermitResponse {
    pub permit_id: Uuid,
    pub uses_left: i64,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub scope: String,
    pub premium: bool,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendTextRequest {
    pub permit_id: Uuid,
    pub text: String,
    pub reply_to: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMediaRequest {
    pub permit_id: Uuid,
    pub kind: MessageKind,
    pub media_key: String,
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendAudioRequest {
    pub permit_id: Uuid,
    pub media_key: String,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: Sender,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub media_url: Option<String>,
    pub duration_ms: Option<i64>,
    pub transcript: Option<String>,
    pub liked_by_user: bool,
    pub liked_by_ai: bool,
    pub ai_error: bool,
    pub reply_to: Option<ReplySnapshot>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct LikeResponse {
    pub liked: bool,
}

// -- Conversations --

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub companion_id: Uuid,
    pub companion_name: String,
    pub companion_avatar_url: Option<String>,
    pub free_remaining: FreeRemaining,
    pub premium_active: bool,
    pub premium_only: bool,
    pub last_message_text: Option<String>,
    pub last_message_kind: Option<MessageKind>,
    pub last_message_at: Option<chrono::DateTime<chrono::Utc>>,
    pub heavy_cooldown_until: Option<chrono::DateTime<chrono::Utc>>,
}

// -- Uploads --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUploadRequest {
    pub kind: MessageKind,
    pub content_type: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub media_key: String,
    pub upload_url: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
