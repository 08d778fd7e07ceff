use amora_db::queries;
use amora_types::models::{Conversation, MediaSeen, Message, MessageKind, Sender};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::Pipeline;
use crate::error::{PipelineError, Result};
use crate::storage::{SignedMethod, SignedUrl, extension_for, user_upload_prefix};

/// Largest page `list_messages` returns.
pub const MAX_PAGE: u32 = 200;

/// A pre-authorized upload slot.
#[derive(Debug, Clone)]
pub struct Upload {
    pub media_key: String,
    pub url: SignedUrl,
}

impl Pipeline {
    /// Get or create the user's conversation with a companion.
    pub async fn open_conversation(&self, user_id: Uuid, companion_id: Uuid) -> Result<Conversation> {
        let initial_free = self.config.initial_free;
        let conv = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    if let Some(existing) = queries::find_conversation(conn, user_id, companion_id)? {
                        return Ok(Some(existing));
                    }
                    let Some(companion) = queries::get_companion(conn, companion_id)? else {
                        return Ok(None);
                    };
                    let now = Utc::now();
                    let conv = Conversation {
                        id: Uuid::new_v4(),
                        user_id,
                        companion_id,
                        companion_name: companion.name,
                        companion_avatar_key: companion.avatar_key,
                        companion_voice_id: companion.voice_id,
                        persona: companion.persona,
                        free_remaining: initial_free,
                        premium_active: false,
                        girl_premium_only: companion.premium_only,
                        last_message_text: None,
                        last_message_kind: None,
                        last_message_sender: None,
                        last_message_at: None,
                        heavy_cooldown_until: None,
                        media_seen: MediaSeen::default(),
                        cleared_at: None,
                        created_at: now,
                        updated_at: now,
                    };
                    let created = queries::create_conversation(conn, &conv)?;
                    if created.id == conv.id {
                        info!("Opened conversation {} for user {}", conv.id, user_id);
                    }
                    Ok(Some(created))
                })?
                .ok_or(PipelineError::NotFound)
            })
            .await?;
        Ok(conv)
    }

    /// The conversation, if it belongs to `user_id`.
    pub async fn conversation(&self, user_id: Uuid, conversation_id: Uuid) -> Result<Conversation> {
        self.blocking(move |db| {
            db.get_conversation(conversation_id)?
                .filter(|c| c.user_id == user_id)
                .ok_or(PipelineError::NotFound)
        })
        .await
    }

    /// Hide everything sent so far. Nothing is deleted.
    pub async fn clear_conversation(&self, user_id: Uuid, conversation_id: Uuid) -> Result<()> {
        self.conversation(user_id, conversation_id).await?;
        self.blocking(move |db| {
            Ok(db.with_conn(|conn| queries::clear_conversation(conn, conversation_id, Utc::now()))?)
        })
        .await?;
        info!("Cleared conversation {}", conversation_id);
        Ok(())
    }

    /// Visible messages, newest first.
    pub async fn list_messages(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let conv = self.conversation(user_id, conversation_id).await?;
        let limit = limit.clamp(1, MAX_PAGE);
        self.blocking(move |db| {
            Ok(db.with_conn(|conn| {
                queries::list_messages(conn, conversation_id, conv.cleared_at, before, limit)
            })?)
        })
        .await
    }

    /// Toggle the user's like on one of the companion's messages. Returns the
    /// new state.
    pub async fn toggle_like(&self, user_id: Uuid, conversation_id: Uuid, message_id: Uuid) -> Result<bool> {
        let conv = self.conversation(user_id, conversation_id).await?;
        self.blocking(move |db| {
            let message = db
                .get_message(message_id)?
                .filter(|m| m.conversation_id == conv.id)
                .filter(|m| conv.cleared_at.is_none_or(|cleared| m.created_at > cleared))
                .ok_or(PipelineError::NotFound)?;
            if message.sender != Sender::Ai {
                return Err(PipelineError::invalid("only companion messages can be liked"));
            }
            Ok(db.with_conn(|conn| queries::toggle_user_like(conn, message_id))?)
        })
        .await
    }

    /// Reserve a key in the conversation's upload namespace and sign a PUT for it.
    pub async fn create_upload(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        kind: MessageKind,
        content_type: &str,
    ) -> Result<Upload> {
        let ext = extension_for(kind, content_type).ok_or_else(|| {
            PipelineError::invalid(format!("unsupported {} type '{}'", kind.as_str(), content_type))
        })?;
        self.conversation(user_id, conversation_id).await?;

        let media_key = format!("{}{}.{}", user_upload_prefix(conversation_id), Uuid::new_v4(), ext);
        let url = self.signer.sign(SignedMethod::Put, &media_key, Utc::now());
        Ok(Upload { media_key, url })
    }

    /// Time-boxed download URL for a stored object.
    pub fn media_url(&self, key: &str) -> String {
        self.signer.sign(SignedMethod::Get, key, Utc::now()).url
    }
}
