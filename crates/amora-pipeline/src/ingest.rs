//! User send path. Every entry point follows one template inside a single
//! transaction: consume the permit, check ownership, entitlement and quota,
//! insert the message with its conversation patch, and queue the follow-up.
//! Any failure rolls the whole thing back, permit use included.

use amora_db::models::NewMessage;
use amora_db::{outcomes, queries};
use amora_types::api::{SendAudioRequest, SendMediaRequest, SendTextRequest};
use amora_types::models::{Conversation, Message, MessageKind, ReplySnapshot, SEND_SCOPE, Sender};
use chrono::Utc;
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::Pipeline;
use crate::error::{PipelineError, Result};
use crate::permit;
use crate::storage::{user_upload_prefix, validate_key};

const SNAPSHOT_CHARS: usize = 120;

struct Draft {
    permit_id: Uuid,
    kind: MessageKind,
    text: Option<String>,
    media_key: Option<String>,
    duration_ms: Option<i64>,
    reply_to: Option<Uuid>,
}

impl Pipeline {
    pub async fn send_text(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        req: SendTextRequest,
    ) -> Result<Message> {
        let text = self.check_text(Some(req.text), true)?;
        self.ingest(user_id, conversation_id, Draft {
            permit_id: req.permit_id,
            kind: MessageKind::Text,
            text,
            media_key: None,
            duration_ms: None,
            reply_to: req.reply_to,
        })
        .await
    }

    pub async fn send_media(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        req: SendMediaRequest,
    ) -> Result<Message> {
        if !matches!(req.kind, MessageKind::Image | MessageKind::Video) {
            return Err(PipelineError::invalid("media kind must be image or video"));
        }
        let caption = self.check_text(req.caption, false)?;
        self.check_upload(conversation_id, &req.media_key).await?;
        self.ingest(user_id, conversation_id, Draft {
            permit_id: req.permit_id,
            kind: req.kind,
            text: caption,
            media_key: Some(req.media_key),
            duration_ms: None,
            reply_to: None,
        })
        .await
    }

    pub async fn send_audio(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        req: SendAudioRequest,
    ) -> Result<Message> {
        if req.duration_ms.is_some_and(|d| d < 0) {
            return Err(PipelineError::invalid("duration_ms must not be negative"));
        }
        self.check_upload(conversation_id, &req.media_key).await?;
        self.ingest(user_id, conversation_id, Draft {
            permit_id: req.permit_id,
            kind: MessageKind::Audio,
            text: None,
            media_key: Some(req.media_key),
            duration_ms: req.duration_ms,
            reply_to: None,
        })
        .await
    }

    fn check_text(&self, text: Option<String>, required: bool) -> Result<Option<String>> {
        let text = text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        match text {
            None if required => Err(PipelineError::invalid("text must not be empty")),
            Some(t) if t.chars().count() > self.config.max_text_chars => Err(PipelineError::invalid(
                format!("text longer than {} characters", self.config.max_text_chars),
            )),
            other => Ok(other),
        }
    }

    /// The key must be an uploaded object in this conversation's user namespace.
    async fn check_upload(&self, conversation_id: Uuid, media_key: &str) -> Result<()> {
        if validate_key(media_key).is_err() || !media_key.starts_with(&user_upload_prefix(conversation_id)) {
            return Err(PipelineError::invalid("media_key is not an upload of this conversation"));
        }
        match self.store.head(media_key).await? {
            Some(_) => Ok(()),
            None => Err(PipelineError::invalid("media has not been uploaded")),
        }
    }

    async fn ingest(&self, user_id: Uuid, conversation_id: Uuid, draft: Draft) -> Result<Message> {
        let scheduler = self.scheduler.clone();

        let message = self
            .blocking(move |db| {
                db.with_tx(|tx| -> Result<Message> {
                    let now = Utc::now();
                    let permit = permit::consume(tx, draft.permit_id, user_id, SEND_SCOPE, now)?;

                    let conv = queries::get_conversation(tx, conversation_id)?
                        .filter(|c| c.user_id == user_id)
                        .ok_or(PipelineError::NotFound)?;

                    if conv.girl_premium_only && !permit.premium_at_mint {
                        return Err(PipelineError::PremiumRequired);
                    }

                    let spend_text = draft.kind == MessageKind::Text && !permit.premium_at_mint;
                    if spend_text && conv.free_remaining.text <= 0 {
                        return Err(PipelineError::QuotaExhausted);
                    }

                    let reply_to = draft
                        .reply_to
                        .map(|id| reply_snapshot(tx, &conv, id))
                        .transpose()?;

                    let msg = NewMessage {
                        id: Uuid::new_v4(),
                        conversation_id,
                        user_id,
                        sender: Sender::User,
                        kind: draft.kind,
                        text: draft.text,
                        media_key: draft.media_key,
                        duration_ms: draft.duration_ms,
                        reply_to,
                        created_at: now,
                    };
                    outcomes::apply_user_send(tx, &msg, spend_text, permit.premium_at_mint)?;
                    scheduler.after_user_send(tx, msg.kind, conversation_id, msg.id)?;

                    queries::get_message(tx, msg.id)?
                        .ok_or_else(|| {
                            PipelineError::Internal(anyhow::anyhow!("message {} vanished after insert", msg.id))
                        })
                })
            })
            .await?;

        info!(
            "User {} sent {} message {} in conversation {}",
            user_id,
            message.kind.as_str(),
            message.id,
            conversation_id
        );
        Ok(message)
    }
}

/// Frozen copy of a visible message in the same conversation.
fn reply_snapshot(conn: &Connection, conv: &Conversation, message_id: Uuid) -> Result<ReplySnapshot> {
    let target = queries::get_message(conn, message_id)?
        .filter(|m| m.conversation_id == conv.id)
        .filter(|m| conv.cleared_at.is_none_or(|cleared| m.created_at > cleared))
        .ok_or(PipelineError::NotFound)?;

    Ok(ReplySnapshot {
        id: target.id,
        sender: target.sender,
        kind: target.kind,
        text: target.text.map(|t| t.chars().take(SNAPSHOT_CHARS).collect()),
    })
}
