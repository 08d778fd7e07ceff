//! Write-side parameter types and row decoding helpers.
//! Read-side rows decode straight into `amora_types::models`.

use amora_types::models::{MessageKind, ReplySnapshot, Sender};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

/// A message about to be inserted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub sender: Sender,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub media_key: Option<String>,
    pub duration_ms: Option<i64>,
    pub reply_to: Option<ReplySnapshot>,
    pub created_at: DateTime<Utc>,
}

/// Which free-tier counter a reply consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCounter {
    Text,
    Media,
    Audio,
}

impl QuotaCounter {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Text => "free_text",
            Self::Media => "free_media",
            Self::Audio => "free_audio",
        }
    }
}

/// Conversation side effects of inserting an AI reply, applied in the same
/// transaction as the insert.
#[derive(Debug, Clone, Default)]
pub struct ReplyEffect {
    /// Counter the reply spends. `None` for premium or text replies.
    pub decrement: Option<QuotaCounter>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Reply asset to record in `media_seen`, with the list cap.
    pub seen: Option<(MessageKind, String, usize)>,
    /// User message the companion liked.
    pub like_message_id: Option<Uuid>,
    /// User message the reply answers; its `ai_error` flag is cleared.
    pub answers_message_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Reply,
    Moderate,
    Transcribe,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Moderate => "moderate",
            Self::Transcribe => "transcribe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reply" => Some(Self::Reply),
            "moderate" => Some(Self::Moderate),
            "transcribe" => Some(Self::Transcribe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: Uuid,
    pub kind: TaskKind,
    pub conversation_id: Uuid,
    pub message_id: Option<Uuid>,
    pub run_at: DateTime<Utc>,
    pub attempts: i64,
}

// -- Decoding helpers --

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, format!("bad uuid '{}': {}", raw, e)))
}

pub(crate) fn get_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, format!("bad uuid '{}': {}", s, e))))
        .transpose()
}

pub(crate) fn get_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(ms_to_dt(row.get(idx)?))
}

pub(crate) fn get_opt_dt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(ms_to_dt))
}

pub(crate) fn get_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<MessageKind> {
    let raw: String = row.get(idx)?;
    MessageKind::parse(&raw).ok_or_else(|| conversion_error(idx, format!("bad kind '{}'", raw)))
}

pub(crate) fn get_opt_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<MessageKind>> {
    Ok(row.get::<_, Option<String>>(idx)?.and_then(|s| MessageKind::parse(&s)))
}

pub(crate) fn get_sender(row: &Row<'_>, idx: usize) -> rusqlite::Result<Sender> {
    let raw: String = row.get(idx)?;
    Sender::parse(&raw).ok_or_else(|| conversion_error(idx, format!("bad sender '{}'", raw)))
}

pub(crate) fn get_json<T: serde::de::DeserializeOwned + Default>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) => serde_json::from_str(&s)
            .map_err(|e| conversion_error(idx, format!("bad json column: {}", e))),
        None => Ok(T::default()),
    }
}
