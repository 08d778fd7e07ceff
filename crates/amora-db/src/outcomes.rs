//! The only writers of a conversation's denormalized state.
//!
//! Every message insertion goes through `apply_user_send` or `apply_reply`, which
//! insert the row and patch counters, cooldown, `media_seen` and the preview on the
//! same connection the caller's transaction holds. A user send's text counter is
//! clamped at zero; a reply spends its counter only if a unit is left at write
//! time, and is not inserted otherwise.

use amora_types::models::{MediaSeen, MessageKind};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::models::{NewMessage, QuotaCounter, ReplyEffect};

const PREVIEW_CHARS: usize = 120;

fn preview_text(msg: &NewMessage) -> String {
    let text = msg.text.as_deref().map(str::trim).unwrap_or_default();
    if !text.is_empty() {
        return text.chars().take(PREVIEW_CHARS).collect();
    }
    match msg.kind {
        MessageKind::Text => String::new(),
        MessageKind::Image => "[image]".to_string(),
        MessageKind::Video => "[video]".to_string(),
        MessageKind::Audio => "[audio]".to_string(),
    }
}

fn insert_message(conn: &Connection, msg: &NewMessage) -> Result<()> {
    if msg.kind.has_media() != msg.media_key.is_some() {
        anyhow::bail!("media key must be present exactly for media kinds");
    }

    let reply_to = msg.reply_to.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO messages (id, conversation_id, user_id, sender, kind, text, media_key,
                               duration_ms, reply_to, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            msg.id.to_string(),
            msg.conversation_id.to_string(),
            msg.user_id.to_string(),
            msg.sender.as_str(),
            msg.kind.as_str(),
            msg.text,
            msg.media_key,
            msg.duration_ms,
            reply_to,
            msg.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn update_preview(conn: &Connection, msg: &NewMessage) -> Result<()> {
    conn.execute(
        "UPDATE conversations
         SET last_message_text = ?2, last_message_kind = ?3, last_message_sender = ?4,
             last_message_at = ?5, updated_at = ?5
         WHERE id = ?1",
        params![
            msg.conversation_id.to_string(),
            preview_text(msg),
            msg.kind.as_str(),
            msg.sender.as_str(),
            msg.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn decrement(conn: &Connection, conversation_id: Uuid, counter: QuotaCounter) -> Result<()> {
    let column = counter.column();
    let sql = format!(
        "UPDATE conversations SET {col} = MAX({col} - 1, 0) WHERE id = ?1",
        col = column
    );
    conn.execute(&sql, [conversation_id.to_string()])?;
    Ok(())
}

/// Take one unit of `counter` if any is left. Returns whether a unit was taken.
fn try_spend(conn: &Connection, conversation_id: Uuid, counter: QuotaCounter) -> Result<bool> {
    let sql = format!(
        "UPDATE conversations SET {col} = {col} - 1 WHERE id = ?1 AND {col} > 0",
        col = counter.column()
    );
    Ok(conn.execute(&sql, [conversation_id.to_string()])? == 1)
}

/// Result of `apply_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyApplied {
    Inserted,
    /// The counter the reply needed was already at zero. Nothing was written.
    QuotaGone,
}

/// Insert a user message. Decrements the text counter when `spend_text` is set
/// and refreshes the premium snapshot from the permit that authorized the send.
pub fn apply_user_send(
    conn: &Connection,
    msg: &NewMessage,
    spend_text: bool,
    premium_snapshot: bool,
) -> Result<()> {
    insert_message(conn, msg)?;
    if spend_text {
        decrement(conn, msg.conversation_id, QuotaCounter::Text)?;
    }
    conn.execute(
        "UPDATE conversations SET premium_active = ?2 WHERE id = ?1",
        params![msg.conversation_id.to_string(), premium_snapshot],
    )?;
    update_preview(conn, msg)
}

/// Insert an AI reply together with all of its conversation side effects.
///
/// The quota check is repeated here against the row itself; a reply planned
/// from an older snapshot of the counters comes back as `QuotaGone`.
pub fn apply_reply(conn: &Connection, msg: &NewMessage, effect: &ReplyEffect) -> Result<ReplyApplied> {
    let conversation_id = msg.conversation_id;
    if let Some(counter) = effect.decrement {
        if !try_spend(conn, conversation_id, counter)? {
            return Ok(ReplyApplied::QuotaGone);
        }
    }
    insert_message(conn, msg)?;

    if let Some(liked) = effect.like_message_id {
        conn.execute(
            "UPDATE messages SET liked_by_ai = 1 WHERE id = ?1 AND conversation_id = ?2",
            params![liked.to_string(), conversation_id.to_string()],
        )?;
    }

    if let Some(answered) = effect.answers_message_id {
        conn.execute(
            "UPDATE messages SET ai_error = 0 WHERE id = ?1 AND conversation_id = ?2",
            params![answered.to_string(), conversation_id.to_string()],
        )?;
    }

    if let Some(until) = effect.cooldown_until {
        set_cooldown(conn, conversation_id, until)?;
    }

    if let Some((kind, key, cap)) = &effect.seen {
        let raw: String = conn.query_row(
            "SELECT media_seen FROM conversations WHERE id = ?1",
            [conversation_id.to_string()],
            |row| row.get(0),
        )?;
        let mut seen: MediaSeen = serde_json::from_str(&raw).unwrap_or_default();
        seen.push(*kind, key, *cap);
        conn.execute(
            "UPDATE conversations SET media_seen = ?2 WHERE id = ?1",
            params![conversation_id.to_string(), serde_json::to_string(&seen)?],
        )?;
    }

    update_preview(conn, msg)?;
    Ok(ReplyApplied::Inserted)
}

fn set_cooldown(conn: &Connection, conversation_id: Uuid, until: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET heavy_cooldown_until = ?2 WHERE id = ?1",
        params![conversation_id.to_string(), until.timestamp_millis()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::queries::{get_conversation, get_message};
    use crate::testing::{seed_companion, seed_conversation, seed_user_message};
    use amora_types::models::Sender;

    fn ai_message(conversation_id: Uuid, user_id: Uuid, kind: MessageKind, key: Option<&str>) -> NewMessage {
        NewMessage {
            id: Uuid::new_v4(),
            conversation_id,
            user_id,
            sender: Sender::Ai,
            kind,
            text: Some("hey".into()),
            media_key: key.map(str::to_string),
            duration_ms: None,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reply_effects_land_together() {
        let db = Database::open_in_memory().unwrap();
        let companion = seed_companion(&db, false);
        let conv = seed_conversation(&db, Uuid::new_v4(), &companion);
        let user_msg = seed_user_message(&db, &conv, MessageKind::Text, None);
        let until = Utc::now() + chrono::Duration::seconds(45);

        let msg = ai_message(conv.id, conv.user_id, MessageKind::Image, Some("assets/a.jpg"));
        let effect = ReplyEffect {
            decrement: Some(QuotaCounter::Media),
            cooldown_until: Some(until),
            seen: Some((MessageKind::Image, "assets/a.jpg".into(), 20)),
            like_message_id: Some(user_msg),
            answers_message_id: Some(user_msg),
        };
        let applied = db.with_tx(|tx| apply_reply(tx, &msg, &effect)).unwrap();
        assert_eq!(applied, ReplyApplied::Inserted);

        let after = db.with_conn(|c| get_conversation(c, conv.id)).unwrap().unwrap();
        assert_eq!(after.free_remaining.media, conv.free_remaining.media - 1);
        assert_eq!(after.free_remaining.text, conv.free_remaining.text);
        assert_eq!(after.media_seen.image, vec!["assets/a.jpg"]);
        assert_eq!(
            after.heavy_cooldown_until.map(|t| t.timestamp_millis()),
            Some(until.timestamp_millis())
        );
        assert_eq!(after.last_message_kind, Some(MessageKind::Image));
        assert_eq!(after.last_message_sender, Some(Sender::Ai));

        let liked = db.with_conn(|c| get_message(c, user_msg)).unwrap().unwrap();
        assert!(liked.liked_by_ai);
    }

    #[test]
    fn reply_against_spent_counter_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let companion = seed_companion(&db, false);
        let conv = seed_conversation(&db, Uuid::new_v4(), &companion);
        db.with_conn(|c| {
            c.execute("UPDATE conversations SET free_audio = 0 WHERE id = ?1", [conv.id.to_string()])?;
            Ok(())
        })
        .unwrap();

        let msg = ai_message(conv.id, conv.user_id, MessageKind::Audio, Some("tts/v/x.mp3"));
        let effect = ReplyEffect {
            decrement: Some(QuotaCounter::Audio),
            cooldown_until: Some(Utc::now()),
            ..Default::default()
        };
        let applied = db.with_tx(|tx| apply_reply(tx, &msg, &effect)).unwrap();
        assert_eq!(applied, ReplyApplied::QuotaGone);

        let after = db.with_conn(|c| get_conversation(c, conv.id)).unwrap().unwrap();
        assert_eq!(after.free_remaining.audio, 0);
        assert!(after.heavy_cooldown_until.is_none());
        assert!(after.last_message_kind.is_none());
        assert!(db.with_conn(|c| get_message(c, msg.id)).unwrap().is_none());
    }

    #[test]
    fn last_text_unit_spent_by_user_send_clamps_at_zero() {
        let db = Database::open_in_memory().unwrap();
        let companion = seed_companion(&db, false);
        let conv = seed_conversation(&db, Uuid::new_v4(), &companion);
        db.with_conn(|c| {
            c.execute("UPDATE conversations SET free_text = 0 WHERE id = ?1", [conv.id.to_string()])?;
            Ok(())
        })
        .unwrap();

        let mut msg = ai_message(conv.id, conv.user_id, MessageKind::Text, None);
        msg.sender = Sender::User;
        db.with_tx(|tx| apply_user_send(tx, &msg, true, false)).unwrap();

        let after = db.with_conn(|c| get_conversation(c, conv.id)).unwrap().unwrap();
        assert_eq!(after.free_remaining.text, 0);
    }

    #[test]
    fn media_kind_without_key_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let companion = seed_companion(&db, false);
        let conv = seed_conversation(&db, Uuid::new_v4(), &companion);

        let msg = ai_message(conv.id, conv.user_id, MessageKind::Video, None);
        let result = db.with_tx(|tx| apply_reply(tx, &msg, &ReplyEffect::default()));
        assert!(result.is_err());
    }

    #[test]
    fn user_send_spends_text_and_snapshots_premium() {
        let db = Database::open_in_memory().unwrap();
        let companion = seed_companion(&db, false);
        let conv = seed_conversation(&db, Uuid::new_v4(), &companion);

        let mut msg = ai_message(conv.id, conv.user_id, MessageKind::Text, None);
        msg.sender = Sender::User;
        db.with_tx(|tx| apply_user_send(tx, &msg, true, true)).unwrap();

        let after = db.with_conn(|c| get_conversation(c, conv.id)).unwrap().unwrap();
        assert_eq!(after.free_remaining.text, conv.free_remaining.text - 1);
        assert!(after.premium_active);
        assert_eq!(after.last_message_text.as_deref(), Some("hey"));
    }
}
