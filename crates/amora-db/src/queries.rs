use amora_types::models::{
    Companion, Conversation, FreeRemaining, Label, MediaAsset, MediaInsight, Message, MessageKind,
    Permit,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use crate::Database;
use crate::models::{get_dt, get_json, get_kind, get_opt_dt, get_opt_kind, get_sender, get_uuid};

const CONVERSATION_COLUMNS: &str = "id, user_id, companion_id, companion_name, companion_avatar_key,
    companion_voice_id, persona, free_text, free_media, free_audio, premium_active,
    girl_premium_only, last_message_text, last_message_kind, last_message_sender,
    last_message_at, heavy_cooldown_until, media_seen, cleared_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, user_id, sender, kind, text, media_key,
    duration_ms, transcript, media_summary, liked_by_user, liked_by_ai, ai_error, reply_to,
    created_at";

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: get_uuid(row, 0)?,
        user_id: get_uuid(row, 1)?,
        companion_id: get_uuid(row, 2)?,
        companion_name: row.get(3)?,
        companion_avatar_key: row.get(4)?,
        companion_voice_id: row.get(5)?,
        persona: row.get(6)?,
        free_remaining: FreeRemaining {
            text: row.get(7)?,
            media: row.get(8)?,
            audio: row.get(9)?,
        },
        premium_active: row.get(10)?,
        girl_premium_only: row.get(11)?,
        last_message_text: row.get(12)?,
        last_message_kind: get_opt_kind(row, 13)?,
        last_message_sender: row
            .get::<_, Option<String>>(14)?
            .and_then(|s| amora_types::models::Sender::parse(&s)),
        last_message_at: get_opt_dt(row, 15)?,
        heavy_cooldown_until: get_opt_dt(row, 16)?,
        media_seen: get_json(row, 17)?,
        cleared_at: get_opt_dt(row, 18)?,
        created_at: get_dt(row, 19)?,
        updated_at: get_dt(row, 20)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: get_uuid(row, 0)?,
        conversation_id: get_uuid(row, 1)?,
        user_id: get_uuid(row, 2)?,
        sender: get_sender(row, 3)?,
        kind: get_kind(row, 4)?,
        text: row.get(5)?,
        media_key: row.get(6)?,
        duration_ms: row.get(7)?,
        transcript: row.get(8)?,
        media_summary: row.get(9)?,
        liked_by_user: row.get(10)?,
        liked_by_ai: row.get(11)?,
        ai_error: row.get(12)?,
        reply_to: get_json(row, 13)?,
        created_at: get_dt(row, 14)?,
    })
}

fn map_insight(row: &Row<'_>) -> rusqlite::Result<MediaInsight> {
    Ok(MediaInsight {
        message_id: get_uuid(row, 0)?,
        explicit_labels: get_json::<Vec<Label>>(row, 1)?,
        scene_labels: get_json::<Vec<Label>>(row, 2)?,
        method: row.get(3)?,
        created_at: get_dt(row, 4)?,
    })
}

// -- Companions --

pub fn get_companion(conn: &Connection, id: Uuid) -> Result<Option<Companion>> {
    let row = conn
        .query_row(
            "SELECT id, name, avatar_key, voice_id, persona, premium_only
             FROM companions WHERE id = ?1",
            [id.to_string()],
            |row| {
                Ok(Companion {
                    id: get_uuid(row, 0)?,
                    name: row.get(1)?,
                    avatar_key: row.get(2)?,
                    voice_id: row.get(3)?,
                    persona: row.get(4)?,
                    premium_only: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn insert_companion(conn: &Connection, companion: &Companion) -> Result<()> {
    conn.execute(
        "INSERT INTO companions (id, name, avatar_key, voice_id, persona, premium_only, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            companion.id.to_string(),
            companion.name,
            companion.avatar_key,
            companion.voice_id,
            companion.persona,
            companion.premium_only,
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

// -- Entitlements --

pub fn premium_until(conn: &Connection, user_id: Uuid) -> Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = conn
        .query_row(
            "SELECT premium_until FROM entitlements WHERE user_id = ?1",
            [user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(ms.map(crate::models::ms_to_dt))
}

pub fn set_premium_until(conn: &Connection, user_id: Uuid, until: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO entitlements (user_id, premium_until) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET premium_until = excluded.premium_until",
        params![user_id.to_string(), until.timestamp_millis()],
    )?;
    Ok(())
}

// -- Conversations --

pub fn get_conversation(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
    Ok(conn.query_row(&sql, [id.to_string()], map_conversation).optional()?)
}

pub fn find_conversation(
    conn: &Connection,
    user_id: Uuid,
    companion_id: Uuid,
) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE user_id = ?1 AND companion_id = ?2",
        CONVERSATION_COLUMNS
    );
    Ok(conn
        .query_row(&sql, [user_id.to_string(), companion_id.to_string()], map_conversation)
        .optional()?)
}

/// Insert unless the (user, companion) pair already has a conversation.
/// Returns whichever row now exists.
pub fn create_conversation(conn: &Connection, conv: &Conversation) -> Result<Conversation> {
    conn.execute(
        "INSERT OR IGNORE INTO conversations (
            id, user_id, companion_id, companion_name, companion_avatar_key, companion_voice_id,
            persona, free_text, free_media, free_audio, premium_active, girl_premium_only,
            media_seen, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            conv.id.to_string(),
            conv.user_id.to_string(),
            conv.companion_id.to_string(),
            conv.companion_name,
            conv.companion_avatar_key,
            conv.companion_voice_id,
            conv.persona,
            conv.free_remaining.text.max(0),
            conv.free_remaining.media.max(0),
            conv.free_remaining.audio.max(0),
            conv.premium_active,
            conv.girl_premium_only,
            serde_json::to_string(&conv.media_seen)?,
            conv.created_at.timestamp_millis(),
        ],
    )?;
    find_conversation(conn, conv.user_id, conv.companion_id)?
        .ok_or_else(|| anyhow::anyhow!("conversation vanished after insert"))
}

pub fn clear_conversation(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET cleared_at = ?2, updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), now.timestamp_millis()],
    )?;
    Ok(())
}

// -- Messages --

pub fn get_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    Ok(conn.query_row(&sql, [id.to_string()], map_message).optional()?)
}

/// Visible messages, newest first. Messages at or before `cleared_at` are hidden.
pub fn list_messages(
    conn: &Connection,
    conversation_id: Uuid,
    cleared_at: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
    limit: u32,
) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {} FROM messages
         WHERE conversation_id = ?1 AND created_at > ?2 AND created_at < ?3
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?4",
        MESSAGE_COLUMNS
    );
    let after_ms = cleared_at.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
    let before_ms = before.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![conversation_id.to_string(), after_ms, before_ms, limit],
            map_message,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The last `limit` visible messages in chronological order.
pub fn recent_messages(
    conn: &Connection,
    conversation_id: Uuid,
    cleared_at: Option<DateTime<Utc>>,
    limit: u32,
) -> Result<Vec<Message>> {
    let mut rows = list_messages(conn, conversation_id, cleared_at, None, limit)?;
    rows.reverse();
    Ok(rows)
}

pub fn set_media_summary(conn: &Connection, message_id: Uuid, summary: &str) -> Result<()> {
    conn.execute(
        "UPDATE messages SET media_summary = ?2 WHERE id = ?1",
        params![message_id.to_string(), summary],
    )?;
    Ok(())
}

pub fn set_transcript(conn: &Connection, message_id: Uuid, transcript: &str) -> Result<()> {
    conn.execute(
        "UPDATE messages SET transcript = ?2 WHERE id = ?1",
        params![message_id.to_string(), transcript],
    )?;
    Ok(())
}

pub fn set_ai_error(conn: &Connection, message_id: Uuid, ai_error: bool) -> Result<()> {
    conn.execute(
        "UPDATE messages SET ai_error = ?2 WHERE id = ?1",
        params![message_id.to_string(), ai_error],
    )?;
    Ok(())
}

/// Flip `liked_by_user`. Returns the new value.
pub fn toggle_user_like(conn: &Connection, message_id: Uuid) -> Result<bool> {
    let liked: bool = conn.query_row(
        "UPDATE messages SET liked_by_user = 1 - liked_by_user WHERE id = ?1
         RETURNING liked_by_user",
        [message_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(liked)
}

// -- Permits --

pub fn insert_permit(conn: &Connection, permit: &Permit) -> Result<()> {
    conn.execute(
        "INSERT INTO permits (id, user_id, uses_left, expires_at, scope, premium_at_mint, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            permit.id.to_string(),
            permit.user_id.to_string(),
            permit.uses_left,
            permit.expires_at.timestamp_millis(),
            permit.scope,
            permit.premium_at_mint,
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub fn get_permit(conn: &Connection, id: Uuid) -> Result<Option<Permit>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, uses_left, expires_at, scope, premium_at_mint
             FROM permits WHERE id = ?1",
            [id.to_string()],
            |row| {
                Ok(Permit {
                    id: get_uuid(row, 0)?,
                    user_id: get_uuid(row, 1)?,
                    uses_left: row.get(2)?,
                    expires_at: get_dt(row, 3)?,
                    scope: row.get(4)?,
                    premium_at_mint: row.get(5)?,
                })
            },
        )
        .optional()?)
}

/// Spend one use. The guard lives in the `WHERE` clause, so two callers racing
/// for the last use cannot both match. `None` means missing, expired,
/// exhausted, foreign or wrong scope.
pub fn consume_permit(
    conn: &Connection,
    id: Uuid,
    user_id: Uuid,
    scope: &str,
    now: DateTime<Utc>,
) -> Result<Option<Permit>> {
    Ok(conn
        .query_row(
            "UPDATE permits SET uses_left = uses_left - 1
             WHERE id = ?1 AND user_id = ?2 AND scope = ?3 AND uses_left > 0 AND expires_at > ?4
             RETURNING id, user_id, uses_left, expires_at, scope, premium_at_mint",
            params![id.to_string(), user_id.to_string(), scope, now.timestamp_millis()],
            |row| {
                Ok(Permit {
                    id: get_uuid(row, 0)?,
                    user_id: get_uuid(row, 1)?,
                    uses_left: row.get(2)?,
                    expires_at: get_dt(row, 3)?,
                    scope: row.get(4)?,
                    premium_at_mint: row.get(5)?,
                })
            },
        )
        .optional()?)
}

// -- Reply assets --

pub fn insert_media_asset(conn: &Connection, asset: &MediaAsset) -> Result<()> {
    conn.execute(
        "INSERT INTO media_assets (id, companion_id, kind, media_key, description, tags, published, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            asset.id.to_string(),
            asset.companion_id.to_string(),
            asset.kind.as_str(),
            asset.media_key,
            asset.description,
            asset.tags,
            asset.published,
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub fn published_assets(
    conn: &Connection,
    companion_id: Uuid,
    kind: MessageKind,
) -> Result<Vec<MediaAsset>> {
    let mut stmt = conn.prepare(
        "SELECT id, companion_id, kind, media_key, description, tags, published
         FROM media_assets
         WHERE companion_id = ?1 AND kind = ?2 AND published = 1
         ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map(params![companion_id.to_string(), kind.as_str()], |row| {
            Ok(MediaAsset {
                id: get_uuid(row, 0)?,
                companion_id: get_uuid(row, 1)?,
                kind: get_kind(row, 2)?,
                media_key: row.get(3)?,
                description: row.get(4)?,
                tags: row.get(5)?,
                published: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Media insights --

/// Written once per message. Returns `false` if one already existed.
pub fn insert_insight(conn: &Connection, insight: &MediaInsight) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO media_insights (message_id, explicit_labels, scene_labels, method, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            insight.message_id.to_string(),
            serde_json::to_string(&insight.explicit_labels)?,
            serde_json::to_string(&insight.scene_labels)?,
            insight.method,
            insight.created_at.timestamp_millis(),
        ],
    )?;
    Ok(changed == 1)
}

pub fn get_insight(conn: &Connection, message_id: Uuid) -> Result<Option<MediaInsight>> {
    Ok(conn
        .query_row(
            "SELECT message_id, explicit_labels, scene_labels, method, created_at
             FROM media_insights WHERE message_id = ?1",
            [message_id.to_string()],
            map_insight,
        )
        .optional()?)
}

/// Batch-fetch insights for a set of message IDs.
pub fn insights_for_messages(conn: &Connection, message_ids: &[Uuid]) -> Result<Vec<MediaInsight>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT message_id, explicit_labels, scene_labels, method, created_at
         FROM media_insights WHERE message_id IN ({})",
        placeholders.join(", ")
    );

    let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), map_insight)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl Database {
    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| get_conversation(conn, id))
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| get_message(conn, id))
    }

    pub fn get_companion(&self, id: Uuid) -> Result<Option<Companion>> {
        self.with_conn(|conn| get_companion(conn, id))
    }

    pub fn get_permit(&self, id: Uuid) -> Result<Option<Permit>> {
        self.with_conn(|conn| get_permit(conn, id))
    }

    pub fn insert_permit(&self, permit: &Permit) -> Result<()> {
        self.with_conn(|conn| insert_permit(conn, permit))
    }

    pub fn is_premium(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .with_conn(|conn| premium_until(conn, user_id))?
            .is_some_and(|until| until > now))
    }

    pub fn published_assets(&self, companion_id: Uuid, kind: MessageKind) -> Result<Vec<MediaAsset>> {
        self.with_conn(|conn| published_assets(conn, companion_id, kind))
    }

    pub fn get_insight(&self, message_id: Uuid) -> Result<Option<MediaInsight>> {
        self.with_conn(|conn| get_insight(conn, message_id))
    }
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_companion, seed_conversation};
    use std::sync::Arc;

    #[test]
    fn open_conversation_is_idempotent_per_pair() {
        let db = Database::open_in_memory().unwrap();
        let companion = seed_companion(&db, false);
        let user = Uuid::new_v4();

        let first = seed_conversation(&db, user, &companion);
        let second = seed_conversation(&db, user, &companion);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn permit_last_use_is_consumed_once_under_contention() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        let now = Utc::now();
        let permit = Permit {
            id: Uuid::new_v4(),
            user_id: user,
            uses_left: 1,
            expires_at: now + chrono::Duration::minutes(10),
            scope: "chat:send".into(),
            premium_at_mint: false,
        };
        db.insert_permit(&permit).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || {
                    db.with_conn(|conn| consume_permit(conn, permit.id, user, "chat:send", now))
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(db.get_permit(permit.id).unwrap().unwrap().uses_left, 0);
    }

    #[test]
    fn consume_rejects_wrong_scope_owner_and_expiry() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let permit = Permit {
            id: Uuid::new_v4(),
            user_id: user,
            uses_left: 3,
            expires_at: now + chrono::Duration::seconds(30),
            scope: "chat:send".into(),
            premium_at_mint: true,
        };
        db.insert_permit(&permit).unwrap();

        db.with_conn(|conn| {
            assert!(consume_permit(conn, permit.id, user, "other", now)?.is_none());
            assert!(consume_permit(conn, permit.id, Uuid::new_v4(), "chat:send", now)?.is_none());
            let later = now + chrono::Duration::seconds(31);
            assert!(consume_permit(conn, permit.id, user, "chat:send", later)?.is_none());
            let spent = consume_permit(conn, permit.id, user, "chat:send", now)?.unwrap();
            assert_eq!(spent.uses_left, 2);
            assert!(spent.premium_at_mint);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn insight_is_written_once() {
        let db = Database::open_in_memory().unwrap();
        let companion = seed_companion(&db, false);
        let conv = seed_conversation(&db, Uuid::new_v4(), &companion);
        let message_id = crate::testing::seed_user_message(&db, &conv, MessageKind::Image, None);

        let insight = MediaInsight {
            message_id,
            explicit_labels: vec![],
            scene_labels: vec![Label { name: "Beach".into(), confidence: 91.0 }],
            method: "vision".into(),
            created_at: Utc::now(),
        };
        db.with_conn(|conn| {
            assert!(insert_insight(conn, &insight)?);
            assert!(!insert_insight(conn, &MediaInsight { method: "again".into(), ..insight.clone() })?);
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get_insight(message_id).unwrap().unwrap().method, "vision");
    }
}
