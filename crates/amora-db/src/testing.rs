//! Fixtures for tests in this crate and downstream crates.

use amora_types::models::{
    Companion, Conversation, FreeRemaining, MediaAsset, MediaSeen, MessageKind, Sender,
};
use chrono::Utc;
use uuid::Uuid;

use crate::Database;
use crate::models::NewMessage;
use crate::{outcomes, queries};

pub fn seed_companion(db: &Database, premium_only: bool) -> Companion {
    let companion = Companion {
        id: Uuid::new_v4(),
        name: "Lucia".into(),
        avatar_key: Some("companions/lucia/avatar.jpg".into()),
        voice_id: Some("voice-lucia".into()),
        persona: "Playful, warm, from Valencia.".into(),
        premium_only,
    };
    db.with_conn(|conn| queries::insert_companion(conn, &companion))
        .expect("insert companion");
    companion
}

pub fn seed_conversation(db: &Database, user_id: Uuid, companion: &Companion) -> Conversation {
    let now = Utc::now();
    let conv = Conversation {
        id: Uuid::new_v4(),
        user_id,
        companion_id: companion.id,
        companion_name: companion.name.clone(),
        companion_avatar_key: companion.avatar_key.clone(),
        companion_voice_id: companion.voice_id.clone(),
        persona: companion.persona.clone(),
        free_remaining: FreeRemaining { text: 10, media: 2, audio: 2 },
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
    db.with_conn(|conn| queries::create_conversation(conn, &conv))
        .expect("create conversation")
}

pub fn set_free_remaining(db: &Database, conversation_id: Uuid, free: FreeRemaining) {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE conversations SET free_text = ?2, free_media = ?3, free_audio = ?4 WHERE id = ?1",
            rusqlite::params![conversation_id.to_string(), free.text, free.media, free.audio],
        )?;
        Ok(())
    })
    .expect("set free remaining");
}

pub fn seed_user_message(
    db: &Database,
    conv: &Conversation,
    kind: MessageKind,
    text: Option<&str>,
) -> Uuid {
    let msg = NewMessage {
        id: Uuid::new_v4(),
        conversation_id: conv.id,
        user_id: conv.user_id,
        sender: Sender::User,
        kind,
        text: text.map(str::to_string),
        media_key: kind
            .has_media()
            .then(|| format!("conversations/{}/user/{}.bin", conv.id, Uuid::new_v4())),
        duration_ms: None,
        reply_to: None,
        created_at: Utc::now(),
    };
    db.with_tx(|tx| outcomes::apply_user_send(tx, &msg, false, false))
        .expect("insert user message");
    msg.id
}

pub fn seed_asset(
    db: &Database,
    companion: &Companion,
    kind: MessageKind,
    key: &str,
    description: &str,
) -> MediaAsset {
    let asset = MediaAsset {
        id: Uuid::new_v4(),
        companion_id: companion.id,
        kind,
        media_key: key.into(),
        description: description.into(),
        tags: String::new(),
        published: true,
    };
    db.with_conn(|conn| queries::insert_media_asset(conn, &asset))
        .expect("insert asset");
    asset
}
