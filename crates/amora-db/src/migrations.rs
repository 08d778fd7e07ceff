use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// All timestamps are integer milliseconds since the Unix epoch.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE companions (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                avatar_key      TEXT,
                voice_id        TEXT,
                persona         TEXT NOT NULL DEFAULT '',
                premium_only    INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE entitlements (
                user_id         TEXT PRIMARY KEY,
                premium_until   INTEGER NOT NULL
            );

            CREATE TABLE conversations (
                id                      TEXT PRIMARY KEY,
                user_id                 TEXT NOT NULL,
                companion_id            TEXT NOT NULL REFERENCES companions(id),
                companion_name          TEXT NOT NULL,
                companion_avatar_key    TEXT,
                companion_voice_id      TEXT,
                persona                 TEXT NOT NULL DEFAULT '',
                free_text               INTEGER NOT NULL CHECK (free_text >= 0),
                free_media              INTEGER NOT NULL CHECK (free_media >= 0),
                free_audio              INTEGER NOT NULL CHECK (free_audio >= 0),
                premium_active          INTEGER NOT NULL DEFAULT 0,
                girl_premium_only       INTEGER NOT NULL DEFAULT 0,
                last_message_text       TEXT,
                last_message_kind       TEXT,
                last_message_sender     TEXT,
                last_message_at         INTEGER,
                heavy_cooldown_until    INTEGER,
                media_seen              TEXT NOT NULL DEFAULT '{}',
                cleared_at              INTEGER,
                created_at              INTEGER NOT NULL,
                updated_at              INTEGER NOT NULL,
                UNIQUE(user_id, companion_id)
            );

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                user_id         TEXT NOT NULL,
                sender          TEXT NOT NULL CHECK (sender IN ('user', 'ai')),
                kind            TEXT NOT NULL CHECK (kind IN ('text', 'image', 'video', 'audio')),
                text            TEXT,
                media_key       TEXT,
                duration_ms     INTEGER,
                transcript      TEXT,
                media_summary   TEXT,
                liked_by_user   INTEGER NOT NULL DEFAULT 0,
                liked_by_ai     INTEGER NOT NULL DEFAULT 0,
                ai_error        INTEGER NOT NULL DEFAULT 0,
                reply_to        TEXT,
                created_at      INTEGER NOT NULL,
                CHECK ((kind = 'text') = (media_key IS NULL))
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE permits (
                id              TEXT PRIMARY KEY,
                user_id         TEXT NOT NULL,
                uses_left       INTEGER NOT NULL CHECK (uses_left >= 0),
                expires_at      INTEGER NOT NULL,
                scope           TEXT NOT NULL,
                premium_at_mint INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE media_assets (
                id              TEXT PRIMARY KEY,
                companion_id    TEXT NOT NULL REFERENCES companions(id),
                kind            TEXT NOT NULL CHECK (kind IN ('image', 'video', 'audio')),
                media_key       TEXT NOT NULL,
                description     TEXT NOT NULL DEFAULT '',
                tags            TEXT NOT NULL DEFAULT '',
                published       INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX idx_media_assets_companion
                ON media_assets(companion_id, kind, published);

            CREATE TABLE media_insights (
                message_id      TEXT PRIMARY KEY REFERENCES messages(id),
                explicit_labels TEXT NOT NULL DEFAULT '[]',
                scene_labels    TEXT NOT NULL DEFAULT '[]',
                method          TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE scheduled_tasks (
                id              TEXT PRIMARY KEY,
                kind            TEXT NOT NULL CHECK (kind IN ('reply', 'moderate', 'transcribe')),
                conversation_id TEXT NOT NULL,
                message_id      TEXT,
                run_at          INTEGER NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                attempts        INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX idx_scheduled_tasks_due
                ON scheduled_tasks(status, run_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
