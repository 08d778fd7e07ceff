use std::collections::HashMap;

use amora_types::models::{Conversation, MediaInsight, Message, MessageKind, Sender};
use uuid::Uuid;

use crate::moderation::summarize_labels;
use crate::providers::{ChatTurn, Role};

const RULES: &str = "\
You are texting as the character described below. Stay in character at all times.
Keep replies short, warm and natural, like a real chat. Never mention being an AI.
Do not describe media you were not shown. React to the user's photos, videos and
voice notes using the bracketed notes in their messages.
Answer with exactly one JSON object and nothing else:
{\"type\": \"text\" | \"image\" | \"video\" | \"audio\", \"text\": \"...\", \"tags\": [\"...\"]}
`text` is the message (or caption). `tags` are a few words describing the photo or
video you would send.";

/// System prompt: fixed rules, persona, and the live quota status.
pub fn system_prompt(conv: &Conversation) -> String {
    let free = conv.free_remaining;
    let mut status = String::from("STATUS\n");
    if conv.premium_active {
        status.push_str("premium: yes (no limits)\n");
    } else {
        status.push_str("premium: no\n");
        status.push_str(&format!(
            "remaining free: text={} media={} audio={}\n",
            free.text, free.media, free.audio
        ));
        if free.media <= 0 {
            status.push_str("Media is used up: do not choose image or video, prefer text.\n");
        }
        if free.audio <= 0 {
            status.push_str("Voice notes are used up: do not choose audio, prefer text.\n");
        }
    }

    format!(
        "{}\n\nCHARACTER: {}\n{}\n\n{}",
        RULES,
        conv.companion_name,
        conv.persona.trim(),
        status.trim_end()
    )
}

/// Render stored messages (chronological) as model turns. Media without a
/// backfilled summary falls back to its insight, when one is given.
pub fn render_turns(
    messages: &[Message],
    insights: &HashMap<Uuid, MediaInsight>,
    min_confidence: f32,
    max_labels: usize,
) -> Vec<ChatTurn> {
    messages
        .iter()
        .map(|m| ChatTurn {
            role: match m.sender {
                Sender::User => Role::User,
                Sender::Ai => Role::Assistant,
            },
            content: render_content(m, insights, min_confidence, max_labels),
        })
        .collect()
}

fn render_content(
    m: &Message,
    insights: &HashMap<Uuid, MediaInsight>,
    min_confidence: f32,
    max_labels: usize,
) -> String {
    let text = m.text.as_deref().map(str::trim).filter(|t| !t.is_empty());

    match m.kind {
        MessageKind::Text => text.unwrap_or_default().to_string(),
        MessageKind::Image | MessageKind::Video => {
            let tag = if m.kind == MessageKind::Image { "[photo]" } else { "[video]" };
            let summary = m.media_summary.clone().filter(|s| !s.is_empty()).or_else(|| {
                insights
                    .get(&m.id)
                    .map(|i| summarize_labels(i, min_confidence, max_labels))
                    .filter(|s| !s.is_empty())
            });
            let mut out = tag.to_string();
            if let Some(summary) = summary {
                out.push_str(&format!(" ({})", summary));
            }
            if let Some(caption) = text {
                out.push(' ');
                out.push_str(caption);
            }
            out
        }
        MessageKind::Audio => {
            let spoken = m
                .transcript
                .as_deref()
                .or(if m.sender == Sender::Ai { text } else { None })
                .map(str::trim)
                .filter(|t| !t.is_empty());
            match spoken {
                Some(words) => format!("[voice note] {}", words),
                None => "[voice note] (no transcript)".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amora_types::models::{FreeRemaining, Label, MediaSeen};
    use chrono::Utc;

    fn conversation(premium: bool, free: FreeRemaining) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            companion_id: Uuid::new_v4(),
            companion_name: "Lucia".into(),
            companion_avatar_key: None,
            companion_voice_id: None,
            persona: "Playful.".into(),
            free_remaining: free,
            premium_active: premium,
            girl_premium_only: false,
            last_message_text: None,
            last_message_kind: None,
            last_message_sender: None,
            last_message_at: None,
            heavy_cooldown_until: None,
            media_seen: MediaSeen::default(),
            cleared_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn message(sender: Sender, kind: MessageKind, text: Option<&str>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            user_id: Uuid::nil(),
            sender,
            kind,
            text: text.map(str::to_string),
            media_key: kind.has_media().then(|| "k".to_string()),
            duration_ms: None,
            transcript: None,
            media_summary: None,
            liked_by_user: false,
            liked_by_ai: false,
            ai_error: false,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_block_steers_away_from_exhausted_modalities() {
        let prompt = system_prompt(&conversation(false, FreeRemaining { text: 3, media: 0, audio: 1 }));
        assert!(prompt.contains("remaining free: text=3 media=0 audio=1"));
        assert!(prompt.contains("do not choose image or video"));
        assert!(!prompt.contains("do not choose audio"));
        assert!(prompt.contains("Lucia"));

        let premium = system_prompt(&conversation(true, FreeRemaining { text: 0, media: 0, audio: 0 }));
        assert!(premium.contains("premium: yes"));
        assert!(!premium.contains("do not choose"));
    }

    #[test]
    fn media_renders_summary_then_insight_fallback() {
        let mut with_summary = message(Sender::User, MessageKind::Image, Some("look"));
        with_summary.media_summary = Some("scene: Beach 91%".into());
        let bare_video = message(Sender::User, MessageKind::Video, None);
        let mut voice = message(Sender::User, MessageKind::Audio, None);
        let silent_voice = message(Sender::User, MessageKind::Audio, None);
        voice.transcript = Some("miss you".into());

        let mut insights = HashMap::new();
        insights.insert(bare_video.id, MediaInsight {
            message_id: bare_video.id,
            explicit_labels: vec![],
            scene_labels: vec![Label { name: "Dog".into(), confidence: 95.0 }],
            method: "vision-frame".into(),
            created_at: Utc::now(),
        });

        let turns = render_turns(
            &[with_summary, bare_video, voice, silent_voice],
            &insights,
            80.0,
            8,
        );
        assert_eq!(turns[0].content, "[photo] (scene: Beach 91%) look");
        assert_eq!(turns[1].content, "[video] (scene: Dog 95%)");
        assert_eq!(turns[2].content, "[voice note] miss you");
        assert_eq!(turns[3].content, "[voice note] (no transcript)");
        assert!(turns.iter().all(|t| t.role == Role::User));
    }
}
