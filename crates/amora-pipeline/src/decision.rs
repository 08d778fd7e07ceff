//! Structured reply decisions parsed out of free-form model output.

use amora_types::models::MessageKind;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const MAX_TAGS: usize = 8;

/// What the companion replies with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub kind: MessageKind,
    pub text: Option<String>,
    pub tags: Vec<String>,
    /// The raw output failed validation and was replaced by a text snippet.
    pub degraded: bool,
}

impl Decision {
    fn degraded(raw: &str, snippet_chars: usize) -> Self {
        let snippet: String = raw.trim().chars().take(snippet_chars).collect();
        Self {
            kind: MessageKind::Text,
            text: Some(snippet),
            tags: Vec::new(),
            degraded: true,
        }
    }
}

/// Parse the first JSON object embedded in `raw`.
///
/// Never fails: anything that is not `{type: text|image|video|audio, text?: string,
/// tags?: [string]}` becomes a text decision holding the first `snippet_chars`
/// characters of the raw output.
pub fn parse_decision(raw: &str, snippet_chars: usize) -> Decision {
    match first_object(raw).and_then(validate) {
        Some(decision) => decision,
        None => Decision::degraded(raw, snippet_chars),
    }
}

fn first_object(raw: &str) -> Option<Map<String, Value>> {
    raw.match_indices('{').find_map(|(start, _)| {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(map))) => Some(map),
            _ => None,
        }
    })
}

fn validate(map: Map<String, Value>) -> Option<Decision> {
    let kind = match map.get("type")? {
        Value::String(s) => MessageKind::parse(s.trim().to_ascii_lowercase().as_str())?,
        _ => return None,
    };

    let text = match map.get("text") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(_) => return None,
    };

    let tags = match map.get("tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut tags = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(tag) = item else {
                    return None;
                };
                let tag = tag.trim().to_lowercase();
                if !tag.is_empty() && !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
            tags.truncate(MAX_TAGS);
            tags
        }
        Some(_) => return None,
    };

    // A text reply with nothing to say is as good as malformed.
    if kind == MessageKind::Text && text.is_none() {
        return None;
    }

    Some(Decision {
        kind,
        text,
        tags,
        degraded: false,
    })
}

/// Whether the companion likes the message. Roughly one in four, and always the
/// same answer for the same message.
pub fn companion_likes(message_id: Uuid) -> bool {
    let digest = Sha256::digest(message_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % 4 == 0
}
