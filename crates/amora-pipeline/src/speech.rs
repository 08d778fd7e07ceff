use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::providers::TtsProvider;
use crate::storage::ObjectStore;

/// Content-addressed cache of synthesized speech.
///
/// The key depends only on `(voice_id, text)`, so concurrent callers for the same
/// pair race at worst to upload identical bytes to the same key.
pub struct SpeechCache {
    store: Arc<dyn ObjectStore>,
    tts: Arc<dyn TtsProvider>,
}

pub fn cache_key(voice_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(voice_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("tts/{}/{}.mp3", &digest[..2], digest)
}

impl SpeechCache {
    pub fn new(store: Arc<dyn ObjectStore>, tts: Arc<dyn TtsProvider>) -> Self {
        Self { store, tts }
    }

    /// Object key holding `text` spoken in `voice_id`, synthesizing on a miss.
    pub async fn ensure(&self, voice_id: &str, text: &str) -> Result<String> {
        let key = cache_key(voice_id, text);

        if self.store.head(&key).await?.is_some() {
            debug!("TTS cache hit {}", key);
            return Ok(key);
        }

        let audio = self.tts.synthesize(voice_id, text).await?;
        let size = audio.len();
        self.store.put(&key, audio).await?;
        info!("TTS cache miss: synthesized {} bytes with {} into {}", size, self.tts.id(), key);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTts, MemoryObjectStore};

    #[tokio::test]
    async fn second_call_hits_cache() {
        let store = Arc::new(MemoryObjectStore::default());
        let tts = Arc::new(FakeTts::default());
        let cache = SpeechCache::new(store.clone(), tts.clone());

        let first = cache.ensure("voice-a", "hola").await.unwrap();
        let second = cache.ensure("voice-a", "hola").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(tts.calls(), 1);
        assert!(store.contains(&first));
    }

    #[tokio::test]
    async fn key_depends_on_voice_and_text() {
        assert_ne!(cache_key("a", "bc"), cache_key("ab", "c"));
        assert_ne!(cache_key("a", "hola"), cache_key("b", "hola"));
        assert_eq!(cache_key("a", "hola"), cache_key("a", "hola"));
        assert!(cache_key("a", "hola").starts_with("tts/"));
    }

    #[tokio::test]
    async fn synthesis_failure_uploads_nothing() {
        let store = Arc::new(MemoryObjectStore::default());
        let tts = Arc::new(FakeTts::failing());
        let cache = SpeechCache::new(store.clone(), tts);

        assert!(cache.ensure("voice-a", "hola").await.is_err());
        assert!(!store.contains(&cache_key("voice-a", "hola")));
    }
}
