use amora_types::models::Message;
use anyhow::{Context, anyhow};
use tracing::{info, warn};
use uuid::Uuid;

use crate::Pipeline;
use crate::error::Result;

impl Pipeline {
    /// Transcribe a voice note, then reply to it straight away. A failed
    /// transcription leaves `transcript` empty; the reply still runs.
    pub async fn transcribe(&self, conversation_id: Uuid, message_id: Uuid) -> Result<()> {
        let Some(message) = self.blocking(move |db| Ok(db.get_message(message_id)?)).await? else {
            warn!("Transcription skipped: message {} no longer exists", message_id);
            return Ok(());
        };

        match self.transcript_of(&message).await {
            Ok(transcript) => {
                let chars = transcript.chars().count();
                let saved = self
                    .blocking(move |db| {
                        db.with_conn(|conn| amora_db::queries::set_transcript(conn, message_id, &transcript))
                            .map_err(Into::into)
                    })
                    .await;
                match saved {
                    Ok(()) => info!("Transcribed voice note {} ({} chars)", message_id, chars),
                    Err(e) => warn!("Failed to store transcript for {}: {}", message_id, e),
                }
            }
            Err(e) => warn!("Transcription of {} failed: {:#}", message_id, e),
        }

        self.run_reply(conversation_id, Some(message_id)).await;
        Ok(())
    }

    async fn transcript_of(&self, message: &Message) -> anyhow::Result<String> {
        let key = message
            .media_key
            .as_deref()
            .ok_or_else(|| anyhow!("message {} has no audio", message.id))?;
        let audio = self
            .store
            .get(key)
            .await
            .with_context(|| format!("download {}", key))?;
        let file_name = key.rsplit('/').next().unwrap_or(key);

        let transcript = self.providers.stt.transcribe(audio, file_name).await?;
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            return Err(anyhow!("{} returned an empty transcript", self.providers.stt.id()));
        }
        Ok(transcript)
    }
}
