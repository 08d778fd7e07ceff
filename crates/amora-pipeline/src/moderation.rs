//! Content analysis of user images and videos.
//!
//! Analysis always terminates in exactly one scheduled reply. Whatever
//! happens in between (provider errors, a missing object, a panic in a
//! client) is written down as an empty insight and the conversation moves on.

use std::panic::AssertUnwindSafe;

use amora_db::queries;
use amora_types::models::{Label, MediaInsight, Message, MessageKind};
use anyhow::{Context, anyhow};
use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Pipeline;
use crate::error::Result;

fn method_for(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Video => "vision-video-frame",
        _ => "vision-image",
    }
}

/// Compact digest of the labels above `min_confidence`, explicit ones first,
/// e.g. `explicit: Swimwear 91%; scene: Beach 97%, Sunset 85%`.
pub fn summarize_labels(insight: &MediaInsight, min_confidence: f32, max_labels: usize) -> String {
    let mut budget = max_labels;
    let mut parts = Vec::new();

    for (heading, labels) in [("explicit", &insight.explicit_labels), ("scene", &insight.scene_labels)] {
        let picked: Vec<String> = labels
            .iter()
            .filter(|l| l.confidence > min_confidence)
            .take(budget)
            .map(|l| format!("{} {:.0}%", l.name, l.confidence))
            .collect();
        budget -= picked.len();
        if !picked.is_empty() {
            parts.push(format!("{}: {}", heading, picked.join(", ")));
        }
    }

    parts.join("; ")
}

fn ranked(mut labels: Vec<Label>) -> Vec<Label> {
    labels.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    labels
}

impl Pipeline {
    /// Analyze a media message, then schedule its reply.
    pub async fn moderate(&self, conversation_id: Uuid, message_id: Uuid) -> Result<()> {
        let Some(message) = self.blocking(move |db| Ok(db.get_message(message_id)?)).await? else {
            warn!("Moderation skipped: message {} no longer exists", message_id);
            return Ok(());
        };

        let recorded = self.blocking(move |db| Ok(db.get_insight(message_id)?)).await?;
        if recorded.is_some() {
            debug!("Media insight for {} already recorded", message_id);
        } else {
            self.record_insight(&message).await;
        }

        let scheduler = self.scheduler.clone();
        let kind = message.kind;
        self.blocking(move |db| {
            db.with_conn(|conn| scheduler.after_moderation(conn, kind, conversation_id, message_id))
                .map_err(Into::into)
        })
        .await?;

        info!("Moderation of {} finished; reply scheduled", message_id);
        Ok(())
    }

    /// Analyze the media and store the insight. Never fails; a failed
    /// analysis is stored as an empty insight.
    async fn record_insight(&self, message: &Message) {
        let method = method_for(message.kind);
        let analysis = AssertUnwindSafe(self.analyze(message)).catch_unwind().await;

        let insight = match analysis {
            Ok(Ok(insight)) => insight,
            Ok(Err(e)) => {
                warn!("Moderation of {} failed: {:#}", message.id, e);
                self.empty_insight(message.id, method)
            }
            Err(_) => {
                error!("Moderation of {} panicked", message.id);
                self.empty_insight(message.id, method)
            }
        };

        let summary = summarize_labels(
            &insight,
            self.config.summary_min_confidence,
            self.config.summary_max_labels,
        );
        let stored = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    let inserted = queries::insert_insight(conn, &insight)?;
                    if inserted && !summary.is_empty() {
                        queries::set_media_summary(conn, insight.message_id, &summary)?;
                    }
                    Ok(inserted)
                })
                .map_err(Into::into)
            })
            .await;
        match stored {
            Ok(true) => debug!("Stored media insight for {}", message.id),
            Ok(false) => debug!("Media insight for {} already recorded", message.id),
            Err(e) => warn!("Failed to store media insight for {}: {}", message.id, e),
        }
    }

    async fn analyze(&self, message: &Message) -> anyhow::Result<MediaInsight> {
        let key = message
            .media_key
            .as_deref()
            .ok_or_else(|| anyhow!("message {} has no media", message.id))?;
        let bytes = self
            .store
            .get(key)
            .await
            .with_context(|| format!("download {}", key))?;
        let vision = &self.providers.vision;

        let (explicit, scene) = match message.kind {
            MessageKind::Image => {
                let explicit = vision.explicit_labels(bytes.clone()).await?;
                let scene = vision.scene_labels(bytes).await?;
                (explicit, scene)
            }
            MessageKind::Video => {
                let frame = self
                    .providers
                    .frames
                    .sample_frame(bytes)
                    .await
                    .context("sample video frame")?;
                (vision.explicit_labels(frame).await?, Vec::new())
            }
            other => return Err(anyhow!("cannot moderate {} messages", other.as_str())),
        };

        Ok(MediaInsight {
            message_id: message.id,
            explicit_labels: ranked(explicit),
            scene_labels: ranked(scene),
            method: method_for(message.kind).to_string(),
            created_at: Utc::now(),
        })
    }

    fn empty_insight(&self, message_id: Uuid, method: &str) -> MediaInsight {
        MediaInsight {
            message_id,
            explicit_labels: Vec::new(),
            scene_labels: Vec::new(),
            method: format!("{}-failed", method),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amora_db::models::TaskKind;
    use amora_db::testing::{seed_companion, seed_conversation};
    use amora_types::api::SendMediaRequest;
    use bytes::Bytes;

    use crate::storage::{ObjectStore, user_upload_prefix};
    use crate::testing::{FakeVision, Fakes, Harness};

    async fn send(h: &Harness, kind: MessageKind) -> (Uuid, Message) {
        let user = Uuid::new_v4();
        let conv = seed_conversation(h.db(), user, &seed_companion(h.db(), false));
        let key = format!("{}{}.bin", user_upload_prefix(conv.id), Uuid::new_v4());
        h.store.put(&key, Bytes::from_static(b"media")).await.unwrap();
        let permit = h.pipeline.mint_permit(user, "tok", None).await.unwrap();
        let msg = h
            .pipeline
            .send_media(user, conv.id, SendMediaRequest {
                permit_id: permit.id,
                kind,
                media_key: key,
                caption: None,
            })
            .await
            .unwrap();
        (conv.id, msg)
    }

    fn reply_tasks(h: &Harness, message_id: Uuid) -> Vec<amora_db::models::TaskRow> {
        h.db()
            .tasks_for_message(message_id)
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TaskKind::Reply)
            .collect()
    }

    #[tokio::test]
    async fn image_gets_ranked_labels_and_summary() {
        let h = Harness::new();
        let (cid, msg) = send(&h, MessageKind::Image).await;

        h.pipeline.moderate(cid, msg.id).await.unwrap();

        let insight = h.db().get_insight(msg.id).unwrap().unwrap();
        assert_eq!(insight.method, "vision-image");
        assert_eq!(insight.scene_labels[0].name, "Beach");
        assert_eq!(insight.scene_labels[1].name, "Sunset");

        let stored = h.db().get_message(msg.id).unwrap().unwrap();
        assert_eq!(stored.media_summary.as_deref(), Some("scene: Beach 97%, Sunset 84%"));
        assert_eq!(reply_tasks(&h, msg.id).len(), 1);
    }

    #[tokio::test]
    async fn video_uses_one_frame_for_explicit_labels_only() {
        let h = Harness::new();
        let (cid, msg) = send(&h, MessageKind::Video).await;

        h.pipeline.moderate(cid, msg.id).await.unwrap();

        let insight = h.db().get_insight(msg.id).unwrap().unwrap();
        assert_eq!(insight.method, "vision-video-frame");
        assert_eq!(insight.explicit_labels.len(), 1);
        assert!(insight.scene_labels.is_empty());
        assert_eq!(h.vision.calls(), 1);
    }

    #[tokio::test]
    async fn vision_failure_still_schedules_one_reply_in_window() {
        let h = Harness::with(Fakes {
            vision: FakeVision::failing(),
            ..Fakes::default()
        });
        let (cid, msg) = send(&h, MessageKind::Image).await;

        let before = Utc::now();
        h.pipeline.moderate(cid, msg.id).await.unwrap();
        let after = Utc::now();

        let insight = h.db().get_insight(msg.id).unwrap().unwrap();
        assert_eq!(insight.method, "vision-image-failed");
        assert!(insight.explicit_labels.is_empty() && insight.scene_labels.is_empty());
        assert!(h.db().get_message(msg.id).unwrap().unwrap().media_summary.is_none());

        let replies = reply_tasks(&h, msg.id);
        assert_eq!(replies.len(), 1);
        let run_at = replies[0].run_at.timestamp_millis();
        assert!(run_at >= before.timestamp_millis() + 2_500);
        assert!(run_at <= after.timestamp_millis() + 6_000);
    }

    #[tokio::test]
    async fn panicking_provider_still_schedules_reply() {
        let h = Harness::with(Fakes {
            vision: FakeVision::panicking(),
            ..Fakes::default()
        });
        let (cid, msg) = send(&h, MessageKind::Video).await;

        h.pipeline.moderate(cid, msg.id).await.unwrap();

        let insight = h.db().get_insight(msg.id).unwrap().unwrap();
        assert_eq!(insight.method, "vision-video-frame-failed");
        assert_eq!(reply_tasks(&h, msg.id).len(), 1);
    }

    #[test]
    fn summary_respects_threshold_and_budget() {
        let insight = MediaInsight {
            message_id: Uuid::nil(),
            explicit_labels: vec![
                Label { name: "Swimwear".into(), confidence: 91.0 },
                Label { name: "Underwear".into(), confidence: 80.0 },
            ],
            scene_labels: vec![
                Label { name: "Beach".into(), confidence: 97.0 },
                Label { name: "Sand".into(), confidence: 88.0 },
            ],
            method: "vision-image".into(),
            created_at: Utc::now(),
        };
        assert_eq!(
            summarize_labels(&insight, 80.0, 8),
            "explicit: Swimwear 91%; scene: Beach 97%, Sand 88%"
        );
        assert_eq!(summarize_labels(&insight, 80.0, 2), "explicit: Swimwear 91%; scene: Beach 97%");
        assert_eq!(summarize_labels(&insight, 99.0, 8), "");
    }
}
