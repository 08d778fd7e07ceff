//! Delayed work behind one abstraction: which task a send triggers, how long
//! a reply waits, and the worker that drains the durable queue.

use std::sync::Arc;
use std::time::Duration;

use amora_db::models::{TaskKind, TaskRow};
use amora_db::tasks;
use amora_types::models::MessageKind;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rusqlite::Connection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Pipeline;
use crate::config::{JitterWindow, PipelineConfig};
use crate::error::Result;

#[derive(Clone)]
pub struct Scheduler {
    config: Arc<PipelineConfig>,
}

impl Scheduler {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    /// Jitter applied before a reply to a message of `kind`. Audio has none:
    /// its reply runs straight after transcription.
    pub fn reply_jitter(&self, kind: MessageKind) -> Option<JitterWindow> {
        match kind {
            MessageKind::Text => Some(self.config.text_reply_jitter),
            MessageKind::Image => Some(self.config.image_reply_jitter),
            MessageKind::Video => Some(self.config.video_reply_jitter),
            MessageKind::Audio => None,
        }
    }

    pub fn schedule_reply(
        &self,
        conn: &Connection,
        conversation_id: Uuid,
        message_id: Uuid,
        delay: Duration,
    ) -> anyhow::Result<Uuid> {
        let run_at = after(Utc::now(), delay);
        debug!("Reply to {} scheduled in {}ms", message_id, delay.as_millis());
        tasks::enqueue(conn, TaskKind::Reply, conversation_id, Some(message_id), run_at)
    }

    /// Queue the follow-up work for a freshly inserted user message. Runs on
    /// the ingestion transaction.
    pub fn after_user_send(
        &self,
        conn: &Connection,
        kind: MessageKind,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        match kind {
            MessageKind::Text => {
                let delay = self.pick_delay(kind);
                self.schedule_reply(conn, conversation_id, message_id, delay)?;
            }
            MessageKind::Image | MessageKind::Video => {
                tasks::enqueue(conn, TaskKind::Moderate, conversation_id, Some(message_id), now)?;
            }
            MessageKind::Audio => {
                tasks::enqueue(conn, TaskKind::Transcribe, conversation_id, Some(message_id), now)?;
            }
        }
        Ok(())
    }

    /// Queue the reply once moderation of a media message has terminated.
    pub fn after_moderation(
        &self,
        conn: &Connection,
        kind: MessageKind,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> anyhow::Result<()> {
        let delay = self.pick_delay(kind);
        self.schedule_reply(conn, conversation_id, message_id, delay)?;
        Ok(())
    }

    fn pick_delay(&self, kind: MessageKind) -> Duration {
        self.reply_jitter(kind)
            .map(|window| window.pick(&mut rand::rng()))
            .unwrap_or_default()
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_default()
}

/// Claims a failing moderation or transcription task gets before it is dropped.
const MAX_TASK_ATTEMPTS: i64 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

impl Pipeline {
    /// Execute one claimed task. It leaves the queue when it finishes, or is
    /// put back with a backoff when it failed before its reply was scheduled.
    pub async fn run_task(&self, task: TaskRow) {
        let result = match (task.kind, task.message_id) {
            (TaskKind::Reply, message_id) => {
                self.run_reply(task.conversation_id, message_id).await;
                Ok(())
            }
            (TaskKind::Moderate, Some(message_id)) => {
                self.moderate(task.conversation_id, message_id).await
            }
            (TaskKind::Transcribe, Some(message_id)) => {
                self.transcribe(task.conversation_id, message_id).await
            }
            (kind, None) => {
                warn!("Dropping {} task {} without a message", kind.as_str(), task.id);
                Ok(())
            }
        };

        let id = task.id;
        match result {
            Ok(()) => {}
            Err(e) if task.attempts < MAX_TASK_ATTEMPTS => {
                let delay = RETRY_BACKOFF * task.attempts.max(1) as u32;
                warn!(
                    "{} task {} failed (attempt {}), retrying in {}s: {}",
                    task.kind.as_str(),
                    id,
                    task.attempts,
                    delay.as_secs(),
                    e
                );
                let run_at = after(Utc::now(), delay);
                match self.blocking(move |db| Ok(db.retry_task(id, run_at)?)).await {
                    Ok(()) => return,
                    Err(e) => warn!("Failed to requeue task {}: {}", id, e),
                }
            }
            Err(e) => error!(
                "{} task {} failed after {} attempts, dropping it: {}",
                task.kind.as_str(),
                id,
                task.attempts,
                e
            ),
        }

        if let Err(e) = self.blocking(move |db| Ok(db.complete_task(id)?)).await {
            warn!("Failed to complete task {}: {}", id, e);
        }
    }

    /// Claim and run every task due at `now`, waiting for all of them.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let limit = self.config.scheduler_batch;
        let due = self.blocking(move |db| Ok(db.claim_due_tasks(now, limit)?)).await?;
        let count = due.len();
        join_all(due.into_iter().map(|task| self.run_task(task))).await;
        Ok(count)
    }
}

/// Background loop draining the task queue. Tasks run concurrently on their
/// own tokio tasks so a slow reply never holds up the next poll.
pub async fn run_worker(pipeline: Arc<Pipeline>) {
    match pipeline.blocking(|db| Ok(db.release_running_tasks()?)).await {
        Ok(0) => {}
        Ok(count) => info!("Scheduler: released {} tasks left running by a previous process", count),
        Err(e) => warn!("Scheduler: failed to release running tasks: {}", e),
    }

    let mut interval = tokio::time::interval(pipeline.config.scheduler_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let limit = pipeline.config.scheduler_batch;

    loop {
        interval.tick().await;

        let now = Utc::now();
        let due = match pipeline.blocking(move |db| Ok(db.claim_due_tasks(now, limit)?)).await {
            Ok(due) => due,
            Err(e) => {
                warn!("Scheduler poll error: {}", e);
                continue;
            }
        };

        for task in due {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline.run_task(task).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amora_db::Database;
    use amora_db::testing::{seed_companion, seed_conversation};
    use amora_types::api::{SendAudioRequest, SendMediaRequest};
    use amora_types::models::{Conversation, Sender};
    use bytes::Bytes;

    use crate::storage::{ObjectStore, user_upload_prefix};
    use crate::testing::{Fakes, Harness};

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(PipelineConfig::default()))
    }

    #[test]
    fn text_send_schedules_reply_inside_jitter() {
        let db = Database::open_in_memory().unwrap();
        let scheduler = scheduler();
        let (cid, mid) = (Uuid::new_v4(), Uuid::new_v4());

        let before = Utc::now();
        db.with_conn(|conn| scheduler.after_user_send(conn, MessageKind::Text, cid, mid))
            .unwrap();
        let after = Utc::now();

        let tasks = db.tasks_for_message(mid).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::Reply);
        let run_at = tasks[0].run_at.timestamp_millis();
        assert!(run_at >= before.timestamp_millis() + 2_000);
        assert!(run_at <= after.timestamp_millis() + 7_000);
    }

    #[test]
    fn media_and_audio_sends_defer_the_reply() {
        let db = Database::open_in_memory().unwrap();
        let scheduler = scheduler();
        let cid = Uuid::new_v4();

        for (kind, expected) in [
            (MessageKind::Image, TaskKind::Moderate),
            (MessageKind::Video, TaskKind::Moderate),
            (MessageKind::Audio, TaskKind::Transcribe),
        ] {
            let mid = Uuid::new_v4();
            db.with_conn(|conn| scheduler.after_user_send(conn, kind, cid, mid))
                .unwrap();
            let tasks = db.tasks_for_message(mid).unwrap();
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].kind, expected);
            assert!(tasks[0].run_at <= Utc::now());
        }
    }

    #[test]
    fn jitter_windows_scale_with_analysis_cost() {
        let scheduler = scheduler();
        let text = scheduler.reply_jitter(MessageKind::Text).unwrap();
        let image = scheduler.reply_jitter(MessageKind::Image).unwrap();
        let video = scheduler.reply_jitter(MessageKind::Video).unwrap();
        assert_eq!(text, JitterWindow::from_millis(2_000, 7_000));
        assert_eq!(image, JitterWindow::from_millis(2_500, 6_000));
        assert_eq!(video, JitterWindow::from_millis(3_500, 7_000));
        assert!(scheduler.reply_jitter(MessageKind::Audio).is_none());
    }

    async fn upload(h: &Harness, conv: &Conversation, ext: &str) -> String {
        let key = format!("{}{}.{}", user_upload_prefix(conv.id), Uuid::new_v4(), ext);
        h.store.put(&key, Bytes::from_static(b"bytes")).await.unwrap();
        key
    }

    fn later(secs: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn image_send_drains_through_moderation_and_reply() {
        let h = Harness::new();
        let user = Uuid::new_v4();
        let conv = seed_conversation(h.db(), user, &seed_companion(h.db(), false));
        let permit = h.pipeline.mint_permit(user, "tok", None).await.unwrap();
        let key = upload(&h, &conv, "jpg").await;
        let msg = h
            .pipeline
            .send_media(user, conv.id, SendMediaRequest {
                permit_id: permit.id,
                kind: MessageKind::Image,
                media_key: key,
                caption: None,
            })
            .await
            .unwrap();

        // Moderation first, which queues the jittered reply.
        assert_eq!(h.pipeline.run_due(later(10)).await.unwrap(), 1);
        assert!(h.db().get_insight(msg.id).unwrap().is_some());
        let pending = h.db().tasks_for_message(msg.id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TaskKind::Reply);

        assert_eq!(h.pipeline.run_due(later(10)).await.unwrap(), 1);
        let messages = h.pipeline.list_messages(user, conv.id, 50, None).await.unwrap();
        assert_eq!(messages.iter().filter(|m| m.sender == Sender::Ai).count(), 1);

        assert!(h.db().tasks_for_message(msg.id).unwrap().is_empty());
        assert_eq!(h.pipeline.run_due(later(60)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn audio_send_replies_straight_after_transcription() {
        let h = Harness::new();
        let user = Uuid::new_v4();
        let conv = seed_conversation(h.db(), user, &seed_companion(h.db(), false));
        let permit = h.pipeline.mint_permit(user, "tok", None).await.unwrap();
        let key = upload(&h, &conv, "mp3").await;
        let msg = h
            .pipeline
            .send_audio(user, conv.id, SendAudioRequest {
                permit_id: permit.id,
                media_key: key,
                duration_ms: Some(4_000),
            })
            .await
            .unwrap();

        assert_eq!(h.pipeline.run_due(later(10)).await.unwrap(), 1);

        let stored = h.db().get_message(msg.id).unwrap().unwrap();
        assert_eq!(stored.transcript.as_deref(), Some("hola guapa"));
        let messages = h.pipeline.list_messages(user, conv.id, 50, None).await.unwrap();
        assert_eq!(messages.iter().filter(|m| m.sender == Sender::Ai).count(), 1);
        assert!(h.db().tasks_for_message(msg.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn moderation_is_retried_when_the_reply_cannot_be_queued() {
        let h = Harness::new();
        let user = Uuid::new_v4();
        let conv = seed_conversation(h.db(), user, &seed_companion(h.db(), false));
        let permit = h.pipeline.mint_permit(user, "tok", None).await.unwrap();
        let key = upload(&h, &conv, "jpg").await;
        let msg = h
            .pipeline
            .send_media(user, conv.id, SendMediaRequest {
                permit_id: permit.id,
                kind: MessageKind::Image,
                media_key: key,
                caption: None,
            })
            .await
            .unwrap();

        h.db()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER refuse_replies BEFORE INSERT ON scheduled_tasks
                     WHEN NEW.kind = 'reply'
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let started = Utc::now();
        assert_eq!(h.pipeline.run_due(later(10)).await.unwrap(), 1);

        let kept = h.db().tasks_for_message(msg.id).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].kind, TaskKind::Moderate);
        assert_eq!(kept[0].attempts, 1);
        assert!(kept[0].run_at >= started + chrono::Duration::seconds(5));
        assert_eq!(h.vision.calls(), 2);

        h.db()
            .with_conn(|conn| {
                conn.execute_batch("DROP TRIGGER refuse_replies;")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(h.pipeline.run_due(later(10)).await.unwrap(), 1);

        let queued = h.db().tasks_for_message(msg.id).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, TaskKind::Reply);
        // The stored insight is reused, so the media is not analyzed twice.
        assert_eq!(h.vision.calls(), 2);
    }

    #[tokio::test]
    async fn worker_drains_the_queue_in_the_background() {
        let config = PipelineConfig {
            scheduler_poll_interval: Duration::from_millis(20),
            ..PipelineConfig::default()
        };
        let h = Harness::with_config(Fakes::default(), config);
        let user = Uuid::new_v4();
        let conv = seed_conversation(h.db(), user, &seed_companion(h.db(), false));
        let permit = h.pipeline.mint_permit(user, "tok", None).await.unwrap();
        let key = upload(&h, &conv, "mp3").await;
        let msg = h
            .pipeline
            .send_audio(user, conv.id, SendAudioRequest {
                permit_id: permit.id,
                media_key: key,
                duration_ms: None,
            })
            .await
            .unwrap();

        let worker = tokio::spawn(run_worker(h.pipeline.clone()));
        let mut drained = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if h.db().tasks_for_message(msg.id).unwrap().is_empty() {
                drained = true;
                break;
            }
        }
        worker.abort();

        assert!(drained);
        let messages = h.pipeline.list_messages(user, conv.id, 50, None).await.unwrap();
        assert_eq!(messages.iter().filter(|m| m.sender == Sender::Ai).count(), 1);
    }
}
