//! Reply decisions: build the context, ask the model, then walk an ordered
//! list of reply strategies until one produces a message.

use std::collections::HashMap;

use amora_db::models::{NewMessage, QuotaCounter, ReplyEffect};
use amora_db::outcomes::{self, ReplyApplied};
use amora_db::queries;
use amora_types::models::{Conversation, Message, MessageKind, Sender};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Pipeline;
use crate::context::{render_turns, system_prompt};
use crate::decision::{Decision, companion_likes, parse_decision};
use crate::error::{PipelineError, Result};
use crate::providers::ChatTurn;
use crate::selector::select_asset;

/// Why a preferred reply modality was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degrade {
    QuotaExhausted,
    NoVoice,
    NoText,
    SynthesisFailed,
    NoAssets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Voice,
    Media(MessageKind),
    Text,
}

fn strategies(kind: MessageKind) -> &'static [Strategy] {
    match kind {
        MessageKind::Audio => &[Strategy::Voice, Strategy::Text],
        MessageKind::Image => &[Strategy::Media(MessageKind::Image), Strategy::Text],
        MessageKind::Video => &[Strategy::Media(MessageKind::Video), Strategy::Text],
        MessageKind::Text => &[Strategy::Text],
    }
}

struct Planned {
    kind: MessageKind,
    text: Option<String>,
    media_key: Option<String>,
    effect: ReplyEffect,
}

enum Step {
    Done(Planned),
    Continue(Degrade),
}

#[derive(Debug)]
pub struct ReplyOutcome {
    pub message: Message,
    pub decision: Decision,
    /// Set when the decided modality fell back to text.
    pub degraded: Option<Degrade>,
}

impl Pipeline {
    /// One reply attempt. Fails only when the conversation is gone, storage
    /// errors, or every model tier fails.
    pub async fn reply(
        &self,
        conversation_id: Uuid,
        user_message_id: Option<Uuid>,
    ) -> Result<ReplyOutcome> {
        let (conv, turns) = self.build_context(conversation_id).await?;
        let system = system_prompt(&conv);

        let raw = self.providers.llm.complete(&system, &turns).await?;
        let decision = parse_decision(&raw, self.config.degraded_snippet_chars);
        if decision.degraded {
            info!("Model output for {} was not a valid decision; replying with text", conversation_id);
        }
        debug!("Decision for {}: {:?} tags={:?}", conversation_id, decision.kind, decision.tags);

        let mut degraded = None;
        let mut planned = None;
        for strategy in strategies(decision.kind) {
            match self.attempt(*strategy, &conv, &decision, degraded).await? {
                Step::Done(plan) => {
                    planned = Some(plan);
                    break;
                }
                Step::Continue(reason) => {
                    info!("{:?} reply for {} degraded: {:?}", strategy, conversation_id, reason);
                    degraded = Some(reason);
                }
            }
        }
        let mut planned = match planned {
            Some(plan) => plan,
            None => self.text_plan(&decision, degraded),
        };

        planned.effect.like_message_id = user_message_id.filter(|id| companion_likes(*id));
        planned.effect.answers_message_id = user_message_id;

        // Written instead if the counter the plan spends is gone by write time.
        let mut nudge = self.text_plan(&decision, Some(Degrade::QuotaExhausted));
        nudge.effect.like_message_id = planned.effect.like_message_id;
        nudge.effect.answers_message_id = user_message_id;

        let now = Utc::now();
        let reply_message = move |plan: Planned| {
            let msg = NewMessage {
                id: Uuid::new_v4(),
                conversation_id,
                user_id: conv.user_id,
                sender: Sender::Ai,
                kind: plan.kind,
                text: plan.text,
                media_key: plan.media_key,
                duration_ms: None,
                reply_to: None,
                created_at: now,
            };
            (msg, plan.effect)
        };
        let first = reply_message(planned);
        let second = reply_message(nudge);

        let (message, quota_gone) = self
            .blocking(move |db| {
                db.with_tx(|tx| -> Result<(Message, bool)> {
                    let (mut msg, mut effect) = first;
                    let mut quota_gone = false;
                    if outcomes::apply_reply(tx, &msg, &effect)? == ReplyApplied::QuotaGone {
                        (msg, effect) = second;
                        quota_gone = true;
                        outcomes::apply_reply(tx, &msg, &effect)?;
                    }
                    let message = queries::get_message(tx, msg.id)?.ok_or_else(|| {
                        PipelineError::Internal(anyhow::anyhow!("reply {} vanished after insert", msg.id))
                    })?;
                    Ok((message, quota_gone))
                })
            })
            .await?;
        if quota_gone {
            info!("Quota for {} was spent before the reply was written; sent text", conversation_id);
            degraded = Some(Degrade::QuotaExhausted);
        }

        Ok(ReplyOutcome {
            message,
            decision,
            degraded,
        })
    }

    /// Run a reply attempt to completion, recording failure on the user
    /// message that triggered it.
    pub async fn run_reply(&self, conversation_id: Uuid, user_message_id: Option<Uuid>) {
        match self.reply(conversation_id, user_message_id).await {
            Ok(outcome) => info!(
                "Replied {} in conversation {} (message {})",
                outcome.message.kind.as_str(),
                conversation_id,
                outcome.message.id
            ),
            Err(e) => {
                error!("Reply attempt in conversation {} failed: {}", conversation_id, e);
                let Some(message_id) = user_message_id else {
                    return;
                };
                let flagged = self
                    .blocking(move |db| {
                        db.with_conn(|conn| queries::set_ai_error(conn, message_id, true))
                            .map_err(Into::into)
                    })
                    .await;
                if let Err(e) = flagged {
                    warn!("Failed to flag message {}: {}", message_id, e);
                }
            }
        }
    }

    async fn build_context(&self, conversation_id: Uuid) -> Result<(Conversation, Vec<ChatTurn>)> {
        let turns = self.config.context_turns;
        let (conv, recent, insights) = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    let Some(conv) = queries::get_conversation(conn, conversation_id)? else {
                        return Ok(None);
                    };
                    let recent = queries::recent_messages(conn, conversation_id, conv.cleared_at, turns)?;
                    let missing: Vec<Uuid> = recent
                        .iter()
                        .filter(|m| matches!(m.kind, MessageKind::Image | MessageKind::Video))
                        .filter(|m| m.media_summary.is_none())
                        .map(|m| m.id)
                        .collect();
                    let insights = queries::insights_for_messages(conn, &missing)?;
                    Ok(Some((conv, recent, insights)))
                })?
                .ok_or(PipelineError::NotFound)
            })
            .await?;

        let insights: HashMap<Uuid, _> = insights.into_iter().map(|i| (i.message_id, i)).collect();
        let rendered = render_turns(
            &recent,
            &insights,
            self.config.summary_min_confidence,
            self.config.summary_max_labels,
        );
        Ok((conv, rendered))
    }

    async fn attempt(
        &self,
        strategy: Strategy,
        conv: &Conversation,
        decision: &Decision,
        degraded: Option<Degrade>,
    ) -> Result<Step> {
        match strategy {
            Strategy::Voice => Ok(self.voice_reply(conv, decision).await),
            Strategy::Media(kind) => self.media_reply(conv, decision, kind).await,
            Strategy::Text => Ok(Step::Done(self.text_plan(decision, degraded))),
        }
    }

    async fn voice_reply(&self, conv: &Conversation, decision: &Decision) -> Step {
        let premium = conv.premium_active;
        if !premium && conv.free_remaining.audio <= 0 {
            return Step::Continue(Degrade::QuotaExhausted);
        }
        let Some(voice_id) = conv.companion_voice_id.as_deref() else {
            return Step::Continue(Degrade::NoVoice);
        };
        let Some(text) = decision.text.as_deref() else {
            return Step::Continue(Degrade::NoText);
        };

        let key = match self.speech.ensure(voice_id, text).await {
            Ok(key) => key,
            Err(e) => {
                warn!("Speech synthesis for {} failed: {:#}", conv.id, e);
                return Step::Continue(Degrade::SynthesisFailed);
            }
        };

        let cooldown = chrono::Duration::from_std(self.config.heavy_cooldown).unwrap_or_default();
        Step::Done(Planned {
            kind: MessageKind::Audio,
            text: Some(text.to_string()),
            media_key: Some(key.clone()),
            effect: ReplyEffect {
                decrement: (!premium).then_some(QuotaCounter::Audio),
                cooldown_until: Some(Utc::now() + cooldown),
                seen: Some((MessageKind::Audio, key, self.config.media_seen_cap)),
                ..ReplyEffect::default()
            },
        })
    }

    async fn media_reply(
        &self,
        conv: &Conversation,
        decision: &Decision,
        kind: MessageKind,
    ) -> Result<Step> {
        let premium = conv.premium_active;
        if !premium && conv.free_remaining.media <= 0 {
            return Ok(Step::Continue(Degrade::QuotaExhausted));
        }

        let companion_id = conv.companion_id;
        let assets = self
            .blocking(move |db| Ok(db.published_assets(companion_id, kind)?))
            .await?;
        let Some(asset) = select_asset(&assets, &decision.tags, &conv.media_seen, &mut rand::rng())
        else {
            return Ok(Step::Continue(Degrade::NoAssets));
        };
        debug!("Selected {} asset {} for {}", kind.as_str(), asset.id, conv.id);

        Ok(Step::Done(Planned {
            kind,
            text: decision.text.clone(),
            media_key: Some(asset.media_key.clone()),
            effect: ReplyEffect {
                decrement: (!premium).then_some(QuotaCounter::Media),
                seen: Some((kind, asset.media_key.clone(), self.config.media_seen_cap)),
                ..ReplyEffect::default()
            },
        }))
    }

    fn text_plan(&self, decision: &Decision, degraded: Option<Degrade>) -> Planned {
        let text = decision.text.clone().unwrap_or_else(|| match degraded {
            Some(Degrade::QuotaExhausted) => self.config.upgrade_nudge.clone(),
            _ => self.config.fallback_reply.clone(),
        });
        Planned {
            kind: MessageKind::Text,
            text: Some(text),
            media_key: None,
            effect: ReplyEffect::default(),
        }
    }
}
