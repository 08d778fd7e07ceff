use std::str::FromStr;
use std::time::Duration;

use amora_types::models::FreeRemaining;
use rand::Rng;

/// Inclusive delay window a reply is scheduled within.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterWindow {
    pub min: Duration,
    pub max: Duration,
}

impl JitterWindow {
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if hi <= lo {
            return self.min;
        }
        Duration::from_millis(rng.random_range(lo..=hi))
    }

    pub fn contains(&self, delay: Duration) -> bool {
        delay >= self.min && delay <= self.max
    }
}

/// Uses and lifetime granted to a freshly minted permit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PermitPolicy {
    pub uses: i64,
    pub ttl: Duration,
}

/// Immutable runtime configuration, built once at startup and shared.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Counters given to a new conversation.
    pub initial_free: FreeRemaining,
    pub permit_free: PermitPolicy,
    pub permit_premium: PermitPolicy,
    /// Messages rendered into the model context.
    pub context_turns: u32,
    pub heavy_cooldown: Duration,
    pub media_seen_cap: usize,
    pub text_reply_jitter: JitterWindow,
    pub image_reply_jitter: JitterWindow,
    pub video_reply_jitter: JitterWindow,
    /// Labels above this confidence (percent) make it into `media_summary`.
    pub summary_min_confidence: f32,
    pub summary_max_labels: usize,
    /// Length of the raw-output snippet a malformed decision degrades to.
    pub degraded_snippet_chars: usize,
    pub max_text_chars: usize,
    pub upgrade_nudge: String,
    pub fallback_reply: String,
    pub signed_url_ttl: Duration,
    pub scheduler_poll_interval: Duration,
    pub scheduler_batch: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            initial_free: FreeRemaining {
                text: 30,
                media: 3,
                audio: 3,
            },
            permit_free: PermitPolicy {
                uses: 20,
                ttl: Duration::from_secs(10 * 60),
            },
            permit_premium: PermitPolicy {
                uses: 60,
                ttl: Duration::from_secs(30 * 60),
            },
            context_turns: 8,
            heavy_cooldown: Duration::from_secs(45),
            media_seen_cap: 20,
            text_reply_jitter: JitterWindow::from_millis(2_000, 7_000),
            image_reply_jitter: JitterWindow::from_millis(2_500, 6_000),
            video_reply_jitter: JitterWindow::from_millis(3_500, 7_000),
            summary_min_confidence: 80.0,
            summary_max_labels: 8,
            degraded_snippet_chars: 180,
            max_text_chars: 2_000,
            upgrade_nudge: "I'd love to send you more, but you're out of free ones. Upgrade and I'm all yours."
                .to_string(),
            fallback_reply: "Mmm, tell me more.".to_string(),
            signed_url_ttl: Duration::from_secs(15 * 60),
            scheduler_poll_interval: Duration::from_millis(250),
            scheduler_batch: 32,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `AMORA_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        Ok(Self {
            initial_free: FreeRemaining {
                text: env_or("AMORA_FREE_TEXT", d.initial_free.text)?,
                media: env_or("AMORA_FREE_MEDIA", d.initial_free.media)?,
                audio: env_or("AMORA_FREE_AUDIO", d.initial_free.audio)?,
            },
            permit_free: PermitPolicy {
                uses: env_or("AMORA_PERMIT_USES", d.permit_free.uses)?,
                ttl: Duration::from_secs(env_or("AMORA_PERMIT_TTL_SECS", d.permit_free.ttl.as_secs())?),
            },
            permit_premium: PermitPolicy {
                uses: env_or("AMORA_PREMIUM_PERMIT_USES", d.permit_premium.uses)?,
                ttl: Duration::from_secs(env_or(
                    "AMORA_PREMIUM_PERMIT_TTL_SECS",
                    d.permit_premium.ttl.as_secs(),
                )?),
            },
            context_turns: env_or("AMORA_CONTEXT_TURNS", d.context_turns)?,
            media_seen_cap: env_or("AMORA_MEDIA_SEEN_CAP", d.media_seen_cap)?,
            signed_url_ttl: Duration::from_secs(env_or(
                "AMORA_SIGNED_URL_TTL_SECS",
                d.signed_url_ttl.as_secs(),
            )?),
            ..d
        })
    }

    pub fn permit_policy(&self, premium: bool) -> PermitPolicy {
        if premium { self.permit_premium } else { self.permit_free }
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}
