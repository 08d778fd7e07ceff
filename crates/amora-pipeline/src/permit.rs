use amora_db::queries;
use amora_types::models::{Permit, SEND_SCOPE};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::Pipeline;
use crate::error::{PipelineError, Result};

impl Pipeline {
    /// Verify a human-presence challenge and issue a send permit sized by the
    /// user's current entitlement.
    pub async fn mint_permit(
        &self,
        user_id: Uuid,
        challenge_token: &str,
        scope: Option<&str>,
    ) -> Result<Permit> {
        let scope = scope.unwrap_or(SEND_SCOPE);
        if scope != SEND_SCOPE {
            return Err(PipelineError::invalid(format!("unknown permit scope '{}'", scope)));
        }
        if challenge_token.trim().is_empty() {
            return Err(PipelineError::ChallengeInvalid);
        }

        let passed = self
            .providers
            .challenge
            .verify(challenge_token)
            .await
            .map_err(|e| PipelineError::provider("challenge", e))?;
        if !passed {
            warn!("Challenge rejected for user {}", user_id);
            return Err(PipelineError::ChallengeInvalid);
        }

        let config = self.config.clone();
        let now = Utc::now();
        let permit = self
            .blocking(move |db| {
                let premium = db.is_premium(user_id, now)?;
                let policy = config.permit_policy(premium);
                let permit = Permit {
                    id: Uuid::new_v4(),
                    user_id,
                    uses_left: policy.uses,
                    expires_at: now + chrono::Duration::from_std(policy.ttl).unwrap_or_default(),
                    scope: SEND_SCOPE.to_string(),
                    premium_at_mint: premium,
                };
                db.insert_permit(&permit)?;
                Ok(permit)
            })
            .await?;

        info!(
            "Minted permit {} for user {} ({} uses, premium={})",
            permit.id, user_id, permit.uses_left, permit.premium_at_mint
        );
        Ok(permit)
    }
}

/// Spend one use of a permit on the caller's transaction.
pub fn consume(
    conn: &Connection,
    permit_id: Uuid,
    user_id: Uuid,
    scope: &str,
    now: DateTime<Utc>,
) -> Result<Permit> {
    queries::consume_permit(conn, permit_id, user_id, scope, now)?
        .ok_or(PipelineError::PermitInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChallenge, Fakes, Harness};

    #[tokio::test]
    async fn premium_users_get_bigger_permits() {
        let h = Harness::new();
        let free_user = Uuid::new_v4();
        let premium_user = Uuid::new_v4();
        h.db()
            .with_conn(|conn| {
                queries::set_premium_until(conn, premium_user, Utc::now() + chrono::Duration::days(30))
            })
            .unwrap();

        let free = h.pipeline.mint_permit(free_user, "tok", None).await.unwrap();
        let premium = h.pipeline.mint_permit(premium_user, "tok", Some(SEND_SCOPE)).await.unwrap();

        assert!(!free.premium_at_mint);
        assert_eq!(free.uses_left, 20);
        assert!(premium.premium_at_mint);
        assert_eq!(premium.uses_left, 60);
        assert!(premium.expires_at > free.expires_at);
        assert!(h.db().get_permit(free.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entitlement_is_not_premium() {
        let h = Harness::new();
        let user = Uuid::new_v4();
        h.db()
            .with_conn(|conn| queries::set_premium_until(conn, user, Utc::now() - chrono::Duration::hours(1)))
            .unwrap();
        assert!(!h.pipeline.mint_permit(user, "tok", None).await.unwrap().premium_at_mint);
    }

    #[tokio::test]
    async fn rejected_challenge_mints_nothing() {
        let h = Harness::with(Fakes {
            challenge: FakeChallenge::Rejecting,
            ..Fakes::default()
        });
        let err = h.pipeline.mint_permit(Uuid::new_v4(), "tok", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::ChallengeInvalid));

        let err = Harness::new().pipeline.mint_permit(Uuid::new_v4(), "  ", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::ChallengeInvalid));
    }

    #[tokio::test]
    async fn verifier_outage_is_a_provider_failure() {
        let h = Harness::with(Fakes {
            challenge: FakeChallenge::Unreachable,
            ..Fakes::default()
        });
        let err = h.pipeline.mint_permit(Uuid::new_v4(), "tok", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProviderFailure { .. }));
    }

    #[tokio::test]
    async fn unknown_scope_is_rejected() {
        let h = Harness::new();
        let err = h.pipeline.mint_permit(Uuid::new_v4(), "tok", Some("admin")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
