use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::ChallengeVerifier;

/// Cloudflare Turnstile style `siteverify` endpoint.
pub struct TurnstileVerifier {
    client: reqwest::Client,
    verify_url: String,
    secret: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

impl TurnstileVerifier {
    pub fn new(verify_url: &str, secret: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            verify_url: verify_url.to_string(),
            secret: secret.to_string(),
        })
    }
}

#[async_trait]
impl ChallengeVerifier for TurnstileVerifier {
    async fn verify(&self, token: &str) -> Result<bool> {
        if token.trim().is_empty() {
            return Ok(false);
        }

        let response: VerifyResponse = self
            .client
            .post(&self.verify_url)
            .form(&[("secret", self.secret.as_str()), ("response", token)])
            .send()
            .await
            .context("challenge verify request")?
            .error_for_status()?
            .json()
            .await
            .context("challenge verify body")?;

        if !response.success {
            tracing::debug!("Challenge rejected: {:?}", response.error_codes);
        }
        Ok(response.success)
    }
}
