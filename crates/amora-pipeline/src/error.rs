use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("not found")]
    NotFound,

    #[error("send permit is missing, expired, exhausted or for another scope")]
    PermitInvalid,

    #[error("human verification failed")]
    ChallengeInvalid,

    #[error("this companion requires premium")]
    PremiumRequired,

    #[error("free message quota exhausted")]
    QuotaExhausted,

    #[error("{0}")]
    InvalidInput(String),

    #[error("{provider} failed: {source}")]
    ProviderFailure {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn provider(provider: impl Into<String>, source: anyhow::Error) -> Self {
        Self::ProviderFailure {
            provider: provider.into(),
            source,
        }
    }

    /// Stable machine-readable code for API bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::NotFound => "not_found",
            Self::PermitInvalid => "permit_invalid",
            Self::ChallengeInvalid => "challenge_invalid",
            Self::PremiumRequired => "premium_required",
            Self::QuotaExhausted => "quota_exhausted",
            Self::InvalidInput(_) => "invalid_input",
            Self::ProviderFailure { .. } => "provider_failure",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
