use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use amora_pipeline::error::PipelineError;
use amora_types::api::ErrorBody;

/// `PipelineError` rendered as `{ "error": code, "message": text }`.
#[derive(Debug)]
pub struct ApiError(pub PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PipelineError::NotFound => StatusCode::NOT_FOUND,
            PipelineError::PermitInvalid => StatusCode::FORBIDDEN,
            PipelineError::PremiumRequired => StatusCode::PAYMENT_REQUIRED,
            PipelineError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::ChallengeInvalid | PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::ProviderFailure { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            PipelineError::Internal(e) => {
                error!("Internal error: {:#}", e);
                "internal server error".to_string()
            }
            PipelineError::ProviderFailure { .. } => {
                warn!("{}", self.0);
                self.0.to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: self.0.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        let cases = [
            (PipelineError::Unauthenticated, 401),
            (PipelineError::NotFound, 404),
            (PipelineError::PermitInvalid, 403),
            (PipelineError::PremiumRequired, 402),
            (PipelineError::QuotaExhausted, 429),
            (PipelineError::ChallengeInvalid, 400),
            (PipelineError::invalid("bad"), 400),
            (PipelineError::provider("llm", anyhow::anyhow!("down")), 502),
            (PipelineError::Internal(anyhow::anyhow!("db")), 500),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status().as_u16(), status);
        }
    }
}
