use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};

use amora_types::api::{Claims, MintPermitRequest, PermitResponse};

use crate::error::ApiError;
use crate::state::AppState;

/// POST /permits: trade a human-verification token for a send permit.
pub async fn mint_permit(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MintPermitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let permit = state
        .pipeline
        .mint_permit(claims.sub, &req.challenge_token, req.scope.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PermitResponse {
            permit_id: permit.id,
            uses_left: permit.uses_left,
            expires_at: permit.expires_at,
            scope: permit.scope,
            premium: permit.premium_at_mint,
        }),
    ))
}
