use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use amora_pipeline::Pipeline;
use amora_types::api::{Claims, ConversationResponse, CreateUploadRequest, UploadResponse};
use amora_types::models::Conversation;

use crate::error::ApiError;
use crate::messages::message_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: `created_at` of the oldest message on the previous page.
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    50
}

pub(crate) fn conversation_response(pipeline: &Pipeline, conv: Conversation) -> ConversationResponse {
    ConversationResponse {
        id: conv.id,
        companion_id: conv.companion_id,
        companion_avatar_url: conv.companion_avatar_key.as_deref().map(|k| pipeline.media_url(k)),
        companion_name: conv.companion_name,
        free_remaining: conv.free_remaining,
        premium_active: conv.premium_active,
        premium_only: conv.girl_premium_only,
        last_message_text: conv.last_message_text,
        last_message_kind: conv.last_message_kind,
        last_message_at: conv.last_message_at,
        heavy_cooldown_until: conv.heavy_cooldown_until,
    }
}

/// POST /companions/{companion_id}/conversation
pub async fn open_conversation(
    State(state): State<AppState>,
    Path(companion_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conv = state.pipeline.open_conversation(claims.sub, companion_id).await?;
    Ok(Json(conversation_response(&state.pipeline, conv)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let conv = state.pipeline.conversation(claims.sub, conversation_id).await?;
    Ok(Json(conversation_response(&state.pipeline, conv)))
}

pub async fn clear_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.pipeline.clear_conversation(claims.sub, conversation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .pipeline
        .list_messages(claims.sub, conversation_id, query.limit, query.before)
        .await?;

    let body: Vec<_> = messages
        .into_iter()
        .map(|m| message_response(&state.pipeline, m))
        .collect();
    Ok(Json(body))
}

/// POST /conversations/{id}/uploads. Reserves a key and returns a signed PUT URL.
pub async fn create_upload(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateUploadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let upload = state
        .pipeline
        .create_upload(claims.sub, conversation_id, req.kind, &req.content_type)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            media_key: upload.media_key,
            upload_url: upload.url.url,
            expires_at: upload.url.expires_at,
        }),
    ))
}
