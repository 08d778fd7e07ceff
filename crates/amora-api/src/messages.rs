use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use amora_pipeline::Pipeline;
use amora_types::api::{
    Claims, LikeResponse, MessageResponse, SendAudioRequest, SendMediaRequest, SendTextRequest,
};
use amora_types::models::Message;

use crate::error::ApiError;
use crate::state::AppState;

/// API view of a message; media keys become time-boxed download URLs.
pub(crate) fn message_response(pipeline: &Pipeline, m: Message) -> MessageResponse {
    MessageResponse {
        media_url: m.media_key.as_deref().map(|k| pipeline.media_url(k)),
        id: m.id,
        conversation_id: m.conversation_id,
        sender: m.sender,
        kind: m.kind,
        text: m.text,
        duration_ms: m.duration_ms,
        transcript: m.transcript,
        liked_by_user: m.liked_by_user,
        liked_by_ai: m.liked_by_ai,
        ai_error: m.ai_error,
        reply_to: m.reply_to,
        created_at: m.created_at,
    }
}

pub async fn send_text(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendTextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let msg = state.pipeline.send_text(claims.sub, conversation_id, req).await?;
    Ok((StatusCode::CREATED, Json(message_response(&state.pipeline, msg))))
}

pub async fn send_media(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMediaRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let msg = state.pipeline.send_media(claims.sub, conversation_id, req).await?;
    Ok((StatusCode::CREATED, Json(message_response(&state.pipeline, msg))))
}

pub async fn send_audio(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendAudioRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let msg = state.pipeline.send_audio(claims.sub, conversation_id, req).await?;
    Ok((StatusCode::CREATED, Json(message_response(&state.pipeline, msg))))
}

/// Toggle the user's like on a companion message.
pub async fn toggle_like(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let liked = state
        .pipeline
        .toggle_like(claims.sub, conversation_id, message_id)
        .await?;
    Ok(Json(LikeResponse { liked }))
}
