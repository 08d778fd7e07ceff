//! Signed object transfer. These routes carry no JWT; the HMAC in the query
//! string is the credential.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use amora_pipeline::storage::{SignedMethod, content_type_for_key, validate_key};

use crate::state::AppState;

/// 64 MB upload limit for media
pub const MAX_OBJECT_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub sig: String,
}

fn authorize(
    state: &AppState,
    method: SignedMethod,
    key: &str,
    query: &SignedQuery,
) -> Result<(), StatusCode> {
    validate_key(key).map_err(|_| StatusCode::BAD_REQUEST)?;
    if !state
        .pipeline
        .signer
        .verify(method, key, query.expires, &query.sig, Utc::now())
    {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(())
}

/// GET /objects/{*key}
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, SignedMethod::Get, &key, &query)?;

    let store = &state.pipeline.store;
    if store.head(&key).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let data = store.get(&key).await.map_err(|e| {
        error!("Failed to read object {}: {}", key, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type_for_key(&key)),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("private, max-age=600"),
    );
    Ok((StatusCode::OK, headers, data))
}

/// PUT /objects/{*key}. Write-once: a key that already holds an object is 409.
pub async fn put_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    authorize(&state, SignedMethod::Put, &key, &query)?;

    if body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if body.len() > MAX_OBJECT_SIZE {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let store = &state.pipeline.store;
    if store.head(&key).await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?.is_some() {
        warn!("Refusing to overwrite object {}", key);
        return Err(StatusCode::CONFLICT);
    }

    let size = body.len();
    store.put(&key, body).await.map_err(|e| {
        error!("Failed to write object {}: {}", key, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    info!("Stored object {} ({} bytes)", key, size);
    Ok(StatusCode::CREATED)
}

pub async fn health() -> &'static str {
    "ok"
}
