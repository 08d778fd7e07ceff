pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod objects;
pub mod permits;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

use crate::middleware::require_auth;
use crate::state::AppState;

/// All HTTP routes. CORS and tracing layers are added by the binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(objects::health))
        .route(
            "/objects/{*key}",
            get(objects::get_object).put(objects::put_object),
        )
        .layer(DefaultBodyLimit::max(objects::MAX_OBJECT_SIZE))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/permits", post(permits::mint_permit))
        .route(
            "/companions/{companion_id}/conversation",
            post(conversations::open_conversation),
        )
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route(
            "/conversations/{conversation_id}/clear",
            post(conversations::clear_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages),
        )
        .route(
            "/conversations/{conversation_id}/messages/text",
            post(messages::send_text),
        )
        .route(
            "/conversations/{conversation_id}/messages/media",
            post(messages::send_media),
        )
        .route(
            "/conversations/{conversation_id}/messages/audio",
            post(messages::send_audio),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/like",
            post(messages::toggle_like),
        )
        .route(
            "/conversations/{conversation_id}/uploads",
            post(conversations::create_upload),
        )
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use amora_db::testing::{seed_companion, set_free_remaining};
    use amora_pipeline::storage::ObjectStore;
    use amora_pipeline::testing::Harness;
    use amora_types::api::Claims;
    use amora_types::models::FreeRemaining;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode, header};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::state::AppStateInner;

    const SECRET: &str = "test-jwt-secret";

    fn app(h: &Harness) -> Router {
        router(Arc::new(AppStateInner {
            pipeline: h.pipeline.clone(),
            jwt_secret: SECRET.into(),
        }))
    }

    fn token(user: Uuid) -> String {
        let claims = Claims {
            sub: user,
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes()))
            .expect("encode token")
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => req.body(Body::empty()),
        }
        .expect("request");

        let resp = app.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn open(app: &Router, user: Uuid, companion_id: Uuid) -> Value {
        let (status, conv) = call(
            app,
            Method::POST,
            &format!("/companions/{}/conversation", companion_id),
            Some(user),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        conv
    }

    async fn mint(app: &Router, user: Uuid) -> String {
        let (status, permit) = call(
            app,
            Method::POST,
            "/permits",
            Some(user),
            Some(json!({ "challenge_token": "turnstile-ok" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        permit["permit_id"].as_str().expect("permit id").to_string()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let h = Harness::new();
        let resp = app(&h)
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_reject_missing_or_bad_tokens() {
        let h = Harness::new();
        let app = app(&h);

        let (status, body) = call(&app, Method::POST, "/permits", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthenticated");

        let req = Request::post("/permits")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mint_then_send_text() {
        let h = Harness::new();
        let app = app(&h);
        let user = Uuid::new_v4();
        let companion = seed_companion(h.db(), false);

        let conv = open(&app, user, companion.id).await;
        assert_eq!(conv["companion_name"], "Lucia");
        assert_eq!(conv["free_remaining"]["text"], 30);
        assert!(conv["companion_avatar_url"].as_str().is_some_and(|u| u.contains("sig=")));

        let permit_id = mint(&app, user).await;
        let conv_id = conv["id"].as_str().expect("conversation id");
        let (status, msg) = call(
            &app,
            Method::POST,
            &format!("/conversations/{}/messages/text", conv_id),
            Some(user),
            Some(json!({ "permit_id": permit_id, "text": "  hola  " })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(msg["sender"], "user");
        assert_eq!(msg["kind"], "text");
        assert_eq!(msg["text"], "hola");

        let (status, conv) = call(
            &app,
            Method::GET,
            &format!("/conversations/{}", conv_id),
            Some(user),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(conv["free_remaining"]["text"], 29);
        assert_eq!(conv["last_message_text"], "hola");

        let (status, page) = call(
            &app,
            Method::GET,
            &format!("/conversations/{}/messages?limit=10", conv_id),
            Some(user),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn exhausted_text_quota_is_429() {
        let h = Harness::new();
        let app = app(&h);
        let user = Uuid::new_v4();
        let companion = seed_companion(h.db(), false);
        let conv = open(&app, user, companion.id).await;
        let conv_id: Uuid = conv["id"].as_str().expect("id").parse().expect("uuid");
        set_free_remaining(h.db(), conv_id, FreeRemaining { text: 0, media: 2, audio: 2 });

        let permit_id = mint(&app, user).await;
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/conversations/{}/messages/text", conv_id),
            Some(user),
            Some(json!({ "permit_id": permit_id, "text": "hola" })),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "quota_exhausted");
    }

    #[tokio::test]
    async fn another_users_conversation_is_404() {
        let h = Harness::new();
        let app = app(&h);
        let owner = Uuid::new_v4();
        let companion = seed_companion(h.db(), false);
        let conv = open(&app, owner, companion.id).await;

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/conversations/{}", conv["id"].as_str().expect("id")),
            Some(Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn signed_upload_then_download() {
        let h = Harness::new();
        let app = app(&h);
        let user = Uuid::new_v4();
        let companion = seed_companion(h.db(), false);
        let conv = open(&app, user, companion.id).await;

        let (status, upload) = call(
            &app,
            Method::POST,
            &format!("/conversations/{}/uploads", conv["id"].as_str().expect("id")),
            Some(user),
            Some(json!({ "kind": "image", "content_type": "image/jpeg" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let key = upload["media_key"].as_str().expect("key").to_string();
        let put_uri = upload["upload_url"]
            .as_str()
            .and_then(|u| u.strip_prefix("http://localhost:3210"))
            .expect("signed path")
            .to_string();

        let resp = app
            .clone()
            .oneshot(
                Request::put(&put_uri)
                    .body(Body::from(vec![0xffu8, 0xd8, 0xff]))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(h.store.contains(&key));

        // The PUT signature does not authorize a GET.
        let resp = app
            .clone()
            .oneshot(Request::get(&put_uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let get_uri = h
            .pipeline
            .media_url(&key)
            .strip_prefix("http://localhost:3210")
            .expect("signed path")
            .to_string();
        let resp = app
            .oneshot(Request::get(&get_uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("image/jpeg")
        );
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        assert_eq!(bytes.as_ref(), &[0xff, 0xd8, 0xff]);
    }

    #[tokio::test]
    async fn signed_put_cannot_overwrite_an_upload() {
        let h = Harness::new();
        let app = app(&h);
        let user = Uuid::new_v4();
        let companion = seed_companion(h.db(), false);
        let conv = open(&app, user, companion.id).await;

        let (status, upload) = call(
            &app,
            Method::POST,
            &format!("/conversations/{}/uploads", conv["id"].as_str().expect("id")),
            Some(user),
            Some(json!({ "kind": "image", "content_type": "image/jpeg" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let key = upload["media_key"].as_str().expect("key").to_string();
        let put_uri = upload["upload_url"]
            .as_str()
            .and_then(|u| u.strip_prefix("http://localhost:3210"))
            .expect("signed path")
            .to_string();

        let put = |bytes: &'static [u8]| {
            app.clone()
                .oneshot(Request::put(&put_uri).body(Body::from(bytes)).expect("request"))
        };
        assert_eq!(put(b"first").await.expect("response").status(), StatusCode::CREATED);
        assert_eq!(put(b"second").await.expect("response").status(), StatusCode::CONFLICT);

        let stored = h.store.get(&key).await.expect("stored object");
        assert_eq!(stored.as_ref(), b"first");
    }

    #[tokio::test]
    async fn tampered_signature_is_forbidden() {
        let h = Harness::new();
        let url = h.pipeline.media_url("companions/lucia/avatar.jpg");
        let path = url.strip_prefix("http://localhost:3210").expect("signed path");
        let tampered = format!("{}00", path);

        let resp = app(&h)
            .oneshot(Request::get(&tampered).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
