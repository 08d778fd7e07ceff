use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{Method, header::{AUTHORIZATION, CONTENT_TYPE}};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use amora_api::state::AppStateInner;
use amora_db::Database;
use amora_pipeline::config::PipelineConfig;
use amora_pipeline::providers::{
    ElevenLabsTts, FfmpegFrameSampler, HttpVisionProvider, LlmChain, OpenAiCompatLlm,
    OpenAiCompatStt, TurnstileVerifier,
};
use amora_pipeline::storage::{FsObjectStore, UrlSigner};
use amora_pipeline::{Pipeline, Providers, scheduler};

/// Placeholder secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn required_secret(key: &str) -> String {
    let value = std::env::var(key).unwrap_or_default();
    if value.is_empty() || PLACEHOLDER_SECRETS.contains(&value.as_str()) {
        eprintln!("FATAL: {} is unset or still a placeholder.", key);
        eprintln!("       Set it in your .env file and restart.");
        std::process::exit(1);
    }
    value
}

fn providers() -> anyhow::Result<Providers> {
    let challenge = TurnstileVerifier::new(
        &env_or(
            "AMORA_TURNSTILE_URL",
            "https://challenges.cloudflare.com/turnstile/v0/siteverify",
        ),
        &env_or("AMORA_TURNSTILE_SECRET", ""),
    )?;

    let primary = OpenAiCompatLlm::new(
        "primary",
        &env_or("AMORA_LLM_URL", "https://api.openai.com/v1"),
        &env_or("AMORA_LLM_API_KEY", ""),
        &env_or("AMORA_LLM_MODEL", "gpt-4o-mini"),
    )?;
    let fallback = OpenAiCompatLlm::new(
        "fallback",
        &env_or("AMORA_LLM_FALLBACK_URL", "https://openrouter.ai/api/v1"),
        &env_or("AMORA_LLM_FALLBACK_API_KEY", ""),
        &env_or("AMORA_LLM_FALLBACK_MODEL", "meta-llama/llama-3.1-70b-instruct"),
    )?;

    let vision = HttpVisionProvider::new(
        &env_or("AMORA_VISION_URL", "http://localhost:8400"),
        &env_or("AMORA_VISION_API_KEY", ""),
    )?;
    let stt = OpenAiCompatStt::new(
        &env_or("AMORA_STT_URL", "https://api.openai.com/v1"),
        &env_or("AMORA_STT_API_KEY", ""),
        &env_or("AMORA_STT_MODEL", "whisper-1"),
    )?;
    let tts = ElevenLabsTts::new(
        &env_or("AMORA_TTS_URL", "https://api.elevenlabs.io"),
        &env_or("AMORA_TTS_API_KEY", ""),
        &env_or("AMORA_TTS_MODEL", "eleven_multilingual_v2"),
    )?;

    Ok(Providers {
        challenge: Arc::new(challenge),
        llm: LlmChain::primary_with_fallback(Arc::new(primary), Arc::new(fallback)),
        vision: Arc::new(vision),
        frames: Arc::new(FfmpegFrameSampler::new(&env_or("AMORA_FFMPEG", "ffmpeg"))),
        stt: Arc::new(stt),
        tts: Arc::new(tts),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amora_server=debug,amora_api=debug,amora_pipeline=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret = required_secret("AMORA_JWT_SECRET");
    let signing_secret = required_secret("AMORA_SIGNING_SECRET");
    let db_path: PathBuf = env_or("AMORA_DB_PATH", "amora.db").into();
    let storage_dir: PathBuf = env_or("AMORA_STORAGE_DIR", "./object-storage").into();
    let host = env_or("AMORA_HOST", "0.0.0.0");
    let port: u16 = env_or("AMORA_PORT", "3210").parse()?;
    let public_url = env_or("AMORA_PUBLIC_URL", &format!("http://localhost:{}", port));
    let config = PipelineConfig::from_env()?;

    // Init database, storage and providers
    let db = Arc::new(Database::open(&db_path)?);
    let store = Arc::new(FsObjectStore::new(storage_dir).await?);
    let signer = UrlSigner::new(&signing_secret, &public_url, config.signed_url_ttl)?;
    let pipeline = Arc::new(Pipeline::new(db, config, store, signer, providers()?));

    // Delayed moderation, transcription and reply tasks
    tokio::spawn(scheduler::run_worker(pipeline.clone()));

    let state = Arc::new(AppStateInner { pipeline, jwt_secret });

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(false);

    let app = amora_api::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Amora server listening on {}", addr);
    info!("Signed object URLs under {}", public_url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
