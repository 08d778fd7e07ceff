//! The conversational message pipeline: permits, quota-gated ingestion,
//! moderation, reply decisions and the delayed-task scheduler that ties
//! them together.

pub mod config;
pub mod context;
pub mod conversations;
pub mod decision;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod moderation;
pub mod permit;
pub mod providers;
pub mod scheduler;
pub mod selector;
pub mod speech;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transcription;

use std::sync::Arc;

use amora_db::Database;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::providers::{
    ChallengeVerifier, FrameSampler, LlmChain, SttProvider, TtsProvider, VisionProvider,
};
use crate::scheduler::Scheduler;
use crate::speech::SpeechCache;
use crate::storage::{ObjectStore, UrlSigner};

/// External services the pipeline depends on.
pub struct Providers {
    pub challenge: Arc<dyn ChallengeVerifier>,
    pub llm: LlmChain,
    pub vision: Arc<dyn VisionProvider>,
    pub frames: Arc<dyn FrameSampler>,
    pub stt: Arc<dyn SttProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

/// Shared handle over every pipeline component.
pub struct Pipeline {
    pub db: Arc<Database>,
    pub config: Arc<PipelineConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub signer: UrlSigner,
    pub scheduler: Scheduler,
    pub providers: Providers,
    speech: SpeechCache,
}

impl Pipeline {
    pub fn new(
        db: Arc<Database>,
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        signer: UrlSigner,
        providers: Providers,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            speech: SpeechCache::new(store.clone(), providers.tts.clone()),
            scheduler: Scheduler::new(config.clone()),
            db,
            config,
            store,
            signer,
            providers,
        }
    }

    /// Run blocking database work off the async runtime.
    pub(crate) async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
    }
}
