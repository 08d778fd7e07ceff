//! In-memory stand-ins for every external collaborator, plus a harness that
//! wires them into a `Pipeline` over an in-memory database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amora_db::Database;
use amora_types::models::Label;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::PipelineConfig;
use crate::providers::{
    ChallengeVerifier, ChatTurn, FrameSampler, LlmChain, LlmProvider, SttProvider, TtsProvider,
    VisionProvider,
};
use crate::storage::{ObjectStore, UrlSigner};
use crate::{Pipeline, Providers};

/// Chat model with a canned answer, or one that always errors.
pub struct FakeLlm {
    id: String,
    reply: Option<String>,
    requests: Mutex<Vec<(String, Vec<ChatTurn>)>>,
}

impl FakeLlm {
    pub fn replying(id: &str, reply: &str) -> Self {
        Self {
            id: id.to_string(),
            reply: Some(reply.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            reply: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// System prompt and turns of the most recent call.
    pub fn last_request(&self) -> Option<(String, Vec<ChatTurn>)> {
        self.requests.lock().ok().and_then(|r| r.last().cloned())
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((system.to_string(), turns.to_vec()));
        }
        self.reply.clone().ok_or_else(|| anyhow!("{} unavailable", self.id))
    }
}

pub enum FakeChallenge {
    Passing,
    Rejecting,
    Unreachable,
}

#[async_trait]
impl ChallengeVerifier for FakeChallenge {
    async fn verify(&self, token: &str) -> Result<bool> {
        match self {
            Self::Passing => Ok(!token.is_empty()),
            Self::Rejecting => Ok(false),
            Self::Unreachable => bail!("verification service unreachable"),
        }
    }
}

pub struct FakeVision {
    fail: bool,
    panic: bool,
    pub explicit: Vec<Label>,
    pub scene: Vec<Label>,
    calls: AtomicUsize,
}

impl Default for FakeVision {
    fn default() -> Self {
        Self {
            fail: false,
            panic: false,
            explicit: vec![Label { name: "Suggestive".into(), confidence: 62.0 }],
            scene: vec![
                Label { name: "Sunset".into(), confidence: 84.2 },
                Label { name: "Beach".into(), confidence: 97.2 },
            ],
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeVision {
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn panicking() -> Self {
        Self { panic: true, ..Self::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, labels: &[Label]) -> Result<Vec<Label>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("vision client bug");
        }
        if self.fail {
            bail!("vision service returned 503");
        }
        Ok(labels.to_vec())
    }
}

#[async_trait]
impl VisionProvider for FakeVision {
    fn id(&self) -> &str {
        "fake-vision"
    }

    async fn explicit_labels(&self, _image: Bytes) -> Result<Vec<Label>> {
        self.answer(&self.explicit)
    }

    async fn scene_labels(&self, _image: Bytes) -> Result<Vec<Label>> {
        self.answer(&self.scene)
    }
}

/// Returns the video bytes unchanged as the "frame".
#[derive(Default)]
pub struct FakeFrames;

#[async_trait]
impl FrameSampler for FakeFrames {
    async fn sample_frame(&self, video: Bytes) -> Result<Bytes> {
        Ok(video)
    }
}

pub struct FakeStt {
    transcript: Option<String>,
}

impl FakeStt {
    pub fn replying(transcript: &str) -> Self {
        Self { transcript: Some(transcript.to_string()) }
    }

    pub fn failing() -> Self {
        Self { transcript: None }
    }
}

#[async_trait]
impl SttProvider for FakeStt {
    fn id(&self) -> &str {
        "fake-stt"
    }

    async fn transcribe(&self, _audio: Bytes, _file_name: &str) -> Result<String> {
        self.transcript.clone().ok_or_else(|| anyhow!("transcription failed"))
    }
}

#[derive(Default)]
pub struct FakeTts {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeTts {
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TtsProvider for FakeTts {
    fn id(&self) -> &str {
        "fake-tts"
    }

    async fn synthesize(&self, voice_id: &str, text: &str) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("tts quota exceeded");
        }
        Ok(Bytes::from(format!("mp3:{}:{}", voice_id, text)))
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().map(|o| o.contains_key(key)).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no such object: {}", key))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        Ok(self
            .objects
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .get(key)
            .map(|b| b.len() as u64))
    }
}

/// Collaborators a `Harness` is built from. Defaults all succeed; the LLM
/// answers with a plain text decision.
pub struct Fakes {
    pub challenge: FakeChallenge,
    pub llm: FakeLlm,
    pub fallback: FakeLlm,
    pub vision: FakeVision,
    pub stt: FakeStt,
    pub tts: FakeTts,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            challenge: FakeChallenge::Passing,
            llm: FakeLlm::replying("primary", r#"{"type":"text","text":"hey you"}"#),
            fallback: FakeLlm::failing("fallback"),
            vision: FakeVision::default(),
            stt: FakeStt::replying("hola guapa"),
            tts: FakeTts::default(),
        }
    }
}

/// A `Pipeline` over an in-memory database with handles on its fakes.
pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<MemoryObjectStore>,
    pub llm: Arc<FakeLlm>,
    pub fallback: Arc<FakeLlm>,
    pub vision: Arc<FakeVision>,
    pub tts: Arc<FakeTts>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Fakes::default())
    }

    pub fn with(fakes: Fakes) -> Self {
        Self::with_config(fakes, PipelineConfig::default())
    }

    pub fn with_config(fakes: Fakes, config: PipelineConfig) -> Self {
        let db = Arc::new(Database::open_in_memory().expect("in-memory database"));
        let store = Arc::new(MemoryObjectStore::default());
        let llm = Arc::new(fakes.llm);
        let fallback = Arc::new(fakes.fallback);
        let vision = Arc::new(fakes.vision);
        let tts = Arc::new(fakes.tts);

        let providers = Providers {
            challenge: Arc::new(fakes.challenge),
            llm: LlmChain::primary_with_fallback(llm.clone(), fallback.clone()),
            vision: vision.clone(),
            frames: Arc::new(FakeFrames),
            stt: Arc::new(fakes.stt),
            tts: tts.clone(),
        };
        let signer = UrlSigner::new("test-signing-secret", "http://localhost:3210", Duration::from_secs(900))
            .expect("signer");

        Self {
            pipeline: Arc::new(Pipeline::new(db, config, store.clone(), signer, providers)),
            store,
            llm,
            fallback,
            vision,
            tts,
        }
    }

    pub fn db(&self) -> &Database {
        &self.pipeline.db
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
