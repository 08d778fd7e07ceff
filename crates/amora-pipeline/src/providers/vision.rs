use std::process::Stdio;
use std::time::Duration;

use amora_types::models::Label;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use super::{FrameSampler, VisionProvider};

/// JSON vision endpoint: `POST {base}/analyze` with a base64 image and a
/// feature name, answering `{labels: [{name, confidence}]}`.
pub struct HttpVisionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    image: String,
    feature: &'a str,
    max_labels: u32,
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    labels: Vec<Label>,
}

impl HttpVisionProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn analyze(&self, image: Bytes, feature: &str) -> Result<Vec<Label>> {
        let body = AnalyzeRequest {
            image: B64.encode(&image),
            feature,
            max_labels: 20,
        };
        let response: AnalyzeResponse = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("vision {} request", feature))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("vision {} body", feature))?;
        Ok(response.labels)
    }
}

#[async_trait]
impl VisionProvider for HttpVisionProvider {
    fn id(&self) -> &str {
        "vision"
    }

    async fn explicit_labels(&self, image: Bytes) -> Result<Vec<Label>> {
        self.analyze(image, "moderation").await
    }

    async fn scene_labels(&self, image: Bytes) -> Result<Vec<Label>> {
        self.analyze(image, "labels").await
    }
}

/// Samples a frame one second in using the `ffmpeg` binary.
pub struct FfmpegFrameSampler {
    binary: String,
}

impl FfmpegFrameSampler {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }
}

#[async_trait]
impl FrameSampler for FfmpegFrameSampler {
    async fn sample_frame(&self, video: Bytes) -> Result<Bytes> {
        // Containers with a trailing index can't be demuxed from a pipe.
        let input = std::env::temp_dir().join(format!("amora-frame-{}", Uuid::new_v4()));
        tokio::fs::write(&input, &video).await?;

        let result = async {
            let mut child = tokio::process::Command::new(&self.binary)
                .args(["-hide_banner", "-loglevel", "error", "-ss", "1", "-i"])
                .arg(&input)
                .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "pipe:1"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .context("spawn ffmpeg")?;

            let mut frame = Vec::new();
            if let Some(mut stdout) = child.stdout.take() {
                stdout.read_to_end(&mut frame).await?;
            }
            let status = child.wait().await?;
            if !status.success() || frame.is_empty() {
                bail!("ffmpeg produced no frame (status {})", status);
            }
            Ok(Bytes::from(frame))
        }
        .await;

        let _ = tokio::fs::remove_file(&input).await;
        result
    }
}
