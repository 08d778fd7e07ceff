use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use amora_types::models::MessageKind;

type HmacSha256 = Hmac<Sha256>;

/// Blob storage addressed by slash-separated keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Size of the object, or `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>>;
}

/// Reject keys that could escape the storage root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 512 || key.starts_with('/') {
        bail!("invalid object key");
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            bail!("invalid object key segment");
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            bail!("invalid character in object key");
        }
    }
    Ok(())
}

/// Namespace for objects a user uploads into a conversation.
pub fn user_upload_prefix(conversation_id: Uuid) -> String {
    format!("conversations/{}/user/", conversation_id)
}

pub fn extension_for(kind: MessageKind, content_type: &str) -> Option<&'static str> {
    let ext = match (kind, content_type) {
        (MessageKind::Image, "image/jpeg") => "jpg",
        (MessageKind::Image, "image/png") => "png",
        (MessageKind::Image, "image/webp") => "webp",
        (MessageKind::Video, "video/mp4") => "mp4",
        (MessageKind::Video, "video/quicktime") => "mov",
        (MessageKind::Video, "video/webm") => "webm",
        (MessageKind::Audio, "audio/mpeg") => "mp3",
        (MessageKind::Audio, "audio/webm") => "webm",
        (MessageKind::Audio, "audio/ogg") => "ogg",
        (MessageKind::Audio, "audio/mp4") => "m4a",
        _ => return None,
    };
    Some(ext)
}

pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next().unwrap_or_default() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// Object storage on the local filesystem, one file per key.
pub struct FsObjectStore {
    dir: PathBuf,
}

impl FsObjectStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Object storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so concurrent writers of one key never expose a torn file.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(self.path(key)?).await?))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path(key)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedMethod {
    Get,
    Put,
}

impl SignedMethod {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and checks time-boxed object URLs:
/// `{base}/objects/{key}?expires={unix}&sig={hex hmac(method\nkey\nexpires)}`.
#[derive(Clone)]
pub struct UrlSigner {
    keyed: HmacSha256,
    base_url: String,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(secret: &str, base_url: &str, ttl: Duration) -> Result<Self> {
        let keyed = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid signing secret: {}", e))?;
        Ok(Self {
            keyed,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
        })
    }

    fn mac(&self, method: SignedMethod, key: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(format!("{}\n{}\n{}", method.as_str(), key, expires).as_bytes());
        mac
    }

    pub fn sign(&self, method: SignedMethod, key: &str, now: DateTime<Utc>) -> SignedUrl {
        let expires_at = now + chrono::Duration::from_std(self.ttl).unwrap_or_default();
        let expires = expires_at.timestamp();
        let sig = hex::encode(self.mac(method, key, expires).finalize().into_bytes());
        SignedUrl {
            url: format!("{}/objects/{}?expires={}&sig={}", self.base_url, key, expires, sig),
            expires_at,
        }
    }

    pub fn verify(
        &self,
        method: SignedMethod,
        key: &str,
        expires: i64,
        sig: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if now.timestamp() >= expires {
            return false;
        }
        let Ok(raw) = hex::decode(sig) else {
            return false;
        };
        self.mac(method, key, expires).verify_slice(&raw).is_ok()
    }
}
