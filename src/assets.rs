//! Attachment model and media resolution.
//!
//! Turns an attachment descriptor into a media kind and a fetchable URL.

use crate::error::{ViewerError, ViewerResult};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// One playable item of a group.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    /// Raw file extension or MIME subtype, e.g. `mp4`.
    #[serde(rename = "type", default)]
    pub media_type: String,
    pub file_type: Option<String>,
}

impl Attachment {
    pub fn new(id: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            media_type: media_type.into(),
            file_type: None,
        }
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Self {
        self.file_type = Some(file_type.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Unknown,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Unknown => "unknown",
        }
    }

    fn from_file_type(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Some(MediaKind::Image),
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Look up an extension or MIME subtype in the static table.
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.trim().to_ascii_lowercase();
        let ext = ext.rsplit('/').next().unwrap_or_default();
        let ext = ext.trim_start_matches('.');

        if IMAGE_EXTENSIONS.contains(&ext) {
            MediaKind::Image
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            MediaKind::Audio
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            MediaKind::Video
        } else {
            MediaKind::Unknown
        }
    }
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "svg+xml", "avif", "ico", "tiff",
];
const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "mpeg", "wav", "ogg", "oga", "aac", "flac", "m4a", "opus", "weba",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "mov", "quicktime", "mkv", "avi", "m4v", "ogv", "3gp",
];

/// Where a surface should read media bytes from.
#[derive(Debug, Clone)]
pub enum PlaybackSource {
    /// Stream straight from the network.
    Url(String),
    /// Previously cached bytes for `url`, with their on-disk location.
    Blob {
        url: String,
        bytes: Bytes,
        path: Option<PathBuf>,
    },
}

impl PlaybackSource {
    pub fn url(&self) -> &str {
        match self {
            PlaybackSource::Url(url) => url,
            PlaybackSource::Blob { url, .. } => url,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, PlaybackSource::Blob { .. })
    }
}

/// How attachment bytes are located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// `{api_base}/attachment/{id}`
    Direct,
    /// Exchange the id for a short-lived signed URL.
    Signed,
}

/// Exchanges an attachment id for a time-limited download URL.
#[async_trait]
pub trait SignedUrlProvider: Send + Sync {
    async fn signed_url(&self, attachment_id: &str) -> ViewerResult<String>;
}

pub struct MediaResolver {
    api_base: String,
    mode: RetrievalMode,
    signer: Option<Arc<dyn SignedUrlProvider>>,
}

impl MediaResolver {
    pub fn direct(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            mode: RetrievalMode::Direct,
            signer: None,
        }
    }

    pub fn signed(api_base: impl Into<String>, signer: Arc<dyn SignedUrlProvider>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            mode: RetrievalMode::Signed,
            signer: Some(signer),
        }
    }

    /// Explicit `fileType` wins, then the extension table.
    pub fn kind(&self, attachment: &Attachment) -> MediaKind {
        attachment
            .file_type
            .as_deref()
            .and_then(MediaKind::from_file_type)
            .unwrap_or_else(|| MediaKind::from_extension(&attachment.media_type))
    }

    /// Resolve the URL the bytes of `attachment` can be fetched from.
    pub async fn source_url(&self, attachment: &Attachment) -> ViewerResult<String> {
        match self.mode {
            RetrievalMode::Direct => Ok(format!(
                "{}/attachment/{}",
                self.api_base,
                urlencoding::encode(&attachment.id)
            )),
            RetrievalMode::Signed => {
                let signer = self.signer.as_ref().ok_or_else(|| {
                    ViewerError::SignedUrlUnavailable {
                        id: attachment.id.clone(),
                        reason: "no signer configured".into(),
                    }
                })?;
                let url = signer.signed_url(&attachment.id).await?;
                Ok(self.full_url(&url))
            }
        }
    }

    /// Signed URLs may come back relative to the API host.
    fn full_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.api_base, url.trim_start_matches('/'))
        }
    }
}
