//! REST collaborators: initial group fetch, signed-url exchange and
//! byte streaming.

use crate::assets::{Attachment, SignedUrlProvider};
use crate::error::{ViewerError, ViewerResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

/// Upper bound on buffer space reserved from a `Content-Length` header.
const PREALLOC_LIMIT: u64 = 8 << 20;

#[derive(Debug, Deserialize)]
struct GroupResponse {
    #[serde(default)]
    attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlResponse {
    signed_url: String,
}

/// Downloads the full body behind a URL.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> ViewerResult<Bytes>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    api_base: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Credentials only go to our own API; signed URLs carry their own.
    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) if is_under(&self.api_base, url) => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Seed list for a group. A missing list comes back empty.
    pub async fn fetch_group(&self, group_key: &str) -> ViewerResult<Vec<Attachment>> {
        let url = format!(
            "{}/attachment-group/{}",
            self.api_base,
            urlencoding::encode(group_key)
        );
        let res = self.get(&url).send().await?.error_for_status()?;
        let parsed: GroupResponse = res.json().await?;
        let attachments = parsed.attachments.unwrap_or_default();
        tracing::info!("Fetched {} attachments for group {}", attachments.len(), group_key);
        Ok(attachments)
    }
}

#[async_trait]
impl SignedUrlProvider for ApiClient {
    async fn signed_url(&self, attachment_id: &str) -> ViewerResult<String> {
        let url = format!(
            "{}/attachment/{}/signed-url",
            self.api_base,
            urlencoding::encode(attachment_id)
        );
        let unavailable = |reason: String| ViewerError::SignedUrlUnavailable {
            id: attachment_id.to_string(),
            reason,
        };

        let res = self
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unavailable(e.to_string()))?;
        let parsed: SignedUrlResponse = res.json().await.map_err(|e| unavailable(e.to_string()))?;
        Ok(parsed.signed_url)
    }
}

#[async_trait]
impl MediaFetcher for ApiClient {
    async fn fetch_bytes(&self, url: &str) -> ViewerResult<Bytes> {
        let res = self.get(url).send().await?.error_for_status()?;
        let reserve = res.content_length().unwrap_or(0).min(PREALLOC_LIMIT);
        let mut buf = BytesMut::with_capacity(reserve as usize);

        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Same origin as `base` and a path at or below its path.
fn is_under(base: &str, target: &str) -> bool {
    let (Ok(base), Ok(target)) = (Url::parse(base), Url::parse(target)) else {
        return false;
    };
    if base.scheme() != target.scheme()
        || base.host_str() != target.host_str()
        || base.port_or_known_default() != target.port_or_known_default()
    {
        return false;
    }

    let prefix = base.path().trim_end_matches('/');
    let path = target.path();
    prefix.is_empty()
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
