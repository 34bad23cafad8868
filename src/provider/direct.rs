//! Provider for plain http(s) media links.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use super::Provider;
use crate::error::{ResolutionError, StreamError};
use crate::track::{StreamHandle, Track};

pub const TAG: &str = "url";

pub struct DirectUrlProvider {
    client: reqwest::Client,
}

impl DirectUrlProvider {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    fn parse(query: &str) -> Result<Url, ResolutionError> {
        let url = Url::parse(query.trim()).map_err(|_| ResolutionError::not_found(TAG, query))?;
        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            _ => Err(ResolutionError::not_found(TAG, query)),
        }
    }

    /// Last non-empty path segment, falling back to the host.
    fn title_for(url: &Url) -> String {
        url.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .or_else(|| url.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string())
    }
}

#[async_trait]
impl Provider for DirectUrlProvider {
    fn tag(&self) -> &str {
        TAG
    }

    async fn resolve(&self, query: &str) -> Result<Track, ResolutionError> {
        let url = Self::parse(query)?;
        let title = Self::title_for(&url);
        Ok(Track::new(TAG, url.as_str(), title))
    }

    async fn open_stream(&self, track: &Track) -> Result<StreamHandle, StreamError> {
        let response = self
            .client
            .head(&track.id)
            .send()
            .await
            .map_err(|e| StreamError::unavailable(&track.title, e.to_string()))?;

        let status = response.status();
        // Some media hosts refuse HEAD but serve GET fine.
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            Ok(StreamHandle(track.id.clone()))
        } else {
            Err(StreamError::unavailable(&track.title, format!("HTTP {}", status)))
        }
    }
}
