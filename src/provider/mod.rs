//! Uniform access to track providers.

pub mod direct;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ResolutionError, StreamError};
use crate::track::{StreamHandle, Track, TrackRequest};

pub use direct::DirectUrlProvider;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Source tag used in requests and stored on resolved tracks.
    fn tag(&self) -> &str;

    /// Look up track metadata. Must not open a stream.
    async fn resolve(&self, query: &str) -> Result<Track, ResolutionError>;

    /// Produce a playable handle for a track this provider resolved.
    async fn open_stream(&self, track: &Track) -> Result<StreamHandle, StreamError>;
}

/// Registry of providers with a bounded wait on every fetch.
pub struct ProviderGateway {
    providers: Vec<Arc<dyn Provider>>,
    default_source: Option<String>,
    fetch_timeout: Duration,
}

impl ProviderGateway {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            default_source: None,
            fetch_timeout,
        }
    }

    pub fn register(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_default(mut self, source: impl Into<String>) -> Self {
        self.default_source = Some(source.into());
        self
    }

    pub fn sources(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.tag()).collect()
    }

    fn find(&self, tag: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.tag() == tag)
    }

    /// Providers to try for a request: the named one, or default first then the rest.
    fn candidates(&self, request: &TrackRequest) -> Result<Vec<&Arc<dyn Provider>>, ResolutionError> {
        if let Some(tag) = &request.source {
            return self
                .find(tag)
                .map(|p| vec![p])
                .ok_or_else(|| ResolutionError::UnknownSource(tag.clone()));
        }
        if self.providers.is_empty() {
            return Err(ResolutionError::NoProviders);
        }
        let mut ordered: Vec<_> = self.providers.iter().collect();
        if let Some(default) = &self.default_source {
            ordered.sort_by_key(|p| p.tag() != default.as_str());
        }
        Ok(ordered)
    }

    /// Resolve a request to a track without fetching its stream.
    pub async fn resolve(&self, request: &TrackRequest) -> Result<Track, ResolutionError> {
        let mut last_error = ResolutionError::NoProviders;

        for provider in self.candidates(request)? {
            let outcome = tokio::time::timeout(self.fetch_timeout, provider.resolve(&request.query)).await;
            match outcome {
                Ok(Ok(mut track)) => {
                    track.requested_by = request.requested_by.clone();
                    return Ok(track);
                }
                Ok(Err(e)) => {
                    debug!(source = provider.tag(), query = %request.query, error = %e, "Provider could not resolve");
                    last_error = e;
                }
                Err(_) => {
                    debug!(source = provider.tag(), query = %request.query, "Provider timed out");
                    last_error = ResolutionError::Timeout {
                        provider: provider.tag().to_string(),
                        after: self.fetch_timeout,
                    };
                }
            }
        }

        Err(last_error)
    }

    /// Open the stream for a track through the provider that resolved it.
    pub async fn open_stream(&self, track: &Track) -> Result<StreamHandle, StreamError> {
        let provider = self
            .find(&track.source)
            .ok_or_else(|| StreamError::unavailable(&track.title, format!("unknown source '{}'", track.source)))?;

        match tokio::time::timeout(self.fetch_timeout, provider.open_stream(track)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Timeout {
                track: track.title.clone(),
                after: self.fetch_timeout,
            }),
        }
    }
}
