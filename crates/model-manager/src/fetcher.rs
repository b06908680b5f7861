//! Model fetcher implementation
//!
//! This module provides functionality for retrieving remote model artifacts,
//! with progress tracking and checksum verification.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytesize::ByteSize;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use common::error::FetchError;
use common::FetchProgress;

/// Minimum time between two progress reports
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Capability that retrieves the bytes of a remote model artifact
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Fetches `url`, reporting progress through `progress` while bytes arrive
    async fn fetch(
        &self,
        url: &str,
        progress: &(dyn Fn(FetchProgress) + Send + Sync),
    ) -> Result<Vec<u8>, FetchError>;
}

/// HTTP(S) fetcher backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpModelFetcher {
    /// HTTP client
    client: Client,
}

impl HttpModelFetcher {
    /// Creates a new fetcher
    ///
    /// The overall fetch deadline is applied by the lifecycle manager, so only
    /// the connect timeout is set here.
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ModelFetcher for HttpModelFetcher {
    async fn fetch(
        &self,
        url: &str,
        progress: &(dyn Fn(FetchProgress) + Send + Sync),
    ) -> Result<Vec<u8>, FetchError> {
        info!("Fetching model artifact from {}", url);

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let total_bytes = resp.content_length();
        let mut body = Vec::with_capacity(total_bytes.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        let mut stream = resp.bytes_stream();
        let mut last_update = Instant::now();

        progress(FetchProgress {
            received_bytes: 0,
            total_bytes,
        });

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Transport(e.to_string()))?;
            body.extend_from_slice(&chunk);

            if last_update.elapsed() > PROGRESS_INTERVAL {
                let current = FetchProgress {
                    received_bytes: body.len() as u64,
                    total_bytes,
                };
                debug!("Fetching {}: {}", url, current);
                progress(current);
                last_update = Instant::now();
            }
        }

        progress(FetchProgress {
            received_bytes: body.len() as u64,
            total_bytes,
        });

        info!("Fetched {} from {}", ByteSize::b(body.len() as u64), url);

        Ok(body)
    }
}

/// Checks fetched bytes against an expected hex-encoded SHA-256
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<(), FetchError> {
    let actual = hex::encode(Sha256::digest(bytes));

    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(FetchError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_sha256() {
        let digest = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert!(verify_sha256(b"hello", digest).is_ok());
        assert!(verify_sha256(b"hello", &digest.to_uppercase()).is_ok());

        match verify_sha256(b"hello!", digest) {
            Err(FetchError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, digest);
                assert_ne!(actual, digest);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_http_fetcher_builds() {
        assert!(HttpModelFetcher::new("image-recognizer-test").is_ok());
    }
}
