//! Injected I/O capabilities: remote key-set fetching and keystore reading

use crate::error::{KeyError, KeyResult};
use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;

/// Fetches the raw bytes of a remote JWK Set
#[async_trait]
pub trait KeySetFetcher: Send + Sync + 'static {
    /// Fetch the document at `url`
    ///
    /// # Errors
    /// `KeySourceUnavailable` on network failure or a non-success status.
    async fn fetch(&self, url: &str) -> KeyResult<Vec<u8>>;
}

/// Reads keystore files
#[async_trait]
pub trait KeystoreReader: Send + Sync + 'static {
    /// Read the file at `path`
    ///
    /// # Errors
    /// `KeySourceUnavailable` when the file cannot be read.
    async fn read(&self, path: &Path) -> KeyResult<Vec<u8>>;
}

/// HTTP key-set fetcher
#[derive(Clone, Debug)]
pub struct HttpKeySetFetcher {
    client: Client,
}

impl HttpKeySetFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    ///
    /// # Errors
    /// `KeySourceUnavailable` if the HTTP client cannot be initialized.
    pub fn new(timeout: Duration) -> KeyResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeyError::source_unavailable("http", format!("Failed to initialize HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, url: &str) -> KeyResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/jwk-set+json, application/json")
            .send()
            .await
            .map_err(|e| KeyError::source_unavailable(url, format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(KeyError::source_unavailable(
                url,
                format!("Server returned status: {}", response.status()),
            ));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| KeyError::source_unavailable(url, format!("Failed to read response: {e}")))
    }
}

/// Keystore reader backed by the local file system
#[derive(Clone, Copy, Debug, Default)]
pub struct FsKeystoreReader;

#[async_trait]
impl KeystoreReader for FsKeystoreReader {
    async fn read(&self, path: &Path) -> KeyResult<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| KeyError::source_unavailable(&path.display().to_string(), e.to_string()))
    }
}
