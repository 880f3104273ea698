use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::io::Read;
use std::time::Duration;

/// Downloads a finished swap result.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("faceswap-pilot/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to initialize HTTP client")?;
        Ok(Self { client })
    }
}

impl AssetFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("request returned error status: {url}"))?;

        let mut bytes = Vec::new();
        resp.read_to_end(&mut bytes)
            .with_context(|| format!("failed while reading result body from {url}"))?;
        Ok(bytes)
    }
}
