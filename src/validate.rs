use std::time::Duration;

use anyhow::{Context, Result, ensure};
use tracing::{instrument, warn};

use crate::util::init_http_client;

/// How long a reachability probe may take before the URL is considered dead
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can tell whether a captured manifest URL actually answers
#[allow(async_fn_in_trait)]
pub trait Reachability {
    async fn is_reachable(&self, url: &str) -> bool;
}

/// Probes URLs with a single `HEAD` request, no retries
#[derive(Debug, Clone)]
pub struct HeadProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HeadProbe {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: PROBE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn probe(&self, url: &str) -> Result<()> {
        let res = self
            .client
            .head(url)
            .timeout(self.timeout)
            .send()
            .await
            .context("Sending HEAD request")?;

        ensure!(
            res.status().is_success(),
            "Server responded with {}",
            res.status()
        );

        Ok(())
    }
}

impl Default for HeadProbe {
    fn default() -> Self {
        Self::new(init_http_client())
    }
}

impl Reachability for HeadProbe {
    #[instrument(skip(self))]
    async fn is_reachable(&self, url: &str) -> bool {
        match self.probe(url).await {
            Ok(()) => true,
            Err(e) => {
                warn!("M3U8 validation failed for {url}: {e:#}");
                false
            }
        }
    }
}

/// Checks that `url` answers a `HEAD` request with a success status within [`PROBE_TIMEOUT`]
pub async fn validate_reachable(url: &str) -> bool {
    HeadProbe::default().is_reachable(url).await
}
