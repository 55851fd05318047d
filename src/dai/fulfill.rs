use std::time::Duration;

use async_trait::async_trait;
use dash_mpd::MPD;
use reqwest::Client;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{DvrError, Result};

/// HTTP facility the fulfillment worker pulls ad manifests through.
///
/// Retries and timeouts are the fetcher's concern; the ad core observes
/// only the final outcome.
#[async_trait]
pub trait AdManifestFetcher: Send + Sync {
    /// Fetch the manifest body, returning it together with the HTTP
    /// status of the final attempt.
    async fn fetch(&self, url: &str) -> Result<(String, u16)>;
}

/// Reqwest-backed fetcher with a per-request timeout and bounded retries
/// with a short backoff.
pub struct HttpAdFetcher {
    client: Client,
    timeout: Duration,
    retries: u32,
}

impl HttpAdFetcher {
    pub fn new(client: Client, timeout: Duration, retries: u32) -> Self {
        Self {
            client,
            timeout,
            retries,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Client::new(),
            Duration::from_millis(config.ad_fetch_timeout_ms),
            config.ad_fetch_retries,
        )
    }
}

impl Default for HttpAdFetcher {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[async_trait]
impl AdManifestFetcher for HttpAdFetcher {
    async fn fetch(&self, url: &str) -> Result<(String, u16)> {
        Url::parse(url).map_err(|e| DvrError::InvalidAdUrl(format!("{url}: {e}")))?;

        let max_attempts = self.retries + 1;
        let mut last_error = DvrError::InvalidAdUrl(url.to_string());
        for attempt in 1..=max_attempts {
            match self.client.get(url).timeout(self.timeout).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        match response.text().await {
                            Ok(body) => return Ok((body, status)),
                            Err(e) => {
                                error!(
                                    "Reading ad manifest body failed: {} (attempt {}/{})",
                                    e, attempt, max_attempts
                                );
                                last_error = e.into();
                            }
                        }
                    } else {
                        error!(
                            "Ad manifest endpoint returned status {} (attempt {}/{})",
                            status, attempt, max_attempts
                        );
                        last_error = DvrError::AdHttpStatus(status);
                    }
                }
                Err(e) => {
                    error!(
                        "Ad manifest request failed: {} (attempt {}/{})",
                        e, attempt, max_attempts
                    );
                    last_error = e.into();
                }
            }
            if attempt < max_attempts {
                warn!("Retrying ad manifest request in 500ms...");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Err(last_error)
    }
}

/// Parse an ad manifest and extract its duration.
///
/// The MPD tree stays opaque to the core; only the duration feeds the
/// placement arithmetic. Falls back to summing period durations when the
/// manifest carries no `mediaPresentationDuration`.
pub fn parse_ad_manifest(xml: &str) -> Result<(MPD, u64)> {
    let mpd = dash_mpd::parse(xml).map_err(|e| DvrError::ManifestParse(e.to_string()))?;
    let duration_ms = ad_manifest_duration_ms(&mpd);
    info!(
        "Parsed ad manifest: {} periods, {}ms",
        mpd.periods.len(),
        duration_ms
    );
    Ok((mpd, duration_ms))
}

fn ad_manifest_duration_ms(mpd: &MPD) -> u64 {
    if let Some(duration) = mpd.mediaPresentationDuration {
        return duration.as_millis() as u64;
    }
    mpd.periods
        .iter()
        .filter_map(|period| period.duration)
        .map(|duration| duration.as_millis() as u64)
        .sum()
}
