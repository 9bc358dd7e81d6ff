// =============================================================================
// Reference feed client — the secondary funding-rate source
// =============================================================================
//
// Polled every 60 s. The feed returns a token list with per-exchange funding
// data; every entry is normalized into a `FundingRate` with source=reference
// before it reaches the aggregator.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::exchanges::generic::as_decimal;
use crate::exchanges::venues::{normalize_slug, perp_symbol};

use super::funding::{FundingRate, RateSource};

const DEFAULT_BASE_URL: &str = "https://api.arbitragescanner.io";

pub struct ReferenceFeedClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReferenceFeedClient {
    pub fn new() -> Self {
        let base_url =
            std::env::var("REFERENCE_FEED_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build reqwest client"),
            base_url,
        }
    }

    /// Fetch the full token list and flatten it into per-venue rates.
    pub async fn fetch_funding_rates(&self) -> Result<Vec<FundingRate>> {
        let url = format!("{}/v1/funding-rates", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("reference feed request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse reference feed response")?;

        if !status.is_success() {
            anyhow::bail!("reference feed returned {status}: {body}");
        }

        let tokens = body
            .get("tokens")
            .or_else(|| body.get("data"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_else(|| body.as_array().cloned().unwrap_or_default());

        let mut rates = Vec::new();
        for token in &tokens {
            let symbol = match token.get("symbol").and_then(|v| v.as_str()) {
                Some(s) => s,
                None => continue,
            };
            let Some(exchanges) = token.get("exchanges").and_then(|v| v.as_object()) else {
                continue;
            };

            for (exchange, info) in exchanges {
                let Some(rate) = info.get("funding_rate").and_then(as_decimal) else {
                    continue;
                };
                let interval = info
                    .get("interval_hours")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(8) as u32;

                let mut fr = FundingRate::new(
                    normalize_slug(exchange),
                    perp_symbol(symbol),
                    rate,
                    interval,
                    RateSource::Reference,
                );
                fr.predicted_rate = info.get("predicted_rate").and_then(as_decimal);
                rates.push(fr);
            }
        }

        if rates.is_empty() {
            warn!("reference feed returned no usable rates");
        } else {
            debug!(count = rates.len(), tokens = tokens.len(), "reference rates fetched");
        }
        Ok(rates)
    }
}

impl Default for ReferenceFeedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_default_url() {
        let client = ReferenceFeedClient::new();
        assert!(client.base_url.starts_with("http"));
    }
}
