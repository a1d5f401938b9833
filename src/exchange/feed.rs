//! Price sources for the paper broker.
//!
//! - `OkxTickerFeed`: public OKX spot ticker, no credentials
//! - `ScriptedFeed`: a fixed price sequence for replays and tests

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Next price sample, or `None` if the source has nothing to offer.
    async fn latest_price(&self) -> Result<Option<Decimal>>;
}

/// OKX public market ticker.
#[derive(Debug, Clone)]
pub struct OkxTickerFeed {
    client: Client,
    base_url: String,
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<TickerData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    inst_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    last: Decimal,
}

impl OkxTickerFeed {
    pub fn new(base_url: &str, base_asset: &str, quote_asset: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            inst_id: format!("{}-{}", base_asset, quote_asset),
        })
    }

    pub fn inst_id(&self) -> &str {
        &self.inst_id
    }
}

#[async_trait]
impl PriceFeed for OkxTickerFeed {
    #[instrument(skip(self), fields(inst_id = %self.inst_id), name = "okx_ticker")]
    async fn latest_price(&self) -> Result<Option<Decimal>> {
        let url = format!("{}/api/v5/market/ticker", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("instId", self.inst_id.as_str())])
            .send()
            .await
            .context("Failed to send ticker request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OKX API error {}: {}", status, body);
        }

        let ticker: TickerResponse = response
            .json()
            .await
            .context("Failed to parse ticker response")?;

        if ticker.code != "0" {
            anyhow::bail!("OKX ticker error {}: {}", ticker.code, ticker.msg);
        }

        let price = ticker
            .data
            .into_iter()
            .find(|d| d.inst_id == self.inst_id)
            .map(|d| d.last);

        debug!(price = ?price, "Fetched ticker");
        Ok(price)
    }
}

/// Replays a fixed sequence of prices, one per call.
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    prices: Mutex<VecDeque<Decimal>>,
}

impl ScriptedFeed {
    pub fn new(prices: impl IntoIterator<Item = Decimal>) -> Self {
        Self {
            prices: Mutex::new(prices.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.prices.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[async_trait]
impl PriceFeed for ScriptedFeed {
    async fn latest_price(&self) -> Result<Option<Decimal>> {
        let mut prices = self
            .prices
            .lock()
            .map_err(|_| anyhow::anyhow!("Scripted feed lock poisoned"))?;
        Ok(prices.pop_front())
    }
}
