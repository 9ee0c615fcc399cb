// DexScreener API client for token price and market cap
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::task::{TriggerMetric, SOL_MINT};

const DEXSCREENER_BASE: &str = "https://api.dexscreener.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
    pub base: Option<f64>,
    pub quote: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteToken {
    pub address: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "baseToken")]
    pub base_token: BaseToken,
    #[serde(rename = "quoteToken")]
    pub quote_token: Option<QuoteToken>,
    #[serde(rename = "priceNative")]
    pub price_native: Option<String>,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    pub liquidity: Option<Liquidity>,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    #[serde(rename = "fdv")]
    pub fdv: Option<f64>,
}

impl DexPair {
    /// Price of one base token in the quote asset (SOL for SOL pairs)
    pub fn price_native(&self) -> Option<f64> {
        self.price_native
            .as_ref()
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)
    }

    /// Market cap in SOL, derived from the USD figures
    pub fn market_cap_native(&self) -> Option<f64> {
        let cap_usd = self.market_cap.or(self.fdv)?;
        let price_usd = self.price_usd.as_ref()?.parse::<f64>().ok()?;
        let price_native = self.price_native()?;
        if price_usd <= 0.0 {
            return None;
        }
        Some(cap_usd / price_usd * price_native)
    }

    fn is_sol_pair_for(&self, mint: &str) -> bool {
        self.chain_id == "solana"
            && self.base_token.address == mint
            && self
                .quote_token
                .as_ref()
                .map_or(false, |q| q.address == SOL_MINT)
    }

    fn quote_liquidity(&self) -> f64 {
        self.liquidity.as_ref().and_then(|l| l.quote).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairsResponse {
    pub pairs: Option<Vec<DexPair>>,
}

pub struct DexScreenerClient {
    client: reqwest::Client,
    base_url: String,
}

impl DexScreenerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    /// Fetch the deepest SOL-quoted pair for a token
    pub async fn get_token_pair(&self, mint: &str) -> Result<Option<DexPair>> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, mint);
        let resp = self.client.get(&url).send().await.map_err(map_reqwest)?;

        if !resp.status().is_success() {
            return Err(Error::Gateway(format!(
                "DexScreener returned {} for {}",
                resp.status(),
                mint
            )));
        }

        let data: TokenPairsResponse = resp.json().await.map_err(map_reqwest)?;
        Ok(select_pair(mint, data.pairs.unwrap_or_default()))
    }

    /// Current price or market cap, in SOL
    pub async fn get_metric(&self, mint: &str, metric: TriggerMetric) -> Result<f64> {
        let pair = self
            .get_token_pair(mint)
            .await?
            .ok_or_else(|| Error::MarketDataUnavailable(mint.to_string()))?;

        let value = match metric {
            TriggerMetric::Price => pair.price_native(),
            TriggerMetric::MarketCap => pair.market_cap_native(),
        };

        debug!(token = mint, %metric, ?value, dex = %pair.dex_id, "DexScreener metric");
        value.ok_or_else(|| Error::MarketDataUnavailable(format!("{} {}", mint, metric)))
    }
}

impl Default for DexScreenerClient {
    fn default() -> Self {
        Self::new(DEXSCREENER_BASE, Duration::from_secs(10))
    }
}

/// Pairs of `mint` against SOL only, so `priceNative` is in SOL. Deepest
/// quote-side liquidity wins.
fn select_pair(mint: &str, pairs: Vec<DexPair>) -> Option<DexPair> {
    pairs
        .into_iter()
        .filter(|p| p.is_sol_pair_for(mint))
        .max_by(|a, b| {
            a.quote_liquidity()
                .partial_cmp(&b.quote_liquidity())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn map_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::GatewayTimeout(0)
    } else if e.is_connect() {
        Error::GatewayConnection(e.to_string())
    } else if e.is_decode() {
        Error::Deserialization(e.to_string())
    } else {
        Error::Gateway(e.to_string())
    }
}
