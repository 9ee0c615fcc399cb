//! External collaborators
//!
//! The engine only talks to the outside world through the four traits here:
//! market data, ledger activity, swap execution and wallet custody. Live
//! implementations are DexScreener + PumpPortal for data and the paper exchange
//! for execution.

pub mod dexscreener;
pub mod paper;
pub mod pumpportal;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::task::TriggerMetric;

pub use dexscreener::DexScreenerClient;
pub use paper::PaperExchange;
pub use pumpportal::PumpPortalStream;

/// A newly created liquidity pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub signature: String,
    /// Mint of the pool's token
    pub token: String,
    /// Quote-side liquidity in SOL
    pub liquidity: f64,
    /// Buy tax in percent
    pub buy_tax: f64,
    /// Sell tax in percent
    pub sell_tax: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
}

/// A trade made by a watched address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub signature: String,
    pub wallet: String,
    pub action: TradeAction,
    pub token: String,
    /// Input side of the trade: SOL spent on a buy, tokens sold on a sell
    pub amount: f64,
    pub observed_at: DateTime<Utc>,
}

/// What the engine wants to trade
#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub input_mint: String,
    pub output_mint: String,
    /// Amount of the input asset
    pub amount: f64,
    pub slippage_bps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub intent: TradeIntent,
    pub in_amount: f64,
    pub out_amount: f64,
    pub price_impact_pct: f64,
    /// Slippage the route will tolerate. Routes with dynamic slippage may
    /// quote more than the intent asked for.
    pub slippage_bps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub signature: String,
    pub amount_in: f64,
    pub amount_out: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuoteError {
    #[error("no route: {0}")]
    NoRoute(String),
    #[error("quote unavailable: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettlementError {
    #[error("submission failed: {0}")]
    Transient(String),
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: f64, required: f64 },
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

impl From<QuoteError> for Error {
    fn from(e: QuoteError) -> Self {
        match e {
            QuoteError::NoRoute(msg) => Error::QuoteRejected(msg),
            QuoteError::Transient(msg) => Error::Gateway(msg),
        }
    }
}

impl From<SettlementError> for Error {
    fn from(e: SettlementError) -> Self {
        match e {
            SettlementError::Transient(msg) => Error::Gateway(msg),
            SettlementError::InsufficientFunds {
                available,
                required,
            } => Error::InsufficientBalance {
                available,
                required,
            },
            SettlementError::Rejected(msg) => Error::SettlementFailed(msg),
        }
    }
}

/// Opaque reference to an owner's signing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerHandle {
    pub owner_id: String,
    pub wallet: Pubkey,
    pub key_ref: String,
}

#[async_trait]
pub trait MarketDataGateway: Send + Sync {
    /// Stream of newly created pools
    async fn subscribe_pool_creations(&self) -> Result<mpsc::Receiver<PoolEvent>>;

    /// Current value of a token metric, in SOL
    async fn get_metric(&self, token: &str, metric: TriggerMetric) -> Result<f64>;
}

#[async_trait]
pub trait LedgerEventGateway: Send + Sync {
    /// Stream of trades made by `address`
    async fn subscribe_address_activity(&self, address: &str) -> Result<mpsc::Receiver<LedgerEvent>>;
}

#[async_trait]
pub trait SwapExecutionGateway: Send + Sync {
    async fn quote(&self, intent: &TradeIntent) -> std::result::Result<Quote, QuoteError>;

    async fn submit(
        &self,
        quote: &Quote,
        signer: &SignerHandle,
    ) -> std::result::Result<Settlement, SettlementError>;
}

#[async_trait]
pub trait WalletCustody: Send + Sync {
    async fn signer(&self, owner_id: &str) -> Result<SignerHandle>;

    /// Spendable balance of `mint` in the owner's wallet
    async fn available_balance(&self, owner_id: &str, mint: &str) -> Result<f64>;
}

/// Market data from DexScreener quotes plus PumpPortal pool creations
pub struct LiveMarketData {
    dexscreener: DexScreenerClient,
    stream: Arc<PumpPortalStream>,
}

impl LiveMarketData {
    pub fn new(dexscreener: DexScreenerClient, stream: Arc<PumpPortalStream>) -> Self {
        Self {
            dexscreener,
            stream,
        }
    }
}

#[async_trait]
impl MarketDataGateway for LiveMarketData {
    async fn subscribe_pool_creations(&self) -> Result<mpsc::Receiver<PoolEvent>> {
        self.stream.subscribe_pool_creations().await
    }

    async fn get_metric(&self, token: &str, metric: TriggerMetric) -> Result<f64> {
        self.dexscreener.get_metric(token, metric).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_gateway_errors_classified() {
        assert!(Error::from(QuoteError::Transient("503".into())).is_retryable());
        assert_eq!(
            Error::from(QuoteError::NoRoute("no pool".into())).kind(),
            ErrorKind::QuoteRejected
        );
        assert_eq!(
            Error::from(SettlementError::Rejected("custom program error: 0x1".into())).kind(),
            ErrorKind::DeterministicSettlementFailure
        );
        assert_eq!(
            Error::from(SettlementError::InsufficientFunds {
                available: 0.01,
                required: 0.1
            })
            .kind(),
            ErrorKind::InsufficientFunds
        );
    }
}
