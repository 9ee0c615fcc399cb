//! Paper exchange
//!
//! Simulated swap execution and wallet custody. Quotes at the current market
//! price less a flat fee, settles against in-memory balances and never signs
//! anything. Every owner gets a throwaway wallet address and a starting SOL
//! balance on first use.

use async_trait::async_trait;
use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    MarketDataGateway, Quote, QuoteError, Settlement, SettlementError, SignerHandle,
    SwapExecutionGateway, TradeIntent, WalletCustody,
};
use crate::config::PaperConfig;
use crate::error::{Error, Result};
use crate::task::{TriggerMetric, SOL_MINT};

pub struct PaperExchange {
    market: Arc<dyn MarketDataGateway>,
    config: PaperConfig,
    wallets: DashMap<String, Pubkey>,
    /// (owner, mint) -> balance
    balances: DashMap<(String, String), f64>,
}

impl PaperExchange {
    pub fn new(market: Arc<dyn MarketDataGateway>, config: PaperConfig) -> Self {
        info!(
            "Paper exchange: {} SOL starting balance, {}bps fee",
            config.starting_balance_sol, config.fee_bps
        );
        Self {
            market,
            config,
            wallets: DashMap::new(),
            balances: DashMap::new(),
        }
    }

    pub fn balance(&self, owner_id: &str, mint: &str) -> f64 {
        let key = (owner_id.to_string(), mint.to_string());
        match self.balances.get(&key) {
            Some(balance) => *balance,
            None if mint == SOL_MINT => self.config.starting_balance_sol,
            None => 0.0,
        }
    }

    /// Set a balance directly
    pub fn deposit(&self, owner_id: &str, mint: &str, amount: f64) {
        self.balances
            .insert((owner_id.to_string(), mint.to_string()), amount);
    }

    fn fee_factor(&self) -> f64 {
        1.0 - self.config.fee_bps as f64 / 10_000.0
    }
}

#[async_trait]
impl SwapExecutionGateway for PaperExchange {
    async fn quote(&self, intent: &TradeIntent) -> std::result::Result<Quote, QuoteError> {
        let buying = intent.input_mint == SOL_MINT;
        let token = if buying {
            &intent.output_mint
        } else {
            &intent.input_mint
        };

        let price = self
            .market
            .get_metric(token, TriggerMetric::Price)
            .await
            .map_err(|e| match e {
                Error::MarketDataUnavailable(msg) => QuoteError::NoRoute(msg),
                other => QuoteError::Transient(other.to_string()),
            })?;

        if price <= 0.0 {
            return Err(QuoteError::NoRoute(format!("no price for {}", token)));
        }

        let out_amount = if buying {
            intent.amount * self.fee_factor() / price
        } else {
            intent.amount * price * self.fee_factor()
        };

        debug!(
            input = %intent.input_mint,
            output = %intent.output_mint,
            amount = intent.amount,
            out_amount,
            "Paper quote"
        );

        Ok(Quote {
            intent: intent.clone(),
            in_amount: intent.amount,
            out_amount,
            price_impact_pct: self.config.price_impact_pct,
            slippage_bps: intent.slippage_bps,
        })
    }

    async fn submit(
        &self,
        quote: &Quote,
        signer: &SignerHandle,
    ) -> std::result::Result<Settlement, SettlementError> {
        let owner = signer.owner_id.clone();
        let input = quote.intent.input_mint.clone();
        let output = quote.intent.output_mint.clone();

        let available = self.balance(&owner, &input);
        if available < quote.in_amount {
            return Err(SettlementError::InsufficientFunds {
                available,
                required: quote.in_amount,
            });
        }

        self.deposit(&owner, &input, available - quote.in_amount);
        let held = self.balance(&owner, &output);
        self.deposit(&owner, &output, held + quote.out_amount);

        let signature = format!("paper-{}", Uuid::new_v4());
        info!(
            owner = %owner,
            wallet = %signer.wallet,
            "Paper fill {} {} -> {} {} ({})",
            quote.in_amount,
            input,
            quote.out_amount,
            output,
            signature
        );

        Ok(Settlement {
            signature,
            amount_in: quote.in_amount,
            amount_out: quote.out_amount,
        })
    }
}

#[async_trait]
impl WalletCustody for PaperExchange {
    async fn signer(&self, owner_id: &str) -> Result<SignerHandle> {
        if owner_id.trim().is_empty() {
            return Err(Error::SignerUnavailable(owner_id.to_string()));
        }
        let wallet = *self
            .wallets
            .entry(owner_id.to_string())
            .or_insert_with(Pubkey::new_unique);

        Ok(SignerHandle {
            owner_id: owner_id.to_string(),
            wallet,
            key_ref: format!("paper:{}", owner_id),
        })
    }

    async fn available_balance(&self, owner_id: &str, mint: &str) -> Result<f64> {
        Ok(self.balance(owner_id, mint))
    }
}
