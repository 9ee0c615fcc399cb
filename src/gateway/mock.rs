//! Instrumented in-memory gateways for tests

use async_trait::async_trait;
use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    LedgerEvent, LedgerEventGateway, MarketDataGateway, PoolEvent, Quote, QuoteError, Settlement,
    SettlementError, SignerHandle, SwapExecutionGateway, TradeIntent, WalletCustody,
};
use crate::error::{Error, Result};
use crate::task::{TriggerMetric, SOL_MINT};

/// Scripted metric series and a pool-event pipe
#[derive(Default)]
pub struct MockMarket {
    series: DashMap<(String, TriggerMetric), VecDeque<f64>>,
    pool_subscribers: Mutex<Vec<mpsc::Sender<PoolEvent>>>,
    metric_calls: AtomicUsize,
}

impl MockMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, token: &str, price: f64) {
        self.set_series(token, TriggerMetric::Price, vec![price]);
    }

    /// Each read consumes one value; the last one sticks
    pub fn set_series(&self, token: &str, metric: TriggerMetric, values: Vec<f64>) {
        self.series
            .insert((token.to_string(), metric), values.into_iter().collect());
    }

    pub fn metric_calls(&self) -> usize {
        self.metric_calls.load(Ordering::SeqCst)
    }

    pub async fn emit_pool(&self, event: PoolEvent) {
        let senders: Vec<_> = self.pool_subscribers.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub fn pool_subscribers(&self) -> usize {
        self.pool_subscribers.lock().unwrap().len()
    }
}

#[async_trait]
impl MarketDataGateway for MockMarket {
    async fn subscribe_pool_creations(&self) -> Result<mpsc::Receiver<PoolEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.pool_subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn get_metric(&self, token: &str, metric: TriggerMetric) -> Result<f64> {
        self.metric_calls.fetch_add(1, Ordering::SeqCst);
        let mut series = self
            .series
            .get_mut(&(token.to_string(), metric))
            .ok_or_else(|| Error::MarketDataUnavailable(token.to_string()))?;
        let value = if series.len() > 1 {
            series.pop_front()
        } else {
            series.front().copied()
        };
        value.ok_or_else(|| Error::MarketDataUnavailable(token.to_string()))
    }
}

/// Per-wallet trade pipes
#[derive(Default)]
pub struct MockLedger {
    subscribers: DashMap<String, Vec<mpsc::Sender<LedgerEvent>>>,
    failed_subscriptions: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn emit(&self, event: LedgerEvent) {
        let senders = match self.subscribers.get(&event.wallet) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }

    pub fn is_subscribed(&self, wallet: &str) -> bool {
        self.subscribers.contains_key(wallet)
    }

    /// True while some receiver for the wallet is still held
    pub fn has_live_subscriber(&self, wallet: &str) -> bool {
        self.subscribers
            .get(wallet)
            .map_or(false, |senders| senders.iter().any(|tx| !tx.is_closed()))
    }

    /// The next `n` subscriptions fail
    pub fn fail_subscriptions(&self, n: usize) {
        self.failed_subscriptions.fetch_add(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerEventGateway for MockLedger {
    async fn subscribe_address_activity(&self, address: &str) -> Result<mpsc::Receiver<LedgerEvent>> {
        if take_one(&self.failed_subscriptions) {
            return Err(Error::GatewayConnection(format!("subscribe {}", address)));
        }
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .entry(address.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub wallet: Pubkey,
    pub owner_id: String,
    pub in_amount: f64,
    pub started: Instant,
    pub finished: Instant,
}

/// Swap gateway that fills at 1000 tokens per SOL unless scripted otherwise
pub struct MockSwap {
    price_impact_pct: Mutex<f64>,
    quoted_slippage_bps: Mutex<Option<u32>>,
    stalled_quotes: AtomicUsize,
    stalled_submits: AtomicUsize,
    quote_script: Mutex<VecDeque<QuoteError>>,
    submit_script: Mutex<VecDeque<SettlementError>>,
    submit_delay: Duration,
    submits: Mutex<Vec<SubmitRecord>>,
    in_flight: DashMap<Pubkey, usize>,
    max_overlap: AtomicUsize,
    quotes: AtomicUsize,
}

impl MockSwap {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(submit_delay: Duration) -> Self {
        Self {
            price_impact_pct: Mutex::new(0.1),
            quoted_slippage_bps: Mutex::new(None),
            stalled_quotes: AtomicUsize::new(0),
            stalled_submits: AtomicUsize::new(0),
            quote_script: Mutex::new(VecDeque::new()),
            submit_script: Mutex::new(VecDeque::new()),
            submit_delay,
            submits: Mutex::new(Vec::new()),
            in_flight: DashMap::new(),
            max_overlap: AtomicUsize::new(0),
            quotes: AtomicUsize::new(0),
        }
    }

    pub fn set_price_impact(&self, pct: f64) {
        *self.price_impact_pct.lock().unwrap() = pct;
    }

    /// Quote this slippage instead of the requested one, like a route with
    /// dynamic slippage
    pub fn set_quoted_slippage(&self, bps: u32) {
        *self.quoted_slippage_bps.lock().unwrap() = Some(bps);
    }

    /// The next `n` quotes never return
    pub fn stall_quotes(&self, n: usize) {
        self.stalled_quotes.fetch_add(n, Ordering::SeqCst);
    }

    /// The next `n` submits never return and are not recorded
    pub fn stall_submits(&self, n: usize) {
        self.stalled_submits.fetch_add(n, Ordering::SeqCst);
    }

    /// Queue quote failures, consumed one per quote
    pub fn fail_quotes(&self, errors: Vec<QuoteError>) {
        self.quote_script.lock().unwrap().extend(errors);
    }

    /// Queue submit failures, consumed one per submit
    pub fn fail_submits(&self, errors: Vec<SettlementError>) {
        self.submit_script.lock().unwrap().extend(errors);
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.submits.lock().unwrap().clone()
    }

    pub fn quotes(&self) -> usize {
        self.quotes.load(Ordering::SeqCst)
    }

    /// Most submits ever in flight at once for a single wallet
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwapExecutionGateway for MockSwap {
    async fn quote(&self, intent: &TradeIntent) -> std::result::Result<Quote, QuoteError> {
        self.quotes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.stalled_quotes) {
            std::future::pending::<()>().await;
        }
        let scripted = self.quote_script.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let out_amount = if intent.input_mint == SOL_MINT {
            intent.amount * 1000.0
        } else {
            intent.amount / 1000.0
        };

        Ok(Quote {
            intent: intent.clone(),
            in_amount: intent.amount,
            out_amount,
            price_impact_pct: *self.price_impact_pct.lock().unwrap(),
            slippage_bps: self
                .quoted_slippage_bps
                .lock()
                .unwrap()
                .unwrap_or(intent.slippage_bps),
        })
    }

    async fn submit(
        &self,
        quote: &Quote,
        signer: &SignerHandle,
    ) -> std::result::Result<Settlement, SettlementError> {
        if take_one(&self.stalled_submits) {
            std::future::pending::<()>().await;
        }
        let started = Instant::now();
        {
            let mut count = self.in_flight.entry(signer.wallet).or_insert(0);
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }

        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        if let Some(mut count) = self.in_flight.get_mut(&signer.wallet) {
            *count -= 1;
        }

        let submitted = {
            let mut submits = self.submits.lock().unwrap();
            submits.push(SubmitRecord {
                wallet: signer.wallet,
                owner_id: signer.owner_id.clone(),
                in_amount: quote.in_amount,
                started,
                finished: Instant::now(),
            });
            submits.len()
        };

        let scripted = self.submit_script.lock().unwrap().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        Ok(Settlement {
            signature: format!("mock-{}", submitted),
            amount_in: quote.in_amount,
            amount_out: quote.out_amount,
        })
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Custody with a fixed wallet per owner and settable balances
#[derive(Default)]
pub struct MockCustody {
    wallets: DashMap<String, Pubkey>,
    balances: DashMap<(String, String), f64>,
}

impl MockCustody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an owner sign with a specific wallet
    pub fn assign_wallet(&self, owner_id: &str, wallet: Pubkey) {
        self.wallets.insert(owner_id.to_string(), wallet);
    }

    pub fn set_balance(&self, owner_id: &str, mint: &str, amount: f64) {
        self.balances
            .insert((owner_id.to_string(), mint.to_string()), amount);
    }
}

#[async_trait]
impl WalletCustody for MockCustody {
    async fn signer(&self, owner_id: &str) -> Result<SignerHandle> {
        let wallet = *self
            .wallets
            .entry(owner_id.to_string())
            .or_insert_with(Pubkey::new_unique);
        Ok(SignerHandle {
            owner_id: owner_id.to_string(),
            wallet,
            key_ref: format!("mock:{}", owner_id),
        })
    }

    /// 10 SOL unless set; tokens default to zero
    async fn available_balance(&self, owner_id: &str, mint: &str) -> Result<f64> {
        let key = (owner_id.to_string(), mint.to_string());
        Ok(match self.balances.get(&key) {
            Some(balance) => *balance,
            None if mint == SOL_MINT => 10.0,
            None => 0.0,
        })
    }
}
