//! PumpPortal WebSocket feed
//!
//! One shared connection serves every subscriber. New-token events become
//! [`PoolEvent`]s; account trades become [`LedgerEvent`]s for the wallet that
//! made them. Subscriptions survive reconnects: the full set is replayed each
//! time the socket comes back.
//!
//! WebSocket endpoint: wss://pumpportal.fun/api/data

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{LedgerEvent, LedgerEventGateway, PoolEvent, TradeAction};
use crate::config::PumpPortalConfig;
use crate::error::{Error, Result};

/// Subscription request sent over the socket
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMessage {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

impl SubscriptionMessage {
    pub fn subscribe_new_tokens() -> Self {
        Self {
            method: "subscribeNewToken".to_string(),
            keys: None,
        }
    }

    pub fn subscribe_account_trades(wallets: Vec<String>) -> Self {
        Self {
            method: "subscribeAccountTrade".to_string(),
            keys: Some(wallets),
        }
    }
}

/// Token creation from PumpPortal. SOL amounts are in SOL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTokenEvent {
    pub signature: String,
    pub mint: String,
    pub trader_public_key: String,
    pub tx_type: String,
    #[serde(default)]
    pub v_sol_in_bonding_curve: f64,
    #[serde(default)]
    pub market_cap_sol: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
}

/// Trade by a subscribed account
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub signature: String,
    pub mint: String,
    pub trader_public_key: String,
    pub tx_type: String,
    pub token_amount: f64,
    pub sol_amount: f64,
    #[serde(default)]
    pub market_cap_sol: f64,
}

impl From<NewTokenEvent> for PoolEvent {
    fn from(event: NewTokenEvent) -> Self {
        // Bonding-curve tokens carry no transfer tax
        Self {
            signature: event.signature,
            token: event.mint,
            liquidity: event.v_sol_in_bonding_curve,
            buy_tax: 0.0,
            sell_tax: 0.0,
            observed_at: Utc::now(),
        }
    }
}

impl TryFrom<TradeEvent> for LedgerEvent {
    type Error = Error;

    fn try_from(event: TradeEvent) -> Result<Self> {
        let (action, amount) = match event.tx_type.as_str() {
            "buy" => (TradeAction::Buy, event.sol_amount),
            "sell" => (TradeAction::Sell, event.token_amount),
            other => {
                return Err(Error::Deserialization(format!(
                    "unknown trade type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            signature: event.signature,
            wallet: event.trader_public_key,
            action,
            token: event.mint,
            amount,
            observed_at: Utc::now(),
        })
    }
}

enum Inbound {
    Pool(PoolEvent),
    Trade(LedgerEvent),
    Ignored,
}

fn parse_message(text: &str) -> Inbound {
    if let Ok(token) = serde_json::from_str::<NewTokenEvent>(text) {
        if token.tx_type == "create" {
            debug!("New token: {} ({}) - {}", token.name, token.symbol, token.mint);
            return Inbound::Pool(token.into());
        }
    }

    if let Ok(trade) = serde_json::from_str::<TradeEvent>(text) {
        match LedgerEvent::try_from(trade) {
            Ok(event) => return Inbound::Trade(event),
            Err(e) => debug!("Skipping trade: {}", e),
        }
    }

    Inbound::Ignored
}

#[derive(Default)]
struct Subscribers {
    pools: Mutex<Vec<mpsc::Sender<PoolEvent>>>,
    wallets: DashMap<String, Vec<mpsc::Sender<LedgerEvent>>>,
}

/// Shared PumpPortal connection
pub struct PumpPortalStream {
    config: PumpPortalConfig,
    subscribers: Arc<Subscribers>,
    control_tx: mpsc::UnboundedSender<SubscriptionMessage>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionMessage>>>,
}

impl PumpPortalStream {
    pub fn new(config: PumpPortalConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            subscribers: Arc::new(Subscribers::default()),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    /// Spawn the connection loop. Calling it twice is an error.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut control_rx = self
            .control_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("PumpPortal stream already started".to_string()))?;

        info!("Starting PumpPortal WebSocket client...");
        info!("URL: {}", self.config.ws_url);

        let config = self.config.clone();
        let subscribers = self.subscribers.clone();

        Ok(tokio::spawn(async move {
            let mut reconnect_attempts = 0u32;

            while !shutdown.is_cancelled() {
                match connect_and_stream(&config, &subscribers, &mut control_rx, &shutdown).await {
                    Ok(()) => reconnect_attempts = 0,
                    Err(e) => {
                        error!("PumpPortal WebSocket error: {}", e);
                        reconnect_attempts += 1;

                        if config.max_reconnect_attempts > 0
                            && reconnect_attempts >= config.max_reconnect_attempts
                        {
                            error!(
                                "Max reconnect attempts ({}) reached",
                                config.max_reconnect_attempts
                            );
                            break;
                        }
                    }
                }

                if shutdown.is_cancelled() {
                    break;
                }

                let delay = Duration::from_millis(config.reconnect_delay_ms);
                warn!("Reconnecting in {:?}...", delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }

            info!("PumpPortal client shut down");
        }))
    }

    pub async fn subscribe_pool_creations(&self) -> Result<mpsc::Receiver<PoolEvent>> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        self.subscribers.pools.lock().await.push(tx);
        Ok(rx)
    }

    fn subscribe_wallet(&self, wallet: &str) -> Result<mpsc::Receiver<LedgerEvent>> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let mut entry = self.subscribers.wallets.entry(wallet.to_string()).or_default();
        let first = entry.is_empty();
        entry.push(tx);
        drop(entry);

        if first {
            self.control_tx
                .send(SubscriptionMessage::subscribe_account_trades(vec![
                    wallet.to_string()
                ]))
                .map_err(|_| Error::GatewayConnection("PumpPortal stream stopped".to_string()))?;
        }
        Ok(rx)
    }
}

#[async_trait]
impl LedgerEventGateway for PumpPortalStream {
    async fn subscribe_address_activity(&self, address: &str) -> Result<mpsc::Receiver<LedgerEvent>> {
        self.subscribe_wallet(address)
    }
}

async fn connect_and_stream(
    config: &PumpPortalConfig,
    subscribers: &Subscribers,
    control_rx: &mut mpsc::UnboundedReceiver<SubscriptionMessage>,
    shutdown: &CancellationToken,
) -> Result<()> {
    info!("Connecting to PumpPortal WebSocket...");

    let url = url::Url::parse(&config.ws_url)
        .map_err(|e| Error::Config(format!("Invalid WebSocket URL: {}", e)))?;

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| Error::GatewayConnection(format!("WebSocket connect failed: {}", e)))?;

    info!("Connected to PumpPortal WebSocket");

    let (mut write, mut read) = ws_stream.split();

    // Anything queued before connecting is covered by the replay below
    while control_rx.try_recv().is_ok() {}

    let mut replay = vec![SubscriptionMessage::subscribe_new_tokens()];
    let wallets: Vec<String> = subscribers.wallets.iter().map(|e| e.key().clone()).collect();
    if !wallets.is_empty() {
        info!("Subscribing to {} wallet(s) for trade tracking", wallets.len());
        replay.push(SubscriptionMessage::subscribe_account_trades(wallets));
    }

    for msg in replay {
        let json = serde_json::to_string(&msg)?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::GatewayConnection(format!("Failed to subscribe: {}", e)))?;
    }

    let mut ping_timer = tokio::time::interval(Duration::from_secs(config.ping_interval_secs));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }

            _ = ping_timer.tick() => {
                write
                    .send(Message::Ping(vec![]))
                    .await
                    .map_err(|e| Error::GatewayConnection(format!("Failed to send ping: {}", e)))?;
                debug!("Sent ping");
            }

            Some(msg) = control_rx.recv() => {
                let json = serde_json::to_string(&msg)?;
                write
                    .send(Message::Text(json))
                    .await
                    .map_err(|e| Error::GatewayConnection(format!("Failed to subscribe: {}", e)))?;
                debug!("Sent {}", msg.method);
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(subscribers, parse_message(&text)).await,
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket closed by server");
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(Error::GatewayConnection(format!("WebSocket error: {}", e)));
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Fan an inbound event out to its subscribers, pruning closed receivers
async fn dispatch(subscribers: &Subscribers, inbound: Inbound) {
    match inbound {
        Inbound::Pool(event) => {
            let senders: Vec<_> = subscribers.pools.lock().await.clone();
            let mut closed = false;
            for tx in &senders {
                if tx.send(event.clone()).await.is_err() {
                    closed = true;
                }
            }
            if closed {
                subscribers.pools.lock().await.retain(|tx| !tx.is_closed());
            }
        }
        Inbound::Trade(event) => {
            let senders = match subscribers.wallets.get(&event.wallet) {
                Some(entry) => entry.value().clone(),
                None => return,
            };
            let mut closed = false;
            for tx in &senders {
                if tx.send(event.clone()).await.is_err() {
                    closed = true;
                }
            }
            if closed {
                if let Some(mut entry) = subscribers.wallets.get_mut(&event.wallet) {
                    entry.retain(|tx| !tx.is_closed());
                }
            }
        }
        Inbound::Ignored => {}
    }
}
