//! Execution coordinator
//!
//! Turns fires into trades. Each worker pulls a fire off the shared queue,
//! sizes it against the wallet, quotes, checks the quote against the task's
//! tolerance and submits, retrying transient gateway failures with
//! exponential backoff.
//!
//! Trades signed by the same wallet are serialized through a per-wallet lane;
//! trades on different wallets run in parallel.

use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use chrono::Utc;
use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ExecutionSettings, FireEvent};
use crate::error::{Error, Result};
use crate::gateway::{
    Quote, Settlement, SignerHandle, SwapExecutionGateway, TradeIntent, WalletCustody,
};
use crate::strategy::{self, limit_order};
use crate::task::{Completion, ExecutionResult, TaskRegistry, TaskState, Tolerance, WatchTask};

pub struct ExecutionCoordinator {
    registry: Arc<TaskRegistry>,
    swap: Arc<dyn SwapExecutionGateway>,
    custody: Arc<dyn WalletCustody>,
    settings: ExecutionSettings,
    lanes: DashMap<Pubkey, Arc<Mutex<()>>>,
}

impl ExecutionCoordinator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        swap: Arc<dyn SwapExecutionGateway>,
        custody: Arc<dyn WalletCustody>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            registry,
            swap,
            custody,
            settings,
            lanes: DashMap::new(),
        }
    }

    /// Spawn `count` workers draining the fire queue.
    ///
    /// A worker checks for shutdown only between fires; an execution that has
    /// started always runs to completion.
    pub fn spawn_workers(
        self: &Arc<Self>,
        fires: async_channel::Receiver<FireEvent>,
        count: usize,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let coordinator = self.clone();
                let fires = fires.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker, "Execution worker started");
                    loop {
                        let fire = tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            fire = fires.recv() => match fire {
                                Ok(fire) => fire,
                                Err(_) => break,
                            },
                        };
                        coordinator.handle(fire).await;
                    }
                    debug!(worker, "Execution worker stopped");
                })
            })
            .collect()
    }

    /// Execute one fire and settle the task.
    ///
    /// Returns `None` when the fire is discarded without touching the gateway:
    /// the task was cancelled while queued, or is no longer executing.
    pub async fn handle(&self, fire: FireEvent) -> Option<ExecutionResult> {
        let Some(task) = self.registry.get(&fire.task_id) else {
            warn!(task_id = %fire.task_id, "Fire for unknown task dropped");
            return None;
        };

        match task.state {
            TaskState::Executing => {}
            TaskState::Cancelled => {
                debug!(task_id = %task.id, "Task cancelled while queued, discarding fire");
                return None;
            }
            other => {
                warn!(task_id = %task.id, state = %other, "Fire for non-executing task dropped");
                return None;
            }
        }

        let result = self.execute(&task, &fire).await;
        let next = strategy::next_state(&task.spec, result.success);

        match self
            .registry
            .complete_execution(&task.id, result.clone(), next)
        {
            Ok(Completion::Applied(_)) => {
                if result.success {
                    self.after_fill(&task, &fire, &result);
                }
            }
            Ok(Completion::Cancelled) => {
                info!(task_id = %task.id, "Task cancelled during execution, result recorded");
            }
            Err(e) => error!(task_id = %task.id, "Failed to record execution: {}", e),
        }

        Some(result)
    }

    /// Run the trade and package the outcome
    pub async fn execute(&self, task: &WatchTask, fire: &FireEvent) -> ExecutionResult {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let mut amount_in = 0.0;

        let outcome = self.trade(task, fire, &attempts, &mut amount_in).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::SeqCst);

        match outcome {
            Ok(settlement) => {
                info!(
                    task_id = %task.id,
                    owner = %task.owner_id,
                    signature = %settlement.signature,
                    amount_in = settlement.amount_in,
                    amount_out = settlement.amount_out,
                    latency_ms,
                    attempts,
                    "Execution settled"
                );
                ExecutionResult {
                    task_id: task.id,
                    owner_id: task.owner_id.clone(),
                    success: true,
                    tx_signature: Some(settlement.signature),
                    amount_in: settlement.amount_in,
                    amount_out: Some(settlement.amount_out),
                    error_kind: None,
                    error_message: None,
                    latency_ms,
                    attempts,
                    completed_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    owner = %task.owner_id,
                    kind = ?e.kind(),
                    latency_ms,
                    attempts,
                    "Execution failed: {}",
                    e
                );
                ExecutionResult {
                    task_id: task.id,
                    owner_id: task.owner_id.clone(),
                    success: false,
                    tx_signature: None,
                    amount_in,
                    amount_out: None,
                    error_kind: Some(e.kind()),
                    error_message: Some(e.to_string()),
                    latency_ms,
                    attempts,
                    completed_at: Utc::now(),
                }
            }
        }
    }

    fn lane(&self, wallet: Pubkey) -> Arc<Mutex<()>> {
        self.lanes.entry(wallet).or_default().clone()
    }

    async fn trade(
        &self,
        task: &WatchTask,
        fire: &FireEvent,
        attempts: &AtomicU32,
        amount_in: &mut f64,
    ) -> Result<Settlement> {
        let plan = strategy::plan(task, &fire.observed)?;
        let signer = self
            .custody
            .signer(&task.owner_id)
            .await
            .map_err(|e| Error::SignerUnavailable(format!("{}: {}", task.owner_id, e)))?;

        let lane = self.lane(signer.wallet);
        let _guard = lane.lock().await;

        if self.registry.is_cancelled(&task.id) {
            return Err(Error::Cancelled(task.id.to_string()));
        }

        // Sized inside the lane so a previous trade's spend is visible
        let available = self
            .custody
            .available_balance(&task.owner_id, &plan.input_mint)
            .await?;
        let amount = plan.size(available, self.registry.limits())?;
        *amount_in = amount;

        let intent = TradeIntent {
            input_mint: plan.input_mint.clone(),
            output_mint: plan.output_mint.clone(),
            amount,
            slippage_bps: task.tolerance.slippage_bps,
        };

        let policy = ExponentialBackoff {
            current_interval: self.settings.backoff_initial,
            initial_interval: self.settings.backoff_initial,
            multiplier: self.settings.backoff_multiplier,
            randomization_factor: 0.0,
            max_interval: self.settings.backoff_max,
            max_elapsed_time: None,
            ..Default::default()
        };

        let this = self;
        let intent = &intent;
        let signer = &signer;
        let tolerance = &task.tolerance;
        let task_id = task.id;
        let max_retries = self.settings.max_retries;

        retry_notify(
            policy,
            move || async move {
                if this.registry.is_cancelled(&task_id) {
                    return Err(backoff::Error::permanent(Error::Cancelled(task_id.to_string())));
                }

                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                match this.attempt(intent, signer, tolerance).await {
                    Ok(settlement) => Ok(settlement),
                    Err(e) if e.is_retryable() && attempt <= max_retries => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            },
            |e: Error, delay: Duration| {
                warn!(task_id = %task_id, "Retryable execution error, retrying in {:?}: {}", delay, e);
            },
        )
        .await
    }

    /// One quote + submit round
    async fn attempt(
        &self,
        intent: &TradeIntent,
        signer: &SignerHandle,
        tolerance: &Tolerance,
    ) -> Result<Settlement> {
        let quote = timeout(self.settings.quote_timeout, self.swap.quote(intent))
            .await
            .map_err(|_| Error::GatewayTimeout(self.settings.quote_timeout.as_millis() as u64))??;

        check_tolerance(&quote, tolerance)?;

        let settlement = timeout(self.settings.submit_timeout, self.swap.submit(&quote, signer))
            .await
            .map_err(|_| Error::GatewayTimeout(self.settings.submit_timeout.as_millis() as u64))??;

        Ok(settlement)
    }

    /// Post-fill bookkeeping: one-cancels-other on protective pairs and
    /// auto-sell orders after buys
    fn after_fill(&self, task: &WatchTask, fire: &FireEvent, result: &ExecutionResult) {
        if let Some(sibling) = task.links.sibling {
            if let Some(state) = self.registry.state(&sibling) {
                if !state.is_terminal() {
                    match self.registry.cancel(&sibling) {
                        Ok(()) => info!(task_id = %task.id, sibling = %sibling, "Cancelled paired order"),
                        Err(e) => warn!(sibling = %sibling, "Failed to cancel paired order: {}", e),
                    }
                }
            }
        }

        let Some(rule) = task.spec.auto_sell() else {
            return;
        };
        let Ok(plan) = strategy::plan(task, &fire.observed) else {
            return;
        };
        let Some(token) = plan.bought_token() else {
            return;
        };
        let (Some(entry_price), Some(tokens)) = (result.fill_price(), result.amount_out) else {
            return;
        };

        let (take_profit, stop_loss) =
            limit_order::auto_sell_pair(task, rule, token, entry_price, tokens);
        let tp_id = take_profit.id;
        let sl_id = stop_loss.id;

        if let Err(e) = self.registry.register(take_profit) {
            warn!(task_id = %task.id, "Failed to create take-profit order: {}", e);
            return;
        }
        if let Err(e) = self.registry.register(stop_loss) {
            warn!(task_id = %task.id, "Failed to create stop-loss order: {}", e);
            let _ = self.registry.cancel(&tp_id);
            return;
        }

        info!(
            task_id = %task.id,
            token,
            entry_price,
            take_profit = %tp_id,
            stop_loss = %sl_id,
            "Auto-sell orders armed"
        );
    }
}

/// Reject quotes outside the task's tolerance
fn check_tolerance(quote: &Quote, tolerance: &Tolerance) -> Result<()> {
    if quote.price_impact_pct > tolerance.max_price_impact_pct {
        return Err(Error::QuoteRejected(format!(
            "price impact {:.2}% exceeds {:.2}%",
            quote.price_impact_pct, tolerance.max_price_impact_pct
        )));
    }
    if quote.slippage_bps > tolerance.slippage_bps {
        return Err(Error::QuoteRejected(format!(
            "slippage {}bps exceeds {}bps",
            quote.slippage_bps, tolerance.slippage_bps
        )));
    }
    Ok(())
}
