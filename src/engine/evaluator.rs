//! Trigger evaluator
//!
//! One long-lived loop per task kind. Copy-trade and sniper loops react to
//! gateway streams; the limit-order loop polls market data. A loop's only side
//! effects are the registry claim and the fire hand-off.
//!
//! Events for a task that is still executing a previous fire are parked in a
//! bounded per-task backlog and replayed, oldest first, when the task returns
//! to Active.
//!
//! Loops never wait on the fire queue. When it is full the claimed fire is
//! handed to a background send; the task stays Executing until that send
//! lands or the evaluator is stopped, which releases it back to Active.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{EvaluatorSettings, FireEvent, ObservedCondition};
use crate::error::Result;
use crate::gateway::{LedgerEvent, LedgerEventGateway, MarketDataGateway, PoolEvent};
use crate::strategy::limit_order::{self, EdgeTracker};
use crate::strategy::{copy_trade, sniper};
use crate::task::{
    Conflict, EngineEvent, TaskId, TaskKind, TaskRegistry, TaskSpec, TaskState, TriggerMetric,
    WatchTask,
};

const TRADE_CHANNEL_CAPACITY: usize = 1024;

/// How often the copy loop retries wallets it failed to subscribe to
const WALLET_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Result of trying to fire a task
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FireOutcome {
    Fired,
    /// Task is executing another fire; try again later
    Busy,
    Rejected(Conflict),
    QueueClosed,
}

/// Bounded FIFO of parked events per task
struct Backlog<T> {
    queues: HashMap<TaskId, VecDeque<T>>,
    capacity: usize,
}

impl<T> Backlog<T> {
    fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, id: TaskId, item: T) {
        let queue = self.queues.entry(id).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!(task_id = %id, "Backlog full, dropped oldest event");
        }
        queue.push_back(item);
    }

    fn has_pending(&self, id: &TaskId) -> bool {
        self.queues.get(id).map_or(false, |q| !q.is_empty())
    }

    fn contains(&self, id: &TaskId, pred: impl Fn(&T) -> bool) -> bool {
        self.queues.get(id).map_or(false, |q| q.iter().any(pred))
    }

    fn front(&self, id: &TaskId) -> Option<&T> {
        self.queues.get(id).and_then(|q| q.front())
    }

    fn pop(&mut self, id: &TaskId) {
        if let Some(queue) = self.queues.get_mut(id) {
            queue.pop_front();
            if queue.is_empty() {
                self.queues.remove(id);
            }
        }
    }

    fn remove(&mut self, id: &TaskId) {
        if let Some(queue) = self.queues.remove(id) {
            if !queue.is_empty() {
                debug!(task_id = %id, "Discarded {} backlogged events", queue.len());
            }
        }
    }

    fn ids(&self) -> Vec<TaskId> {
        self.queues.keys().copied().collect()
    }

    #[cfg(test)]
    fn len(&self, id: &TaskId) -> usize {
        self.queues.get(id).map_or(0, |q| q.len())
    }
}

/// Recently seen ledger signatures
struct SignatureWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl SignatureWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// True if the signature was not seen before
    fn insert(&mut self, signature: &str) -> bool {
        if self.seen.contains(signature) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(signature.to_string());
        self.seen.insert(signature.to_string());
        true
    }
}

fn is_live(task: &WatchTask) -> bool {
    matches!(task.state, TaskState::Active | TaskState::Executing)
}

pub struct TriggerEvaluator {
    registry: Arc<TaskRegistry>,
    market: Arc<dyn MarketDataGateway>,
    ledger: Arc<dyn LedgerEventGateway>,
    fire_tx: async_channel::Sender<FireEvent>,
    settings: EvaluatorSettings,
    /// Background sends waiting on a full fire queue
    handoffs: TaskTracker,
    stop: CancellationToken,
}

impl TriggerEvaluator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        market: Arc<dyn MarketDataGateway>,
        ledger: Arc<dyn LedgerEventGateway>,
        fire_tx: async_channel::Sender<FireEvent>,
        settings: EvaluatorSettings,
    ) -> Self {
        Self {
            registry,
            market,
            ledger,
            fire_tx,
            settings,
            handoffs: TaskTracker::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Abandon fires still waiting for queue space and return their tasks to
    /// Active. Call after the loops have stopped.
    pub async fn release_handoffs(&self) {
        self.handoffs.close();
        self.stop.cancel();
        self.handoffs.wait().await;
    }

    /// Spawn the three evaluation loops
    pub async fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let pools = self.market.subscribe_pool_creations().await?;

        let copy = tokio::spawn(
            self.clone()
                .run_copy_loop(self.registry.subscribe(), shutdown.clone()),
        );
        let snipe = tokio::spawn(
            self.clone()
                .run_sniper_loop(pools, self.registry.subscribe(), shutdown.clone()),
        );
        let limit = tokio::spawn(
            self.clone()
                .run_limit_loop(self.registry.subscribe(), shutdown),
        );

        Ok(vec![copy, snipe, limit])
    }

    /// Claim the task and hand the fire to the coordinator
    pub(crate) async fn fire(
        &self,
        task_id: TaskId,
        claim: Option<&str>,
        observed: ObservedCondition,
    ) -> FireOutcome {
        let task = match self.registry.try_begin_execution(&task_id, claim) {
            Ok(task) => task,
            Err(Conflict::Busy) => return FireOutcome::Busy,
            Err(conflict) => {
                debug!(task_id = %task_id, "Fire dropped: {:?}", conflict);
                return FireOutcome::Rejected(conflict);
            }
        };

        let label = observed.label();
        let event = FireEvent {
            task_id,
            observed,
            observed_at: Utc::now(),
        };

        match self.fire_tx.try_send(event) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(event)) => {
                debug!(task_id = %task_id, "Fire queue full, sending in background");
                self.hand_off(event);
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                warn!(task_id = %task_id, "Fire queue closed, releasing task");
                let _ = self.registry.abort_execution(&task_id);
                return FireOutcome::QueueClosed;
            }
        }

        info!(
            task_id = %task_id,
            owner = %task.owner_id,
            kind = %task.kind(),
            "Trigger fired on {}",
            label
        );
        FireOutcome::Fired
    }

    fn hand_off(&self, event: FireEvent) {
        let tx = self.fire_tx.clone();
        let registry = self.registry.clone();
        let stop = self.stop.clone();

        self.handoffs.spawn(async move {
            let task_id = event.task_id;
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(task_id = %task_id, "Queued fire abandoned, releasing task");
                    let _ = registry.abort_execution(&task_id);
                }
                sent = tx.send(event) => {
                    if sent.is_err() {
                        let _ = registry.abort_execution(&task_id);
                    }
                }
            }
        });
    }

    /// Replay a task's backlog until one event fires or the backlog empties
    async fn drain<T: Clone>(
        &self,
        id: TaskId,
        backlog: &mut Backlog<T>,
        to_fire: impl Fn(T) -> (Option<String>, ObservedCondition),
    ) {
        while let Some(item) = backlog.front(&id).cloned() {
            let (claim, observed) = to_fire(item);
            match self.fire(id, claim.as_deref(), observed).await {
                FireOutcome::Fired => {
                    backlog.pop(&id);
                    break;
                }
                FireOutcome::Busy => break,
                FireOutcome::Rejected(Conflict::AlreadySeen) => backlog.pop(&id),
                FireOutcome::Rejected(_) | FireOutcome::QueueClosed => {
                    backlog.remove(&id);
                    break;
                }
            }
        }
    }

    // ---- copy trade ----

    async fn run_copy_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        shutdown: CancellationToken,
    ) {
        let (trade_tx, mut trades) = mpsc::channel(TRADE_CHANNEL_CAPACITY);
        let mut watched = HashMap::new();
        let mut resync = interval_at(
            Instant::now() + WALLET_RESYNC_INTERVAL,
            WALLET_RESYNC_INTERVAL,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut seen = SignatureWindow::new(self.settings.dedupe_window);
        let mut backlog = Backlog::new(self.settings.backlog_capacity);

        self.watch_source_wallets(&mut watched, &trade_tx, &shutdown)
            .await;
        info!("Copy-trade evaluator started ({} wallets)", watched.len());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(trade) = trades.recv() => {
                    self.on_ledger_event(trade, &mut seen, &mut backlog).await;
                }

                _ = resync.tick() => {
                    self.watch_source_wallets(&mut watched, &trade_tx, &shutdown).await;
                }

                event = events.recv() => match event {
                    Ok(EngineEvent::TaskCreated { kind: TaskKind::CopyTrade, .. }) => {
                        self.watch_source_wallets(&mut watched, &trade_tx, &shutdown).await;
                    }
                    Ok(EngineEvent::TaskStateChanged { task_id, to, .. }) => {
                        let copy_task_ended = to.is_terminal()
                            && self
                                .registry
                                .get(&task_id)
                                .map_or(false, |t| t.kind() == TaskKind::CopyTrade);
                        if copy_task_ended {
                            self.watch_source_wallets(&mut watched, &trade_tx, &shutdown).await;
                        }
                        if backlog.has_pending(&task_id) {
                            self.on_copy_state_change(task_id, to, &mut backlog).await;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Copy-trade evaluator lagged {} events, resyncing", skipped);
                        self.watch_source_wallets(&mut watched, &trade_tx, &shutdown).await;
                        for id in backlog.ids() {
                            self.drain(id, &mut backlog, copy_fire).await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Copy-trade evaluator stopped");
    }

    /// Subscribe to every source wallet of a live copy task and stop
    /// forwarders whose wallet no task follows any more
    async fn watch_source_wallets(
        &self,
        watched: &mut HashMap<String, CancellationToken>,
        trade_tx: &mpsc::Sender<LedgerEvent>,
        shutdown: &CancellationToken,
    ) {
        let wallets: HashSet<String> = self
            .registry
            .list_by_kind(TaskKind::CopyTrade)
            .into_iter()
            .filter(|t| !t.state.is_terminal())
            .filter_map(|t| match t.spec {
                TaskSpec::CopyTrade(copy) => Some(copy.source_wallet),
                _ => None,
            })
            .collect();

        watched.retain(|wallet, forwarder| {
            let keep = wallets.contains(wallet);
            if !keep {
                forwarder.cancel();
                debug!(wallet = %wallet, "Stopped watching wallet");
            }
            keep
        });

        for wallet in wallets {
            if watched.contains_key(&wallet) {
                continue;
            }

            let mut rx = match self.ledger.subscribe_address_activity(&wallet).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(wallet = %wallet, "Failed to watch wallet: {}", e);
                    continue;
                }
            };

            let tx = trade_tx.clone();
            let forwarder = shutdown.child_token();
            let stop = forwarder.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        trade = rx.recv() => match trade {
                            Some(trade) => {
                                if tx.send(trade).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });

            debug!(wallet = %wallet, "Watching wallet");
            watched.insert(wallet, forwarder);
        }
    }

    async fn on_ledger_event(
        &self,
        trade: LedgerEvent,
        seen: &mut SignatureWindow,
        backlog: &mut Backlog<LedgerEvent>,
    ) {
        if !seen.insert(&trade.signature) {
            debug!(signature = %trade.signature, "Duplicate ledger event");
            return;
        }

        for task in self.registry.list_by_kind(TaskKind::CopyTrade) {
            if !is_live(&task) {
                continue;
            }
            let TaskSpec::CopyTrade(copy) = &task.spec else {
                continue;
            };
            if !copy_trade::matches(copy, &trade) {
                continue;
            }
            self.registry.touch(&task.id, Utc::now());

            // Keep order: newer events never overtake parked ones
            if backlog.has_pending(&task.id) {
                backlog.push(task.id, trade.clone());
                self.drain(task.id, backlog, copy_fire).await;
                continue;
            }

            let observed = ObservedCondition::LedgerTrade(trade.clone());
            if self.fire(task.id, None, observed).await == FireOutcome::Busy {
                debug!(task_id = %task.id, "Task busy, parking trade {}", trade.signature);
                backlog.push(task.id, trade.clone());
            }
        }
    }

    async fn on_copy_state_change(
        &self,
        task_id: TaskId,
        to: TaskState,
        backlog: &mut Backlog<LedgerEvent>,
    ) {
        match to {
            TaskState::Active => self.drain(task_id, backlog, copy_fire).await,
            TaskState::Paused | TaskState::Terminated | TaskState::Cancelled => {
                backlog.remove(&task_id)
            }
            _ => {}
        }
    }

    // ---- sniper ----

    async fn run_sniper_loop(
        self: Arc<Self>,
        mut pools: mpsc::Receiver<PoolEvent>,
        mut events: broadcast::Receiver<EngineEvent>,
        shutdown: CancellationToken,
    ) {
        let mut backlog = Backlog::new(self.settings.backlog_capacity);
        info!("Sniper evaluator started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(pool) = pools.recv() => {
                    self.on_pool_event(pool, &mut backlog).await;
                }

                event = events.recv() => match event {
                    Ok(EngineEvent::TaskStateChanged { task_id, to, .. }) => {
                        if backlog.has_pending(&task_id) {
                            self.on_sniper_state_change(task_id, to, &mut backlog).await;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Sniper evaluator lagged {} events, resyncing", skipped);
                        for id in backlog.ids() {
                            self.drain(id, &mut backlog, snipe_fire).await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Sniper evaluator stopped");
    }

    async fn on_pool_event(&self, pool: PoolEvent, backlog: &mut Backlog<PoolEvent>) {
        for task in self.registry.list_by_kind(TaskKind::Sniper) {
            if !is_live(&task) {
                continue;
            }
            let TaskSpec::Sniper(snipe) = &task.spec else {
                continue;
            };
            // Seen set here is a snapshot; the claim below is authoritative
            if !sniper::should_fire(snipe, &pool) {
                continue;
            }
            self.registry.touch(&task.id, Utc::now());

            if backlog.has_pending(&task.id) {
                if !backlog.contains(&task.id, |p| p.token == pool.token) {
                    backlog.push(task.id, pool.clone());
                }
                self.drain(task.id, backlog, snipe_fire).await;
                continue;
            }

            let observed = ObservedCondition::PoolCreated(pool.clone());
            if self.fire(task.id, Some(&pool.token), observed).await == FireOutcome::Busy {
                debug!(task_id = %task.id, "Task busy, parking pool {}", pool.token);
                backlog.push(task.id, pool.clone());
            }
        }
    }

    async fn on_sniper_state_change(
        &self,
        task_id: TaskId,
        to: TaskState,
        backlog: &mut Backlog<PoolEvent>,
    ) {
        match to {
            TaskState::Active => self.drain(task_id, backlog, snipe_fire).await,
            TaskState::Paused | TaskState::Terminated | TaskState::Cancelled => {
                backlog.remove(&task_id)
            }
            _ => {}
        }
    }

    // ---- limit orders ----

    async fn run_limit_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        shutdown: CancellationToken,
    ) {
        let mut tracker = EdgeTracker::new();
        let mut ticker = tokio::time::interval(self.settings.limit_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Limit-order evaluator started (every {:?})",
            self.settings.limit_poll_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => self.evaluate_limit_orders(&mut tracker).await,

                event = events.recv() => match event {
                    // Failed fills re-arm the order
                    Ok(EngineEvent::ExecutionCompleted { result }) if !result.success => {
                        tracker.reset(&result.task_id);
                    }
                    Ok(EngineEvent::TaskStateChanged { task_id, to, .. })
                        if to == TaskState::Paused || to.is_terminal() =>
                    {
                        tracker.reset(&task_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Limit-order evaluator lagged {} events, resyncing", skipped);
                        for task in self.registry.list_active(TaskKind::LimitOrder) {
                            if task.history.last().map_or(false, |r| !r.success) {
                                tracker.reset(&task.id);
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Limit-order evaluator stopped");
    }

    /// One poll: read each (token, metric) once, then fire rising edges
    pub(crate) async fn evaluate_limit_orders(&self, tracker: &mut EdgeTracker) {
        let tasks = self.registry.list_active(TaskKind::LimitOrder);
        if tasks.is_empty() {
            return;
        }

        let keys: HashSet<(String, TriggerMetric)> = tasks
            .iter()
            .filter_map(|t| match &t.spec {
                TaskSpec::LimitOrder(order) => Some((order.token.clone(), order.metric)),
                _ => None,
            })
            .collect();

        let reads = keys.into_iter().map(|(token, metric)| async move {
            let value = self.read_metric(&token, metric).await;
            ((token, metric), value)
        });
        let values: HashMap<(String, TriggerMetric), Option<f64>> =
            futures::future::join_all(reads).await.into_iter().collect();

        let now = Utc::now();
        for task in tasks {
            let TaskSpec::LimitOrder(order) = &task.spec else {
                continue;
            };
            self.registry.touch(&task.id, now);

            let key = (order.token.clone(), order.metric);
            let Some(value) = values.get(&key).copied().flatten() else {
                continue;
            };

            let satisfied = limit_order::is_satisfied(order.side, value, order.trigger_value);
            if !tracker.observe(task.id, satisfied) {
                continue;
            }

            debug!(
                task_id = %task.id,
                side = %order.side,
                value,
                trigger = order.trigger_value,
                "Limit order crossed"
            );

            let observed = ObservedCondition::MetricCrossed {
                token: order.token.clone(),
                metric: order.metric,
                value,
            };
            if self.fire(task.id, None, observed).await != FireOutcome::Fired {
                tracker.reset(&task.id);
            }
        }
    }

    async fn read_metric(&self, token: &str, metric: TriggerMetric) -> Option<f64> {
        match timeout(self.settings.metric_timeout, self.market.get_metric(token, metric)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(token, %metric, "Metric unavailable: {}", e);
                None
            }
            Err(_) => {
                warn!(token, %metric, "Metric read timed out");
                None
            }
        }
    }
}

fn copy_fire(trade: LedgerEvent) -> (Option<String>, ObservedCondition) {
    (None, ObservedCondition::LedgerTrade(trade))
}

fn snipe_fire(pool: PoolEvent) -> (Option<String>, ObservedCondition) {
    (Some(pool.token.clone()), ObservedCondition::PoolCreated(pool))
}
