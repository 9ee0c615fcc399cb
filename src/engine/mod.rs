//! Trigger engine
//!
//! Wires the evaluator loops, the execution worker pool and the registry
//! flusher together and owns their shutdown.

pub mod coordinator;
pub mod evaluator;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::gateway::{
    LedgerEvent, LedgerEventGateway, MarketDataGateway, PoolEvent, SwapExecutionGateway,
    WalletCustody,
};
use crate::task::{TaskId, TaskRegistry, TriggerMetric};

pub use coordinator::ExecutionCoordinator;
pub use evaluator::TriggerEvaluator;

/// What the evaluator saw when a trigger was satisfied
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedCondition {
    LedgerTrade(LedgerEvent),
    PoolCreated(PoolEvent),
    MetricCrossed {
        token: String,
        metric: TriggerMetric,
        value: f64,
    },
}

impl ObservedCondition {
    pub fn label(&self) -> &'static str {
        match self {
            ObservedCondition::LedgerTrade(_) => "ledger trade",
            ObservedCondition::PoolCreated(_) => "pool creation",
            ObservedCondition::MetricCrossed { .. } => "metric crossing",
        }
    }
}

/// Hand-off from evaluator to coordinator. Consumed exactly once.
#[derive(Debug, Clone)]
pub struct FireEvent {
    pub task_id: TaskId,
    pub observed: ObservedCondition,
    pub observed_at: DateTime<Utc>,
}

/// Retry and timeout policy for executions
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub quote_timeout: Duration,
    pub submit_timeout: Duration,
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            quote_timeout: Duration::from_secs(10),
            submit_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_initial: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub limit_poll_interval: Duration,
    pub metric_timeout: Duration,
    /// Events held per busy task before the oldest is dropped
    pub backlog_capacity: usize,
    /// Recent ledger signatures remembered for duplicate suppression
    pub dedupe_window: usize,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            limit_poll_interval: Duration::from_secs(10),
            metric_timeout: Duration::from_secs(10),
            backlog_capacity: 64,
            dedupe_window: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub worker_count: usize,
    pub fire_queue_capacity: usize,
    pub flush_interval: Duration,
    pub evaluator: EvaluatorSettings,
    pub execution: ExecutionSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            fire_queue_capacity: 256,
            flush_interval: Duration::from_secs(5),
            evaluator: EvaluatorSettings::default(),
            execution: ExecutionSettings::default(),
        }
    }
}

/// External collaborators the engine runs against
#[derive(Clone)]
pub struct Gateways {
    pub market: Arc<dyn MarketDataGateway>,
    pub ledger: Arc<dyn LedgerEventGateway>,
    pub swap: Arc<dyn SwapExecutionGateway>,
    pub custody: Arc<dyn WalletCustody>,
}

/// Running engine
pub struct Engine {
    registry: Arc<TaskRegistry>,
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    flusher: JoinHandle<()>,
    evaluator: Arc<TriggerEvaluator>,
    fire_rx: async_channel::Receiver<FireEvent>,
}

impl Engine {
    pub async fn start(
        registry: Arc<TaskRegistry>,
        gateways: Gateways,
        settings: EngineSettings,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let (fire_tx, fire_rx) = async_channel::bounded(settings.fire_queue_capacity.max(1));

        let coordinator = Arc::new(ExecutionCoordinator::new(
            registry.clone(),
            gateways.swap.clone(),
            gateways.custody.clone(),
            settings.execution.clone(),
        ));
        let workers = coordinator.spawn_workers(
            fire_rx.clone(),
            settings.worker_count.max(1),
            shutdown.child_token(),
        );

        let evaluator = Arc::new(TriggerEvaluator::new(
            registry.clone(),
            gateways.market.clone(),
            gateways.ledger.clone(),
            fire_tx,
            settings.evaluator.clone(),
        ));
        let loops = evaluator.spawn(shutdown.child_token()).await?;

        let flusher = registry.spawn_flusher(settings.flush_interval, shutdown.child_token());

        info!(
            "Engine started: {} workers, {} tasks loaded",
            workers.len(),
            registry.len()
        );

        Ok(Self {
            registry,
            shutdown,
            loops,
            workers,
            flusher,
            evaluator,
            fire_rx,
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Stop evaluating, let in-flight executions finish, release queued fires
    /// and flush the registry
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down engine...");
        self.shutdown.cancel();

        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!("Evaluator loop ended abnormally: {}", e);
            }
        }
        self.evaluator.release_handoffs().await;

        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!("Execution worker ended abnormally: {}", e);
            }
        }

        let mut released = 0usize;
        while let Ok(fire) = self.fire_rx.try_recv() {
            if self.registry.abort_execution(&fire.task_id).is_ok() {
                released += 1;
            }
        }
        if released > 0 {
            info!("Released {} queued fires", released);
        }

        if let Err(e) = self.flusher.await {
            warn!("Registry flusher ended abnormally: {}", e);
        }
        self.registry.close().await
    }
}
