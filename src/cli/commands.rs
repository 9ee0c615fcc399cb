//! CLI command implementations
//!
//! Task commands edit the registry file directly. A running engine merges
//! those edits on its next flush.

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{Engine, Gateways};
use crate::gateway::{
    DexScreenerClient, LedgerEventGateway, LiveMarketData, MarketDataGateway, PaperExchange,
    PumpPortalStream,
};
use crate::task::{
    AutoSellRule, CopyTradeTask, EngineEvent, LimitOrderTask, OrderSide, SizingRule, SniperTask,
    TaskId, TaskRegistry, TaskSpec, Tolerance, TriggerMetric, WatchTask,
};

/// Run the engine against live market data and paper execution until Ctrl-C
pub async fn start(config: &Config) -> Result<()> {
    info!("Starting trigger engine...");
    warn!("Execution is simulated by the paper exchange - no real trades will be sent");

    let registry = Arc::new(open_registry(config).await?);
    let shutdown = CancellationToken::new();

    let stream = Arc::new(PumpPortalStream::new(config.pumpportal.clone()));
    let stream_handle = stream.start(shutdown.clone()).await?;

    let dexscreener = DexScreenerClient::new(
        config.market_data.dexscreener_url.clone(),
        Duration::from_millis(config.market_data.timeout_ms),
    );
    let market: Arc<dyn MarketDataGateway> =
        Arc::new(LiveMarketData::new(dexscreener, stream.clone()));
    let ledger: Arc<dyn LedgerEventGateway> = stream.clone();
    let paper = Arc::new(PaperExchange::new(market.clone(), config.paper.clone()));

    let engine = Engine::start(
        registry.clone(),
        Gateways {
            market,
            ledger,
            swap: paper.clone(),
            custody: paper,
        },
        config.engine_settings(),
    )
    .await?;

    let reporter = tokio::spawn(report_executions(registry.subscribe(), shutdown.clone()));

    info!("Engine running with {} tasks. Press Ctrl-C to stop.", registry.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutdown signal received");
    engine.shutdown().await?;
    shutdown.cancel();
    if let Err(e) = stream_handle.await {
        warn!("PumpPortal stream ended abnormally: {}", e);
    }
    let _ = reporter.await;

    info!("Engine stopped");
    Ok(())
}

/// Print each execution outcome as it lands
async fn report_executions(
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(EngineEvent::ExecutionCompleted { result }) => {
                    if result.success {
                        println!(
                            "[{}] task {} filled: {} in, {} out ({}ms, tx {})",
                            result.completed_at.format("%H:%M:%S"),
                            result.task_id,
                            result.amount_in,
                            result.amount_out.unwrap_or_default(),
                            result.latency_ms,
                            result.tx_signature.as_deref().unwrap_or("-"),
                        );
                    } else {
                        println!(
                            "[{}] task {} failed: {}",
                            result.completed_at.format("%H:%M:%S"),
                            result.task_id,
                            result.error_message.as_deref().unwrap_or("unknown error"),
                        );
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Execution reporter skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn open_registry(config: &Config) -> Result<TaskRegistry> {
    TaskRegistry::open(
        &config.registry.path,
        config.task_limits(),
        config.registry.event_capacity,
    )
    .await
    .with_context(|| format!("Failed to open registry {}", config.registry.path.display()))
}

fn parse_task_id(id: &str) -> Result<TaskId> {
    TaskId::parse_str(id).with_context(|| format!("Invalid task id: {}", id))
}

fn tolerance(config: &Config, slippage_bps: Option<u32>) -> Tolerance {
    let mut tolerance = config.default_tolerance();
    if let Some(bps) = slippage_bps {
        tolerance.slippage_bps = bps;
    }
    tolerance
}

fn auto_sell(take_profit_pct: Option<f64>, stop_loss_pct: Option<f64>) -> Result<Option<AutoSellRule>> {
    match (take_profit_pct, stop_loss_pct) {
        (Some(take_profit_pct), Some(stop_loss_pct)) => Ok(Some(AutoSellRule {
            take_profit_pct,
            stop_loss_pct,
        })),
        (None, None) => Ok(None),
        _ => anyhow::bail!("--take-profit and --stop-loss must be given together"),
    }
}

/// Register a task and persist the registry
async fn save_new_task(config: &Config, owner: &str, spec: TaskSpec, tolerance: Tolerance) -> Result<()> {
    let registry = open_registry(config).await?;
    let task = registry.create(owner, spec, tolerance)?;
    registry.close().await?;

    println!("Created {} task {}", task.kind(), task.id);
    Ok(())
}

pub struct CopyArgs {
    pub owner: String,
    pub wallet: String,
    pub buys: bool,
    pub sells: bool,
    pub amount: Option<f64>,
    pub multiplier: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub slippage_bps: Option<u32>,
}

pub async fn add_copy(config: &Config, args: CopyArgs) -> Result<()> {
    let sizing = match (args.amount, args.multiplier) {
        (Some(amount), None) => SizingRule::Fixed { amount },
        (None, Some(multiplier)) => SizingRule::Multiplier { multiplier },
        _ => anyhow::bail!("Give exactly one of --amount or --multiplier"),
    };

    // Neither flag means follow both
    let (follow_buy, follow_sell) = if args.buys || args.sells {
        (args.buys, args.sells)
    } else {
        (true, true)
    };

    let spec = TaskSpec::CopyTrade(CopyTradeTask {
        source_wallet: args.wallet,
        follow_buy,
        follow_sell,
        sizing,
        auto_sell: auto_sell(args.take_profit_pct, args.stop_loss_pct)?,
    });

    save_new_task(config, &args.owner, spec, tolerance(config, args.slippage_bps)).await
}

pub struct SniperArgs {
    pub owner: String,
    pub buy_amount: Option<f64>,
    pub min_liquidity: Option<f64>,
    pub max_buy_tax: Option<f64>,
    pub max_sell_tax: Option<f64>,
    pub no_auto_sell: bool,
    pub slippage_bps: Option<u32>,
}

pub async fn add_sniper(config: &Config, args: SniperArgs) -> Result<()> {
    let mut filter = config.sniper_filter();
    if let Some(v) = args.min_liquidity {
        filter.min_liquidity = v;
    }
    if let Some(v) = args.max_buy_tax {
        filter.max_buy_tax = v;
    }
    if let Some(v) = args.max_sell_tax {
        filter.max_sell_tax = v;
    }

    let spec = TaskSpec::Sniper(SniperTask {
        filter,
        buy_amount: args.buy_amount.unwrap_or(config.sniper.buy_amount_sol),
        auto_sell: if args.no_auto_sell {
            None
        } else {
            config.sniper_auto_sell()
        },
        seen_tokens: HashSet::new(),
    });

    save_new_task(config, &args.owner, spec, tolerance(config, args.slippage_bps)).await
}

pub struct LimitArgs {
    pub owner: String,
    pub token: String,
    pub side: OrderSide,
    pub metric: TriggerMetric,
    pub trigger_value: f64,
    pub amount: f64,
    pub rearm: bool,
    pub slippage_bps: Option<u32>,
}

pub async fn add_limit(config: &Config, args: LimitArgs) -> Result<()> {
    let spec = TaskSpec::LimitOrder(LimitOrderTask {
        token: args.token,
        side: args.side,
        metric: args.metric,
        trigger_value: args.trigger_value,
        amount: args.amount,
        rearm: args.rearm,
    });

    save_new_task(config, &args.owner, spec, tolerance(config, args.slippage_bps)).await
}

/// List tasks, optionally for one owner
pub async fn list(config: &Config, owner: Option<&str>) -> Result<()> {
    let registry = open_registry(config).await?;
    let tasks = match owner {
        Some(owner) => registry.list_by_owner(owner),
        None => registry.list_all(),
    };

    println!("\n=== WATCH TASKS ===\n");
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<11}  {:<12}  {:>5}  {:>5}  DETAIL",
        "ID", "OWNER", "KIND", "STATE", "RUNS", "FAILS"
    );
    for task in &tasks {
        println!(
            "{:<36}  {:<10}  {:<11}  {:<12}  {:>5}  {:>5}  {}",
            task.id,
            task.owner_id,
            task.kind().to_string(),
            task.state.to_string(),
            task.stats.executions,
            task.stats.failures,
            describe(task),
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

fn describe(task: &WatchTask) -> String {
    match &task.spec {
        TaskSpec::CopyTrade(copy) => {
            let sizing = match copy.sizing {
                SizingRule::Fixed { amount } => format!("{} SOL", amount),
                SizingRule::Multiplier { multiplier } => format!("x{}", multiplier),
            };
            format!("follow {} ({})", short(&copy.source_wallet), sizing)
        }
        TaskSpec::Sniper(sniper) => format!(
            "buy {} SOL if liq >= {} SOL ({} sniped)",
            sniper.buy_amount,
            sniper.filter.min_liquidity,
            sniper.seen_tokens.len()
        ),
        TaskSpec::LimitOrder(order) => format!(
            "{} {} {} @ {} {}{}",
            order.side,
            order.amount,
            short(&order.token),
            order.metric,
            order.trigger_value,
            if order.rearm { " (rearm)" } else { "" }
        ),
    }
}

fn short(address: &str) -> String {
    if address.len() > 10 {
        format!("{}..{}", &address[..4], &address[address.len() - 4..])
    } else {
        address.to_string()
    }
}

pub async fn cancel(config: &Config, id: &str) -> Result<()> {
    let registry = open_registry(config).await?;
    registry.cancel(&parse_task_id(id)?)?;
    registry.close().await?;
    println!("Cancelled task {}", id);
    Ok(())
}

/// Cancel every open task of an owner
pub async fn cancel_all(config: &Config, owner: &str, force: bool) -> Result<()> {
    let registry = open_registry(config).await?;
    let open = registry
        .list_by_owner(owner)
        .into_iter()
        .filter(|t| !t.state.is_terminal())
        .count();

    if open == 0 {
        println!("No open tasks for {}", owner);
        return Ok(());
    }

    // Confirmation prompt (unless --force)
    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!("Cancel {} open task(s) for {}?", open, owner))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Cancel-all aborted by user");
            return Ok(());
        }
    }

    let cancelled = registry.cancel_all(owner);
    registry.close().await?;
    println!("Cancelled {} task(s) for {}", cancelled, owner);
    Ok(())
}

pub async fn pause(config: &Config, id: &str) -> Result<()> {
    let registry = open_registry(config).await?;
    registry.pause(&parse_task_id(id)?)?;
    registry.close().await?;
    println!("Paused task {}", id);
    Ok(())
}

pub async fn resume(config: &Config, id: &str) -> Result<()> {
    let registry = open_registry(config).await?;
    registry.resume(&parse_task_id(id)?)?;
    registry.close().await?;
    println!("Resumed task {}", id);
    Ok(())
}

pub async fn set_trigger(config: &Config, id: &str, value: f64) -> Result<()> {
    let registry = open_registry(config).await?;
    registry.update_trigger_value(&parse_task_id(id)?, value)?;
    registry.close().await?;
    println!("Task {} now triggers at {}", id, value);
    Ok(())
}

pub async fn set_filter(
    config: &Config,
    id: &str,
    min_liquidity: Option<f64>,
    max_buy_tax: Option<f64>,
    max_sell_tax: Option<f64>,
) -> Result<()> {
    let registry = open_registry(config).await?;
    let task_id = parse_task_id(id)?;
    let task = registry
        .get(&task_id)
        .with_context(|| format!("Task not found: {}", id))?;

    let TaskSpec::Sniper(sniper) = task.spec else {
        anyhow::bail!("Task {} is not a sniper", id);
    };
    let mut filter = sniper.filter;
    if let Some(v) = min_liquidity {
        filter.min_liquidity = v;
    }
    if let Some(v) = max_buy_tax {
        filter.max_buy_tax = v;
    }
    if let Some(v) = max_sell_tax {
        filter.max_sell_tax = v;
    }

    registry.update_sniper_filter(&task_id, filter)?;
    registry.close().await?;
    println!("Updated filter for task {}", id);
    Ok(())
}

/// Show a task's execution history
pub async fn history(config: &Config, id: &str, limit: usize) -> Result<()> {
    let registry = open_registry(config).await?;
    let task = registry
        .get(&parse_task_id(id)?)
        .with_context(|| format!("Task not found: {}", id))?;

    println!("\n=== HISTORY: {} ({}, {}) ===\n", task.id, task.kind(), task.state);
    println!(
        "Executions: {}  Failures: {}  Copied: {}  Sniped: {}",
        task.stats.executions,
        task.stats.failures,
        task.stats.trades_copied,
        task.stats.successful_snipes
    );
    if let Some(at) = task.last_evaluated_at {
        println!("Last evaluated: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();

    if task.history.is_empty() {
        println!("No executions yet.");
        return Ok(());
    }

    for result in task.history.iter().rev().take(limit) {
        let outcome = if result.success {
            format!(
                "OK   {} -> {} tx {}",
                result.amount_in,
                result.amount_out.unwrap_or_default(),
                result.tx_signature.as_deref().unwrap_or("-")
            )
        } else {
            format!(
                "FAIL {}: {}",
                result
                    .error_kind
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                result.error_message.as_deref().unwrap_or("-")
            )
        };
        println!(
            "{}  {:>6}ms  {} attempt(s)  {}",
            result.completed_at.format("%Y-%m-%d %H:%M:%S"),
            result.latency_ms,
            result.attempts,
            outcome
        );
    }
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    const WHALE: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    fn config_in(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.registry.path = dir.path().join("tasks.json");
        config
    }

    #[test]
    fn test_auto_sell_needs_both_bounds() {
        assert!(auto_sell(Some(100.0), None).is_err());
        assert!(auto_sell(None, None).unwrap().is_none());
        assert_eq!(auto_sell(Some(50.0), Some(20.0)).unwrap().unwrap().stop_loss_pct, 20.0);
    }

    #[test]
    fn test_short_address() {
        assert_eq!(short(WHALE), "DYw8..NSKK");
        assert_eq!(short("abc"), "abc");
    }

    #[tokio::test]
    async fn test_task_commands_persist() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        add_copy(
            &config,
            CopyArgs {
                owner: "user-1".to_string(),
                wallet: WHALE.to_string(),
                buys: true,
                sells: false,
                amount: Some(0.2),
                multiplier: None,
                take_profit_pct: None,
                stop_loss_pct: None,
                slippage_bps: Some(300),
            },
        )
        .await
        .unwrap();

        let registry = open_registry(&config).await.unwrap();
        let task = registry.list_by_owner("user-1").pop().unwrap();
        assert_eq!(task.state, TaskState::Active);
        assert_eq!(task.tolerance.slippage_bps, 300);

        pause(&config, &task.id.to_string()).await.unwrap();
        let registry = open_registry(&config).await.unwrap();
        assert_eq!(registry.state(&task.id), Some(TaskState::Paused));

        cancel_all(&config, "user-1", true).await.unwrap();
        let registry = open_registry(&config).await.unwrap();
        assert_eq!(registry.state(&task.id), Some(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_copy_sizing_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        let err = add_copy(
            &config,
            CopyArgs {
                owner: "user-1".to_string(),
                wallet: WHALE.to_string(),
                buys: false,
                sells: false,
                amount: Some(0.2),
                multiplier: Some(2.0),
                take_profit_pct: None,
                stop_loss_pct: None,
                slippage_bps: None,
            },
        )
        .await;
        assert!(err.is_err());
    }
}
