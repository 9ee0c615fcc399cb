//! Watch task data model
//!
//! A task links a trigger condition to a trade. The kind-specific fields live
//! in [`TaskSpec`], a closed enum, so every consumer matches all three kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// Wrapped SOL mint, the quote asset for every trade
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Task identifier
pub type TaskId = Uuid;

/// Task kind, derived from the spec and immutable after creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CopyTrade,
    Sniper,
    LimitOrder,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::CopyTrade => write!(f, "copy-trade"),
            TaskKind::Sniper => write!(f, "sniper"),
            TaskKind::LimitOrder => write!(f, "limit-order"),
        }
    }
}

/// How a mirrored trade is sized
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SizingRule {
    /// Constant amount of the input asset regardless of the source trade
    Fixed { amount: f64 },
    /// Fraction of the source trade amount (0.5 = 50%)
    Multiplier { multiplier: f64 },
}

/// Take-profit / stop-loss thresholds applied after a successful buy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoSellRule {
    /// Gain over entry price that triggers the take-profit, in percent
    pub take_profit_pct: f64,
    /// Drop below entry price that triggers the stop-loss, in percent
    pub stop_loss_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyTradeTask {
    /// Wallet whose trades are mirrored
    pub source_wallet: String,
    pub follow_buy: bool,
    pub follow_sell: bool,
    pub sizing: SizingRule,
    #[serde(default)]
    pub auto_sell: Option<AutoSellRule>,
}

/// Static pool filter. Taxes are percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SniperFilter {
    /// Minimum pool liquidity in SOL
    pub min_liquidity: f64,
    pub max_buy_tax: f64,
    pub max_sell_tax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SniperTask {
    pub filter: SniperFilter,
    /// SOL spent per snipe
    pub buy_amount: f64,
    #[serde(default)]
    pub auto_sell: Option<AutoSellRule>,
    /// Tokens this task already fired on; never bought twice
    #[serde(default)]
    pub seen_tokens: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
    StopLoss,
    TakeProfit,
}

impl OrderSide {
    /// True if the order spends SOL to acquire the token
    pub fn is_buy(&self) -> bool {
        matches!(self, OrderSide::Buy)
    }

    /// True if the order fires when the metric falls to or through the trigger
    pub fn fires_on_fall(&self) -> bool {
        matches!(self, OrderSide::Buy | OrderSide::StopLoss)
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
            OrderSide::StopLoss => write!(f, "stop-loss"),
            OrderSide::TakeProfit => write!(f, "take-profit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMetric {
    Price,
    MarketCap,
}

impl fmt::Display for TriggerMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerMetric::Price => write!(f, "price"),
            TriggerMetric::MarketCap => write!(f, "market_cap"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrderTask {
    pub token: String,
    pub side: OrderSide,
    pub metric: TriggerMetric,
    pub trigger_value: f64,
    /// SOL for buys, tokens for every sell-type side
    pub amount: f64,
    /// Return to Active after a successful fill instead of terminating
    #[serde(default)]
    pub rearm: bool,
}

/// Kind-specific task configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    CopyTrade(CopyTradeTask),
    Sniper(SniperTask),
    LimitOrder(LimitOrderTask),
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::CopyTrade(_) => TaskKind::CopyTrade,
            TaskSpec::Sniper(_) => TaskKind::Sniper,
            TaskSpec::LimitOrder(_) => TaskKind::LimitOrder,
        }
    }

    /// Auto-sell rule, if this kind supports one
    pub fn auto_sell(&self) -> Option<AutoSellRule> {
        match self {
            TaskSpec::CopyTrade(copy) => copy.auto_sell,
            TaskSpec::Sniper(sniper) => sniper.auto_sell,
            TaskSpec::LimitOrder(_) => None,
        }
    }

    /// Validate the spec against trading limits
    pub fn validate(&self, limits: &TaskLimits) -> Result<()> {
        match self {
            TaskSpec::CopyTrade(copy) => {
                validate_address("source_wallet", &copy.source_wallet)?;
                if !copy.follow_buy && !copy.follow_sell {
                    return Err(Error::InvalidTask(
                        "copy-trade must follow buys, sells or both".to_string(),
                    ));
                }
                match copy.sizing {
                    SizingRule::Fixed { amount } => limits.check_amount("fixed amount", amount)?,
                    SizingRule::Multiplier { multiplier } => {
                        if !multiplier.is_finite()
                            || multiplier <= 0.0
                            || multiplier > limits.max_copy_multiplier
                        {
                            return Err(Error::InvalidTask(format!(
                                "multiplier must be in (0, {}], got {}",
                                limits.max_copy_multiplier, multiplier
                            )));
                        }
                    }
                }
                if let Some(rule) = &copy.auto_sell {
                    rule.validate()?;
                }
            }
            TaskSpec::Sniper(sniper) => {
                sniper.filter.validate()?;
                limits.check_amount("buy_amount", sniper.buy_amount)?;
                if let Some(rule) = &sniper.auto_sell {
                    rule.validate()?;
                }
            }
            TaskSpec::LimitOrder(order) => {
                validate_address("token", &order.token)?;
                if !order.trigger_value.is_finite() || order.trigger_value <= 0.0 {
                    return Err(Error::InvalidTask(format!(
                        "trigger_value must be positive, got {}",
                        order.trigger_value
                    )));
                }
                if order.side.is_buy() {
                    limits.check_amount("amount", order.amount)?;
                } else if !order.amount.is_finite() || order.amount <= 0.0 {
                    return Err(Error::InvalidTask(format!(
                        "amount must be positive, got {}",
                        order.amount
                    )));
                }
            }
        }
        Ok(())
    }
}

impl SniperFilter {
    pub fn validate(&self) -> Result<()> {
        if !self.min_liquidity.is_finite() || self.min_liquidity < 0.0 {
            return Err(Error::InvalidTask(format!(
                "min_liquidity must be non-negative, got {}",
                self.min_liquidity
            )));
        }
        for (name, tax) in [("max_buy_tax", self.max_buy_tax), ("max_sell_tax", self.max_sell_tax)] {
            if !(0.0..=100.0).contains(&tax) {
                return Err(Error::InvalidTask(format!(
                    "{} must be between 0 and 100, got {}",
                    name, tax
                )));
            }
        }
        Ok(())
    }
}

impl AutoSellRule {
    pub fn validate(&self) -> Result<()> {
        if !self.take_profit_pct.is_finite() || self.take_profit_pct <= 0.0 {
            return Err(Error::InvalidTask("take_profit_pct must be positive".to_string()));
        }
        if self.stop_loss_pct <= 0.0 || self.stop_loss_pct >= 100.0 {
            return Err(Error::InvalidTask(
                "stop_loss_pct must be between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_address(field: &str, address: &str) -> Result<()> {
    Pubkey::from_str(address)
        .map(|_| ())
        .map_err(|e| Error::InvalidAddress(format!("{} '{}': {}", field, address, e)))
}

/// Trading limits applied at task creation
#[derive(Debug, Clone)]
pub struct TaskLimits {
    pub min_trade_amount: f64,
    pub max_buy_amount: f64,
    pub max_slippage_bps: u32,
    pub max_copy_multiplier: f64,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            min_trade_amount: 0.001,
            max_buy_amount: 100.0,
            max_slippage_bps: 10_000,
            max_copy_multiplier: 10.0,
        }
    }
}

impl TaskLimits {
    fn check_amount(&self, field: &str, amount: f64) -> Result<()> {
        if !amount.is_finite() || amount < self.min_trade_amount || amount > self.max_buy_amount {
            return Err(Error::InvalidTask(format!(
                "{} must be between {} and {} SOL, got {}",
                field, self.min_trade_amount, self.max_buy_amount, amount
            )));
        }
        Ok(())
    }
}

/// Quote acceptance bounds for a task's trades
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub slippage_bps: u32,
    pub max_price_impact_pct: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            slippage_bps: 500,
            max_price_impact_pct: 10.0,
        }
    }
}

impl Tolerance {
    pub fn validate(&self, limits: &TaskLimits) -> Result<()> {
        if self.slippage_bps > limits.max_slippage_bps {
            return Err(Error::InvalidTask(format!(
                "slippage_bps cannot exceed {}",
                limits.max_slippage_bps
            )));
        }
        if !(self.max_price_impact_pct > 0.0 && self.max_price_impact_pct <= 100.0) {
            return Err(Error::InvalidTask(
                "max_price_impact_pct must be in (0, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Paused,
    Executing,
    Satisfied,
    Failed,
    Terminated,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Terminated | TaskState::Cancelled)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Active) | (Pending, Terminated) => true,
            (Active, Executing) | (Active, Paused) => true,
            (Paused, Active) => true,
            (Executing, Satisfied) | (Executing, Failed) => true,
            (Satisfied, Active) | (Satisfied, Terminated) => true,
            (Failed, Active) | (Failed, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Paused => "paused",
            TaskState::Executing => "executing",
            TaskState::Satisfied => "satisfied",
            TaskState::Failed => "failed",
            TaskState::Terminated => "terminated",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-task execution counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub executions: u64,
    pub failures: u64,
    pub trades_copied: u64,
    pub successful_snipes: u64,
}

/// Links between derived orders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskLinks {
    /// Task whose buy created this order
    pub parent: Option<TaskId>,
    /// Other half of a take-profit / stop-loss pair
    pub sibling: Option<TaskId>,
}

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub owner_id: String,
    pub success: bool,
    pub tx_signature: Option<String>,
    pub amount_in: f64,
    pub amount_out: Option<f64>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub latency_ms: u64,
    /// Quote/submit attempts made (0 if the trade never reached the gateway)
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Price paid per output unit, for successful fills
    pub fn fill_price(&self) -> Option<f64> {
        match self.amount_out {
            Some(out) if self.success && out > 0.0 => Some(self.amount_in / out),
            _ => None,
        }
    }
}

/// A persisted watch configuration linking a condition to an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchTask {
    pub id: TaskId,
    pub owner_id: String,
    pub spec: TaskSpec,
    pub state: TaskState,
    #[serde(default)]
    pub tolerance: Tolerance,
    #[serde(default)]
    pub stats: TaskStats,
    #[serde(default)]
    pub links: TaskLinks,
    pub created_at: DateTime<Utc>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<ExecutionResult>,
}

impl WatchTask {
    /// Create a new task in the Pending state
    pub fn new(owner_id: impl Into<String>, spec: TaskSpec, tolerance: Tolerance) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            spec,
            state: TaskState::Pending,
            tolerance,
            stats: TaskStats::default(),
            links: TaskLinks::default(),
            created_at: Utc::now(),
            last_evaluated_at: None,
            history: Vec::new(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.spec.kind()
    }

    pub fn is_active(&self) -> bool {
        self.state == TaskState::Active
    }

    /// Validate owner, spec and tolerance
    pub fn validate(&self, limits: &TaskLimits) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::InvalidTask("owner_id must not be empty".to_string()));
        }
        self.spec.validate(limits)?;
        self.tolerance.validate(limits)
    }

    /// Apply an execution result to the counters and history
    pub fn record(&mut self, result: ExecutionResult) {
        self.stats.executions += 1;
        if result.success {
            match self.spec {
                TaskSpec::CopyTrade(_) => self.stats.trades_copied += 1,
                TaskSpec::Sniper(_) => self.stats.successful_snipes += 1,
                TaskSpec::LimitOrder(_) => {}
            }
        } else {
            self.stats.failures += 1;
        }
        self.history.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    fn copy_spec(sizing: SizingRule) -> TaskSpec {
        TaskSpec::CopyTrade(CopyTradeTask {
            source_wallet: WALLET.to_string(),
            follow_buy: true,
            follow_sell: true,
            sizing,
            auto_sell: None,
        })
    }

    #[test]
    fn test_kind_is_derived_from_spec() {
        let task = WatchTask::new("user-1", copy_spec(SizingRule::Fixed { amount: 0.1 }), Tolerance::default());
        assert_eq!(task.kind(), TaskKind::CopyTrade);
        assert_eq!(task.state, TaskState::Pending);
    }

    #[test]
    fn test_invalid_wallet_rejected() {
        let spec = TaskSpec::CopyTrade(CopyTradeTask {
            source_wallet: "not-a-wallet".to_string(),
            follow_buy: true,
            follow_sell: false,
            sizing: SizingRule::Fixed { amount: 0.1 },
            auto_sell: None,
        });
        let err = spec.validate(&TaskLimits::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_copy_must_follow_something() {
        let spec = TaskSpec::CopyTrade(CopyTradeTask {
            source_wallet: WALLET.to_string(),
            follow_buy: false,
            follow_sell: false,
            sizing: SizingRule::Multiplier { multiplier: 0.5 },
            auto_sell: None,
        });
        assert!(spec.validate(&TaskLimits::default()).is_err());
    }

    #[test]
    fn test_amount_limits() {
        let limits = TaskLimits::default();
        assert!(copy_spec(SizingRule::Fixed { amount: 0.0005 }).validate(&limits).is_err());
        assert!(copy_spec(SizingRule::Fixed { amount: 150.0 }).validate(&limits).is_err());
        assert!(copy_spec(SizingRule::Fixed { amount: 1.0 }).validate(&limits).is_ok());
        assert!(copy_spec(SizingRule::Multiplier { multiplier: -1.0 }).validate(&limits).is_err());
    }

    #[test]
    fn test_sniper_filter_validation() {
        let filter = SniperFilter {
            min_liquidity: 5.0,
            max_buy_tax: 120.0,
            max_sell_tax: 10.0,
        };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_limit_order_trigger_must_be_positive() {
        let spec = TaskSpec::LimitOrder(LimitOrderTask {
            token: WALLET.to_string(),
            side: OrderSide::Sell,
            metric: TriggerMetric::Price,
            trigger_value: 0.0,
            amount: 1000.0,
            rearm: false,
        });
        assert!(spec.validate(&TaskLimits::default()).is_err());
    }

    #[test]
    fn test_state_machine() {
        use TaskState::*;
        assert!(Active.can_transition_to(Executing));
        assert!(!Paused.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Cancelled));
        assert!(!Terminated.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(Failed.can_transition_to(Active));
    }

    #[test]
    fn test_record_updates_counters() {
        let mut task = WatchTask::new("user-1", copy_spec(SizingRule::Fixed { amount: 0.1 }), Tolerance::default());
        let result = ExecutionResult {
            task_id: task.id,
            owner_id: "user-1".to_string(),
            success: true,
            tx_signature: Some("sig".to_string()),
            amount_in: 0.1,
            amount_out: Some(1000.0),
            error_kind: None,
            error_message: None,
            latency_ms: 12,
            attempts: 1,
            completed_at: Utc::now(),
        };
        task.record(result.clone());
        task.record(ExecutionResult {
            success: false,
            error_kind: Some(ErrorKind::InsufficientFunds),
            ..result
        });

        assert_eq!(task.stats.trades_copied, 1);
        assert_eq!(task.stats.failures, 1);
        assert_eq!(task.history.len(), 2);
    }

    #[test]
    fn test_spec_roundtrips_with_kind_tag() {
        let spec = copy_spec(SizingRule::Multiplier { multiplier: 0.25 });
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"copy_trade\""));
        let back: TaskSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
