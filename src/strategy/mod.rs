//! Strategy adapters
//!
//! Kind-specific rules for matching, sizing and post-execution disposition.
//! Nothing in here does I/O; the evaluator and coordinator feed in whatever
//! they observed and act on the answer.

pub mod copy_trade;
pub mod limit_order;
pub mod sniper;

use crate::engine::ObservedCondition;
use crate::error::{Error, Result};
use crate::task::{TaskLimits, TaskSpec, TaskState, WatchTask, SOL_MINT};

/// What a fire wants to trade, before it is sized against the wallet
#[derive(Debug, Clone, PartialEq)]
pub struct TradePlan {
    pub input_mint: String,
    pub output_mint: String,
    /// Amount of the input asset the rule asks for
    pub requested: f64,
    /// Shrink to the available balance instead of failing
    pub clamp_to_balance: bool,
}

impl TradePlan {
    pub fn buy(token: &str, sol: f64) -> Self {
        Self {
            input_mint: SOL_MINT.to_string(),
            output_mint: token.to_string(),
            requested: sol,
            clamp_to_balance: false,
        }
    }

    pub fn sell(token: &str, tokens: f64) -> Self {
        Self {
            input_mint: token.to_string(),
            output_mint: SOL_MINT.to_string(),
            requested: tokens,
            clamp_to_balance: false,
        }
    }

    pub fn clamped(mut self) -> Self {
        self.clamp_to_balance = true;
        self
    }

    pub fn is_buy(&self) -> bool {
        self.input_mint == SOL_MINT
    }

    /// Token acquired by this trade, if it is a buy
    pub fn bought_token(&self) -> Option<&str> {
        self.is_buy().then_some(self.output_mint.as_str())
    }

    /// Final input amount given what the wallet holds
    pub fn size(&self, available: f64, limits: &TaskLimits) -> Result<f64> {
        let insufficient = || Error::InsufficientBalance {
            available,
            required: self.requested,
        };

        if !self.clamp_to_balance {
            if available < self.requested {
                return Err(insufficient());
            }
            return Ok(self.requested);
        }

        let amount = self.requested.min(available);
        let floor = if self.is_buy() {
            limits.min_trade_amount
        } else {
            0.0
        };
        if amount <= 0.0 || amount < floor {
            return Err(insufficient());
        }
        Ok(amount)
    }
}

/// Resolve the trade a fire asks for
pub fn plan(task: &WatchTask, observed: &ObservedCondition) -> Result<TradePlan> {
    match (&task.spec, observed) {
        (TaskSpec::CopyTrade(copy), ObservedCondition::LedgerTrade(event)) => {
            Ok(copy_trade::plan(copy, event))
        }
        (TaskSpec::Sniper(sniper), ObservedCondition::PoolCreated(pool)) => {
            Ok(sniper::plan(sniper, pool))
        }
        (TaskSpec::LimitOrder(order), ObservedCondition::MetricCrossed { .. }) => {
            Ok(limit_order::plan(order))
        }
        (spec, observed) => Err(Error::Internal(format!(
            "{} task fired with {} payload",
            spec.kind(),
            observed.label()
        ))),
    }
}

/// Where a task goes after an execution finishes
pub fn next_state(spec: &TaskSpec, success: bool) -> TaskState {
    match spec {
        TaskSpec::CopyTrade(_) | TaskSpec::Sniper(_) => TaskState::Active,
        TaskSpec::LimitOrder(order) => limit_order::disposition(order, success),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    #[test]
    fn test_unclamped_plan_needs_full_balance() {
        let limits = TaskLimits::default();
        let plan = TradePlan::buy(TOKEN, 0.5);
        assert_eq!(plan.size(1.0, &limits).unwrap(), 0.5);
        assert!(plan.size(0.4, &limits).is_err());
    }

    #[test]
    fn test_clamped_plan_shrinks_to_balance() {
        let limits = TaskLimits::default();
        let plan = TradePlan::buy(TOKEN, 2.0).clamped();
        assert_eq!(plan.size(1.5, &limits).unwrap(), 1.5);

        let err = plan.size(0.0005, &limits).unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
    }

    #[test]
    fn test_clamped_sell_has_no_sol_floor() {
        let limits = TaskLimits::default();
        let plan = TradePlan::sell(TOKEN, 10.0).clamped();
        assert_eq!(plan.size(0.0001, &limits).unwrap(), 0.0001);
        assert!(plan.size(0.0, &limits).is_err());
        assert_eq!(plan.bought_token(), None);
    }
}
