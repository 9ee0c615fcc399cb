//! Copy-trade rules

use super::TradePlan;
use crate::gateway::{LedgerEvent, TradeAction};
use crate::task::{CopyTradeTask, SizingRule};

/// True if the task mirrors this trade
pub fn matches(task: &CopyTradeTask, event: &LedgerEvent) -> bool {
    if event.wallet != task.source_wallet {
        return false;
    }
    match event.action {
        TradeAction::Buy => task.follow_buy,
        TradeAction::Sell => task.follow_sell,
    }
}

/// Amount to mirror for a source trade of `source_amount`
pub fn mirror_amount(sizing: SizingRule, source_amount: f64) -> f64 {
    match sizing {
        SizingRule::Fixed { amount } => amount,
        SizingRule::Multiplier { multiplier } => source_amount * multiplier,
    }
}

/// Buys mirror SOL into the token, sells mirror the token back to SOL
pub fn plan(task: &CopyTradeTask, event: &LedgerEvent) -> TradePlan {
    let amount = mirror_amount(task.sizing, event.amount);
    let plan = match event.action {
        TradeAction::Buy => TradePlan::buy(&event.token, amount),
        TradeAction::Sell => TradePlan::sell(&event.token, amount),
    };
    plan.clamped()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SOL_MINT;
    use chrono::Utc;

    const WHALE: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";
    const TOKEN: &str = "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr";

    fn task(follow_buy: bool, follow_sell: bool, sizing: SizingRule) -> CopyTradeTask {
        CopyTradeTask {
            source_wallet: WHALE.to_string(),
            follow_buy,
            follow_sell,
            sizing,
            auto_sell: None,
        }
    }

    fn event(action: TradeAction, amount: f64) -> LedgerEvent {
        LedgerEvent {
            signature: "sig".to_string(),
            wallet: WHALE.to_string(),
            action,
            token: TOKEN.to_string(),
            amount,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_follow_flags() {
        let buys_only = task(true, false, SizingRule::Fixed { amount: 0.1 });
        assert!(matches(&buys_only, &event(TradeAction::Buy, 1.0)));
        assert!(!matches(&buys_only, &event(TradeAction::Sell, 1.0)));
    }

    #[test]
    fn test_other_wallet_ignored() {
        let copy = task(true, true, SizingRule::Fixed { amount: 0.1 });
        let mut other = event(TradeAction::Buy, 1.0);
        other.wallet = TOKEN.to_string();
        assert!(!matches(&copy, &other));
    }

    #[test]
    fn test_multiplier_sizing() {
        let amount = mirror_amount(SizingRule::Multiplier { multiplier: 0.5 }, 3.0);
        assert_eq!(amount, 1.5);
        assert_eq!(mirror_amount(SizingRule::Fixed { amount: 0.2 }, 3.0), 0.2);
    }

    #[test]
    fn test_sell_mirrors_back_to_sol() {
        let copy = task(true, true, SizingRule::Multiplier { multiplier: 0.1 });
        let plan = plan(&copy, &event(TradeAction::Sell, 50_000.0));
        assert_eq!(plan.input_mint, TOKEN);
        assert_eq!(plan.output_mint, SOL_MINT);
        assert_eq!(plan.requested, 5_000.0);
        assert!(plan.clamp_to_balance);
    }
}
