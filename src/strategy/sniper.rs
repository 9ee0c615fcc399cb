//! Sniper rules

use super::TradePlan;
use crate::gateway::PoolEvent;
use crate::task::{SniperFilter, SniperTask};

/// Static pool filter: enough liquidity, taxes within bounds
pub fn passes_filter(filter: &SniperFilter, pool: &PoolEvent) -> bool {
    pool.liquidity >= filter.min_liquidity
        && pool.buy_tax <= filter.max_buy_tax
        && pool.sell_tax <= filter.max_sell_tax
}

/// Matches the filter and has not been sniped by this task yet
pub fn should_fire(task: &SniperTask, pool: &PoolEvent) -> bool {
    passes_filter(&task.filter, pool) && !task.seen_tokens.contains(&pool.token)
}

pub fn plan(task: &SniperTask, pool: &PoolEvent) -> TradePlan {
    TradePlan::buy(&pool.token, task.buy_amount)
}
