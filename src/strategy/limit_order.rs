//! Limit-order rules
//!
//! Orders are edge-triggered: a fire happens on the observation where the
//! condition turns true, not on every observation where it holds.

use std::collections::HashMap;

use super::TradePlan;
use crate::task::{
    AutoSellRule, LimitOrderTask, OrderSide, TaskId, TaskLinks, TaskSpec, TaskState,
    TriggerMetric, WatchTask,
};

/// `Buy`/`StopLoss` wait for the value to fall to the trigger, the others for
/// it to rise to it
pub fn is_satisfied(side: OrderSide, value: f64, trigger: f64) -> bool {
    if side.fires_on_fall() {
        value <= trigger
    } else {
        value >= trigger
    }
}

pub fn plan(order: &LimitOrderTask) -> TradePlan {
    if order.side.is_buy() {
        TradePlan::buy(&order.token, order.amount)
    } else {
        TradePlan::sell(&order.token, order.amount)
    }
}

/// Failures always re-arm; fills terminate unless the order re-arms itself
pub fn disposition(order: &LimitOrderTask, success: bool) -> TaskState {
    if success && !order.rearm {
        TaskState::Terminated
    } else {
        TaskState::Active
    }
}

/// Last observed condition per order
#[derive(Debug, Default)]
pub struct EdgeTracker {
    last: HashMap<TaskId, bool>,
}

impl EdgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation; true if it is a rising edge
    pub fn observe(&mut self, id: TaskId, satisfied: bool) -> bool {
        let previous = self.last.insert(id, satisfied);
        satisfied && previous != Some(true)
    }

    /// Forget the last observation so the next satisfied tick fires again
    pub fn reset(&mut self, id: &TaskId) {
        self.last.remove(id);
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Take-profit and stop-loss orders protecting a fresh buy.
///
/// Both sell the full position, trigger on price relative to `entry_price`
/// and are linked as siblings so a fill on one can cancel the other.
pub fn auto_sell_pair(
    parent: &WatchTask,
    rule: AutoSellRule,
    token: &str,
    entry_price: f64,
    tokens: f64,
) -> (WatchTask, WatchTask) {
    let order = |side: OrderSide, trigger_value: f64| LimitOrderTask {
        token: token.to_string(),
        side,
        metric: TriggerMetric::Price,
        trigger_value,
        amount: tokens,
        rearm: false,
    };

    let take_profit = order(
        OrderSide::TakeProfit,
        entry_price * (1.0 + rule.take_profit_pct / 100.0),
    );
    let stop_loss = order(
        OrderSide::StopLoss,
        entry_price * (1.0 - rule.stop_loss_pct / 100.0),
    );

    let mut tp = WatchTask::new(
        parent.owner_id.clone(),
        TaskSpec::LimitOrder(take_profit),
        parent.tolerance,
    );
    let mut sl = WatchTask::new(
        parent.owner_id.clone(),
        TaskSpec::LimitOrder(stop_loss),
        parent.tolerance,
    );

    tp.links = TaskLinks {
        parent: Some(parent.id),
        sibling: Some(sl.id),
    };
    sl.links = TaskLinks {
        parent: Some(parent.id),
        sibling: Some(tp.id),
    };

    (tp, sl)
}
