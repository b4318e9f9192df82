use crate::model::{
    Constraints, PortfolioView, PositionSnapshot, TradeHistoryEntry, TradeSide, TradeType,
    QUANTITY_PRECISION,
};
use parking_lot::RwLock;
use std::collections::HashMap;

/// `get_view` returns the current snapshot (with buying_power / gross /
/// total_value computed); `apply_trades` is the only mutator, called once
/// per cycle by the Decision Coordinator after execution.
pub trait PortfolioService: Send + Sync {
    fn get_view(&self) -> PortfolioView;
    /// Applies each fill in order, mutating position state. Any entry
    /// whose `realized_pnl`/`exit_ts`/`holding_ms` wasn't already computed
    /// by the caller is filled in here, against the position's `avg_price`
    /// at the moment it's applied — the only place that value is known.
    fn apply_trades(&self, trades: &mut [TradeHistoryEntry], price_map: &HashMap<String, f64>);
    /// Refreshes `mark_price`/`unrealized_pnl` on every open position from
    /// `price_map` without touching quantity or realized P&L. Called once
    /// per cycle ahead of `get_view` so a cycle with no trades still marks
    /// positions to the latest price.
    fn mark_to_market(&self, price_map: &HashMap<String, f64>);
    /// Replaces free cash and positions wholesale from a durable checkpoint.
    /// Called once by the Stream Controller at startup, before the first
    /// cycle, to resume a strategy across restarts.
    fn seed_from_snapshot(&self, view: &PortfolioView);
}

struct Inner {
    free_cash: f64,
    positions: HashMap<String, PositionSnapshot>,
    is_spot: bool,
}

/// Reference in-memory implementation, `parking_lot::RwLock`-guarded.
/// Opening adds to quantity and recomputes a VWAP `avg_price`; closing
/// reduces quantity and realizes P&L; a close that overshoots zero opens
/// the opposite side with the excess as a defensive clamp — the normalizer
/// already splits flips into two sub-steps, so this path is a robustness
/// net rather than a regular code path.
pub struct InMemoryPortfolioService {
    strategy_id: String,
    is_spot: bool,
    max_leverage: f64,
    constraints: Constraints,
    inner: RwLock<Inner>,
}

impl InMemoryPortfolioService {
    pub fn new(
        strategy_id: impl Into<String>,
        initial_cash: f64,
        is_spot: bool,
        max_leverage: f64,
        constraints: Constraints,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            is_spot,
            max_leverage,
            constraints,
            inner: RwLock::new(Inner {
                free_cash: initial_cash,
                positions: HashMap::new(),
                is_spot,
            }),
        }
    }

    fn apply_one(inner: &mut Inner, trade: &mut TradeHistoryEntry, price_map: &HashMap<String, f64>) {
        let symbol = &trade.instrument.symbol;
        let mark_price = price_map
            .get(symbol)
            .copied()
            .or(trade.exit_price)
            .or(trade.entry_price)
            .unwrap_or(0.0);

        let pos = inner
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| PositionSnapshot::flat(trade.instrument.clone()));

        let signed_delta = trade.side.sign() * trade.quantity;
        let current = pos.quantity;
        let trade_price = trade.entry_price.or(trade.exit_price).unwrap_or(mark_price);
        let fee = trade.fee_cost.unwrap_or(0.0);

        let adding = current == 0.0 || current.signum() == signed_delta.signum();

        if adding {
            let new_qty = current + signed_delta;
            let prior_notional = current.abs() * pos.avg_price.unwrap_or(trade_price);
            let added_notional = trade.quantity * trade_price;
            pos.avg_price = if new_qty.abs() > QUANTITY_PRECISION {
                Some((prior_notional + added_notional) / new_qty.abs())
            } else {
                None
            };
            pos.quantity = new_qty;
            if inner.is_spot_like() {
                inner.free_cash -= signed_delta * trade_price;
            }
            inner.free_cash -= fee;
            trade.entry_price.get_or_insert(trade_price);
            pos.entry_ts = pos.entry_ts.or(trade.entry_ts).or(Some(trade.trade_ts));
        } else {
            // Reducing or flipping through zero.
            let closing_qty = trade.quantity.min(current.abs());
            let realized = *trade
                .realized_pnl
                .get_or_insert_with(|| Self::realize(pos, trade.side, closing_qty, trade_price));
            pos.quantity = current - current.signum() * closing_qty;
            inner.free_cash += realized - fee;
            if inner.is_spot_like() {
                inner.free_cash += current.signum() * closing_qty * trade_price;
            }

            trade.exit_price.get_or_insert(trade_price);
            trade.exit_ts.get_or_insert(trade.trade_ts);
            if trade.holding_ms.is_none() {
                if let (Some(entry_ts), Some(exit_ts)) = (pos.entry_ts, trade.exit_ts) {
                    trade.holding_ms = Some((exit_ts - entry_ts).max(0));
                }
            }

            let excess = trade.quantity - closing_qty;
            if excess > QUANTITY_PRECISION {
                // Overshoot past zero: open the opposite side with the remainder.
                pos.quantity = signed_delta.signum() * excess;
                pos.avg_price = Some(trade_price);
                pos.entry_ts = Some(trade.trade_ts);
            }
            if pos.quantity.abs() <= QUANTITY_PRECISION {
                pos.quantity = 0.0;
                pos.avg_price = None;
                pos.entry_ts = None;
            }
        }

        pos.trade_type = TradeType::from_quantity(pos.quantity);
        pos.mark_price = Some(mark_price);
        if let Some(avg) = pos.avg_price {
            pos.notional = Some(pos.quantity.abs() * mark_price);
            pos.unrealized_pnl = Some((mark_price - avg) * pos.quantity);
            pos.unrealized_pnl_pct = if avg.abs() > f64::EPSILON {
                Some((mark_price - avg) / avg * pos.quantity.signum())
            } else {
                None
            };
        } else {
            pos.notional = None;
            pos.unrealized_pnl = None;
            pos.unrealized_pnl_pct = None;
        }
    }

    /// Realized P&L for closing `closing_qty` units at `exit_price`, used
    /// only when the trade entry didn't already carry a computed value.
    fn realize(pos: &PositionSnapshot, side: TradeSide, closing_qty: f64, exit_price: f64) -> f64 {
        let avg = pos.avg_price.unwrap_or(exit_price);
        match side {
            TradeSide::Sell => (exit_price - avg) * closing_qty,
            TradeSide::Buy => (avg - exit_price) * closing_qty,
        }
    }
}

impl Inner {
    fn is_spot_like(&self) -> bool {
        self.is_spot
    }
}

impl PortfolioService for InMemoryPortfolioService {
    fn get_view(&self) -> PortfolioView {
        let inner = self.inner.read();
        let gross_exposure: f64 = inner
            .positions
            .values()
            .map(|p| p.notional.unwrap_or(0.0))
            .sum();
        let net_exposure: f64 = inner
            .positions
            .values()
            .map(|p| p.quantity * p.mark_price.unwrap_or(0.0))
            .sum();
        let total_unrealized_pnl: f64 = inner
            .positions
            .values()
            .filter_map(|p| p.unrealized_pnl)
            .sum();
        let total_value = inner.free_cash + total_unrealized_pnl;

        let buying_power = if self.is_spot {
            inner.free_cash.max(0.0)
        } else {
            let allowed_leverage = self.constraints.max_leverage.unwrap_or(self.max_leverage);
            (total_value * allowed_leverage - gross_exposure).max(0.0)
        };

        PortfolioView {
            ts: chrono::Utc::now().timestamp_millis(),
            strategy_id: Some(self.strategy_id.clone()),
            free_cash: inner.free_cash,
            positions: inner.positions.clone(),
            gross_exposure: Some(gross_exposure),
            net_exposure: Some(net_exposure),
            total_value: Some(total_value),
            total_unrealized_pnl: Some(total_unrealized_pnl),
            buying_power: Some(buying_power),
            constraints: Some(self.constraints.clone()),
        }
    }

    fn apply_trades(&self, trades: &mut [TradeHistoryEntry], price_map: &HashMap<String, f64>) {
        if trades.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for trade in trades.iter_mut() {
            Self::apply_one(&mut inner, trade, price_map);
        }
    }

    fn mark_to_market(&self, price_map: &HashMap<String, f64>) {
        let mut inner = self.inner.write();
        for (symbol, pos) in inner.positions.iter_mut() {
            if pos.is_flat() {
                continue;
            }
            let Some(mark_price) = price_map.get(symbol).copied() else {
                continue;
            };
            pos.mark_price = Some(mark_price);
            if let Some(avg) = pos.avg_price {
                pos.notional = Some(pos.quantity.abs() * mark_price);
                pos.unrealized_pnl = Some((mark_price - avg) * pos.quantity);
                pos.unrealized_pnl_pct = if avg.abs() > f64::EPSILON {
                    Some((mark_price - avg) / avg * pos.quantity.signum())
                } else {
                    None
                };
            }
        }
    }

    fn seed_from_snapshot(&self, view: &PortfolioView) {
        let mut inner = self.inner.write();
        inner.free_cash = view.free_cash;
        inner.positions = view.positions.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentRef;

    fn trade(symbol: &str, side: TradeSide, qty: f64, price: f64, realized: Option<f64>) -> TradeHistoryEntry {
        TradeHistoryEntry {
            trade_id: "t1".into(),
            compose_id: "c1".into(),
            instruction_id: "c1:sym:0".into(),
            strategy_id: "s1".into(),
            instrument: InstrumentRef::new(symbol),
            side,
            trade_type: TradeType::from_quantity(if side == TradeSide::Buy { 1.0 } else { -1.0 }),
            quantity: qty,
            entry_price: Some(price),
            exit_price: None,
            notional_entry: Some(qty * price),
            notional_exit: None,
            entry_ts: Some(0),
            exit_ts: None,
            trade_ts: 0,
            holding_ms: None,
            realized_pnl: realized,
            fee_cost: Some(0.0),
            leverage: Some(1.0),
            note: None,
        }
    }

    #[test]
    fn opening_buy_sets_vwap_avg_price() {
        let svc = InMemoryPortfolioService::new("s1", 10_000.0, true, 1.0, Constraints::default());
        svc.apply_trades(
            &mut [trade("BTC-USDT", TradeSide::Buy, 0.02, 49_500.0, None)],
            &HashMap::new(),
        );
        let view = svc.get_view();
        let pos = &view.positions["BTC-USDT"];
        assert!((pos.quantity - 0.02).abs() < 1e-9);
        assert!((pos.avg_price.unwrap() - 49_500.0).abs() < 1e-6);
    }

    #[test]
    fn closing_sell_realizes_pnl() {
        let svc = InMemoryPortfolioService::new("s1", 0.0, false, 3.0, Constraints::default());
        svc.apply_trades(
            &mut [trade("BTC-USDT", TradeSide::Buy, 1.0, 100.0, None)],
            &HashMap::new(),
        );
        svc.apply_trades(
            &mut [trade("BTC-USDT", TradeSide::Sell, 1.0, 110.0, Some(10.0))],
            &HashMap::new(),
        );
        let view = svc.get_view();
        assert!((view.free_cash - 10.0).abs() < 1e-6);
        assert!(view.positions["BTC-USDT"].is_flat());
    }

    #[test]
    fn closing_sell_fills_in_realized_pnl_when_not_precomputed() {
        let svc = InMemoryPortfolioService::new("s1", 0.0, false, 3.0, Constraints::default());
        svc.apply_trades(
            &mut [trade("BTC-USDT", TradeSide::Buy, 1.0, 100.0, None)],
            &HashMap::new(),
        );
        let mut closing = [trade("BTC-USDT", TradeSide::Sell, 1.0, 110.0, None)];
        svc.apply_trades(&mut closing, &HashMap::new());
        assert!((closing[0].realized_pnl.unwrap() - 10.0).abs() < 1e-6);
        assert!(closing[0].exit_price.is_some());
    }

    #[test]
    fn buying_power_is_zero_when_spot_cash_exhausted() {
        let svc = InMemoryPortfolioService::new("s1", 0.0, true, 1.0, Constraints::default());
        let view = svc.get_view();
        assert_eq!(view.buying_power, Some(0.0));
    }

    #[test]
    fn mark_to_market_updates_unrealized_pnl_without_changing_quantity() {
        let svc = InMemoryPortfolioService::new("s1", 10_000.0, false, 3.0, Constraints::default());
        svc.apply_trades(
            &mut [trade("BTC-USDT", TradeSide::Buy, 1.0, 100.0, None)],
            &HashMap::new(),
        );

        let mut price_map = HashMap::new();
        price_map.insert("BTC-USDT".to_string(), 110.0);
        svc.mark_to_market(&price_map);

        let view = svc.get_view();
        let pos = &view.positions["BTC-USDT"];
        assert!((pos.quantity - 1.0).abs() < 1e-9);
        assert_eq!(pos.mark_price, Some(110.0));
        assert!((pos.unrealized_pnl.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn seed_from_snapshot_replaces_cash_and_positions() {
        let svc = InMemoryPortfolioService::new("s1", 0.0, false, 3.0, Constraints::default());
        let mut seeded = PositionSnapshot::flat(InstrumentRef::new("ETH-USDT"));
        seeded.quantity = 2.0;
        seeded.avg_price = Some(2_000.0);
        let view = PortfolioView {
            ts: 1,
            strategy_id: Some("s1".into()),
            free_cash: 7_500.0,
            positions: HashMap::from([("ETH-USDT".to_string(), seeded)]),
            gross_exposure: None,
            net_exposure: None,
            total_value: None,
            total_unrealized_pnl: None,
            buying_power: None,
            constraints: None,
        };
        svc.seed_from_snapshot(&view);
        let resumed = svc.get_view();
        assert_eq!(resumed.free_cash, 7_500.0);
        assert!((resumed.positions["ETH-USDT"].quantity - 2.0).abs() < 1e-9);
    }
}
