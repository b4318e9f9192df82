use super::composer::Composer;
use super::normalizer::{normalize_plan, NormalizerConfig};
use super::param_advisor::{GridParamAdvisor, PrevGridParams};
use super::price::resolve_price;
use crate::model::{
    ComposeContext, ComposeResult, FeatureVector, InstrumentRef, PlanAction, PlanItem, PlanProposal,
    QUANTITY_PRECISION,
};
use async_trait::async_trait;
use std::sync::Arc;

const MARKET_CHANGE_THRESHOLD_PCT: f64 = 0.01;
const MIN_GRID_ZONE_PCT: f64 = 0.10;
const MAX_GRID_COUNT_DELTA: i64 = 2;
const ADVICE_REFRESH_SEC: i64 = 300;

/// Rule-based mean-reversion grid strategy: no LLM call is required to
/// produce a plan, only to occasionally retune `step_pct`/`max_steps`/
/// `base_fraction` via the optional `GridParamAdvisor`. With positions,
/// price crossing a grid line from the previous cycle's price adds on the
/// way down and reduces on the way up (mirrored for shorts); without a
/// position, a step crossed since the last cycle triggers an open.
pub struct GridComposer {
    symbols: Vec<String>,
    is_spot: bool,
    max_leverage: f64,
    normalizer_config: NormalizerConfig,
    advisor: Option<Arc<GridParamAdvisor>>,

    step_pct: f64,
    max_steps: u32,
    base_fraction: f64,
    grid_lower_pct: Option<f64>,
    grid_upper_pct: Option<f64>,
    grid_count: Option<u32>,

    params_applied: bool,
    last_advice_ts: Option<i64>,
    advisor_rationale: Option<String>,
}

impl GridComposer {
    pub fn new(
        symbols: Vec<String>,
        is_spot: bool,
        max_leverage: f64,
        normalizer_config: NormalizerConfig,
        advisor: Option<Arc<GridParamAdvisor>>,
    ) -> Self {
        Self {
            symbols,
            is_spot,
            max_leverage,
            normalizer_config,
            advisor,
            step_pct: 0.005,
            max_steps: 3,
            base_fraction: 0.08,
            grid_lower_pct: None,
            grid_upper_pct: None,
            grid_count: None,
            params_applied: false,
            last_advice_ts: None,
            advisor_rationale: None,
        }
    }

    fn max_abs_change_pct(&self, context: &ComposeContext) -> Option<f64> {
        context
            .features
            .iter()
            .filter(|fv| self.symbols.contains(&fv.instrument.symbol))
            .filter_map(Self::change_pct_of)
            .map(|v| v.abs())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    fn change_pct_of(fv: &FeatureVector) -> Option<f64> {
        if let Some(v) = fv.value("change_pct") {
            return Some(v);
        }
        if let Some(v) = fv.value("price.change_pct") {
            return Some(v);
        }
        let last = fv.value("price.last").or_else(|| fv.value("price.close"))?;
        let open = fv.value("price.open")?;
        if open == 0.0 {
            None
        } else {
            Some(last / open - 1.0)
        }
    }

    fn has_clear_market_change(&self, context: &ComposeContext) -> bool {
        self.max_abs_change_pct(context)
            .map(|v| v >= MARKET_CHANGE_THRESHOLD_PCT)
            .unwrap_or(false)
    }

    async fn maybe_refresh_params(&mut self, context: &ComposeContext) {
        let Some(advisor) = self.advisor.clone() else {
            return;
        };
        let should_refresh = !self.params_applied
            || self
                .last_advice_ts
                .map(|ts| context.ts - ts >= ADVICE_REFRESH_SEC * 1000)
                .unwrap_or(true);
        if !should_refresh {
            return;
        }

        let prev = PrevGridParams {
            step_pct: self.step_pct,
            max_steps: self.max_steps,
            base_fraction: self.base_fraction,
            grid_lower_pct: self.grid_lower_pct,
            grid_upper_pct: self.grid_upper_pct,
            grid_count: self.grid_count,
        };

        let Some(advice) = advisor
            .advise(
                context,
                &self.symbols,
                &prev,
                self.normalizer_config.cap_factor,
                self.max_leverage,
            )
            .await
        else {
            return;
        };

        let apply_new = !self.params_applied || self.has_clear_market_change(context);
        if apply_new {
            self.step_pct = advice.grid_step_pct.max(1e-6);
            self.max_steps = advice.grid_max_steps.max(1);
            self.base_fraction = advice.grid_base_fraction.max(1e-6);

            let proposed_lower = advice.grid_lower_pct.unwrap_or(MIN_GRID_ZONE_PCT).max(0.0);
            let proposed_upper = advice.grid_upper_pct.unwrap_or(MIN_GRID_ZONE_PCT).max(0.0);
            self.grid_lower_pct = Some(proposed_lower.max(MIN_GRID_ZONE_PCT));
            self.grid_upper_pct = Some(proposed_upper.max(MIN_GRID_ZONE_PCT));

            if let Some(proposed_count) = advice.grid_count {
                let proposed_count = proposed_count.max(1) as i64;
                self.grid_count = Some(match self.grid_count {
                    Some(prev_count) => {
                        let lower = (prev_count as i64 - MAX_GRID_COUNT_DELTA).max(1);
                        let upper = prev_count as i64 + MAX_GRID_COUNT_DELTA;
                        proposed_count.clamp(lower, upper) as u32
                    }
                    None => proposed_count as u32,
                });
                let span = self.grid_lower_pct.unwrap_or(0.0) + self.grid_upper_pct.unwrap_or(0.0);
                if span > 0.0 {
                    self.step_pct = (span / self.grid_count.unwrap() as f64).max(1e-6);
                    self.max_steps = self.grid_count.unwrap().max(1);
                }
            }
            self.params_applied = true;
        }
        self.advisor_rationale = advice.advisor_rationale;
        self.last_advice_ts = Some(context.ts);
    }

    /// Resolves `(prev_price, curr_price)` for `symbol` from the
    /// best-ranked feature pair (matching `resolve_price`'s ranking),
    /// reading both `price.open` and `price.last`/`close` off the same
    /// feature vector so the pair is internally consistent.
    fn resolve_prev_curr(context: &ComposeContext, symbol: &str) -> Option<(f64, f64)> {
        let candidates: Vec<&FeatureVector> = context
            .features
            .iter()
            .filter(|f| f.instrument.symbol == symbol)
            .collect();

        let rank = |f: &FeatureVector| -> i32 {
            if f.interval() == Some("1s") {
                0
            } else if f.is_market_snapshot() {
                1
            } else if f.interval() == Some("1m") {
                2
            } else {
                3
            }
        };

        let mut best: Option<(i32, f64, f64)> = None;
        for f in candidates {
            let open = f.value("price.open");
            let last = f.value("price.last").or_else(|| f.value("close")).or_else(|| f.value("price.close"));
            if let (Some(open), Some(last)) = (open, last) {
                if open <= 0.0 || last <= 0.0 {
                    continue;
                }
                let r = rank(f);
                if best.map_or(true, |(br, _, _)| r < br) {
                    best = Some((r, open, last));
                }
            }
        }
        best.map(|(_, o, l)| (o, l))
    }

    fn grid_index(price: f64, avg_px: f64, step_pct: f64) -> i64 {
        ((price / avg_px - 1.0) / step_pct.max(1e-9)).floor() as i64
    }

    fn leverage_for(&self, is_open: bool) -> f64 {
        if self.is_spot || !is_open {
            1.0
        } else {
            self.max_leverage
        }
    }

    fn in_zone(&self, avg_px: f64, price: f64) -> bool {
        if avg_px <= 0.0 {
            return true;
        }
        match (self.grid_lower_pct, self.grid_upper_pct) {
            (None, None) => true,
            (lower, upper) => {
                let lower_bound = avg_px * (1.0 - lower.unwrap_or(0.0));
                let upper_bound = avg_px * (1.0 + upper.unwrap_or(0.0));
                price >= lower_bound && price <= upper_bound
            }
        }
    }

    fn plan_for_symbol(&self, context: &ComposeContext, symbol: &str, equity: f64) -> Option<PlanItem> {
        let price = resolve_price(context, symbol)?;
        if price <= 0.0 {
            return None;
        }
        let base_qty = (equity * self.base_fraction / price).max(0.0);
        if base_qty <= 0.0 {
            return None;
        }

        let pos = context.portfolio.positions.get(symbol);
        let qty = pos.map(|p| p.quantity).unwrap_or(0.0);
        let avg_px = pos.and_then(|p| p.avg_price).unwrap_or(0.0);

        if qty.abs() <= QUANTITY_PRECISION {
            let (prev_px, curr_px) = Self::resolve_prev_curr(context, symbol)?;
            let moved_down = curr_px <= prev_px * (1.0 - self.step_pct);
            let moved_up = curr_px >= prev_px * (1.0 + self.step_pct);

            if moved_down {
                return Some(PlanItem {
                    instrument: InstrumentRef::new(symbol),
                    action: PlanAction::OpenLong,
                    target_qty: base_qty,
                    leverage: Some(self.leverage_for(true)),
                    confidence: Some(1.0),
                    rationale: Some(format!(
                        "grid open-long: crossed down from {prev_px:.4} to {curr_px:.4}"
                    )),
                });
            }
            if !self.is_spot && moved_up {
                return Some(PlanItem {
                    instrument: InstrumentRef::new(symbol),
                    action: PlanAction::OpenShort,
                    target_qty: base_qty,
                    leverage: Some(self.leverage_for(true)),
                    confidence: Some(1.0),
                    rationale: Some(format!(
                        "grid open-short: crossed up from {prev_px:.4} to {curr_px:.4}"
                    )),
                });
            }
            return None;
        }

        if avg_px <= 0.0 {
            return None;
        }
        let (prev_px, curr_px) = Self::resolve_prev_curr(context, symbol)?;
        if !self.in_zone(avg_px, price) {
            return None;
        }

        let gi_prev = Self::grid_index(prev_px, avg_px, self.step_pct);
        let gi_curr = Self::grid_index(curr_px, avg_px, self.step_pct);
        let delta_idx = gi_curr - gi_prev;
        if delta_idx == 0 {
            return None;
        }
        let applied_steps = delta_idx.unsigned_abs().min(self.max_steps as u64) as f64;
        let confidence = (applied_steps / self.max_steps.max(1) as f64).min(1.0);

        if qty > 0.0 {
            if delta_idx < 0 {
                return Some(PlanItem {
                    instrument: InstrumentRef::new(symbol),
                    action: PlanAction::OpenLong,
                    target_qty: base_qty * applied_steps,
                    leverage: Some(self.leverage_for(true)),
                    confidence: Some(confidence),
                    rationale: Some(format!(
                        "grid long add: crossed {} grid(s) down around avg {avg_px:.4}",
                        delta_idx.unsigned_abs()
                    )),
                });
            }
            return Some(PlanItem {
                instrument: InstrumentRef::new(symbol),
                action: PlanAction::CloseLong,
                target_qty: (qty.abs()).min(base_qty * applied_steps),
                leverage: Some(1.0),
                confidence: Some(confidence),
                rationale: Some(format!(
                    "grid long reduce: crossed {} grid(s) up around avg {avg_px:.4}",
                    delta_idx.unsigned_abs()
                )),
            });
        }

        // qty < 0: short position.
        if delta_idx > 0 && !self.is_spot {
            return Some(PlanItem {
                instrument: InstrumentRef::new(symbol),
                action: PlanAction::OpenShort,
                target_qty: base_qty * applied_steps,
                leverage: Some(self.leverage_for(true)),
                confidence: Some(confidence),
                rationale: Some(format!(
                    "grid short add: crossed {} grid(s) up around avg {avg_px:.4}",
                    delta_idx.unsigned_abs()
                )),
            });
        }
        if delta_idx < 0 {
            return Some(PlanItem {
                instrument: InstrumentRef::new(symbol),
                action: PlanAction::CloseShort,
                target_qty: (qty.abs()).min(base_qty * applied_steps),
                leverage: Some(1.0),
                confidence: Some(confidence),
                rationale: Some(format!(
                    "grid short cover: crossed {} grid(s) down around avg {avg_px:.4}",
                    delta_idx.unsigned_abs()
                )),
            });
        }
        None
    }

    fn params_desc(&self) -> String {
        let zone = match (self.grid_lower_pct, self.grid_upper_pct) {
            (Some(l), Some(u)) => format!(", zone_pct=[-{l:.4}, +{u:.4}]"),
            _ => String::new(),
        };
        let count = self.grid_count.map(|c| format!(", count={c}")).unwrap_or_default();
        format!(
            "params(step_pct={:.4}, max_steps={}, base_fraction={:.4}{zone}{count})",
            self.step_pct, self.max_steps, self.base_fraction
        )
    }
}

#[async_trait]
impl Composer for GridComposer {
    async fn compose(&mut self, context: &ComposeContext) -> ComposeResult {
        self.maybe_refresh_params(context).await;

        let equity = context
            .portfolio
            .total_value
            .unwrap_or(context.portfolio.free_cash);

        let mut items = Vec::new();
        for symbol in self.symbols.clone() {
            if let Some(item) = self.plan_for_symbol(context, &symbol, equity) {
                items.push(item);
            }
        }

        let params_desc = self.params_desc();
        let advisor_desc = self
            .advisor_rationale
            .as_ref()
            .map(|r| format!("; advisor_rationale={r}"))
            .unwrap_or_default();

        if items.is_empty() {
            return ComposeResult::empty(format!("Grid NOOP — no triggers hit. {params_desc}{advisor_desc}"));
        }

        let plan = PlanProposal {
            ts: context.ts,
            items,
            rationale: Some(format!("Grid plan — {params_desc}{advisor_desc}")),
        };
        let instructions = normalize_plan(context, &plan, &self.normalizer_config);
        ComposeResult {
            instructions,
            rationale: plan.rationale.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Constraints, Digest, PortfolioView, PositionSnapshot, TradeType};
    use std::collections::HashMap;

    fn feature_pair(symbol: &str, open: f64, last: f64) -> FeatureVector {
        let mut values = HashMap::new();
        values.insert("price.open".to_string(), open);
        values.insert("price.last".to_string(), last);
        let mut meta = HashMap::new();
        meta.insert("group_by".to_string(), "market_snapshot".to_string());
        FeatureVector {
            ts: 0,
            instrument: InstrumentRef::new(symbol),
            values,
            meta,
        }
    }

    fn context_with(features: Vec<FeatureVector>, positions: HashMap<String, PositionSnapshot>, total_value: f64) -> ComposeContext {
        ComposeContext {
            ts: 0,
            compose_id: "c1".into(),
            strategy_id: "s1".into(),
            features,
            portfolio: PortfolioView {
                ts: 0,
                strategy_id: None,
                free_cash: total_value,
                positions,
                gross_exposure: Some(0.0),
                net_exposure: Some(0.0),
                total_value: Some(total_value),
                total_unrealized_pnl: Some(0.0),
                buying_power: Some(total_value),
                constraints: Some(Constraints::default()),
            },
            digest: Digest::new(),
            prompt_text: None,
            market_snapshot: None,
            constraints: Constraints {
                quantity_step: Some(1e-6),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn opens_long_on_no_position_when_price_drops_a_step() {
        let ctx = context_with(
            vec![feature_pair("BTC-USDT", 50_000.0, 49_000.0)],
            HashMap::new(),
            10_000.0,
        );
        let mut composer = GridComposer::new(
            vec!["BTC-USDT".into()],
            true,
            1.0,
            NormalizerConfig { is_spot: true, ..Default::default() },
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        assert_eq!(result.instructions[0].side, crate::model::TradeSide::Buy);
    }

    #[tokio::test]
    async fn stays_noop_when_no_step_crossed() {
        let ctx = context_with(
            vec![feature_pair("BTC-USDT", 50_000.0, 50_010.0)],
            HashMap::new(),
            10_000.0,
        );
        let mut composer = GridComposer::new(
            vec!["BTC-USDT".into()],
            true,
            1.0,
            NormalizerConfig { is_spot: true, ..Default::default() },
            None,
        );
        let result = composer.compose(&ctx).await;
        assert!(result.instructions.is_empty());
    }

    #[tokio::test]
    async fn reduces_long_position_when_price_crosses_grid_line_up() {
        let mut positions = HashMap::new();
        positions.insert(
            "BTC-USDT".to_string(),
            PositionSnapshot {
                instrument: InstrumentRef::new("BTC-USDT"),
                quantity: 0.1,
                avg_price: Some(50_000.0),
                mark_price: Some(50_400.0),
                unrealized_pnl: None,
                unrealized_pnl_pct: None,
                notional: Some(5_040.0),
                leverage: None,
                entry_ts: None,
                trade_type: TradeType::Long,
            },
        );
        let ctx = context_with(
            vec![feature_pair("BTC-USDT", 50_200.0, 50_400.0)],
            positions,
            10_000.0,
        );
        let mut composer = GridComposer::new(
            vec!["BTC-USDT".into()],
            true,
            1.0,
            NormalizerConfig { is_spot: true, ..Default::default() },
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        assert_eq!(result.instructions[0].side, crate::model::TradeSide::Sell);
    }

    /// Derivatives account, buying power available: a `CLOSE_LONG` grid
    /// reduce must leave a positive remaining position, not flip to a
    /// short. Unlike the spot variant above, nothing here (no spot clamp,
    /// no starved buying power) can incidentally hide a flip — this is the
    /// case the resolve-target fix is actually for.
    #[tokio::test]
    async fn partial_close_on_derivatives_reduces_without_flipping_short() {
        let mut positions = HashMap::new();
        positions.insert(
            "BTC-USDT".to_string(),
            PositionSnapshot {
                instrument: InstrumentRef::new("BTC-USDT"),
                quantity: 0.1,
                avg_price: Some(50_000.0),
                mark_price: Some(50_400.0),
                unrealized_pnl: None,
                unrealized_pnl_pct: None,
                notional: Some(5_040.0),
                leverage: None,
                entry_ts: None,
                trade_type: TradeType::Long,
            },
        );
        let ctx = context_with(
            vec![feature_pair("BTC-USDT", 50_200.0, 50_400.0)],
            positions,
            10_000.0,
        );
        let mut composer = GridComposer::new(
            vec!["BTC-USDT".into()],
            false,
            3.0,
            NormalizerConfig { is_spot: false, max_leverage: 3.0, ..Default::default() },
            None,
        );
        let result = composer.compose(&ctx).await;
        assert_eq!(result.instructions.len(), 1);
        let instruction = &result.instructions[0];
        assert_eq!(instruction.side, crate::model::TradeSide::Sell);
        // Reduce-only magnitude (base_qty * applied_steps), strictly less
        // than the full 0.1 position — a partial close, not a full exit.
        assert!(instruction.quantity > 0.0);
        assert!(instruction.quantity < 0.1);
        let remaining = 0.1 - instruction.quantity;
        assert!(remaining > 0.0, "partial close must leave a positive remaining long, not flip short");
    }

    #[tokio::test]
    async fn zone_bound_blocks_trading_outside_configured_zone() {
        let mut composer = GridComposer::new(
            vec!["BTC-USDT".into()],
            true,
            1.0,
            NormalizerConfig { is_spot: true, ..Default::default() },
            None,
        );
        composer.grid_lower_pct = Some(0.1);
        composer.grid_upper_pct = Some(0.1);

        // in_zone is only consulted once a position exists, so seed one
        // whose avg_price puts the current price far outside the zone.
        let mut positions = HashMap::new();
        positions.insert(
            "BTC-USDT".to_string(),
            PositionSnapshot {
                instrument: InstrumentRef::new("BTC-USDT"),
                quantity: 0.1,
                avg_price: Some(40_000.0),
                mark_price: Some(49_000.0),
                unrealized_pnl: None,
                unrealized_pnl_pct: None,
                notional: Some(4_900.0),
                leverage: None,
                entry_ts: None,
                trade_type: TradeType::Long,
            },
        );
        let ctx = context_with(
            vec![feature_pair("BTC-USDT", 50_000.0, 49_000.0)],
            positions,
            10_000.0,
        );
        let result = composer.compose(&ctx).await;
        assert!(result.instructions.is_empty());
    }
}
