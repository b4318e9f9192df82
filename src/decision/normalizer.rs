use super::price::resolve_price;
use crate::model::{
    ComposeContext, InstrumentRef, PlanAction, PlanProposal, PriceMode, TradeInstruction, TradeSide,
    QUANTITY_PRECISION,
};
use std::collections::HashMap;

/// Trading-config knobs the normalizer needs but that don't live on
/// `ComposeContext` (which carries only per-cycle, not per-strategy, data).
#[derive(Debug, Clone, Copy)]
pub struct NormalizerConfig {
    pub is_spot: bool,
    pub max_leverage: f64,
    pub cap_factor: f64,
    pub default_slippage_bps: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            is_spot: false,
            max_leverage: crate::config::DEFAULT_MAX_LEVERAGE,
            cap_factor: crate::config::DEFAULT_CAP_FACTOR,
            default_slippage_bps: 5.0,
        }
    }
}

/// Pure, deterministic, idempotent: runs entirely off `context` + `plan` +
/// `config`, touches no I/O, and is unit-tested without instantiating any
/// composer.
pub fn normalize_plan(
    context: &ComposeContext,
    plan: &PlanProposal,
    config: &NormalizerConfig,
) -> Vec<TradeInstruction> {
    let constraints = &context.constraints;
    let equity = context
        .portfolio
        .total_value
        .unwrap_or(context.portfolio.free_cash);
    let allowed_leverage = constraints
        .max_leverage
        .map(|c| c.min(config.max_leverage))
        .unwrap_or(config.max_leverage);

    let mut projected_positions: HashMap<String, f64> = context
        .portfolio
        .positions
        .iter()
        .map(|(symbol, pos)| (symbol.clone(), pos.quantity))
        .collect();
    let mut projected_gross = context.portfolio.gross_exposure.unwrap_or_else(|| {
        projected_positions.values().map(|q| q.abs()).sum::<f64>()
    });
    let mut active_positions = context.portfolio.active_position_count() as u32;

    let mut instructions = Vec::new();

    for (idx, item) in plan.items.iter().enumerate() {
        let symbol = item.instrument.symbol.clone();
        let current_before_item = *projected_positions.get(&symbol).unwrap_or(&0.0);

        // 1. Resolve target. OPEN_* resolves `target_qty` as a signed
        // absolute target (sign by action). CLOSE_* resolves it as a
        // reduce magnitude bounded by the current position instead: a
        // partial close can only shrink the position toward zero, never
        // cross it into the opposite side. A close with no matching
        // position to reduce (e.g. CLOSE_LONG while flat or short) is a
        // no-op — there's nothing of that side to close.
        let mut target = match item.action {
            PlanAction::Noop => current_before_item,
            PlanAction::CloseLong => {
                if current_before_item > 0.0 {
                    (current_before_item - item.target_qty.abs()).max(0.0)
                } else {
                    current_before_item
                }
            }
            PlanAction::CloseShort => {
                if current_before_item < 0.0 {
                    (current_before_item + item.target_qty.abs()).min(0.0)
                } else {
                    current_before_item
                }
            }
            _ => item.action.sign() * item.target_qty.abs(),
        };
        if let Some(max_pos) = constraints.max_position_qty {
            target = target.clamp(-max_pos, max_pos);
        }

        // 2. Spot clamp.
        if config.is_spot && target < 0.0 {
            target = 0.0;
        }

        // 3. Split flip.
        let sub_targets: Vec<f64> = if current_before_item * target < 0.0 {
            vec![0.0, target]
        } else {
            vec![target]
        };

        let price = resolve_price(context, &symbol);
        let mut running_current = current_before_item;

        for (sub_i, &sub_target) in sub_targets.iter().enumerate() {
            let delta = sub_target - running_current;

            // 4. Skip sub-steps under precision.
            if delta.abs() <= QUANTITY_PRECISION {
                continue;
            }

            // 5. Max-positions gate: opening a new symbol from flat.
            let opening_new_symbol = running_current.abs() <= QUANTITY_PRECISION;
            if opening_new_symbol {
                if let Some(max_positions) = constraints.max_positions {
                    if active_positions >= max_positions {
                        continue;
                    }
                }
            }

            // 6. Side + leverage.
            let side = TradeSide::from_delta(delta);
            let leverage = if config.is_spot {
                1.0
            } else {
                item.leverage
                    .unwrap_or(1.0)
                    .clamp(1.0, allowed_leverage.max(1.0))
            };

            let mut qty = delta.abs();

            // 7. Filters, in order.
            if let Some(max_order_qty) = constraints.max_order_qty {
                qty = qty.min(max_order_qty);
            }
            if let Some(step) = constraints.quantity_step {
                if step > 0.0 {
                    qty = (qty / step).floor() * step;
                }
            }
            if qty <= QUANTITY_PRECISION {
                continue;
            }
            if let Some(min_trade_qty) = constraints.min_trade_qty {
                if qty < min_trade_qty {
                    continue;
                }
            }
            if let (Some(min_notional), Some(price)) = (constraints.min_notional, price) {
                if qty * price < min_notional {
                    continue;
                }
            }

            // 8. Notional/leverage cap.
            if let Some(price) = price {
                if price > 0.0 {
                    let cap_factor = if constraints.quantity_step.map_or(false, |s| s > 0.0) {
                        config.cap_factor.max(1.5)
                    } else {
                        config.cap_factor
                    };
                    let cap_qty = (cap_factor * equity / price).min(allowed_leverage * equity / price);
                    qty = qty.min(cap_qty.max(0.0));
                }
            }

            if qty <= QUANTITY_PRECISION {
                continue;
            }

            // 9. Buying-power clamp.
            if let Some(price) = price {
                if price > 0.0 {
                    let effective_price = price * (1.0 + config.default_slippage_bps / 10_000.0);
                    let a = running_current.abs();
                    if qty > 2.0 * a {
                        let available_bp = if config.is_spot {
                            context.portfolio.free_cash.max(0.0)
                        } else {
                            (equity * allowed_leverage - projected_gross).max(0.0)
                        };
                        let bp_units = available_bp / effective_price;
                        qty = qty.min(bp_units);
                    }
                }
            }

            // 10. Emit.
            if qty <= QUANTITY_PRECISION {
                continue;
            }

            let signed_delta = side.sign() * qty;
            let new_current = running_current + signed_delta;

            let instruction_id = TradeInstruction::deterministic_id(
                &context.compose_id,
                &symbol,
                idx * 10 + sub_i,
            );

            instructions.push(TradeInstruction {
                instruction_id,
                compose_id: context.compose_id.clone(),
                instrument: InstrumentRef::new(symbol.clone()),
                side,
                quantity: qty,
                leverage,
                price_mode: PriceMode::Market,
                limit_price: None,
                max_slippage_bps: Some(config.default_slippage_bps),
                meta: {
                    let mut meta = HashMap::new();
                    let reduces_position = new_current.abs() < running_current.abs() - QUANTITY_PRECISION;
                    meta.insert("reduce_only".to_string(), serde_json::json!(reduces_position));
                    meta
                },
            });

            let was_active = running_current.abs() > QUANTITY_PRECISION;
            let is_active = new_current.abs() > QUANTITY_PRECISION;
            if !was_active && is_active {
                active_positions += 1;
            } else if was_active && !is_active {
                active_positions = active_positions.saturating_sub(1);
            }

            projected_gross += new_current.abs() - running_current.abs();
            running_current = new_current;
            projected_positions.insert(symbol.clone(), running_current);
        }
    }

    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Constraints, Digest, PlanItem, PortfolioView, PositionSnapshot, TradeType,
    };

    fn context_with(
        positions: Vec<(&str, f64, f64)>,
        constraints: Constraints,
        free_cash: f64,
        features_price: Option<(&str, f64)>,
    ) -> ComposeContext {
        let mut pos_map = HashMap::new();
        for (symbol, qty, avg) in positions {
            pos_map.insert(
                symbol.to_string(),
                PositionSnapshot {
                    instrument: InstrumentRef::new(symbol),
                    quantity: qty,
                    avg_price: Some(avg),
                    mark_price: None,
                    unrealized_pnl: None,
                    unrealized_pnl_pct: None,
                    notional: None,
                    leverage: None,
                    entry_ts: None,
                    trade_type: TradeType::from_quantity(qty),
                },
            );
        }

        let mut features = Vec::new();
        if let Some((symbol, price)) = features_price {
            let mut values = HashMap::new();
            values.insert("close".to_string(), price);
            let mut meta = HashMap::new();
            meta.insert("interval".to_string(), "1s".to_string());
            features.push(crate::model::FeatureVector {
                ts: 0,
                instrument: InstrumentRef::new(symbol),
                values,
                meta,
            });
        }

        ComposeContext {
            ts: 0,
            compose_id: "c1".into(),
            strategy_id: "s1".into(),
            features,
            portfolio: PortfolioView {
                ts: 0,
                strategy_id: None,
                free_cash,
                positions: pos_map,
                gross_exposure: None,
                net_exposure: None,
                total_value: Some(free_cash),
                total_unrealized_pnl: None,
                buying_power: None,
                constraints: Some(constraints.clone()),
            },
            digest: Digest::new(),
            prompt_text: None,
            market_snapshot: None,
            constraints,
        }
    }

    fn plan_item(symbol: &str, action: PlanAction, qty: f64) -> PlanItem {
        PlanItem {
            instrument: InstrumentRef::new(symbol),
            action,
            target_qty: qty,
            leverage: None,
            confidence: None,
            rationale: None,
        }
    }

    #[test]
    fn noop_plan_emits_no_instructions() {
        let ctx = context_with(vec![], Constraints::default(), 10_000.0, Some(("BTC-USDT", 50_000.0)));
        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::Noop, 0.0)],
            rationale: None,
        };
        let out = normalize_plan(&ctx, &plan, &NormalizerConfig { is_spot: true, ..Default::default() });
        assert!(out.is_empty());
    }

    #[test]
    fn spot_open_long_floors_to_quantity_step() {
        let constraints = Constraints {
            quantity_step: Some(1e-3),
            min_notional: Some(5.0),
            ..Default::default()
        };
        let ctx = context_with(vec![], constraints, 10_000.0, Some(("BTC-USDT", 49_500.0)));
        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::OpenLong, 10_000.0 * 0.1 / 49_500.0)],
            rationale: None,
        };
        let config = NormalizerConfig {
            is_spot: true,
            cap_factor: 1.5,
            ..Default::default()
        };
        let out = normalize_plan(&ctx, &plan, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].side, TradeSide::Buy);
        assert!((out[0].quantity - 0.020).abs() < 1e-9);
    }

    #[test]
    fn spot_clamps_short_target_to_zero() {
        let ctx = context_with(vec![], Constraints::default(), 10_000.0, Some(("BTC-USDT", 50_000.0)));
        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::OpenShort, 1.0)],
            rationale: None,
        };
        let config = NormalizerConfig { is_spot: true, ..Default::default() };
        let out = normalize_plan(&ctx, &plan, &config);
        assert!(out.is_empty());
    }

    #[test]
    fn direction_flip_splits_into_close_then_open() {
        let ctx = context_with(
            vec![("BTC-USDT", 0.5, 50_000.0)],
            Constraints {
                quantity_step: Some(1e-4),
                ..Default::default()
            },
            100_000.0,
            Some(("BTC-USDT", 50_000.0)),
        );
        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::OpenShort, 0.3)],
            rationale: None,
        };
        let config = NormalizerConfig {
            is_spot: false,
            max_leverage: 10.0,
            cap_factor: 1.5,
            default_slippage_bps: 5.0,
        };
        let out = normalize_plan(&ctx, &plan, &config);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].side, TradeSide::Sell);
        assert!((out[0].quantity - 0.5).abs() < 1e-6);
        assert_eq!(out[1].side, TradeSide::Sell);
        assert!((out[1].quantity - 0.3).abs() < 1e-6);
        assert_eq!(out[0].instruction_id, "c1:BTC-USDT:0");
        assert_eq!(out[1].instruction_id, "c1:BTC-USDT:1");
    }

    #[test]
    fn max_positions_gate_blocks_new_symbol() {
        let ctx = context_with(
            vec![("ETH-USDT", 1.0, 2_000.0)],
            Constraints {
                max_positions: Some(1),
                quantity_step: Some(1e-4),
                ..Default::default()
            },
            100_000.0,
            Some(("BTC-USDT", 50_000.0)),
        );
        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::OpenLong, 0.1)],
            rationale: None,
        };
        let out = normalize_plan(&ctx, &plan, &NormalizerConfig::default());
        assert!(out.is_empty());
    }

    #[test]
    fn buying_power_clamp_caps_new_exposure() {
        let ctx = context_with(
            vec![],
            Constraints {
                quantity_step: Some(1e-2),
                ..Default::default()
            },
            1_000.0,
            Some(("BTC-USDT", 100.0)),
        );
        // gross_exposure=2000 requires overriding the default portfolio; build manually.
        let mut ctx = ctx;
        ctx.portfolio.gross_exposure = Some(2_000.0);
        ctx.portfolio.total_value = Some(1_000.0);

        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::OpenLong, 20.0)],
            rationale: None,
        };
        let config = NormalizerConfig {
            is_spot: false,
            max_leverage: 3.0,
            cap_factor: 1.5,
            default_slippage_bps: 25.0,
        };
        let out = normalize_plan(&ctx, &plan, &config);
        assert_eq!(out.len(), 1);
        // BP = max(0, 1000*3 - 2000) = 1000; effective_price = 100*1.0025
        // bp_units = 1000 / 100.25 = 9.9751...; floored to step 1e-2 -> 9.97
        assert!((out[0].quantity - 9.97).abs() < 1e-6);
    }

    #[test]
    fn reductions_are_never_blocked_by_buying_power() {
        let ctx = context_with(
            vec![("BTC-USDT", 5.0, 100.0)],
            Constraints {
                quantity_step: Some(1e-2),
                ..Default::default()
            },
            0.0,
            Some(("BTC-USDT", 100.0)),
        );
        let mut ctx = ctx;
        ctx.portfolio.gross_exposure = Some(500.0);
        ctx.portfolio.total_value = Some(0.0);

        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::CloseLong, 5.0)],
            rationale: None,
        };
        let config = NormalizerConfig {
            is_spot: false,
            max_leverage: 3.0,
            cap_factor: 1.5,
            default_slippage_bps: 5.0,
        };
        let out = normalize_plan(&ctx, &plan, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].side, TradeSide::Sell);
        assert!((out[0].quantity - 5.0).abs() < 1e-6);
    }

    #[test]
    fn partial_close_long_on_derivatives_reduces_without_flipping_short() {
        // Long +0.10 on a derivatives account; planner sends a CLOSE_LONG
        // reduce of 0.016 (a grid-style partial reduce, not a full exit).
        // The old `target = sign * |target_qty|` resolution treated
        // `target_qty` as an absolute signed target, which here meant
        // `target = -0.016`, a flip that closed the whole long and opened
        // a short. The fix must instead leave `current - target_qty`.
        let ctx = context_with(
            vec![("BTC-USDT", 0.10, 50_000.0)],
            Constraints {
                quantity_step: Some(1e-4),
                ..Default::default()
            },
            100_000.0,
            Some(("BTC-USDT", 50_400.0)),
        );
        let mut ctx = ctx;
        ctx.portfolio.gross_exposure = Some(5_040.0);
        ctx.portfolio.total_value = Some(100_000.0);

        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::CloseLong, 0.016)],
            rationale: None,
        };
        let config = NormalizerConfig {
            is_spot: false,
            max_leverage: 3.0,
            cap_factor: 1.5,
            default_slippage_bps: 5.0,
        };
        let out = normalize_plan(&ctx, &plan, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].side, TradeSide::Sell);
        assert!((out[0].quantity - 0.016).abs() < 1e-6);

        let remaining = 0.10 - out[0].quantity;
        assert!(remaining > 0.0, "partial close must leave a positive remaining long");
        assert!(
            (remaining - 0.084).abs() < 1e-6,
            "expected +0.084 remaining, got {remaining}"
        );
    }

    #[test]
    fn close_long_request_larger_than_position_fully_closes_without_flipping() {
        // A CLOSE_LONG for more than the current position must flatten,
        // never flip into a short.
        let ctx = context_with(
            vec![("BTC-USDT", 0.10, 50_000.0)],
            Constraints {
                quantity_step: Some(1e-4),
                ..Default::default()
            },
            100_000.0,
            Some(("BTC-USDT", 50_400.0)),
        );
        let mut ctx = ctx;
        ctx.portfolio.gross_exposure = Some(5_040.0);
        ctx.portfolio.total_value = Some(100_000.0);

        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::CloseLong, 5.0)],
            rationale: None,
        };
        let config = NormalizerConfig {
            is_spot: false,
            max_leverage: 3.0,
            cap_factor: 1.5,
            default_slippage_bps: 5.0,
        };
        let out = normalize_plan(&ctx, &plan, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].side, TradeSide::Sell);
        assert!((out[0].quantity - 0.10).abs() < 1e-6);
    }

    #[test]
    fn close_long_with_no_existing_position_is_a_noop() {
        let ctx = context_with(vec![], Constraints::default(), 10_000.0, Some(("BTC-USDT", 50_000.0)));
        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::CloseLong, 1.0)],
            rationale: None,
        };
        let out = normalize_plan(&ctx, &plan, &NormalizerConfig { is_spot: false, ..Default::default() });
        assert!(out.is_empty());
    }

    #[test]
    fn repeated_normalization_is_idempotent() {
        let ctx = context_with(vec![], Constraints { quantity_step: Some(1e-3), ..Default::default() }, 10_000.0, Some(("BTC-USDT", 49_500.0)));
        let plan = PlanProposal {
            ts: 0,
            items: vec![plan_item("BTC-USDT", PlanAction::OpenLong, 1.0)],
            rationale: None,
        };
        let config = NormalizerConfig { is_spot: true, ..Default::default() };
        let first = normalize_plan(&ctx, &plan, &config);
        let second = normalize_plan(&ctx, &plan, &config);
        assert_eq!(first, second);
    }
}
