use crate::model::{ComposeContext, FeatureVector};

/// Picks the freshest available price for `symbol` out of the cycle's
/// feature vectors: `1s` candle close ranks above a market-snapshot
/// `price.last`, which ranks above a `1m` candle close, which ranks above
/// anything else carrying a `close` value. Shared by the grid composer
/// (current/previous price) and the normalizer (notional and
/// buying-power math).
pub fn resolve_price(context: &ComposeContext, symbol: &str) -> Option<f64> {
    resolve_price_from_features(&context.features, symbol)
}

/// Same ranking as [`resolve_price`], operating directly on a feature
/// slice. Lets callers (the coordinator, building a mark price map before
/// a `ComposeContext` even exists) reuse the ranking without constructing
/// one.
pub fn resolve_price_from_features(features: &[FeatureVector], symbol: &str) -> Option<f64> {
    let matching: Vec<&FeatureVector> = features
        .iter()
        .filter(|f| f.instrument.symbol == symbol)
        .collect();

    matching
        .iter()
        .find(|f| f.interval() == Some("1s"))
        .and_then(|f| f.value("close"))
        .or_else(|| {
            matching
                .iter()
                .find(|f| f.is_market_snapshot())
                .and_then(|f| f.value("price.last"))
        })
        .or_else(|| {
            matching
                .iter()
                .find(|f| f.interval() == Some("1m"))
                .and_then(|f| f.value("close"))
        })
        .or_else(|| matching.iter().find_map(|f| f.value("close")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Constraints, Digest, InstrumentRef, PortfolioView, META_GROUP_BY,
        META_GROUP_BY_MARKET_SNAPSHOT, META_INTERVAL,
    };
    use std::collections::HashMap;

    fn base_context(features: Vec<FeatureVector>) -> ComposeContext {
        ComposeContext {
            ts: 0,
            compose_id: "c1".into(),
            strategy_id: "s1".into(),
            features,
            portfolio: PortfolioView {
                ts: 0,
                strategy_id: None,
                free_cash: 0.0,
                positions: HashMap::new(),
                gross_exposure: None,
                net_exposure: None,
                total_value: None,
                total_unrealized_pnl: None,
                buying_power: None,
                constraints: None,
            },
            digest: Digest::new(),
            prompt_text: None,
            market_snapshot: None,
            constraints: Constraints::default(),
        }
    }

    fn feature(symbol: &str, interval: Option<&str>, snapshot: bool, key: &str, val: f64) -> FeatureVector {
        let mut meta = HashMap::new();
        if let Some(i) = interval {
            meta.insert(META_INTERVAL.to_string(), i.to_string());
        }
        if snapshot {
            meta.insert(META_GROUP_BY.to_string(), META_GROUP_BY_MARKET_SNAPSHOT.to_string());
        }
        let mut values = HashMap::new();
        values.insert(key.to_string(), val);
        FeatureVector {
            ts: 0,
            instrument: InstrumentRef::new(symbol),
            values,
            meta,
        }
    }

    #[test]
    fn prefers_1s_over_snapshot_and_1m() {
        let ctx = base_context(vec![
            feature("BTC-USDT", Some("1m"), false, "close", 100.0),
            feature("BTC-USDT", None, true, "price.last", 101.0),
            feature("BTC-USDT", Some("1s"), false, "close", 102.0),
        ]);
        assert_eq!(resolve_price(&ctx, "BTC-USDT"), Some(102.0));
    }

    #[test]
    fn falls_back_to_snapshot_when_no_1s() {
        let ctx = base_context(vec![
            feature("BTC-USDT", Some("1m"), false, "close", 100.0),
            feature("BTC-USDT", None, true, "price.last", 101.0),
        ]);
        assert_eq!(resolve_price(&ctx, "BTC-USDT"), Some(101.0));
    }

    #[test]
    fn missing_symbol_returns_none() {
        let ctx = base_context(vec![feature("ETH-USDT", Some("1s"), false, "close", 10.0)]);
        assert_eq!(resolve_price(&ctx, "BTC-USDT"), None);
    }
}
