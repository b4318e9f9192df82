//! Fixed-precision decimal-string (de)serialization for monetary and
//! exchange-amount fields. In-memory math keeps using `f64` throughout the
//! normalizer/portfolio/execution code; only the persistence and exchange
//! boundary (repository rows, portfolio snapshots, trade history, trade
//! instructions) goes through this fixed-precision string representation,
//! per the storage/wire requirement that money and exchange amounts never
//! round-trip as raw JSON numbers.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serializer};

const PRECISION: usize = 8;

/// For required (non-`Option`) `f64` fields: `quantity`, `cash`,
/// `total_value`, ...
pub mod decimal_string {
    use super::*;

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:.*}", PRECISION))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<f64>().map_err(DeError::custom)
    }
}

/// For optional `f64` fields: `entry_price`, `fee_cost`, `limit_price`, ...
/// Paired with `skip_serializing_if = "Option::is_none"` on every field that
/// uses it, exactly as the plain-`f64` optional fields already were.
pub mod opt_decimal_string {
    use super::*;

    pub fn serialize<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_str(&format!("{v:.*}", PRECISION)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| s.parse::<f64>().map_err(DeError::custom)).transpose()
    }
}
