use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One OHLCV bucket. Prices are kept as the exchange's decimal strings so no
/// precision is lost between ingestion and the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time (ms since epoch)
    pub open_time: i64,
    /// Bucket close time (ms since epoch)
    pub close_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

impl Candle {
    /// Two candles describe the same bucket when their time ranges match.
    #[inline]
    pub fn same_bucket(&self, other: &Candle) -> bool {
        self.open_time == other.open_time && self.close_time == other.close_time
    }

    /// Copy the mutable fields of an in-progress bucket onto this candle.
    /// Open price and open time stay as first recorded.
    pub fn refresh_from(&mut self, other: &Candle) {
        self.close.clone_from(&other.close);
        self.high.clone_from(&other.high);
        self.low.clone_from(&other.low);
        self.volume.clone_from(&other.volume);
    }
}

/// A live push event for one (symbol, interval) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineEvent {
    pub symbol: String,
    pub interval: String,
    pub candle: Candle,
    /// Whether the exchange has closed this bucket
    pub is_final: bool,
}

/// Exchange trading rules for a symbol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingFilters {
    /// Minimum price increment (PRICE_FILTER.tickSize)
    pub tick_size: Option<String>,
    /// Minimum quantity increment (LOT_SIZE.stepSize)
    pub step_size: Option<String>,
    pub min_qty: Option<String>,
    pub min_notional: Option<String>,
}

/// Tradeable symbol with its asset metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub pair: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub margin_asset: String,
    /// Exchange trading status, when the provider reports one
    pub status: Option<String>,
    pub filters: TradingFilters,
}

impl SymbolInfo {
    /// Round a raw price to the nearest tick and render it at tick precision.
    /// Returns `None` when the symbol has no usable tick size.
    pub fn align_price(&self, raw: f64) -> Option<String> {
        let tick = self.filters.tick_size.as_deref()?;
        align_to_step(raw, tick, false)
    }

    /// Floor a raw quantity to the lot step and render it at step precision.
    pub fn align_quantity(&self, raw: f64) -> Option<String> {
        let step = self.filters.step_size.as_deref()?;
        align_to_step(raw, step, true)
    }
}

/// Number of significant fractional digits in a decimal step such as "0.00100".
pub fn step_decimals(step: &str) -> usize {
    match step.trim().split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len(),
        None => 0,
    }
}

fn align_to_step(raw: f64, step: &str, floor: bool) -> Option<String> {
    let step_value: f64 = step.trim().parse().ok()?;
    if !raw.is_finite() || !(step_value > 0.0) {
        return None;
    }

    let decimals = step_decimals(step);
    // Nudge by a tiny epsilon so values sitting exactly on a step survive
    // binary representation error.
    let units = raw / step_value;
    let units = if floor {
        (units + 1e-9).floor()
    } else {
        units.round()
    };

    Some(format!("{:.*}", decimals, units * step_value))
}

/// Consumer-facing copy of one symbol's cached history
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub symbol: String,
    /// Last time any interval of this symbol was written (ms since epoch)
    pub update_time: i64,
    /// interval -> candles, oldest first
    pub candles: HashMap<String, Vec<Candle>>,
}

#[cfg(test)]
pub(crate) fn candle(open_time: i64, close_time: i64, close: &str) -> Candle {
    Candle {
        open_time,
        close_time,
        open: "100.0".to_string(),
        high: close.to_string(),
        low: close.to_string(),
        close: close.to_string(),
        volume: "1.0".to_string(),
    }
}
