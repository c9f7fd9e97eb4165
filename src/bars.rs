//! Normalized OHLCV Bar Record
//!
//! Every market-data transport (terminal IPC, REST, file bridge) reduces its
//! native candle format to this one record before the strategy sees it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Bar resolution used throughout the system (minutes)
pub const BAR_MINUTES: i64 = 5;

/// A single 5-minute OHLCV bar, UTC-stamped, immutable once fetched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// Calendar date of the bar (UTC)
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// True range against the previous close (Wilder's definition)
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }
}

/// Sort bars by timestamp and drop duplicates, newest copy wins.
///
/// Transports occasionally re-deliver the most recent bar while it is still
/// forming; the strategy requires a strictly increasing series.
pub fn normalize_series(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.sort_by_key(|b| b.timestamp);
    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match out.last() {
            Some(last) if last.timestamp == bar.timestamp => {
                *out.last_mut().unwrap() = bar;
            }
            _ => out.push(bar),
        }
    }
    out
}
