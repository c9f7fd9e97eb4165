//! Session & Range Calculator
//!
//! Computes the Wilder-smoothed Average True Range and, for each trading day
//! present in a bar series, the Asia-session high/low/ATR window the sweep
//! detector trades against. The session window is fixed at 21:00 UTC the
//! prior day through 07:00 UTC the trade day.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::bars::Bar;

/// Wilder ATR lookback in bars
pub const ATR_PERIOD: usize = 14;

/// Asia session opens at 21:00 UTC the evening before the trade day
pub const SESSION_START_HOUR: u32 = 21;

/// Asia session closes at 07:00 UTC on the trade day
pub const SESSION_END_HOUR: u32 = 7;

/// Per-day Asia-session range. One per (instrument, trade day); derived,
/// never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingDayRange {
    pub instrument: String,
    pub trade_day: NaiveDate,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub session_high: f64,
    pub session_low: f64,
    pub session_atr: f64,
}

/// Session window bounds for a trade day: [day-1 21:00 UTC, day 07:00 UTC)
pub fn session_window(trade_day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(
        &(trade_day - Duration::days(1))
            .and_time(NaiveTime::from_hms_opt(SESSION_START_HOUR, 0, 0).unwrap()),
    );
    let end = Utc.from_utc_datetime(
        &trade_day.and_time(NaiveTime::from_hms_opt(SESSION_END_HOUR, 0, 0).unwrap()),
    );
    (start, end)
}

/// Wilder-smoothed ATR over an ordered bar series.
///
/// Returns one slot per input bar. The first `ATR_PERIOD` bars are warm-up
/// and carry `None`: the seed value is the simple average of the first 14
/// true ranges (which themselves need a previous close), so the earliest
/// defined ATR sits at index 14.
pub fn wilder_atr(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut out = vec![None; bars.len()];
    if bars.len() <= ATR_PERIOD {
        return out;
    }

    let mut sum_tr = 0.0;
    for i in 1..=ATR_PERIOD {
        sum_tr += bars[i].true_range(bars[i - 1].close);
    }
    let mut atr = sum_tr / ATR_PERIOD as f64;
    out[ATR_PERIOD] = Some(atr);

    for i in (ATR_PERIOD + 1)..bars.len() {
        let tr = bars[i].true_range(bars[i - 1].close);
        atr = (atr * (ATR_PERIOD as f64 - 1.0) + tr) / ATR_PERIOD as f64;
        out[i] = Some(atr);
    }

    out
}

/// Compute one `TradingDayRange` per trade day that has warmed-up bars
/// inside its Asia window.
///
/// Bars before the ATR warm-up are dropped entirely; days whose window holds
/// no remaining bars are skipped. Empty input yields empty output.
pub fn compute_day_ranges(bars: &[Bar]) -> Vec<TradingDayRange> {
    if bars.is_empty() {
        return Vec::new();
    }

    let atr = wilder_atr(bars);

    // Candidate trade days: every calendar date a bar could belong to. A bar
    // at 22:00 belongs to the *next* day's session, so include date + 1.
    let mut days: Vec<NaiveDate> = Vec::new();
    for bar in bars {
        let d = bar.date();
        for candidate in [d, d + Duration::days(1)] {
            if !days.contains(&candidate) {
                days.push(candidate);
            }
        }
    }
    days.sort();

    let instrument = bars[0].instrument.clone();
    let mut ranges = Vec::new();

    for trade_day in days {
        let (start, end) = session_window(trade_day);

        let mut high = f64::NEG_INFINITY;
        let mut low = f64::INFINITY;
        let mut last_atr = None;
        let mut seen = false;

        for (i, bar) in bars.iter().enumerate() {
            if bar.timestamp < start || bar.timestamp >= end {
                continue;
            }
            let Some(bar_atr) = atr[i] else {
                continue; // warm-up bar
            };
            seen = true;
            high = high.max(bar.high);
            low = low.min(bar.low);
            last_atr = Some(bar_atr);
        }

        if !seen {
            continue;
        }

        ranges.push(TradingDayRange {
            instrument: instrument.clone(),
            trade_day,
            session_start: start,
            session_end: end,
            session_high: high,
            session_low: low,
            session_atr: last_atr.unwrap_or(0.0),
        });
    }

    ranges
}
