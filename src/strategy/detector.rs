//! Setup Detector
//!
//! State machine that finds the sweep, break and retest events for one
//! trading day and assembles the candidate trade setup the model scores:
//!
//! 1. SWEEP   - first bar trading through a session bound (liquidity grab)
//! 2. BREAK   - first later bar closing back inside the range (rejection)
//! 3. RETEST  - best-effort revisit of the sweep extreme within 12 bars,
//!              refining entry timing; the break bar is the fallback entry
//!
//! Entry fades the sweep: short after a high-sweep, long after a low-sweep.
//! Detection stops at the first qualifying sweep, so a day produces at most
//! one setup. A day with no sweep or no break is not an error, it is an
//! absence of trade opportunity.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::features::{self, SessionLabel};
use super::risk::compute_risk;
use super::session::{wilder_atr, TradingDayRange};
use crate::bars::Bar;

/// Trading window closes at 15:45 UTC on the trade day
pub const WINDOW_END_HOUR: u32 = 15;
pub const WINDOW_END_MINUTE: u32 = 45;

/// Retest search is bounded to this many bars after the break bar
pub const RETEST_BOUND_BARS: usize = 12;

/// Detector progress through one trading day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    AwaitingSweep,
    AwaitingBreak,
    AwaitingRetest,
    Resolved,
}

impl std::fmt::Display for DetectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectorState::AwaitingSweep => write!(f, "AWAITING_SWEEP"),
            DetectorState::AwaitingBreak => write!(f, "AWAITING_BREAK"),
            DetectorState::AwaitingRetest => write!(f, "AWAITING_RETEST"),
            DetectorState::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// A fully resolved candidate trade. Created once per qualifying day per
/// instrument; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    pub instrument: String,
    pub trade_day: NaiveDate,
    pub sweep_time: DateTime<Utc>,
    /// +1 when the session high was swept, -1 when the session low was swept
    pub sweep_side: i8,
    pub sweep_price: f64,
    pub break_time: DateTime<Utc>,
    pub entry_time: DateTime<Utc>,
    /// Inverse of `sweep_side`: the trade fades the sweep
    pub entry_side: i8,
    pub entry_price: f64,
    pub sl: f64,
    pub tp: f64,
    pub rr: f64,
    pub rr_clip: f64,
    pub session_high: f64,
    pub session_low: f64,
    pub session_atr: f64,
    pub atr_at_sweep: f64,
    pub atr_at_entry: f64,
    pub session_label_at_sweep: SessionLabel,
    pub session_label_at_entry: SessionLabel,
    pub minutes_sweep_to_break: i64,
    pub minutes_break_to_entry: i64,
    pub hour_of_entry: u8,
    pub day_of_week: u8,
    /// Fixed-order numeric features matching the model's declared columns
    pub feature_vector: Vec<f64>,
}

/// End of the trading window for a trade day
pub fn window_end(trade_day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(
        &trade_day
            .and_time(NaiveTime::from_hms_opt(WINDOW_END_HOUR, WINDOW_END_MINUTE, 0).unwrap()),
    )
}

/// Sweep event found while scanning the trading window
#[derive(Debug, Clone, Copy)]
struct SweepEvent {
    bar_idx: usize,
    side: i8,
    price: f64,
}

/// Side of a sweep for a single bar against the session bounds.
///
/// A bar can trade through both bounds. The pinned rule from the original
/// strategy resolves it by whichever half of the bar extended further from
/// its open (upper vs lower excursion); ties go to the upper side.
fn classify_sweep(bar: &Bar, session_high: f64, session_low: f64) -> Option<(i8, f64)> {
    let swept_high = bar.high >= session_high;
    let swept_low = bar.low <= session_low;

    match (swept_high, swept_low) {
        (true, false) => Some((1, bar.high)),
        (false, true) => Some((-1, bar.low)),
        (true, true) => {
            let upper = bar.high - bar.open;
            let lower = bar.open - bar.low;
            if upper >= lower {
                Some((1, bar.high))
            } else {
                Some((-1, bar.low))
            }
        }
        (false, false) => None,
    }
}

/// Run the state machine for one trading day.
///
/// `bars` is the full ordered series for the instrument; the scan is
/// restricted to `[session_end, 15:45 UTC]`. Returns `Ok(None)` when the
/// day never produces a complete sweep-then-break sequence.
pub fn detect_setup(
    bars: &[Bar],
    range: &TradingDayRange,
    feature_cols: &[String],
) -> Result<Option<Setup>> {
    let atr = wilder_atr(bars);
    let end = window_end(range.trade_day);

    // Indices of bars inside the trading window, in order
    let window: Vec<usize> = bars
        .iter()
        .enumerate()
        .filter(|(_, b)| b.timestamp >= range.session_end && b.timestamp <= end)
        .map(|(i, _)| i)
        .collect();

    let mut state = DetectorState::AwaitingSweep;
    let mut sweep: Option<SweepEvent> = None;
    let mut break_idx: Option<usize> = None;
    let mut entry_idx: Option<usize> = None;

    for (pos, &i) in window.iter().enumerate() {
        let bar = &bars[i];
        match state {
            DetectorState::AwaitingSweep => {
                if let Some((side, price)) =
                    classify_sweep(bar, range.session_high, range.session_low)
                {
                    sweep = Some(SweepEvent { bar_idx: i, side, price });
                    state = DetectorState::AwaitingBreak;
                }
            }
            DetectorState::AwaitingBreak => {
                let Some(sw) = sweep else {
                    state = DetectorState::AwaitingSweep;
                    continue;
                };
                let re_entered = if sw.side > 0 {
                    bar.close <= range.session_high
                } else {
                    bar.close >= range.session_low
                };
                if re_entered {
                    break_idx = Some(i);
                    state = DetectorState::AwaitingRetest;
                }
            }
            DetectorState::AwaitingRetest => {
                let (Some(sw), Some(bidx)) = (sweep, break_idx) else {
                    state = DetectorState::AwaitingSweep;
                    continue;
                };

                // Bar offset from the break bar within the window
                let break_pos = window.iter().position(|&w| w == bidx).unwrap_or(pos);
                if pos > break_pos + RETEST_BOUND_BARS {
                    state = DetectorState::Resolved; // bound exceeded, fall back
                    break;
                }

                let revisited = if sw.side > 0 {
                    bar.high >= sw.price
                } else {
                    bar.low <= sw.price
                };
                if revisited {
                    entry_idx = Some(i);
                    state = DetectorState::Resolved;
                    break;
                }
            }
            DetectorState::Resolved => break,
        }
    }

    let (Some(sw), Some(bidx)) = (sweep, break_idx) else {
        return Ok(None); // no opportunity today
    };

    // Retest missing or bound exceeded: the break bar itself is the entry bar
    let eidx = entry_idx.unwrap_or(bidx);

    let sweep_bar = &bars[sw.bar_idx];
    let break_bar = &bars[bidx];
    let entry_bar = &bars[eidx];

    let entry_side = -sw.side;
    let entry_price = break_bar.close; // limit-at-reclaim semantics
    let risk = compute_risk(
        entry_side,
        entry_price,
        range.session_high,
        range.session_low,
        sw.price,
    );

    let mut setup = Setup {
        instrument: range.instrument.clone(),
        trade_day: range.trade_day,
        sweep_time: sweep_bar.timestamp,
        sweep_side: sw.side,
        sweep_price: sw.price,
        break_time: break_bar.timestamp,
        entry_time: entry_bar.timestamp,
        entry_side,
        entry_price,
        sl: risk.sl,
        tp: risk.tp,
        rr: risk.rr,
        rr_clip: risk.rr_clip,
        session_high: range.session_high,
        session_low: range.session_low,
        session_atr: range.session_atr,
        atr_at_sweep: atr[sw.bar_idx].unwrap_or(0.0),
        atr_at_entry: atr[eidx].unwrap_or(0.0),
        session_label_at_sweep: features::session_label(sweep_bar.timestamp),
        session_label_at_entry: features::session_label(entry_bar.timestamp),
        minutes_sweep_to_break: (break_bar.timestamp - sweep_bar.timestamp).num_minutes(),
        minutes_break_to_entry: (entry_bar.timestamp - break_bar.timestamp).num_minutes(),
        hour_of_entry: chrono::Timelike::hour(&entry_bar.timestamp) as u8,
        day_of_week: features::day_of_week(entry_bar.timestamp),
        feature_vector: Vec::new(),
    };
    setup.feature_vector = features::build_vector(&setup, feature_cols)?;

    Ok(Some(setup))
}

/// Detect setups across all day ranges of one instrument, in day order
pub fn detect_setups(
    bars: &[Bar],
    ranges: &[TradingDayRange],
    feature_cols: &[String],
) -> Result<Vec<Setup>> {
    let mut setups = Vec::new();
    for range in ranges {
        if let Some(setup) = detect_setup(bars, range, feature_cols)? {
            setups.push(setup);
        }
    }
    Ok(setups)
}
