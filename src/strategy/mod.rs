//! Strategy Pipeline
//!
//! Session range calculation, sweep/break/retest detection, the shared risk
//! contract and feature extraction. Everything in here is deterministic:
//! identical bar input produces byte-identical setups.

pub mod detector;
pub mod features;
pub mod risk;
pub mod session;

pub use detector::{detect_setup, detect_setups, DetectorState, Setup};
pub use features::{session_label, SessionLabel};
pub use risk::{compute_risk, RiskNumbers};
pub use session::{compute_day_ranges, wilder_atr, TradingDayRange, ATR_PERIOD};
