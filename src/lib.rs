//! rangefade - intraday session range sweep fade
//!
//! Deterministic pipeline from raw 5-minute bars to live orders:
//!
//! 1. [`strategy::session`] derives the overnight session range and ATR
//! 2. [`strategy::detector`] finds the sweep/break/retest sequence
//! 3. [`model`] gates each setup through the trained classifier
//! 4. [`live`] polls, scores and routes retained signals to a [`broker`]
//!    behind the [`ledger`]'s idempotency guard

pub mod bars;
pub mod broker;
pub mod ledger;
pub mod live;
pub mod model;
pub mod strategy;
