//! Broker Execution Adapters
//!
//! One common market-data and order-placement contract with four
//! interchangeable transports:
//!
//! - `terminal`: a locally running trading terminal driven over IPC
//! - `rest`: a remote brokerage REST session with token-pair authentication
//! - `bridge`: a file-drop directory polled by an external gateway
//! - `sim`: an in-process simulator for tests and paper runs
//!
//! No adapter places more than one order per `place_market_order` call;
//! retries are the caller's decision.

pub mod bridge;
pub mod rest;
pub mod sim;
pub mod terminal;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::bars::Bar;

pub use bridge::BridgeBroker;
pub use rest::RestBroker;
pub use sim::SimBroker;
pub use terminal::TerminalBroker;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Entry side encoding used by the detector: +1 long, -1 short
    pub fn from_entry_side(side: i8) -> Self {
        if side > 0 {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome of one order placement attempt, normalized across transports.
///
/// `success == false` is a broker-side rejection carrying the native return
/// code and message; transport failures surface as `Err` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub code: String,
    pub order_id: Option<String>,
    pub message: String,
}

/// Unique tag attached to every order we place
pub fn order_tag() -> String {
    format!("rf-{}", &Uuid::new_v4().to_string()[..8])
}

/// Tagged dispatch over the available transports. The detection and scoring
/// pipeline is shared; only this seam differs per deployment.
pub enum Broker {
    Terminal(TerminalBroker),
    Rest(RestBroker),
    Bridge(BridgeBroker),
    Sim(SimBroker),
}

impl Broker {
    /// Establish the session (connect / login / verify drop directory)
    pub async fn authenticate(&mut self) -> Result<()> {
        match self {
            Broker::Terminal(b) => b.authenticate(),
            Broker::Rest(b) => b.authenticate().await,
            Broker::Bridge(b) => b.authenticate(),
            Broker::Sim(b) => b.authenticate(),
        }
    }

    /// Fetch up to `lookback` of the most recent 5-minute bars
    pub async fn fetch_bars(&mut self, instrument: &str, lookback: usize) -> Result<Vec<Bar>> {
        match self {
            Broker::Terminal(b) => b.fetch_bars(instrument, lookback),
            Broker::Rest(b) => b.fetch_bars(instrument, lookback).await,
            Broker::Bridge(b) => b.fetch_bars(instrument, lookback),
            Broker::Sim(b) => b.fetch_bars(instrument, lookback),
        }
    }

    /// Map a logical symbol to the broker's instrument id, `None` if unknown
    pub async fn resolve_instrument(&mut self, symbol: &str) -> Result<Option<String>> {
        match self {
            Broker::Terminal(b) => b.resolve_instrument(symbol),
            Broker::Rest(b) => b.resolve_instrument(symbol).await,
            Broker::Bridge(b) => b.resolve_instrument(symbol),
            Broker::Sim(b) => b.resolve_instrument(symbol),
        }
    }

    /// Place exactly one market order with attached stop and limit levels
    pub async fn place_market_order(
        &mut self,
        instrument_id: &str,
        side: OrderSide,
        size: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderResult> {
        match self {
            Broker::Terminal(b) => b.place_market_order(instrument_id, side, size, sl, tp, comment),
            Broker::Rest(b) => {
                b.place_market_order(instrument_id, side, size, sl, tp, comment)
                    .await
            }
            Broker::Bridge(b) => {
                b.place_market_order(instrument_id, side, size, sl, tp, comment)
                    .await
            }
            Broker::Sim(b) => b.place_market_order(instrument_id, side, size, sl, tp, comment),
        }
    }

    /// Instrument ids with a currently open position. Second idempotency
    /// guard alongside the ledger.
    pub async fn open_position_symbols(&mut self) -> Result<HashSet<String>> {
        match self {
            Broker::Terminal(b) => b.open_position_symbols(),
            Broker::Rest(b) => b.open_position_symbols().await,
            Broker::Bridge(b) => b.open_position_symbols(),
            Broker::Sim(b) => b.open_position_symbols(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Broker::Terminal(_) => "terminal",
            Broker::Rest(_) => "rest",
            Broker::Bridge(_) => "bridge",
            Broker::Sim(_) => "sim",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_side_from_entry_side() {
        assert_eq!(OrderSide::from_entry_side(1), OrderSide::Buy);
        assert_eq!(OrderSide::from_entry_side(-1), OrderSide::Sell);
    }

    #[test]
    fn test_order_tag_shape() {
        let tag = order_tag();
        assert!(tag.starts_with("rf-"));
        assert_eq!(tag.len(), 11);
    }
}
