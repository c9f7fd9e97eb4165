//! Simulated Broker
//!
//! In-process adapter used for dry runs and tests. Bars are preloaded per
//! instrument, orders are recorded instead of routed, and every placement
//! succeeds unless a rejection code is armed.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use tracing::info;

use super::{OrderResult, OrderSide};
use crate::bars::Bar;

/// A recorded order placement
#[derive(Debug, Clone)]
pub struct SimOrder {
    pub instrument: String,
    pub side: OrderSide,
    pub size: f64,
    pub sl: f64,
    pub tp: f64,
    pub comment: String,
}

/// Adapter that trades against preloaded data
#[derive(Default)]
pub struct SimBroker {
    bars: HashMap<String, Vec<Bar>>,
    open_positions: HashSet<String>,
    /// When set, the next placements are rejected with this code
    reject_with: Option<String>,
    /// Instruments whose order placement fails as if the transport dropped
    fail_orders_for: HashSet<String>,
    /// When true, position queries fail as if the transport dropped
    fail_position_query: bool,
    pub placed: Vec<SimOrder>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload the bar series served for `instrument`
    pub fn load_bars(&mut self, instrument: &str, bars: Vec<Bar>) {
        self.bars.insert(instrument.to_string(), bars);
    }

    /// Mark `instrument` as already holding an open position
    pub fn set_open_position(&mut self, instrument: &str) {
        self.open_positions.insert(instrument.to_string());
    }

    /// Arm broker-side rejection for subsequent placements
    pub fn reject_orders_with(&mut self, code: &str) {
        self.reject_with = Some(code.to_string());
    }

    /// Make order placement for `instrument` fail at the transport level
    pub fn fail_order_transport(&mut self, instrument: &str) {
        self.fail_orders_for.insert(instrument.to_string());
    }

    /// Make position queries return a transport error
    pub fn fail_position_queries(&mut self) {
        self.fail_position_query = true;
    }

    pub fn authenticate(&mut self) -> Result<()> {
        info!("Simulated broker ready");
        Ok(())
    }

    pub fn fetch_bars(&mut self, instrument: &str, lookback: usize) -> Result<Vec<Bar>> {
        let Some(series) = self.bars.get(instrument) else {
            bail!("no simulated bars loaded for {}", instrument);
        };
        let start = series.len().saturating_sub(lookback);
        Ok(series[start..].to_vec())
    }

    pub fn resolve_instrument(&mut self, symbol: &str) -> Result<Option<String>> {
        if self.bars.contains_key(symbol) {
            Ok(Some(symbol.to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn place_market_order(
        &mut self,
        instrument_id: &str,
        side: OrderSide,
        size: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderResult> {
        if self.fail_orders_for.contains(instrument_id) {
            bail!("simulated order transport failure for {}", instrument_id);
        }
        if let Some(code) = &self.reject_with {
            return Ok(OrderResult {
                success: false,
                code: code.clone(),
                order_id: None,
                message: "simulated rejection".to_string(),
            });
        }

        self.placed.push(SimOrder {
            instrument: instrument_id.to_string(),
            side,
            size,
            sl,
            tp,
            comment: comment.to_string(),
        });
        self.open_positions.insert(instrument_id.to_string());

        Ok(OrderResult {
            success: true,
            code: "OK".to_string(),
            order_id: Some(format!("sim-{}", self.placed.len())),
            message: format!("simulated fill ({})", comment),
        })
    }

    pub fn open_position_symbols(&mut self) -> Result<HashSet<String>> {
        if self.fail_position_query {
            bail!("simulated position query failure");
        }
        Ok(self.open_positions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32) -> Bar {
        Bar {
            instrument: "GER40".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 3, 8, minute, 0).unwrap(),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10,
        }
    }

    #[test]
    fn test_fetch_serves_the_tail_of_the_series() {
        let mut broker = SimBroker::new();
        broker.load_bars("GER40", vec![bar(0), bar(5), bar(10), bar(15)]);

        let bars = broker.fetch_bars("GER40", 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp.format("%M").to_string(), "10");

        assert!(broker.fetch_bars("US500", 2).is_err());
    }

    #[test]
    fn test_placement_records_and_opens_position() {
        let mut broker = SimBroker::new();
        let res = broker
            .place_market_order("GER40", OrderSide::Sell, 1.0, 105.0, 98.0, "rf-abc")
            .unwrap();
        assert!(res.success);
        assert_eq!(broker.placed.len(), 1);
        assert!(broker.open_position_symbols().unwrap().contains("GER40"));
    }

    #[test]
    fn test_armed_transport_failure_is_an_error() {
        let mut broker = SimBroker::new();
        broker.fail_order_transport("GER40");
        assert!(broker
            .place_market_order("GER40", OrderSide::Buy, 1.0, 98.0, 105.0, "rf-abc")
            .is_err());
        // other instruments are unaffected
        let res = broker
            .place_market_order("US500", OrderSide::Buy, 1.0, 98.0, 105.0, "rf-abc")
            .unwrap();
        assert!(res.success);
    }

    #[test]
    fn test_armed_rejection_is_not_a_transport_error() {
        let mut broker = SimBroker::new();
        broker.reject_orders_with("INSUFFICIENT_FUNDS");
        let res = broker
            .place_market_order("GER40", OrderSide::Buy, 1.0, 98.0, 105.0, "rf-abc")
            .unwrap();
        assert!(!res.success);
        assert_eq!(res.code, "INSUFFICIENT_FUNDS");
        assert!(broker.placed.is_empty());
    }
}
