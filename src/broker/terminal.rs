//! Local Terminal Adapter
//!
//! Drives a trading terminal (TWS or IB Gateway) running on this machine
//! over its socket IPC. Market data arrives as 5-minute historical bars;
//! orders go out as a bracket: parent market order with attached stop-loss
//! and take-profit children, transmitted together.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ibapi::accounts::PositionUpdate;
use ibapi::contracts::{Contract, SecurityType};
use ibapi::market_data::historical::{BarSize, ToDuration, WhatToShow};
use ibapi::orders::{order_builder, Action};
use ibapi::Client;

use super::{OrderResult, OrderSide};
use crate::bars::{Bar, BAR_MINUTES};

/// Terminal connection settings
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Terminal host (default: 127.0.0.1)
    pub host: String,
    /// Terminal port (paper: 7497, live: 7496)
    pub port: u16,
    /// Client id, unique per connection
    pub client_id: i32,
    /// Exchange the futures contracts trade on
    pub exchange: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 1,
            exchange: "CME".to_string(),
        }
    }
}

/// Broker adapter over the local terminal IPC session
pub struct TerminalBroker {
    config: TerminalConfig,
    client: Option<Arc<Client>>,
    next_order_id: i32,
}

impl TerminalBroker {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            client: None,
            next_order_id: 1,
        }
    }

    fn client(&self) -> Result<&Arc<Client>> {
        self.client
            .as_ref()
            .context("terminal not connected - call authenticate() first")
    }

    fn next_order_id(&mut self) -> i32 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    /// Futures contract for a local symbol of the form
    /// `<base><month code><year digit>` (e.g. NQH6 = March 2026)
    fn contract_for(&self, local_symbol: &str) -> Contract {
        let base_len = local_symbol.len().saturating_sub(2).max(1);
        Contract {
            symbol: local_symbol[..base_len].to_string(),
            security_type: SecurityType::Future,
            exchange: self.config.exchange.clone(),
            currency: "USD".to_string(),
            local_symbol: local_symbol.to_string(),
            primary_exchange: self.config.exchange.clone(),
            ..Default::default()
        }
    }

    /// Connect to the running terminal
    pub fn authenticate(&mut self) -> Result<()> {
        let url = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to terminal at {}...", url);

        let client = Client::connect(&url, self.config.client_id)
            .context("Failed to connect to the trading terminal. Make sure it is running.")?;

        self.client = Some(Arc::new(client));
        info!("Connected to terminal");
        Ok(())
    }

    /// Fetch the most recent `lookback` 5-minute bars
    pub fn fetch_bars(&mut self, instrument: &str, lookback: usize) -> Result<Vec<Bar>> {
        let contract = self.contract_for(instrument);
        let client = self.client()?;

        let duration_secs = (lookback as i64 * BAR_MINUTES * 60) as i32;
        let data = client
            .historical_data(
                &contract,
                None, // end time: now
                duration_secs.seconds(),
                BarSize::Min5,
                WhatToShow::Trades,
                false,
            )
            .with_context(|| format!("failed to fetch bars for {}", instrument))?;

        let mut bars = Vec::with_capacity(data.bars.len());
        for hb in &data.bars {
            let Some(timestamp) =
                DateTime::<Utc>::from_timestamp(hb.date.unix_timestamp(), hb.date.nanosecond())
            else {
                continue;
            };
            bars.push(Bar {
                instrument: instrument.to_string(),
                timestamp,
                open: hb.open,
                high: hb.high,
                low: hb.low,
                close: hb.close,
                volume: hb.volume as u64,
            });
        }

        debug!("Fetched {} bars for {}", bars.len(), instrument);
        Ok(bars)
    }

    /// Verify the symbol resolves to a tradable contract
    pub fn resolve_instrument(&mut self, symbol: &str) -> Result<Option<String>> {
        let contract = self.contract_for(symbol);
        let client = self.client()?;

        match client.contract_details(&contract) {
            Ok(details) => {
                if details.is_empty() {
                    warn!("Contract '{}' not found on the terminal", symbol);
                    Ok(None)
                } else {
                    debug!("Resolved {} ({} matches)", symbol, details.len());
                    Ok(Some(symbol.to_string()))
                }
            }
            Err(e) => {
                warn!("Could not verify contract '{}': {}", symbol, e);
                Ok(None)
            }
        }
    }

    /// Submit one bracket: market parent plus stop and limit children.
    /// Children stay untransmitted until the last leg flips the switch, so
    /// the terminal treats the three as one atomic submission.
    pub fn place_market_order(
        &mut self,
        instrument_id: &str,
        side: OrderSide,
        size: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderResult> {
        let contract = self.contract_for(instrument_id);

        let action = match side {
            OrderSide::Buy => Action::Buy,
            OrderSide::Sell => Action::Sell,
        };
        let reverse = match side {
            OrderSide::Buy => Action::Sell,
            OrderSide::Sell => Action::Buy,
        };

        let parent_id = self.next_order_id();
        let mut parent = order_builder::market_order(action, size);
        parent.order_id = parent_id;
        parent.order_ref = comment.to_string();
        parent.transmit = false;

        let stop_id = self.next_order_id();
        let mut stop_order = order_builder::stop(reverse.clone(), size, sl);
        stop_order.order_id = stop_id;
        stop_order.parent_id = parent_id;
        stop_order.transmit = false;

        let profit_id = self.next_order_id();
        let mut profit_order = order_builder::limit_order(reverse, size, tp);
        profit_order.order_id = profit_id;
        profit_order.parent_id = parent_id;
        profit_order.transmit = true;

        info!(
            "Submitting bracket: {} {} {} @ MKT | SL: {:.2} | TP: {:.2}",
            side, size, instrument_id, sl, tp
        );

        let client = self.client()?;
        client.place_order(parent_id, &contract, &parent)?;
        client.place_order(stop_id, &contract, &stop_order)?;
        client.place_order(profit_id, &contract, &profit_order)?;

        Ok(OrderResult {
            success: true,
            code: "SUBMITTED".to_string(),
            order_id: Some(parent_id.to_string()),
            message: format!("bracket submitted ({})", comment),
        })
    }

    /// Local symbols of contracts with an open position
    pub fn open_position_symbols(&mut self) -> Result<HashSet<String>> {
        let client = self.client()?;
        let subscription = client.positions().context("failed to request positions")?;

        let mut symbols = HashSet::new();
        for update in &subscription {
            match update {
                PositionUpdate::Position(position) => {
                    if position.position != 0.0 {
                        symbols.insert(position.contract.local_symbol.clone());
                    }
                }
                PositionUpdate::PositionEnd => {
                    subscription.cancel();
                    break;
                }
            }
        }

        debug!("{} open positions on the terminal", symbols.len());
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_symbol_split() {
        let broker = TerminalBroker::new(TerminalConfig::default());
        let contract = broker.contract_for("NQH6");
        assert_eq!(contract.symbol, "NQ");
        assert_eq!(contract.local_symbol, "NQH6");
        assert_eq!(contract.exchange, "CME");
    }

    #[test]
    fn test_calls_without_session_fail() {
        let mut broker = TerminalBroker::new(TerminalConfig::default());
        assert!(broker.fetch_bars("NQH6", 10).is_err());
        assert!(broker
            .place_market_order("NQH6", OrderSide::Sell, 1.0, 105.0, 98.0, "rf-test")
            .is_err());
    }
}
