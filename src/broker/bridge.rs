//! File-Drop Bridge Adapter
//!
//! Talks to an external gateway process through a shared directory instead
//! of a socket. The gateway keeps `{instrument}_bars.csv` files current and
//! maintains `positions.json`; we drop `order_{tag}.json` command files and
//! poll for the matching `order_{tag}.result.json`. Command files are
//! written to a temp name and renamed so the gateway never reads a partial
//! file.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{OrderResult, OrderSide};
use crate::bars::{normalize_series, Bar};

/// Bridge directory settings
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory shared with the gateway process
    pub dir: PathBuf,
    /// How long to wait for an order result file
    pub result_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            result_timeout: Duration::from_secs(30),
        }
    }
}

/// One row of a gateway bar CSV
#[derive(Debug, Deserialize)]
struct BarRow {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

/// Order command dropped for the gateway
#[derive(Debug, Serialize)]
struct OrderCommand<'a> {
    tag: &'a str,
    instrument: &'a str,
    side: OrderSide,
    size: f64,
    sl: f64,
    tp: f64,
}

/// Read a gateway bar CSV into a normalized series
pub fn read_bar_csv(path: &Path, instrument: &str) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open bar file {}", path.display()))?;

    let mut bars = Vec::new();
    for record in reader.deserialize() {
        let row: BarRow =
            record.with_context(|| format!("corrupt bar row in {}", path.display()))?;
        bars.push(Bar {
            instrument: instrument.to_string(),
            timestamp: row.timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }

    Ok(normalize_series(bars))
}

/// Broker adapter over a shared drop directory
pub struct BridgeBroker {
    config: BridgeConfig,
}

impl BridgeBroker {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    fn bars_path(&self, instrument: &str) -> PathBuf {
        self.config.dir.join(format!("{}_bars.csv", instrument))
    }

    /// Verify the drop directory exists
    pub fn authenticate(&mut self) -> Result<()> {
        if !self.config.dir.is_dir() {
            bail!(
                "bridge directory {} does not exist - is the gateway running?",
                self.config.dir.display()
            );
        }
        info!("Bridge directory {} ready", self.config.dir.display());
        Ok(())
    }

    pub fn fetch_bars(&mut self, instrument: &str, lookback: usize) -> Result<Vec<Bar>> {
        let path = self.bars_path(instrument);
        if !path.exists() {
            bail!("gateway has not published bars for {}", instrument);
        }

        let mut bars = read_bar_csv(&path, instrument)?;
        if bars.len() > lookback {
            bars.drain(..bars.len() - lookback);
        }

        debug!("Read {} bars for {} from bridge", bars.len(), instrument);
        Ok(bars)
    }

    /// An instrument is known if the gateway publishes bars for it
    pub fn resolve_instrument(&mut self, symbol: &str) -> Result<Option<String>> {
        if self.bars_path(symbol).exists() {
            Ok(Some(symbol.to_string()))
        } else {
            Ok(None)
        }
    }

    /// Drop an order command and wait for the gateway's result file.
    /// The order tag in `comment` keys both filenames.
    pub async fn place_market_order(
        &mut self,
        instrument_id: &str,
        side: OrderSide,
        size: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderResult> {
        let command = OrderCommand {
            tag: comment,
            instrument: instrument_id,
            side,
            size,
            sl,
            tp,
        };

        let final_path = self.config.dir.join(format!("order_{}.json", comment));
        let tmp_path = self.config.dir.join(format!("order_{}.json.tmp", comment));
        let body = serde_json::to_vec_pretty(&command)?;
        std::fs::write(&tmp_path, body)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("failed to publish {}", final_path.display()))?;

        info!(
            "Dropped order {} ({} {} {} | SL: {:.2} | TP: {:.2})",
            comment, side, size, instrument_id, sl, tp
        );

        let result_path = self
            .config
            .dir
            .join(format!("order_{}.result.json", comment));
        let deadline = tokio::time::Instant::now() + self.config.result_timeout;

        loop {
            if result_path.exists() {
                let raw = std::fs::read_to_string(&result_path)
                    .with_context(|| format!("failed to read {}", result_path.display()))?;
                let result: OrderResult = serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt result file {}", result_path.display()))?;
                return Ok(result);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "gateway did not answer order {} within {:?}",
                    comment,
                    self.config.result_timeout
                ));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Symbols listed in the gateway's positions file; absent file means no
    /// open positions
    pub fn open_position_symbols(&mut self) -> Result<HashSet<String>> {
        let path = self.config.dir.join("positions.json");
        if !path.exists() {
            return Ok(HashSet::new());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let symbols: HashSet<String> = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt positions file {}", path.display()))?;
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_bridge_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rangefade-bridge-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_fetch_bars_reads_and_trims_csv() {
        let dir = temp_bridge_dir();
        std::fs::write(
            dir.join("GER40_bars.csv"),
            "timestamp,open,high,low,close,volume\n\
             2025-03-03T07:00:00Z,100.0,101.0,99.0,100.5,10\n\
             2025-03-03T07:05:00Z,100.5,102.0,100.0,101.5,12\n\
             2025-03-03T07:10:00Z,101.5,103.0,101.0,102.5,8\n",
        )
        .unwrap();

        let mut broker = BridgeBroker::new(BridgeConfig::new(dir.clone()));
        broker.authenticate().unwrap();

        let bars = broker.fetch_bars("GER40", 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 101.5);
        assert_eq!(bars[1].instrument, "GER40");

        assert_eq!(broker.resolve_instrument("GER40").unwrap().as_deref(), Some("GER40"));
        assert!(broker.resolve_instrument("US500").unwrap().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_order_roundtrip_via_result_file() {
        let dir = temp_bridge_dir();
        std::fs::write(
            dir.join("order_rf-test.result.json"),
            r#"{"success": true, "code": "OK", "order_id": "g-1", "message": "filled"}"#,
        )
        .unwrap();

        let mut broker = BridgeBroker::new(BridgeConfig::new(dir.clone()));
        let res = broker
            .place_market_order("GER40", OrderSide::Sell, 1.0, 105.0, 98.0, "rf-test")
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.order_id.as_deref(), Some("g-1"));

        // the command file made it to its final name
        assert!(dir.join("order_rf-test.json").exists());
        assert!(!dir.join("order_rf-test.json.tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_result_times_out_as_error() {
        let dir = temp_bridge_dir();
        let mut config = BridgeConfig::new(dir.clone());
        config.result_timeout = Duration::from_millis(50);

        let mut broker = BridgeBroker::new(config);
        let res = broker
            .place_market_order("GER40", OrderSide::Buy, 1.0, 98.0, 105.0, "rf-gone")
            .await;
        assert!(res.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_absent_positions_file_is_empty() {
        let dir = temp_bridge_dir();
        let mut broker = BridgeBroker::new(BridgeConfig::new(dir.clone()));
        assert!(broker.open_position_symbols().unwrap().is_empty());

        std::fs::write(dir.join("positions.json"), r#"["GER40"]"#).unwrap();
        let open = broker.open_position_symbols().unwrap();
        assert!(open.contains("GER40"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
