//! Trade Ledger
//!
//! Durable idempotency guard keyed by (instrument, trade day). The loop
//! checks it before every execution attempt and records immediately after a
//! broker-confirmed placement, so a process restart cannot double-trade a
//! day. Storage is an append-only CSV file; entries are never removed or
//! updated.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One executed-or-attempted marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub instrument: String,
    pub trade_day: NaiveDate,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only ledger backed by a CSV file
pub struct TradeLedger {
    path: PathBuf,
    seen: HashSet<(String, NaiveDate)>,
}

impl TradeLedger {
    /// Open (or create) the ledger file and load existing entries
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create ledger dir {}", parent.display()))?;
            }
        }

        let mut seen = HashSet::new();
        if path.exists() {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("failed to open ledger {}", path.display()))?;
            for record in reader.deserialize() {
                let entry: LedgerEntry = record
                    .with_context(|| format!("corrupt ledger row in {}", path.display()))?;
                seen.insert((entry.instrument, entry.trade_day));
            }
        }

        debug!(entries = seen.len(), path = %path.display(), "ledger loaded");
        Ok(Self {
            path: path.to_path_buf(),
            seen,
        })
    }

    /// Has this (instrument, trade day) already been attempted?
    pub fn already_attempted(&self, instrument: &str, trade_day: NaiveDate) -> bool {
        self.seen.contains(&(instrument.to_string(), trade_day))
    }

    /// Durably record an attempt. At most one row is ever written per
    /// (instrument, trade day); a repeat call is a no-op.
    pub fn record_attempt(&mut self, instrument: &str, trade_day: NaiveDate) -> Result<()> {
        let key = (instrument.to_string(), trade_day);
        if self.seen.contains(&key) {
            return Ok(());
        }

        let write_header = !self.path.exists()
            || std::fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open ledger {} for append", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer.serialize(LedgerEntry {
            instrument: instrument.to_string(),
            trade_day,
            recorded_at: Utc::now(),
        })?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("failed to unwrap ledger writer: {e}"))?
            .sync_all()
            .context("failed to fsync ledger")?;

        self.seen.insert(key);
        Ok(())
    }

    /// Number of recorded entries
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
