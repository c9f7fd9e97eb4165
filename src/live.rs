//! Live Execution Loop
//!
//! Poll, score, execute. Every tick re-derives session ranges and setups
//! from freshly fetched bars, scores them, and routes retained signals for
//! the most recent trade day to the broker. Two guards keep the loop
//! idempotent across restarts: the durable trade ledger and the broker's
//! own open-position list. A failure on one instrument never stops the
//! others.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bars::normalize_series;
use crate::broker::{order_tag, Broker, OrderSide};
use crate::ledger::TradeLedger;
use crate::model::{ScoreMode, Signal, SignalScorer};
use crate::strategy::{compute_day_ranges, detect_setups};

/// Run-time knobs for the loop, assembled from the CLI
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub instruments: Vec<String>,
    pub mode: ScoreMode,
    pub threshold_override: Option<f64>,
    pub poll_interval: Duration,
    pub order_size: f64,
    pub lookback_bars: usize,
    /// Score and report but never touch the broker's order endpoint
    pub dry_run: bool,
    /// Run exactly one tick, then exit
    pub single_shot: bool,
    /// Where dry runs write the scored signals as JSON
    pub signals_out: Option<PathBuf>,
}

/// What one tick did, for logs and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub setups_detected: usize,
    pub signals_retained: usize,
    pub orders_placed: usize,
    pub skipped_ledger: usize,
    pub skipped_open_position: usize,
}

/// Resolve all configured instruments up front. Unknown symbols are logged
/// and dropped; an empty result is fatal.
pub async fn resolve_instruments(
    config: &LoopConfig,
    broker: &mut Broker,
) -> Result<HashMap<String, String>> {
    let mut resolved = HashMap::new();
    for symbol in &config.instruments {
        match broker.resolve_instrument(symbol).await? {
            Some(id) => {
                info!("Resolved {} -> {}", symbol, id);
                resolved.insert(symbol.clone(), id);
            }
            None => warn!("Instrument '{}' unknown to the {} broker, skipping", symbol, broker.name()),
        }
    }
    if resolved.is_empty() {
        bail!("none of the configured instruments resolved");
    }
    Ok(resolved)
}

/// One full poll-score-execute pass over all resolved instruments
pub async fn run_tick(
    config: &LoopConfig,
    scorer: &SignalScorer,
    ledger: &mut TradeLedger,
    broker: &mut Broker,
    resolved: &HashMap<String, String>,
) -> Result<TickReport> {
    let mut report = TickReport::default();
    let mut scored: Vec<Signal> = Vec::new();

    // Fixed iteration order so identical inputs yield identical output,
    // signal files included
    let mut symbols: Vec<&String> = resolved.keys().collect();
    symbols.sort();

    for symbol in symbols {
        match score_instrument(config, scorer, broker, symbol).await {
            Ok(signals) => {
                report.setups_detected += signals.len();
                scored.extend(signals);
            }
            Err(e) => {
                // One bad feed must not poison the rest of the tick
                warn!("Skipping {} this tick: {:#}", symbol, e);
            }
        }
    }

    let candidates: Vec<&Signal> = scored.iter().filter(|s| s.retained).collect();
    report.signals_retained = candidates.len();

    if config.dry_run {
        info!(
            "[dry-run] {} setups, {} retained, no orders sent",
            report.setups_detected, report.signals_retained
        );
        if let Some(path) = &config.signals_out {
            let body = serde_json::to_string_pretty(&scored)?;
            std::fs::write(path, body)?;
            info!("[dry-run] wrote {} signals to {}", scored.len(), path.display());
        }
        return Ok(report);
    }

    if candidates.is_empty() {
        debug!("Tick complete: nothing to execute");
        return Ok(report);
    }

    // Second idempotency guard: what the broker already holds. If we cannot
    // ask, we do not trade this tick.
    let open = match broker.open_position_symbols().await {
        Ok(open) => open,
        Err(e) => {
            warn!("Open-position query failed, holding fire this tick: {:#}", e);
            return Ok(report);
        }
    };

    for signal in candidates {
        let setup = &signal.setup;

        if ledger.already_attempted(&setup.instrument, setup.trade_day) {
            debug!(
                "{} {} already in the ledger, skipping",
                setup.instrument, setup.trade_day
            );
            report.skipped_ledger += 1;
            continue;
        }

        let Some(instrument_id) = resolved.get(&setup.instrument) else {
            continue;
        };
        if open.contains(instrument_id) || open.contains(&setup.instrument) {
            info!(
                "{} already has an open position, skipping",
                setup.instrument
            );
            report.skipped_open_position += 1;
            continue;
        }

        let side = OrderSide::from_entry_side(setup.entry_side);
        let tag = order_tag();
        info!(
            "Executing {} {} {} | p={:.3} | SL: {:.2} | TP: {:.2} | tag: {}",
            side, config.order_size, setup.instrument, signal.probability, setup.sl, setup.tp, tag
        );

        // A dropped connection here is transient: skip this signal, leave
        // the ledger untouched and let the next tick retry.
        let result = match broker
            .place_market_order(
                instrument_id,
                side,
                config.order_size,
                setup.sl,
                setup.tp,
                &tag,
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "Order transport failed for {} {}, retrying next tick: {:#}",
                    setup.instrument, setup.trade_day, e
                );
                continue;
            }
        };

        if result.success {
            // Record before anything else can happen to this process
            ledger.record_attempt(&setup.instrument, setup.trade_day)?;
            report.orders_placed += 1;
            info!(
                "Order confirmed for {} {} (id: {})",
                setup.instrument,
                setup.trade_day,
                result.order_id.as_deref().unwrap_or("-")
            );
        } else {
            warn!(
                "Broker rejected {} {}: {} ({})",
                setup.instrument, setup.trade_day, result.code, result.message
            );
        }
    }

    Ok(report)
}

/// Fetch, detect and score one instrument. Only setups for the most recent
/// trade day are candidates; older days are history, not orders.
async fn score_instrument(
    config: &LoopConfig,
    scorer: &SignalScorer,
    broker: &mut Broker,
    symbol: &str,
) -> Result<Vec<Signal>> {
    let raw = broker.fetch_bars(symbol, config.lookback_bars).await?;
    let bars = normalize_series(raw);
    if bars.is_empty() {
        debug!("{}: no bars", symbol);
        return Ok(Vec::new());
    }

    let ranges = compute_day_ranges(&bars);
    let mut setups = detect_setups(&bars, &ranges, scorer.feature_cols())?;

    if let Some(latest) = setups.iter().map(|s| s.trade_day).max() {
        setups.retain(|s| s.trade_day == latest);
    }

    debug!("{}: {} candidate setup(s)", symbol, setups.len());
    scorer.score(&setups, config.mode, config.threshold_override)
}

/// Authenticate, resolve instruments and tick until stopped
pub async fn run_loop(
    config: LoopConfig,
    scorer: SignalScorer,
    mut ledger: TradeLedger,
    mut broker: Broker,
) -> Result<()> {
    broker.authenticate().await?;
    let resolved = resolve_instruments(&config, &mut broker).await?;

    info!(
        "Loop starting: {} instrument(s), mode={}, broker={}, interval={:?}{}",
        resolved.len(),
        config.mode,
        broker.name(),
        config.poll_interval,
        if config.dry_run { " [dry-run]" } else { "" }
    );

    let mut interval = tokio::time::interval(config.poll_interval);
    loop {
        interval.tick().await;

        match run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved).await {
            Ok(report) => debug!(
                "Tick: {} setups, {} retained, {} placed",
                report.setups_detected, report.signals_retained, report.orders_placed
            ),
            Err(e) => {
                if config.single_shot {
                    return Err(e);
                }
                warn!("Tick failed, retrying next interval: {:#}", e);
            }
        }

        if config.single_shot || config.dry_run {
            info!("Single pass complete, exiting");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::{Bar, BAR_MINUTES};
    use crate::broker::SimBroker;
    use crate::model::{FilterFlags, ModelArtifact, ProbabilityModel};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use uuid::Uuid;

    struct ConstModel(f64);

    impl ProbabilityModel for ConstModel {
        fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
            Ok(vec![self.0; rows.len()])
        }
    }

    fn scorer(prob: f64) -> SignalScorer {
        let artifact = ModelArtifact {
            version: "test".to_string(),
            feature_cols: vec!["rr_clip".to_string(), "sweep_side".to_string()],
            thr_default: 0.5,
            filters: FilterFlags {
                block_ny_ny: false,
                min_rr_clip: 0.0,
            },
        };
        SignalScorer::new(artifact, Box::new(ConstModel(prob))).unwrap()
    }

    /// Flat Asia session then a clean high-sweep and break on March 3rd
    fn sweep_day_bars_for(instrument: &str) -> Vec<Bar> {
        let session_open = Utc.with_ymd_and_hms(2025, 3, 2, 21, 0, 0).unwrap();
        let mut bars: Vec<Bar> = (0..120)
            .map(|i| Bar {
                instrument: instrument.to_string(),
                timestamp: session_open + ChronoDuration::minutes(i * BAR_MINUTES),
                open: 100.0,
                high: 102.0,
                low: 98.0,
                close: 100.0,
                volume: 50,
            })
            .collect();

        let window_open = Utc.with_ymd_and_hms(2025, 3, 3, 7, 0, 0).unwrap();
        for (i, (o, h, l, c)) in [
            (100.0, 101.0, 99.5, 100.5),
            (100.5, 105.0, 100.0, 103.0), // sweep
            (103.0, 103.5, 100.5, 101.0), // break
        ]
        .into_iter()
        .enumerate()
        {
            bars.push(Bar {
                instrument: instrument.to_string(),
                timestamp: window_open + ChronoDuration::minutes(i as i64 * BAR_MINUTES),
                open: o,
                high: h,
                low: l,
                close: c,
                volume: 50,
            });
        }
        bars
    }

    fn sweep_day_bars() -> Vec<Bar> {
        sweep_day_bars_for("GER40")
    }

    fn config(dry_run: bool) -> LoopConfig {
        LoopConfig {
            instruments: vec!["GER40".to_string()],
            mode: ScoreMode::Lenient,
            threshold_override: None,
            poll_interval: Duration::from_millis(10),
            order_size: 1.0,
            lookback_bars: 500,
            dry_run,
            single_shot: true,
            signals_out: None,
        }
    }

    fn ledger() -> TradeLedger {
        let path =
            std::env::temp_dir().join(format!("rangefade-live-{}.csv", Uuid::new_v4()));
        TradeLedger::open(&path).unwrap()
    }

    fn sim_broker() -> Broker {
        let mut sim = SimBroker::new();
        sim.load_bars("GER40", sweep_day_bars());
        Broker::Sim(sim)
    }

    fn resolved() -> HashMap<String, String> {
        HashMap::from([("GER40".to_string(), "GER40".to_string())])
    }

    #[tokio::test]
    async fn test_second_tick_places_nothing() {
        let config = config(false);
        let scorer = scorer(0.9);
        let mut ledger = ledger();
        let mut broker = sim_broker();
        let resolved = resolved();

        let first = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved)
            .await
            .unwrap();
        assert_eq!(first.orders_placed, 1);

        let second = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved)
            .await
            .unwrap();
        assert_eq!(second.orders_placed, 0);
        // blocked by the ledger before the open-position guard is consulted
        assert_eq!(second.skipped_ledger, 1);

        if let Broker::Sim(sim) = &broker {
            assert_eq!(sim.placed.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_rejected_order_not_recorded() {
        let config = config(false);
        let scorer = scorer(0.9);
        let mut ledger = ledger();
        let mut sim = SimBroker::new();
        sim.load_bars("GER40", sweep_day_bars());
        sim.reject_orders_with("INSUFFICIENT_FUNDS");
        let mut broker = Broker::Sim(sim);

        let report = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved())
            .await
            .unwrap();
        assert_eq!(report.orders_placed, 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_open_position_blocks_execution() {
        let config = config(false);
        let scorer = scorer(0.9);
        let mut ledger = ledger();
        let mut sim = SimBroker::new();
        sim.load_bars("GER40", sweep_day_bars());
        sim.set_open_position("GER40");
        let mut broker = Broker::Sim(sim);

        let report = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved())
            .await
            .unwrap();
        assert_eq!(report.skipped_open_position, 1);
        assert_eq!(report.orders_placed, 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_position_query_failure_holds_fire() {
        let config = config(false);
        let scorer = scorer(0.9);
        let mut ledger = ledger();
        let mut sim = SimBroker::new();
        sim.load_bars("GER40", sweep_day_bars());
        sim.fail_position_queries();
        let mut broker = Broker::Sim(sim);

        let report = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved())
            .await
            .unwrap();
        assert_eq!(report.signals_retained, 1);
        assert_eq!(report.orders_placed, 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing_but_writes_signals() {
        let out = std::env::temp_dir()
            .join(format!("rangefade-signals-{}.json", Uuid::new_v4()));
        let mut config = config(true);
        config.signals_out = Some(out.clone());

        let scorer = scorer(0.9);
        let mut ledger = ledger();
        let mut broker = sim_broker();

        let report = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved())
            .await
            .unwrap();
        assert_eq!(report.signals_retained, 1);
        assert_eq!(report.orders_placed, 0);
        assert!(ledger.is_empty());
        if let Broker::Sim(sim) = &broker {
            assert!(sim.placed.is_empty());
        }

        let raw = std::fs::read_to_string(&out).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);

        std::fs::remove_file(&out).ok();
    }

    #[tokio::test]
    async fn test_below_threshold_signal_is_not_executed() {
        let config = config(false);
        let scorer = scorer(0.2); // under thr_default 0.5
        let mut ledger = ledger();
        let mut broker = sim_broker();

        let report = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved())
            .await
            .unwrap();
        assert_eq!(report.setups_detected, 1);
        assert_eq!(report.signals_retained, 0);
        assert_eq!(report.orders_placed, 0);
    }

    #[tokio::test]
    async fn test_order_transport_failure_spares_other_instruments() {
        let mut config = config(false);
        config.instruments = vec!["GER40".to_string(), "US500".to_string()];
        let scorer = scorer(0.9);
        let mut ledger = ledger();

        let mut sim = SimBroker::new();
        sim.load_bars("GER40", sweep_day_bars_for("GER40"));
        sim.load_bars("US500", sweep_day_bars_for("US500"));
        sim.fail_order_transport("GER40");
        let mut broker = Broker::Sim(sim);

        let resolved = HashMap::from([
            ("GER40".to_string(), "GER40".to_string()),
            ("US500".to_string(), "US500".to_string()),
        ]);

        let report = run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved)
            .await
            .unwrap();
        assert_eq!(report.signals_retained, 2);
        assert_eq!(report.orders_placed, 1);

        if let Broker::Sim(sim) = &broker {
            assert_eq!(sim.placed.len(), 1);
            assert_eq!(sim.placed[0].instrument, "US500");
        }

        // the failed instrument stays unrecorded so the next tick retries it
        let day = chrono::NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        assert!(!ledger.already_attempted("GER40", day));
        assert!(ledger.already_attempted("US500", day));
    }

    #[tokio::test]
    async fn test_dry_run_signal_order_is_stable() {
        let out = std::env::temp_dir()
            .join(format!("rangefade-signals-{}.json", Uuid::new_v4()));
        let mut config = config(true);
        config.instruments = vec!["US500".to_string(), "GER40".to_string()];
        config.signals_out = Some(out.clone());

        let scorer = scorer(0.9);
        let mut ledger = ledger();
        let mut sim = SimBroker::new();
        sim.load_bars("GER40", sweep_day_bars_for("GER40"));
        sim.load_bars("US500", sweep_day_bars_for("US500"));
        let mut broker = Broker::Sim(sim);

        let resolved = HashMap::from([
            ("GER40".to_string(), "GER40".to_string()),
            ("US500".to_string(), "US500".to_string()),
        ]);

        run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved)
            .await
            .unwrap();
        let first = std::fs::read_to_string(&out).unwrap();

        run_tick(&config, &scorer, &mut ledger, &mut broker, &resolved)
            .await
            .unwrap();
        let second = std::fs::read_to_string(&out).unwrap();

        // identical inputs, byte-identical file, symbols in sorted order
        assert_eq!(first, second);
        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        let order: Vec<&str> = parsed
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["setup"]["instrument"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["GER40", "US500"]);

        std::fs::remove_file(&out).ok();
    }

    #[tokio::test]
    async fn test_single_shot_loop_runs_once_and_exits() {
        let config = config(false);
        run_loop(config, scorer(0.9), ledger(), sim_broker())
            .await
            .unwrap();
    }
}
