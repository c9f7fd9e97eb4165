use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use rangefade::broker::{
    bridge::{read_bar_csv, BridgeConfig},
    rest::RestBroker,
    terminal::TerminalConfig,
    BridgeBroker, Broker, SimBroker, TerminalBroker,
};
use rangefade::ledger::TradeLedger;
use rangefade::live::{run_loop, LoopConfig};
use rangefade::model::{GbdtModel, ModelArtifact, ScoreMode, SignalScorer};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Lenient,
    Strict,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BrokerArg {
    Terminal,
    Rest,
    Bridge,
    Sim,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Session range sweep fade: detect, score, execute")]
struct Args {
    /// Instruments to trade (comma-separated)
    #[arg(short, long, env = "RANGEFADE_INSTRUMENTS", default_value = "GER40")]
    instruments: String,

    /// Scoring mode
    #[arg(long, value_enum, default_value_t = ModeArg::Lenient)]
    mode: ModeArg,

    /// Decision threshold override (defaults to the model's stored threshold)
    #[arg(long)]
    threshold: Option<f64>,

    /// Poll interval in seconds
    #[arg(long, default_value = "60")]
    interval: u64,

    /// Order size per signal
    #[arg(long, default_value = "1.0")]
    size: f64,

    /// Bars fetched per instrument per tick
    #[arg(long, default_value = "600")]
    lookback: usize,

    /// Score and report but never send orders; exits after one pass
    #[arg(long)]
    dry_run: bool,

    /// Run exactly one tick, then exit
    #[arg(long)]
    single_shot: bool,

    /// Broker transport
    #[arg(long, value_enum, default_value_t = BrokerArg::Terminal)]
    broker: BrokerArg,

    /// Model metadata JSON
    #[arg(long, default_value = "model/meta.json")]
    meta: PathBuf,

    /// Trained classifier dump
    #[arg(long, default_value = "model/classifier.txt")]
    model: PathBuf,

    /// Trade ledger CSV
    #[arg(long, default_value = "state/ledger.csv")]
    ledger: PathBuf,

    /// Where dry runs write scored signals as JSON
    #[arg(long)]
    signals_out: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Terminal host
    #[arg(long, default_value = "127.0.0.1")]
    ib_host: String,

    /// Terminal port (paper: 7497, live: 7496)
    #[arg(long, default_value = "7497")]
    ib_port: u16,

    /// Terminal client id
    #[arg(long, default_value = "1")]
    ib_client_id: i32,

    /// Exchange for terminal futures contracts
    #[arg(long, default_value = "CME")]
    ib_exchange: String,

    /// Drop directory shared with the bridge gateway; also where the sim
    /// broker replays `{instrument}_bars.csv` files from
    #[arg(long, default_value = "bridge")]
    bridge_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("rangefade={default_level}").parse()?),
        )
        .init();

    let instruments: Vec<String> = args
        .instruments
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    info!("Starting rangefade");
    info!("Instruments: {}", instruments.join(", "));
    info!("Model: {} + {}", args.meta.display(), args.model.display());

    let artifact = ModelArtifact::load(&args.meta)?;
    info!(
        "Loaded model '{}' ({} features, thr {:.3})",
        artifact.version,
        artifact.feature_cols.len(),
        artifact.thr_default
    );
    let classifier = GbdtModel::load(&args.model)?;
    let scorer = SignalScorer::new(artifact, Box::new(classifier))?;

    let ledger = TradeLedger::open(&args.ledger)?;
    info!("Ledger {} ({} entries)", args.ledger.display(), ledger.len());

    let broker = match args.broker {
        BrokerArg::Terminal => Broker::Terminal(TerminalBroker::new(TerminalConfig {
            host: args.ib_host.clone(),
            port: args.ib_port,
            client_id: args.ib_client_id,
            exchange: args.ib_exchange.clone(),
        })),
        BrokerArg::Rest => Broker::Rest(RestBroker::from_env()?),
        BrokerArg::Bridge => {
            Broker::Bridge(BridgeBroker::new(BridgeConfig::new(args.bridge_dir.clone())))
        }
        BrokerArg::Sim => {
            // Offline replay: serve the bridge-format CSVs from disk
            let mut sim = SimBroker::new();
            for symbol in &instruments {
                let path = args.bridge_dir.join(format!("{symbol}_bars.csv"));
                if path.exists() {
                    sim.load_bars(symbol, read_bar_csv(&path, symbol)?);
                }
            }
            Broker::Sim(sim)
        }
    };

    let config = LoopConfig {
        instruments,
        mode: match args.mode {
            ModeArg::Lenient => ScoreMode::Lenient,
            ModeArg::Strict => ScoreMode::Strict,
        },
        threshold_override: args.threshold,
        poll_interval: Duration::from_secs(args.interval),
        order_size: args.size,
        lookback_bars: args.lookback,
        dry_run: args.dry_run,
        single_shot: args.single_shot,
        signals_out: args.signals_out,
    };

    run_loop(config, scorer, ledger, broker).await
}
