use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chart_signal_trader::capture::DirectoryFrameSource;
use chart_signal_trader::execution::{
    load_rows, BrokerGateway, ExecutionMode, IbConfig, IbGateway, LedgerSummary, LifecycleManager, PriceCache,
    SimulatedGateway, TradeLedger, TradingConfig,
};
use chart_signal_trader::monitor::{Monitor, DEFAULT_MAX_WORKERS};
use chart_signal_trader::session::{MarketSession, SystemClock};
use chart_signal_trader::vision::{ChartAnalyzer, ScanConfig, DEFAULT_LINE_SPAN};

#[derive(Parser, Debug)]
#[command(name = "chart-signal-trader")]
#[command(about = "Chart-screenshot signal extraction and automated IB equities execution")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse one chart screenshot and print the signals as JSON
    Analyze {
        #[arg(short, long)]
        image: PathBuf,

        /// Pixels each side of a Zigzag hit that must share its color
        #[arg(long, default_value_t = DEFAULT_LINE_SPAN)]
        line_span: u32,
    },

    /// Run the capture / trade loop until ctrl-c
    Run {
        #[arg(long, value_enum, default_value_t = ExecutionMode::Simulation, env = "TRADING_MODE")]
        mode: ExecutionMode,

        #[arg(long, default_value = "127.0.0.1", env = "IB_HOST")]
        ib_host: String,

        /// Defaults to 4002 for paper, 4001 for live
        #[arg(long, env = "IB_PORT")]
        ib_port: Option<u16>,

        #[arg(long, default_value_t = 1, env = "IB_CLIENT_ID")]
        ib_client_id: i32,

        /// Symbols to trade (comma-separated)
        #[arg(short, long, env = "SYMBOLS", value_delimiter = ',', required = true)]
        symbols: Vec<String>,

        /// Directory the capturer drops chart screenshots into
        #[arg(long, default_value = "frames", env = "FRAMES_DIR")]
        frames_dir: PathBuf,

        #[arg(long, default_value_t = 4000.0, env = "INITIAL_CAPITAL")]
        capital: f64,

        #[arg(long, default_value = "trading_records.csv", env = "LEDGER_PATH")]
        ledger: PathBuf,

        #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
        workers: usize,

        #[arg(long, default_value_t = DEFAULT_LINE_SPAN)]
        line_span: u32,

        /// Simulation only: starting prices, e.g. AAPL=190.5,TSLA=250
        #[arg(long, value_delimiter = ',', value_parser = parse_seed_price)]
        seed_prices: Vec<(String, f64)>,
    },

    /// Summarise a trade ledger
    Report {
        #[arg(short, long, default_value = "trading_records.csv", env = "LEDGER_PATH")]
        ledger: PathBuf,
    },
}

fn parse_seed_price(s: &str) -> Result<(String, f64), String> {
    let (symbol, price) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=PRICE, got '{}'", s))?;
    let price: f64 = price
        .trim()
        .parse()
        .map_err(|e| format!("bad price in '{}': {}", s, e))?;
    Ok((symbol.trim().to_uppercase(), price))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chart_signal_trader=info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Analyze { image, line_span } => {
            let analyzer = ChartAnalyzer::new(ScanConfig::default().with_line_span(line_span));
            let analysis = analyzer.analyze_file(&image)?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Run {
            mode,
            ib_host,
            ib_port,
            ib_client_id,
            symbols,
            frames_dir,
            capital,
            ledger,
            workers,
            line_span,
            seed_prices,
        } => {
            let config = TradingConfig {
                mode,
                initial_capital: capital,
                ledger_path: ledger,
                ..Default::default()
            };
            let symbols: Vec<String> = symbols
                .iter()
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                bail!("no symbols to trade");
            }

            info!("═══════════════════════════════════════════════════════════");
            info!("  Mode: {} | Symbols: {} | Capital: ${:.2}", mode, symbols.join(","), capital);
            info!("  Frames: {} | Ledger: {}", frames_dir.display(), config.ledger_path.display());
            info!("═══════════════════════════════════════════════════════════");

            let prices = PriceCache::new();
            let gateway: Arc<dyn BrokerGateway> = match mode {
                ExecutionMode::Simulation => {
                    let sim = SimulatedGateway::new(prices);
                    for (symbol, price) in &seed_prices {
                        sim.set_price(symbol, *price);
                    }
                    Arc::new(sim)
                }
                ExecutionMode::Paper | ExecutionMode::Live => {
                    let mut ib = IbConfig::for_mode(mode);
                    ib.host = ib_host;
                    ib.client_id = ib_client_id;
                    if let Some(port) = ib_port {
                        ib.port = port;
                    }
                    Arc::new(IbGateway::connect(ib, prices, config.clone()).await?)
                }
            };

            let trade_ledger = TradeLedger::open(&config.ledger_path)?;
            let clock = Arc::new(SystemClock);
            let manager = Arc::new(LifecycleManager::new(
                config,
                gateway,
                trade_ledger,
                MarketSession::default(),
                clock.clone(),
                symbols,
            ));
            let monitor = Monitor::new(
                manager,
                ChartAnalyzer::new(ScanConfig::default().with_line_span(line_span)),
                Arc::new(DirectoryFrameSource::new(frames_dir)),
                clock,
                workers,
            );
            monitor.run().await?;
        }
        Commands::Report { ledger } => {
            let rows = load_rows(&ledger).with_context(|| format!("Failed to read ledger {}", ledger.display()))?;
            println!("{}", LedgerSummary::from_rows(&rows));
        }
    }

    Ok(())
}
