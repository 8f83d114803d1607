//! Demo binary: connects the hub, subscribes a handful of channels for one
//! symbol, and logs every event as it arrives.

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use mexrt::app::{HubSettings, LogLevel};
use mexrt::core::hub::{Hub, HubEvent};

#[derive(Parser, Debug)]
#[command(name = "mexrt-demo", about = "Streams BitMEX realtime state to stdout")]
struct Args {
    /// Instrument symbol to subscribe.
    #[arg(long, default_value = "XBTUSD")]
    symbol: String,

    /// Use the production venue instead of testnet.
    #[arg(long)]
    mainnet: bool,
}

fn init_logging() {
    let level = LogLevel::from_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let args = Args::parse();
    let settings = HubSettings {
        is_test: !args.mainnet,
        ..HubSettings::from_env()
    };

    info!(env = settings.env(), symbol = %args.symbol, "mexrt-demo starting");

    tokio::select! {
        result = run(settings, args.symbol) => {
            if let Err(e) = result {
                error!(error = %e, "fatal error");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    info!("mexrt-demo stopped");
}

async fn run(settings: HubSettings, symbol: String) -> mexrt::Result<()> {
    let mut hub = Hub::new(settings);
    hub.connect()?;

    hub.subscribe("orderBookL2", Some(&symbol))?;
    hub.subscribe("trade", Some(&symbol))?;
    if hub.env() != "mainnet" {
        hub.subscribe("wallet", None)?;
        hub.subscribe("position", None)?;
        hub.subscribe("order", None)?;
    }

    while let Some(event) = hub.next_event().await {
        match event {
            Ok(HubEvent::Open) => info!("connected"),
            Ok(HubEvent::Close { code, reason }) => warn!(code, %reason, "disconnected"),
            Ok(HubEvent::Authed { ts }) => info!(ts, "authenticated"),
            Ok(HubEvent::AuthError(message)) => warn!(%message, "auth error"),
            Ok(HubEvent::OrderBookChanged { symbol, changed }) => {
                if let Some(quote) = hub.resolve_instrument(&symbol) {
                    let book = quote.book.lock();
                    info!(
                        symbol,
                        bid = ?book.best_bid(),
                        ask = ?book.best_ask(),
                        changed_bids = changed.bids,
                        changed_asks = changed.asks,
                        "book updated"
                    );
                }
            }
            Ok(HubEvent::TradesChanged { symbol, added }) => info!(symbol, added, "trades"),
            Ok(HubEvent::WalletChanged { account, diff }) => {
                info!(account, currencies = ?diff.changed_currencies, reason = diff.reason.as_str(), "wallet updated");
            }
            Ok(HubEvent::PositionChanged { diff }) => info!(?diff, "position updated"),
            Ok(HubEvent::OrderChanged { handle }) => info!(?handle, "order updated"),
            Err(e) => error!(error = %e, "hub error"),
        }
    }

    Ok(())
}
