mod cache;
mod config;
mod event;
mod filter;
mod msg;
mod relay;
mod router;
mod server;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use config::Settings;
use relay::Relay;
use server::App;

/// Connections still open this long after the shutdown signal are cut off.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "memrelay",
    author,
    version,
    about = "Bounded in-memory Nostr relay"
)]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,
    /// Number of events kept in the in-memory history.
    #[arg(long, default_value_t = 10_000)]
    cache_capacity: usize,
    /// Maximum client frame size in bytes; larger frames close the connection.
    #[arg(long, default_value_t = 1_048_576)]
    max_msg_bytes: usize,
    /// Maximum number of filters accepted in one REQ.
    #[arg(long, default_value_t = 50)]
    max_filters: usize,
    /// Maximum concurrent subscriptions per connection.
    #[arg(long, default_value_t = 32)]
    max_subs: usize,
    /// JSON array of filters; events matching none are broadcast but not cached.
    #[arg(long)]
    admission_filter: Option<String>,
    /// Reject events whose created_at is older than this many seconds.
    #[arg(long)]
    max_event_age: Option<u64>,
    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let addr: SocketAddr = self.addr.parse().context("parsing listen address")?;
        let admission = match &self.admission_filter {
            Some(raw) => Some(config::parse_admission(raw)?),
            None => None,
        };
        Ok(Settings {
            addr,
            cache_capacity: self.cache_capacity,
            max_msg_bytes: self.max_msg_bytes,
            max_filters_per_req: self.max_filters,
            max_subs_per_conn: self.max_subs,
            admission,
            max_event_age: self.max_event_age,
        })
    }
}

#[cfg(not(test))]
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "memrelay=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run the relay until a shutdown signal arrives.
async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings()?;
    let addr = settings.addr;

    let (stop_tx, stop_rx) = watch::channel(false);
    let app = Arc::new(App {
        relay: Relay::new(&settings),
        settings,
        shutdown: stop_rx,
    });

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    let mut drain = app.shutdown.clone();
    let mut grace = app.shutdown.clone();
    let result = tokio::select! {
        res = server::serve(addr, app.clone(), async move {
            let _ = drain.changed().await;
        }) => res,
        _ = async move {
            let _ = grace.changed().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            info!("shutdown grace period elapsed");
        } => Ok(()),
    };
    info!(dropped = app.relay.dropped_deliveries(), "server stopped");
    result
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli).await
}
