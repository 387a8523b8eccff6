use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use satbank_worker::config::Config;
use satbank_worker::db::WorkerDb;
use satbank_worker::{build_worker_state, run};

/// Queue worker for the satbank ledger: autowithdrawals, settlement checks
/// and node event subscriptions.
#[derive(Parser, Debug)]
#[command(name = "satbank-worker", version, about)]
struct Args {
    /// Apply the database schema and exit.
    #[arg(long)]
    migrate: bool,
    /// Override the configured number of job pollers.
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(concurrency) = args.concurrency {
        config.job_concurrency = concurrency.clamp(1, 64);
    }

    if args.migrate {
        let Some(url) = config.db_url.as_deref() else {
            anyhow::bail!("--migrate needs DB_URL to be set");
        };
        let db = WorkerDb::connect(url).await?;
        db.migrate().await?;
        tracing::info!("schema applied");
        return Ok(());
    }

    tracing::info!(
        service = %config.service_name,
        concurrency = config.job_concurrency,
        "starting worker"
    );

    let state = build_worker_state(config).await?;
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = stop.send(true);
    });

    run(state, shutdown).await
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::warn!(reason = %error, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::warn!(reason = %error, "could not listen for sigterm");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
