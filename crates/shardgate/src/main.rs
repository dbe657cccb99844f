//! Shardgate: a replicating S3 reverse proxy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shardgate::create_router;
use shardgate_core::{Config, LogFormat};
use shardgate_repair::RepairService;
use shardgate_replication::{ShardClient, ShardResolver, StaticShardResolver};
use shardgate_watchdog::{ConsistentShardClient, Ledger, RedbLedger};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args).await,
        Commands::CheckConfig(args) => check_config(&args.config),
        Commands::Version => {
            println!("shardgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = Config::load(Some(path)).context("Failed to load configuration")?;
    println!(
        "{}: ok ({} backends, {} regions)",
        path.display(),
        config.backends.len(),
        config.regions.len()
    );
    Ok(())
}

async fn run_server(args: cli::ServeArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(ledger) = args.ledger {
        config.watchdog.path = ledger;
    }
    if args.no_watchdog {
        config.watchdog.enabled = false;
    }

    init_logging(&config)?;
    print_banner(&config);

    let resolver: Arc<dyn ShardResolver> = Arc::new(
        StaticShardResolver::from_config(&config).context("Failed to configure regions")?,
    );

    let ledger = if config.watchdog.enabled {
        let ledger = RedbLedger::open(&config.watchdog.path).with_context(|| {
            format!("Failed to open ledger at {}", config.watchdog.path.display())
        })?;
        Some(Arc::new(ledger) as Arc<dyn Ledger>)
    } else {
        warn!("Consistency ledger disabled: diverged writes will not be repaired");
        None
    };

    let client = ConsistentShardClient::new(
        ShardClient::new(Arc::clone(&resolver)),
        ledger.clone(),
        &config.watchdog,
    )
    .context("Failed to create shard client")?;

    let shutdown = CancellationToken::new();
    let repair = match ledger {
        Some(ledger) => {
            let service = RepairService::from_config(&config, ledger, Arc::clone(&resolver))
                .context("Failed to create repair service")?;
            Some(service.spawn(shutdown.clone()))
        }
        None => None,
    };

    let app = create_router(
        Arc::new(client),
        config.server.max_body_size,
        config.logging.log_requests,
    );

    let addr = config.server.bind;
    let listener = TcpListener::bind(addr).await.context("Failed to bind to address")?;
    info!("Proxy listening on http://{}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Some(repair) = repair {
        if let Err(e) = repair.await {
            warn!(error = %e, "Repair service did not stop cleanly");
        }
    }

    info!("Proxy shutdown complete");
    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    Config::load(path.as_deref()).context("Failed to load configuration")
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = tracing_subscriber::fmt::layer();

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }

    Ok(())
}

fn print_banner(config: &Config) {
    let watchdog = if config.watchdog.enabled {
        format!("enabled ({})", config.watchdog.path.display())
    } else {
        "disabled".to_string()
    };

    println!(
        r#"
  shardgate v{}

  Endpoint:  http://{}
  Backends:  {}
  Regions:   {}
  Watchdog:  {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.server.bind,
        config.backends.keys().cloned().collect::<Vec<_>>().join(", "),
        config.regions.keys().cloned().collect::<Vec<_>>().join(", "),
        watchdog,
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
