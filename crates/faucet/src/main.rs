//! Drip faucet binary: HTTP API and request worker, plus admin commands

use clap::{Parser, Subcommand, ValueEnum};
use drip_common::traits::LockStore;
use drip_common::utils::logging::init_logging;
use drip_core::{AccountPool, AccountRecord, Credential, LeaseOutcome, RequestedTokens};
use drip_faucet::api::enqueue_request;
use drip_faucet::transfer::address_from_credential;
use drip_faucet::{build_processors, fund_safe, router, AppState, FaucetConfig, FaucetMetrics, RequestWorker};
use drip_storage::SledStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Drip faucet CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (TOML, YAML or JSON)
    #[arg(short, long, env = "DRIP_CONFIG")]
    config: Option<String>,

    /// Database path
    #[arg(long)]
    db_path: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the request worker
    Serve {
        /// Server address
        #[arg(long)]
        server_addr: Option<String>,
    },

    /// Manage the signing accounts of a network
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },

    /// Enqueue a funding request
    Request {
        #[arg(long)]
        net: String,

        /// Beneficiary address
        to: String,

        #[arg(long, value_enum, default_value_t = TokensArg::All)]
        tokens: TokensArg,
    },

    /// Top up the big faucet safe of a network (run it from a scheduler)
    FundSafe {
        #[arg(long)]
        net: String,
    },
}

#[derive(Subcommand, Debug)]
enum AccountsCommand {
    /// List accounts and their lock state
    List {
        #[arg(long)]
        net: String,
    },

    /// Remove every account
    Clear {
        #[arg(long)]
        net: String,
    },

    /// Add an account from its private key
    Add {
        #[arg(long)]
        net: String,

        /// Hex private key
        #[arg(env = "DRIP_ACCOUNT_PK", hide_env_values = true)]
        pk: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TokensArg {
    All,
    Stables,
    Native,
}

impl From<TokensArg> for RequestedTokens {
    fn from(arg: TokensArg) -> Self {
        match arg {
            TokensArg::All => RequestedTokens::All,
            TokensArg::Stables => RequestedTokens::Stables,
            TokensArg::Native => RequestedTokens::Native,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FaucetConfig::load(path)?,
        None => FaucetConfig::from_env(),
    };
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    let _log_guard = init_logging(&config.logging)?;

    // sled holds an exclusive file lock, so admin commands need the server stopped.
    let store = Arc::new(SledStore::open(&config.db_path)?);
    info!("Database opened at: {}", config.db_path);

    let result = dispatch(args.command, config, store.clone()).await;

    store.flush().await?;
    result
}

/// Runs one subcommand. Errors come back as values so the caller always flushes.
async fn dispatch(command: Command, mut config: FaucetConfig, store: Arc<SledStore>) -> anyhow::Result<()> {
    match command {
        Command::Serve { server_addr } => {
            if let Some(addr) = server_addr {
                config.server_addr = addr;
            }
            serve(config, store).await
        }
        Command::Accounts { command } => run_accounts(&config, store, command).await,
        Command::Request { net, to, tokens } => {
            let key = enqueue_request(store.as_ref(), &config, &net, &to, tokens.into()).await?;
            println!("{}", key);
            Ok(())
        }
        Command::FundSafe { net } => run_fund_safe(&config, store, &net).await,
    }
}

async fn run_accounts(config: &FaucetConfig, store: Arc<SledStore>, command: AccountsCommand) -> anyhow::Result<()> {
    let pool_for = |net: &str| {
        let namespace = config.account_namespace(net).unwrap_or(net).to_string();
        AccountPool::new(store.clone(), namespace, config.pool.clone())
    };

    match command {
        AccountsCommand::List { net } => {
            let pool = pool_for(&net);
            let accounts = pool.get_accounts().await?;
            println!("{} accounts in {}", accounts.len(), pool.accounts_collection());
            for (key, account) in accounts {
                println!("{}  {}  locked={}", key, account.address, account.locked);
            }
        }
        AccountsCommand::Clear { net } => {
            let removed = pool_for(&net).remove_all().await?;
            println!("Removed {} accounts", removed);
        }
        AccountsCommand::Add { net, pk } => {
            let credential = Credential::new(pk);
            let address = address_from_credential(&credential)?;
            let key = pool_for(&net)
                .add_account(&AccountRecord::new(credential, address.as_str()))
                .await?;
            println!("Added {} as {}", address, key);
        }
    }
    Ok(())
}

async fn run_fund_safe(config: &FaucetConfig, store: Arc<SledStore>, net: &str) -> anyhow::Result<()> {
    match fund_safe(store, config, net).await? {
        LeaseOutcome::Completed(receipt) => {
            if let Some(hash) = receipt.tx_hash {
                println!("native  {}", hash);
            }
            for (symbol, hash) in receipt.token_tx_hashes {
                println!("{:<7} {}", symbol, hash);
            }
            Ok(())
        }
        LeaseOutcome::NoFreeAccount => anyhow::bail!("No free account to fund the {} safe", net),
        LeaseOutcome::ActionTimeout => anyhow::bail!("Funding the {} safe timed out", net),
    }
}

async fn serve(config: FaucetConfig, store: Arc<SledStore>) -> anyhow::Result<()> {
    info!("Starting Drip Faucet v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  Networks: {:?}", config.networks.keys().collect::<Vec<_>>());
    info!(
        "  Pool: retry {}ms, acquire {}ms, action {}ms ({:?} on timeout)",
        config.pool.retry_wait_ms,
        config.pool.get_account_timeout_ms,
        config.pool.action_timeout_ms,
        config.pool.on_action_timeout
    );

    let config = Arc::new(config);
    let store: Arc<dyn LockStore> = store;
    let metrics = Arc::new(FaucetMetrics::new()?);

    let processors = build_processors(store.clone(), &config)?;
    let worker = Arc::new(RequestWorker::new(
        store.clone(),
        processors,
        metrics.clone(),
        &config.worker,
    ));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let worker_task = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .run(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        })
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(AppState {
        config: config.clone(),
        store,
        metrics,
    })
    .layer(cors)
    .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_addr.parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gracefully");
    let _ = shutdown_tx.send(true);
    worker_task.await?;
    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
