//! Vault Relayer
//!
//! Watches `Locked` events on the vault chain and `Burned` events on the
//! wrapped token chain, and settles each one exactly once with `mint` or
//! `release` on the other side.

use std::str::FromStr;
use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use eyre::WrapErr;
use tokio::sync::watch;
use tracing::info;

use vault_relayer::api::{self, ApiState};
use vault_relayer::chain::evm::BridgeSide;
use vault_relayer::chain::{ChainClient, EvmChainClient};
use vault_relayer::config::Config;
use vault_relayer::db::{self, PgStore, RelayStore};
use vault_relayer::orchestrator::{RelayOrchestrator, RelaySettings};
use vault_relayer::quorum::{Attestor, LocalAttestor};
use vault_relayer::state::TransferStateMachine;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    init_logging(&config.api.log_format);

    info!(
        source_chain_id = config.source.chain_id,
        dest_chain_id = config.destination.chain_id,
        confirmation_depth = config.relayer.confirmation_depth,
        quorum_threshold = config.quorum.threshold,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    info!("Database connected");
    db::run_migrations(&pool).await?;
    info!("Database migrations complete");
    let store: Arc<dyn RelayStore> = Arc::new(PgStore::new(pool));

    let signer = config.relayer.signer()?;
    let source = EvmChainClient::new(
        &config.source,
        BridgeSide::Source,
        config.destination.chain_id,
        signer.clone(),
    )?;
    source.verify_chain_id().await?;
    let destination = EvmChainClient::new(
        &config.destination,
        BridgeSide::Destination,
        config.source.chain_id,
        signer,
    )?;
    destination.verify_chain_id().await?;
    let source: Arc<dyn ChainClient> = Arc::new(source);
    let destination: Arc<dyn ChainClient> = Arc::new(destination);

    let mut attestors: Vec<Arc<dyn Attestor>> = Vec::new();
    for key in &config.quorum.local_keys {
        let validator = PrivateKeySigner::from_str(key).wrap_err("Invalid QUORUM_LOCAL_KEYS entry")?;
        info!(validator = %validator.address(), "Local validator enabled");
        attestors.push(Arc::new(LocalAttestor::new(
            validator,
            vec![source.clone(), destination.clone()],
        )));
    }

    let settings = RelaySettings::from_config(&config);
    let orchestrator = RelayOrchestrator::new(
        settings.clone(),
        source,
        destination,
        store.clone(),
        attestors,
    );
    orchestrator.verify_authorization().await?;

    let api_state = ApiState::new(TransferStateMachine::new(store, settings.retry));
    let api_addr = config.api.bind_addr;
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!("Starting relay pipelines");
    orchestrator.run(shutdown_rx).await?;

    info!("Vault relayer stopped");
    Ok(())
}

/// Initialize tracing with a human or JSON formatter
fn init_logging(format: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vault_relayer=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
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
