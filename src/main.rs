use std::collections::HashMap;
use std::sync::Arc;

use eyre::{eyre, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use anchor_relayer::adapters::EvmAdapter;
use anchor_relayer::alarm::{Alarm, LogAlarm, WebhookAlarm};
use anchor_relayer::api;
use anchor_relayer::config::Config;
use anchor_relayer::connection::evm::EvmClient;
use anchor_relayer::connection::Connection;
use anchor_relayer::db::{self, BlockStore, MemoryBlockStore, PgBlockStore};
use anchor_relayer::health::{ChainHealth, Role};
use anchor_relayer::router::Router;
use anchor_relayer::sync::SyncContext;
use anchor_relayer::types::ChainId;
use anchor_relayer::watchers::{ChainSupervisor, Maintainer, Messenger};
use anchor_relayer::writers::Writer;

type EvmConnection = Connection<EvmClient>;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting anchor relayer");

    let config = Config::load()?;
    let anchor_id = config.relayer.anchor_chain_id;
    info!(
        anchor_chain_id = anchor_id,
        chains = config.chains.len(),
        persistent_cursors = config.database.is_some(),
        "Configuration loaded"
    );

    let store: Arc<dyn BlockStore> = match &config.database {
        Some(database) => {
            let pool = db::create_pool(&database.url).await?;
            info!("Database connected");
            db::run_migrations(&pool).await?;
            info!("Database migrations complete");
            Arc::new(PgBlockStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, block cursors will not survive a restart");
            Arc::new(MemoryBlockStore::new())
        }
    };

    let alarm: Arc<dyn Alarm> = match &config.relayer.alarm_webhook_url {
        Some(url) => Arc::new(WebhookAlarm::new(url.clone())?),
        None => Arc::new(LogAlarm),
    };

    let mut connections: HashMap<ChainId, Arc<EvmConnection>> = HashMap::new();
    for chain in &config.chains {
        let client = EvmClient::new(chain.rpc_urls.clone())
            .wrap_err_with(|| format!("Failed to build RPC client for {}", chain.name))?;
        let conn = Connection::new(
            chain.chain_id,
            &chain.name,
            client,
            chain.signer()?,
            chain.gas.clone(),
        );
        conn.connect()
            .await
            .wrap_err_with(|| format!("Failed to connect to {}", chain.name))?;
        connections.insert(chain.chain_id, Arc::new(conn));
    }
    let connection = |chain_id: ChainId| {
        connections
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| eyre!("chain {} has no connection", chain_id))
    };
    let anchor = connection(anchor_id)?;

    let adapter = Arc::new(
        config
            .chains
            .iter()
            .fold(
                EvmAdapter::new(anchor_id, config.relayer.light_client_manager),
                |adapter, chain| adapter.with_chain(chain.chain_id, chain.contracts()),
            ),
    );

    let health = Arc::new(ChainHealth::new());
    let root = CancellationToken::new();
    let mut supervisor = ChainSupervisor::new(health.clone());

    let mut router = Router::new(anchor_id);
    for chain in &config.chains {
        let writer = Writer::new(
            connection(chain.chain_id)?,
            adapter.clone(),
            config.relayer.writer_config(),
            alarm.clone(),
            health.clone(),
            supervisor.chain_token(chain.chain_id, &root),
        );
        router.register(chain.chain_id, Arc::new(writer));
    }
    let router = Arc::new(router);

    for chain in &config.chains {
        let conn = connection(chain.chain_id)?;
        let stop = supervisor.chain_token(chain.chain_id, &root);
        let context = |role| {
            SyncContext::new(
                chain.chain_id,
                &chain.name,
                role,
                stop.clone(),
                config.relayer.poll_interval(),
                config.relayer.retry_attempts,
                health.clone(),
            )
        };

        let mut maintainer = Maintainer::new(
            context(Role::Maintainer),
            chain.maintainer_config(),
            conn.clone(),
            anchor.clone(),
            adapter.clone(),
            router.clone(),
            store.clone(),
        );
        if chain.chain_id == anchor_id {
            let fan_out = config
                .chains
                .iter()
                .filter(|c| c.chain_id != anchor_id && c.light_node.is_some())
                .map(|c| connection(c.chain_id))
                .collect::<eyre::Result<Vec<_>>>()?;
            info!(destinations = fan_out.len(), "Anchor header fan-out configured");
            maintainer = maintainer.with_fan_out(fan_out);
        }
        supervisor.spawn(chain.chain_id, &chain.name, Role::Maintainer, maintainer.run());

        let messenger = Messenger::new(
            context(Role::Messenger),
            chain.messenger_config(),
            conn,
            anchor.clone(),
            adapter.clone(),
            router.clone(),
            store.clone(),
        );
        supervisor.spawn(chain.chain_id, &chain.name, Role::Messenger, messenger.run());
    }
    info!(loops = supervisor.len(), "Chain loops started");

    let api_addr = config.api.socket_addr()?;
    let api_health = health.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_health).await {
            error!(error = %e, "API server error");
        }
    });

    let shutdown = root.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown.cancel();
    });

    let exits = supervisor.run().await;
    for conn in connections.values() {
        conn.close();
    }

    let dead: Vec<_> = exits
        .iter()
        .filter(|exit| exit.fatal.is_some())
        .map(|exit| format!("{}/{}", exit.name, exit.role))
        .collect();
    if dead.is_empty() {
        info!("Anchor relayer stopped");
    } else {
        warn!(dead = ?dead, "Anchor relayer stopped with dead chains");
    }
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,anchor_relayer=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
