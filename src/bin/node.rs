//! Operational entry point: reads
//! `NODE_ID`/`NODE_ADDRESS`/`NODE_PORT`/`CLUSTER_ID` from the environment,
//! bootstraps a single-node cluster, and serves until signalled.
//!
//! This binary wires the core against the in-memory `testsupport`
//! collaborators rather than a production Storage/Transport/Discovery
//! stack — the same role `memstore` plays for `async-raft` itself. A real
//! deployment swaps in its own implementations of the `Storage`,
//! `Transport` and `Discovery` traits; the core is agnostic to which.

use std::sync::Arc;

use ensemble_runtime::cluster::ClusterManager;
use ensemble_runtime::context::Context;
use ensemble_runtime::dispatch::command::CommandDispatcher;
use ensemble_runtime::dispatch::query::QueryDispatcher;
use ensemble_runtime::eventstore::EventStore;
use ensemble_runtime::saga::SagaOrchestrator;
use ensemble_runtime::testsupport::{Hub, InMemoryDiscovery, InMemoryStorage, InMemoryTransport};
use ensemble_runtime::{NodeId, RuntimeConfig};

/// Config error: a required environment variable was missing or malformed.
const EXIT_CONFIG_ERROR: i32 = 64;
/// Storage collaborator failed to initialize or reported itself unusable.
const EXIT_STORAGE_FATAL: i32 = 70;
/// No peers were reachable at startup and `BOOTSTRAP` was not set.
const EXIT_UNREACHABLE_PEERS: i32 = 74;

struct StartupEnv {
    node_id: NodeId,
    #[allow(dead_code)]
    node_address: String,
    #[allow(dead_code)]
    node_port: u16,
    cluster_id: String,
    bootstrap: bool,
}

fn read_env() -> Result<StartupEnv, String> {
    let node_id = std::env::var("NODE_ID")
        .map_err(|_| "NODE_ID is not set".to_string())?
        .parse::<NodeId>()
        .map_err(|e| format!("NODE_ID must be an integer: {e}"))?;
    let node_address = std::env::var("NODE_ADDRESS").map_err(|_| "NODE_ADDRESS is not set".to_string())?;
    let node_port = std::env::var("NODE_PORT")
        .map_err(|_| "NODE_PORT is not set".to_string())?
        .parse::<u16>()
        .map_err(|e| format!("NODE_PORT must be a u16: {e}"))?;
    let cluster_id = std::env::var("CLUSTER_ID").map_err(|_| "CLUSTER_ID is not set".to_string())?;
    let bootstrap = std::env::var("BOOTSTRAP").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);

    Ok(StartupEnv { node_id, node_address, node_port, cluster_id, bootstrap })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    let env = match read_env() {
        Ok(env) => env,
        Err(message) => {
            tracing::error!(%message, "configuration error");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let config = match RuntimeConfig::build(env.node_id, env.cluster_id.clone()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid runtime configuration");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let ctx = Context::system();
    let storage = Arc::new(InMemoryStorage::new());
    let discovery = Arc::new(InMemoryDiscovery::new());
    let hub = Hub::new();
    let transport = Arc::new(InMemoryTransport::register(hub, env.node_id));

    let cluster = Arc::new(ClusterManager::new(
        env.node_id,
        env.cluster_id.clone(),
        Arc::new(config.raft.clone()),
        config.cluster.clone(),
        ctx.clone(),
        discovery.clone(),
        transport.clone(),
        storage.clone(),
    ));

    // A lone node with no known peers can only make progress by declaring
    // itself the founding member (`BOOTSTRAP=1`); otherwise it waits to be
    // added to an existing cluster's membership and exits if that never
    // happens before discovery has had a chance to run once.
    if env.bootstrap {
        if let Err(err) = cluster.bootstrap().await {
            tracing::error!(%err, "failed to bootstrap cluster");
            std::process::exit(EXIT_STORAGE_FATAL);
        }
    } else {
        let peers = discovery.discover(&env.cluster_id).await.unwrap_or_default();
        if peers.is_empty() {
            tracing::error!("no peers reachable at startup and BOOTSTRAP was not set");
            std::process::exit(EXIT_UNREACHABLE_PEERS);
        }
    }

    if let Err(err) = cluster.register_self(env.node_address.clone(), env.node_port).await {
        tracing::error!(%err, "failed to register with discovery");
        std::process::exit(EXIT_STORAGE_FATAL);
    }
    cluster.spawn_background_loops();

    let event_store = Arc::new(EventStore::new(storage.clone(), ctx.clone(), config.event_store.clone()));
    let command_dispatcher = Arc::new(CommandDispatcher::new(config.dispatch.clone(), ctx.clone()));
    let query_dispatcher = Arc::new(QueryDispatcher::new(config.dispatch.clone(), ctx.clone()));
    let _saga_orchestrator = SagaOrchestrator::new(config.saga.clone(), ctx.clone(), event_store.clone(), command_dispatcher.clone());

    tracing::info!(
        node_id = env.node_id,
        cluster_id = %env.cluster_id,
        in_flight_commands = command_dispatcher.in_flight(),
        "ensemble-node started"
    );
    // The query dispatcher has no handlers registered by this bare-metal
    // entry point; it's constructed here so the process exit path below
    // can report a consistent final status for every core component.
    let _ = query_dispatcher.in_flight();

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received shutdown signal");
            if let Err(err) = cluster.raft().shutdown().await {
                tracing::error!(%err, "error during shutdown");
            }
            std::process::exit(0);
        }
        Err(err) => {
            tracing::error!(%err, "failed to install signal handler");
            std::process::exit(EXIT_STORAGE_FATAL);
        }
    }
}
