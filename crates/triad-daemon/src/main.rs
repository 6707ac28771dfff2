//! triad-daemon — standalone allocation server process.
//!
//! Reads config the way `sem_os_server::main` does (env var pointing at a
//! TOML file, plus a direct `TRIAD_DATABASE_URL` override), connects to
//! sqlite, loads the static mesh topology once, and spawns the
//! allocator/BMP/scheduler background loops. No HTTP router is built —
//! the client-facing RPC surface is out of scope here.

use std::sync::Arc;

use triad_alloc::{Allocator, BmpController, DummyTransport, Scheduler};
use triad_core::config::Config;
use triad_core::ports::MachineStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,triad_alloc=debug,triad_store=debug".into()),
        )
        .init();

    let config = Config::load().expect("failed to load configuration");

    let pool = triad_store::connect(&config.database_url, std::time::Duration::from_secs(config.sqlite.timeout_secs))
        .await
        .expect("failed to connect to sqlite store");
    tracing::info!(url = %config.database_url, "connected to store");

    let store = Arc::new(triad_store::SqliteStore::new(pool));

    let topology = Arc::new(triad_store::load_topology(&store).await.expect("failed to load topology"));
    tracing::info!("mesh topology loaded");

    let allocator = Arc::new(Allocator::new(Arc::clone(&store), Arc::clone(&topology), config.allocator.clone()));
    tokio::spawn(Arc::clone(&allocator).run());

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&allocator), config.quota.clone(), config.historical_data.clone()));
    tokio::spawn(Arc::clone(&scheduler).run_consolidation());
    tokio::spawn(Arc::clone(&scheduler).run_tombstoning());

    let transport: Arc<dyn triad_alloc::BmpTransport> = if config.transceiver.dummy {
        Arc::new(DummyTransport)
    } else {
        // A real transport would speak the BMP UDP protocol over the network;
        // not implemented here (`transceiver.dummy` gates this in every
        // deployment this build targets).
        tracing::warn!("transceiver.dummy is false but no real BMP transport is wired up; using DummyTransport");
        Arc::new(DummyTransport)
    };

    for machine in store.list_machines().await.expect("failed to list machines") {
        for bmp in store.bmps_for_machine(machine.id).await.expect("failed to list bmps") {
            let controller = Arc::new(BmpController::new(
                Arc::clone(&store),
                Arc::clone(&transport),
                bmp.id,
                config.transceiver.clone(),
                config.allocator.clone(),
            ));
            tokio::spawn(controller.run());
        }
    }
    tracing::info!("bmp controllers spawned");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutting down");
}
