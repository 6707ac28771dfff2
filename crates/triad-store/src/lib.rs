//! Sqlite implementations of every `triad_core::ports` trait.
//!
//! Mirrors `sem_os_postgres`'s split: one adapter module (`store`) holding
//! newtypes over the pool, a `sqlx_types` module isolating wire encodings,
//! and a `schema` module owning DDL. `SqliteStores` bundles them the way
//! `PgStores` bundles the postgres adapters for `main.rs`.

pub mod schema;
pub mod sqlx_types;
pub mod store;

#[cfg(test)]
mod tests;

pub use store::SqliteStore;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use triad_core::ports::MachineStore;
use triad_core::topology::Topology;

/// Connect to `url` (e.g. `sqlite::memory:` or `sqlite:///var/lib/triad/db.sqlite`),
/// apply the schema, and return a ready-to-use pool. Busy timeout follows
/// `Config::sqlite`; `sem_os_server::main` applies its pool options the
/// same way before handing the pool to `PgStores::new`.
pub async fn connect(url: &str, busy_timeout: Duration) -> anyhow::Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(busy_timeout);
    let pool = SqlitePoolOptions::new()
        .max_connections(1) // sqlite writers serialize regardless; one connection avoids lock storms
        .connect_with(opts)
        .await?;
    sqlx::query(schema::SCHEMA).execute(&pool).await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(pool)
}

/// Load the immutable mesh geometry for every machine the store knows
/// about. Called once at startup — `triad_core::topology::Topology` is
/// never refreshed afterwards (`spec.md §3` Ownership).
pub async fn load_topology(store: &SqliteStore) -> anyhow::Result<Topology> {
    let machines = store.list_machines().await?;
    let mut machine_tuples = Vec::new();
    let mut boards = Vec::new();
    let mut links = Vec::new();
    for m in &machines {
        machine_tuples.push((m.id, m.width, m.height, m.wrap_horizontal, m.wrap_vertical));
        boards.extend(store.all_boards(m.id).await?);
        links.extend(store.all_links(m.id).await?);
    }
    Ok(Topology::load(&machine_tuples, &boards, &links))
}
