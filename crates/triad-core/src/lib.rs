//! Domain logic for the board allocation service: topology, placement,
//! error kinds, configuration, and storage port traits. No I/O lives here
//! — `triad-store` implements the ports against sqlite, `triad-alloc`
//! drives the allocation/power/keepalive workflows, `triad-daemon` wires
//! everything into a running process.

pub mod config;
pub mod error;
pub mod importance;
pub mod placement;
pub mod ports;
pub mod topology;
pub mod types;

pub use error::{AllocError, Result};
