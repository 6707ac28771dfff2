//! Allocation, power-control, and job-lifecycle workflows built on top of
//! `triad_core`'s pure placement/topology logic and a `triad_core::ports::Store`.
//!
//! Background loops here follow `sem_os_server::dispatcher::OutboxDispatcher`'s
//! shape: claim work, process it, sleep on empty, never return.

pub mod allocator;
pub mod bmp_controller;
pub mod jobsm;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use allocator::Allocator;
pub use bmp_controller::{BmpController, BmpTransport, DummyTransport};
pub use jobsm::JobSM;
pub use scheduler::Scheduler;
