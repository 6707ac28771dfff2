//! Error kinds for the allocation server core.
//!
//! Mirrors the flat `thiserror` enum shape of `sem_os_core::error::SemOsError`:
//! one variant per `spec.md §7` error kind, plus a classifier method in place
//! of an HTTP-status mapping (this core has no HTTP layer to map onto).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no such machine: {0}")]
    NoSuchMachine(String),

    #[error("no such job: {0}")]
    NoSuchJob(i64),

    #[error("no such board: {0}")]
    NoSuchBoard(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("quota exhausted for group {0}")]
    QuotaExhausted(String),

    #[error("request too large: {0}")]
    RequestTooLarge(String),

    #[error("request invalid: {0}")]
    RequestInvalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bmp command timed out after {attempts} attempt(s): {detail}")]
    BmpTimeout { attempts: u32, detail: String },

    #[error("bmp command failed permanently: {0}")]
    BmpPermanent(String),

    #[error("store busy (lock contention) after {retries} retries")]
    StoreBusy { retries: u32 },

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),
}

impl AllocError {
    /// True for errors that are the caller's fault and should be surfaced as
    /// the job-create/access failure reason rather than retried transparently.
    ///
    /// Mirrors `spec.md §7`: `QuotaExhausted`, `RequestTooLarge`,
    /// `Unauthorized`, `NoSuchX` and `Conflict` are client-visible; BMP and
    /// store transients are not.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            AllocError::NoSuchMachine(_)
                | AllocError::NoSuchJob(_)
                | AllocError::NoSuchBoard(_)
                | AllocError::Unauthorized(_)
                | AllocError::QuotaExhausted(_)
                | AllocError::RequestTooLarge(_)
                | AllocError::RequestInvalid(_)
                | AllocError::Conflict(_)
        )
    }

    /// True for errors the per-BMP worker should retry locally before
    /// escalating to a permanent failure.
    pub fn is_retryable_bmp(&self) -> bool {
        matches!(self, AllocError::BmpTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, AllocError>;
