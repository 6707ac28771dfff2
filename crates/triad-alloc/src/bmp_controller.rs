//! BMPController: per-BMP worker draining `PendingChange`s into hardware
//! commands (`spec.md §4.6`).
//!
//! Shaped like `OutboxDispatcher`: claim outstanding work, process it,
//! mark done or bump a bounded retry counter, dead-letter (here: report
//! the board faulty and move on) past `transceiver.*Attempts`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use triad_core::config::{AllocatorConfig, TransceiverConfig};
use triad_core::error::{AllocError, Result};
use triad_core::ports::Store;
use triad_core::types::*;

/// Hardware transport seam — the real implementation would speak the BMP
/// UDP protocol; tests and the `transceiver.dummy = true` configuration
/// use `DummyTransport` instead (`spec.md §6` "transceiver.dummy").
#[async_trait]
pub trait BmpTransport: Send + Sync {
    async fn set_power(&self, board: &Board, target: PowerTarget) -> Result<()>;
    async fn set_fpga_links(&self, board: &Board, fpga: FpgaLinks) -> Result<()>;
    /// Poll until the board reports power state matches `target`, or time out.
    async fn wait_for_power_state(&self, board: &Board, target: PowerTarget, timeout: Duration) -> Result<()>;
}

/// Always succeeds immediately — used in tests and whenever
/// `transceiver.dummy` is set, exactly as `spec.md §6` describes.
pub struct DummyTransport;

#[async_trait]
impl BmpTransport for DummyTransport {
    async fn set_power(&self, _board: &Board, _target: PowerTarget) -> Result<()> {
        Ok(())
    }

    async fn set_fpga_links(&self, _board: &Board, _fpga: FpgaLinks) -> Result<()> {
        Ok(())
    }

    async fn wait_for_power_state(&self, _board: &Board, _target: PowerTarget, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

pub struct BmpController<S: Store> {
    store: Arc<S>,
    transport: Arc<dyn BmpTransport>,
    bmp: BmpId,
    config: TransceiverConfig,
    allocator_config: AllocatorConfig,
}

impl<S: Store + 'static> BmpController<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn BmpTransport>,
        bmp: BmpId,
        config: TransceiverConfig,
        allocator_config: AllocatorConfig,
    ) -> Self {
        Self { store, transport, bmp, config, allocator_config }
    }

    /// Run forever, draining this BMP's boards' pending changes every
    /// configured period. Spawn one per BMP, as `sem_os_server::main`
    /// spawns one `OutboxDispatcher` per process.
    pub async fn run(self: Arc<Self>) {
        info!(bmp = self.bmp, period = ?self.config.period(), "bmp controller started");
        let mut ticker = tokio::time::interval(self.config.period());
        loop {
            ticker.tick().await;
            if let Err(e) = self.process_requests(self.config.off_wait()).await {
                error!(bmp = self.bmp, "processRequests failed: {e}");
            }
        }
    }

    /// One sweep: for every board on this BMP with outstanding changes,
    /// issue the hardware command and either finish it or retry up to
    /// `transceiver.powerAttempts` before reporting the board faulty
    /// (`spec.md §4.6`).
    pub async fn process_requests(&self, timeout: Duration) -> Result<()> {
        let boards = self.store.boards_for_bmp(self.bmp).await?;
        for board in boards {
            let changes = self.store.outstanding_changes_for_board(board.id).await?;
            for change in changes {
                // A single board's permanent failure must not abort the
                // sweep over the rest of this BMP's boards (`spec.md §4.6`
                // scenario S5) — the job it belonged to has already been
                // re-queued by `apply_change` by the time this surfaces.
                if let Err(e) = self.apply_change(&board, &change, timeout).await {
                    error!(board = board.id, job = change.job, error = %e, "pending change failed permanently");
                }
            }
        }
        Ok(())
    }

    async fn apply_change(&self, board: &Board, change: &PendingChange, timeout: Duration) -> Result<()> {
        self.store.set_in_progress(change.id, true).await?;

        let attempts = self.config.power_attempts;
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.try_apply(board, change, timeout).await {
                Ok(()) => {
                    self.store.set_board_power(board.id, matches!(change.power, PowerTarget::On), chrono::Utc::now()).await?;
                    let new_state = self.store.finish_pending_change(change.id, change.job).await?;
                    debug!(board = board.id, job = change.job, ?new_state, "pending change applied");
                    return Ok(());
                }
                Err(e) if e.is_retryable_bmp() => {
                    warn!(board = board.id, attempt, attempts, error = %e, "bmp command failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(self.config.probe_interval_secs)).await;
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        let detail = last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown".to_string());
        error!(board = board.id, job = change.job, detail, "bmp command permanently failed, marking board faulty");
        self.store
            .insert_board_report(BoardReport {
                id: 0,
                board: board.id,
                job: Some(change.job),
                reporter: 0, // system-reported, not a user report
                issue: format!("bmp command failed: {detail}"),
                ts: chrono::Utc::now(),
            })
            .await?;
        self.store.set_in_progress(change.id, false).await?;

        // Unrecoverable: tear the job's placement down entirely and put it
        // back in the queue excluding this board, rather than leaving it
        // stuck half-powered (`spec.md §4.6` scenario S5).
        let job = self.store.get_job(change.job).await?;
        let owner = self.store.get_user(job.owner).await?;
        let base_priority = if owner.is_internal { 2.0 } else { 1.0 };
        self.store
            .requeue_job_for_retry(
                change.job,
                base_priority,
                &self.allocator_config.priority_scale,
                self.allocator_config.importance_span,
            )
            .await?;

        Err(AllocError::BmpPermanent(detail))
    }

    async fn try_apply(&self, board: &Board, change: &PendingChange, timeout: Duration) -> Result<()> {
        self.transport.set_power(board, change.power).await?;
        self.transport.wait_for_power_state(board, change.power, timeout).await?;
        if matches!(change.power, PowerTarget::On) {
            self.transport.set_fpga_links(board, change.fpga).await?;
        }
        Ok(())
    }
}
