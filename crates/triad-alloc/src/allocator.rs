//! The Allocator: one `allocate()` pass per tick, plus `expireJobs()`,
//! `tombstone()`, and `consolidate()` (`spec.md §4.4`).
//!
//! Shaped like `OutboxDispatcher::run` — an owned loop method spawned via
//! `tokio::spawn`, sleeping on its configured period between passes
//! instead of busy-polling.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use triad_core::config::AllocatorConfig;
use triad_core::error::{AllocError, Result};
use triad_core::importance::IMPORTANCE_BUMP;
use triad_core::placement::{self, MachineSnapshot, PlacementRequest};
use triad_core::ports::{BoardQuery, OutstandingRequest, Store};
use triad_core::types::*;
use triad_core::topology::Topology;

pub struct Allocator<S: Store> {
    store: Arc<S>,
    topology: Arc<Topology>,
    config: AllocatorConfig,
}

impl<S: Store + 'static> Allocator<S> {
    pub fn new(store: Arc<S>, topology: Arc<Topology>, config: AllocatorConfig) -> Self {
        Self { store, topology, config }
    }

    /// Run forever, attempting an `allocate()` pass every configured period.
    /// Spawn as a background task; never returns under normal operation.
    pub async fn run(self: Arc<Self>) {
        info!(period = ?self.config.period(), "allocator loop started");
        let mut ticker = tokio::time::interval(self.config.period());
        loop {
            ticker.tick().await;
            if let Err(e) = self.allocate().await {
                error!("allocate() pass failed: {e}");
            }
            if let Err(e) = self.expire_jobs().await {
                error!("expireJobs() pass failed: {e}");
            }
        }
    }

    /// One full scan of outstanding `QUEUED` requests, importance-ordered,
    /// attempting to place each in turn (`spec.md §4.4` step 1-2).
    pub async fn allocate(&self) -> Result<()> {
        let requests = self.store.outstanding_requests(JobState::Queued).await?;
        debug!(count = requests.len(), "allocate() pass scanning outstanding requests");

        for req in requests {
            match self.try_place(&req).await {
                Ok(true) => info!(job = req.job, "placed"),
                Ok(false) => {
                    self.store
                        .bump_importance(req.request_id, IMPORTANCE_BUMP, self.config.importance_span)
                        .await?;
                }
                Err(e) if e.is_client_fault() => {
                    warn!(job = req.job, error = %e, "request permanently rejected");
                    self.store
                        .destroy_job(req.job, &e.to_string(), Utc::now())
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn try_place(&self, req: &OutstandingRequest) -> Result<bool> {
        let machine = self.store.get_machine(req.machine).await?;
        if !machine.in_service {
            return Ok(false);
        }
        let (width, height) = self
            .topology
            .machine_dims(req.machine)
            .ok_or_else(|| AllocError::NoSuchMachine(req.machine.to_string()))?;

        let live = self.store.live_boards(req.machine).await?;
        let all = self.store.all_boards(req.machine).await?;
        let snapshot = MachineSnapshot {
            topology: &self.topology,
            machine: req.machine,
            width,
            height,
            live_boards: live.iter().map(|b| b.id).collect(),
            allocated_boards: all.iter().filter(|b| b.allocated_job.is_some()).map(|b| b.id).collect(),
        };

        let placement_request = self.resolve_request(req).await?;
        let excluded = self.previously_faulty_boards(req.job).await?;

        let Some(result) = placement::place(&placement_request, &snapshot, &excluded)? else {
            return Ok(false);
        };

        self.store.commit_placement(req.job, &result, Utc::now()).await?;
        let changes = power_on_changes(req.job, &result, &self.topology);
        self.store.issue_pending_changes(&changes).await?;
        Ok(true)
    }

    async fn resolve_request(&self, req: &OutstandingRequest) -> Result<PlacementRequest> {
        Ok(match &req.request {
            JobRequest::ByCount { n, max_dead } => PlacementRequest::ByCount { n: *n, max_dead: *max_dead },
            JobRequest::ByRect { w, h, max_dead } => PlacementRequest::ByRect { w: *w, h: *h, max_dead: *max_dead },
            JobRequest::ByBoard(BoardLocator::Id(id)) => PlacementRequest::ByBoard(*id),
            JobRequest::ByBoard(locator) => {
                let query = match locator {
                    BoardLocator::Id(_) => unreachable!("handled above"),
                    BoardLocator::Triad(t) => BoardQuery::Triad(*t),
                    BoardLocator::Physical(p) => BoardQuery::Physical(*p),
                    BoardLocator::Ip(ip) => BoardQuery::Ip(ip.clone()),
                };
                let board = self.store.find_board(req.machine, query).await?;
                PlacementRequest::ByBoard(board.id)
            }
        })
    }

    /// A job whose previous placement attempt failed mid-power-up may be
    /// retried excluding the board(s) it reported faulty, so the next
    /// placement doesn't hand it the same bad board (`spec.md §4.6`).
    async fn previously_faulty_boards(&self, job: JobId) -> Result<BTreeSet<BoardId>> {
        self.store.boards_reported_by_job(job).await
    }

    /// `expireJobs()`: destroy jobs whose keepalive has lapsed (`spec.md §4.4`).
    pub async fn expire_jobs(&self) -> Result<()> {
        let now = Utc::now();
        let expired = self.store.find_expired_jobs(now).await?;
        for job in expired {
            warn!(job, "keepalive expired");
            self.store.destroy_job(job, "keepalive expired", now).await?;
        }
        Ok(())
    }

    /// `consolidate()`: charge each destroyed, not-yet-consolidated job's
    /// board-seconds (`allocationSize x (deathTs - allocationTs)`) against
    /// its group's quota (`spec.md §4.4` property 6). Idempotent: a job
    /// already marked consolidated is skipped by `consolidation_targets`.
    pub async fn consolidate(&self) -> Result<()> {
        for job_id in self.store.consolidation_targets().await? {
            let job = self.store.get_job(job_id).await?;
            let death_ts = job.death_ts.ok_or_else(|| {
                AllocError::InternalInvariantViolated(format!("job {job_id} has no deathTs but was selected for consolidation"))
            })?;
            // Jobs destroyed before ever being allocated a board never accrued
            // board-seconds; charge them nothing.
            let charge = match (job.allocation_ts, job.allocation_size) {
                (Some(allocation_ts), Some(size)) => {
                    let elapsed = (death_ts - allocation_ts).num_seconds().max(0);
                    size as i64 * elapsed
                }
                _ => 0,
            };
            self.store.adjust_quota(job.group, -charge).await?;
            self.store.mark_consolidated(job_id).await?;
        }
        Ok(())
    }

    /// `tombstone()`: move destroyed jobs older than the configured grace
    /// period into historical storage (`spec.md §4.4`).
    pub async fn tombstone(&self, grace: Duration) -> Result<(u64, u64)> {
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        self.store.tombstone(cutoff).await
    }
}

/// Build the `PendingChange`s to power on a freshly placed allocation, with
/// FPGA links disabled on the perimeter and enabled internally (`spec.md
/// §4.4` step 2, §4.1 perimeter-links definition) — this isolates the
/// allocation from its neighbours on the mesh.
fn power_on_changes(job: JobId, result: &PlacementResult, topology: &Topology) -> Vec<PendingChange> {
    let perimeter = topology.perimeter_links(&result.boards);
    let mut disabled: std::collections::HashMap<BoardId, FpgaLinks> = std::collections::HashMap::new();
    for &board in &result.boards {
        let mut fpga = FpgaLinks {
            north: true,
            south: true,
            east: true,
            west: true,
            nw: true,
            se: true,
        };
        for &(from, dir, _) in &perimeter {
            if from == board {
                fpga.set(dir, false);
            }
        }
        disabled.insert(board, fpga);
    }

    result
        .boards
        .iter()
        .map(|&board| PendingChange {
            id: 0, // assigned by the store on insert
            job,
            board,
            from_state: JobState::Queued,
            to_state: JobState::Power,
            power: PowerTarget::On,
            fpga: disabled.get(&board).copied().unwrap_or_default(),
            in_progress: false,
        })
        .collect()
}
