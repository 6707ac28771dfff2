//! JobSM: the client-facing job lifecycle state machine (`spec.md §4.5`).
//!
//! `createJob`, `access` (keepalive), `destroy`, `whereIs`, `reportIssue`.
//! These are ordinary request/response calls, not background loops — the
//! daemon's (absent) RPC surface would call straight into this the way
//! `sem_os_server`'s axum handlers call into `sem_os_core` ports; here
//! they're exercised directly from tests and from `triad-daemon`'s wiring.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use triad_core::config::AllocatorConfig;
use triad_core::error::{AllocError, Result};
use triad_core::importance::{importance, RequestShape};
use triad_core::ports::{BoardQuery, Store};
use triad_core::types::*;

pub struct JobSM<S: Store> {
    store: Arc<S>,
    allocator_config: AllocatorConfig,
}

impl<S: Store> JobSM<S> {
    pub fn new(store: Arc<S>, allocator_config: AllocatorConfig) -> Self {
        Self { store, allocator_config }
    }

    /// Create a job and its initial request (`spec.md §4.5`). Rejects
    /// immediately — before ever reaching the Allocator — on quota
    /// exhaustion or machine unavailability; everything else is resolved
    /// asynchronously by `Allocator::allocate`.
    pub async fn create_job(
        &self,
        machine_name: &str,
        owner: UserId,
        group: Option<GroupId>,
        request: JobRequest,
        keepalive_interval: Duration,
        original_request: Option<Vec<u8>>,
    ) -> Result<JobId> {
        let machine = self.store.get_machine_by_name(machine_name).await?;
        if !machine.in_service {
            return Err(AllocError::NoSuchMachine(format!("{machine_name} is not in service")));
        }
        if !self.store.may_use_machine(owner, machine.id).await? {
            return Err(AllocError::Unauthorized(format!("user {owner} may not use {machine_name}")));
        }

        let user = self.store.get_user(owner).await?;
        let groups = self.store.groups_for_user(owner, machine.id).await?;
        let group = match group {
            Some(id) => groups
                .iter()
                .find(|g| g.id == id)
                .ok_or_else(|| AllocError::Unauthorized(format!("user does not belong to group {id}")))?,
            // No group named: pick whichever of the user's groups on this
            // machine has the most quota left, tie-broken by the smallest
            // group id (`spec.md §4.5`).
            None => {
                let mut candidates = Vec::with_capacity(groups.len());
                for g in &groups {
                    let quota = self.store.group_quota(g.id).await?;
                    candidates.push((g, quota));
                }
                candidates.sort_by(|(ga, qa), (gb, qb)| quota_rank(qb).cmp(&quota_rank(qa)).then(ga.id.cmp(&gb.id)));
                candidates
                    .first()
                    .map(|(g, _)| *g)
                    .ok_or_else(|| AllocError::Unauthorized("user belongs to no group".into()))?
            }
        };
        if self.store.group_quota(group.id).await?.is_exhausted() {
            return Err(AllocError::QuotaExhausted(group.name.clone()));
        }

        validate_request(&request, machine.width, machine.height)?;

        let job = self
            .store
            .insert_job(machine.id, owner, group.id, keepalive_interval, original_request)
            .await?;

        let shape = match &request {
            JobRequest::ByCount { .. } => RequestShape::Size,
            JobRequest::ByRect { .. } => RequestShape::Dimensions,
            JobRequest::ByBoard(_) => RequestShape::SpecificBoard,
        };
        let base_priority = if user.is_internal { 2.0 } else { 1.0 };
        let initial_importance = importance(
            base_priority,
            shape,
            0.0,
            &self.allocator_config.priority_scale,
            self.allocator_config.importance_span,
        );
        self.store.insert_request(job, request, initial_importance).await?;

        Ok(job)
    }

    /// Refresh a job's keepalive deadline (`spec.md §4.5`). Fails if the
    /// job is already destroyed.
    pub async fn access(&self, job: JobId, host: Option<String>) -> Result<()> {
        let j = self.store.get_job(job).await?;
        if j.state == JobState::Destroyed {
            return Err(AllocError::NoSuchJob(job));
        }
        self.store.update_keepalive(job, host, Utc::now()).await
    }

    /// Destroy a job, releasing its boards and cancelling any outstanding
    /// request or pending power change (`spec.md §4.5`).
    pub async fn destroy(&self, job: JobId, reason: &str) -> Result<()> {
        self.store.destroy_job(job, reason, Utc::now()).await
    }

    /// `whereIs`: map a machine-global chip coordinate back to its board
    /// and the job-relative position within that job's allocation
    /// (`spec.md §4.5`).
    pub async fn where_is(&self, job: JobId, chip_x: i32, chip_y: i32) -> Result<BoardLocation> {
        let j = self.store.get_job(job).await?;
        let root_board_id = j.root_board.ok_or_else(|| AllocError::NoSuchBoard(format!("job {job} has no allocated boards")))?;
        let root_board = self.store.get_board(root_board_id).await?;
        let board = self.store.find_board(j.machine, BoardQuery::JobChip { job, chip_x, chip_y }).await?;
        Ok(BoardLocation {
            job,
            board: board.id,
            chip_x,
            chip_y,
            job_relative_x: chip_x - root_board.root_chip.0,
            job_relative_y: chip_y - root_board.root_chip.1,
        })
    }

    /// Record a board fault report; once a board accumulates
    /// `report_action_threshold` reports it is disabled automatically
    /// (`spec.md §4.5`, §4.4 BMPController escalation path).
    pub async fn report_issue(&self, board: BoardId, job: Option<JobId>, reporter: UserId, issue: String, threshold: u32) -> Result<()> {
        self.store
            .insert_board_report(BoardReport {
                id: 0,
                board,
                job,
                reporter,
                issue,
                ts: Utc::now(),
            })
            .await?;
        let flagged = self.store.reported_boards_above(threshold).await?;
        if flagged.contains(&board) {
            self.store.set_board_enabled(board, false).await?;
        }
        Ok(())
    }
}

/// Orders quotas from least to most remaining, with `Unlimited` ranked above
/// any finite amount.
fn quota_rank(quota: &Quota) -> i64 {
    match quota {
        Quota::Unlimited => i64::MAX,
        Quota::Seconds(s) => *s,
    }
}

/// Shape-level validation that doesn't need a `Store` round-trip
/// (`spec.md §4.2` RequestInvalid cases).
fn validate_request(request: &JobRequest, machine_w: i32, machine_h: i32) -> Result<()> {
    match request {
        JobRequest::ByCount { n, max_dead } => {
            if *n <= 0 {
                return Err(AllocError::RequestInvalid("count must be positive".into()));
            }
            if *max_dead < 0 {
                return Err(AllocError::RequestInvalid("maxDead must be non-negative".into()));
            }
        }
        JobRequest::ByRect { w, h, max_dead } => {
            if *w <= 0 || *h <= 0 {
                return Err(AllocError::RequestInvalid("width/height must be positive".into()));
            }
            if *max_dead < 0 {
                return Err(AllocError::RequestInvalid("maxDead must be non-negative".into()));
            }
            if *w > machine_w || *h > machine_h {
                return Err(AllocError::RequestTooLarge(format!("{w}x{h} exceeds machine {machine_w}x{machine_h}")));
            }
        }
        JobRequest::ByBoard(_) => {}
    }
    Ok(())
}
