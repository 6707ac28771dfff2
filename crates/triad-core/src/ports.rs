//! Storage port traits — implemented by `triad-store`.
//!
//! Core logic (`triad-alloc`) depends only on these traits, never on sqlx
//! directly, exactly as `sem_os_core::ports` keeps `sem_os_core` free of
//! sqlx. Split into one trait per concern, grounded on the same file's
//! `SnapshotStore` / `ChangesetStore` / `OutboxStore` / ... split.
//!
//! The operations enumerated in `spec.md §6` are covered by the methods
//! below; several prose bullets collapse into one parameterised method
//! (e.g. "find a board by (machine,x,y,z) / (machine,cab,frame,board) /
//! (machine,ip) / ..." becomes `find_board(machine, BoardQuery)`).

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::config::PriorityScale;
use crate::error::Result;
use crate::types::*;

/// Page request for list operations (`spec.md §6`: "paged by (limit, offset)").
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

/// The ways a specific board may be looked up outside of a `JobRequest`
/// (`spec.md §6`: "find a board by (machine, x, y, z) / ... / (job, board,
/// chipX, chipY) / (machine, chipX, chipY)").
#[derive(Debug, Clone)]
pub enum BoardQuery {
    Triad(TriadCoord),
    Physical(PhysicalCoord),
    Ip(String),
    JobChip { job: JobId, chip_x: i32, chip_y: i32 },
    MachineChip { chip_x: i32, chip_y: i32 },
}

#[derive(Debug, Clone, Copy)]
pub struct MachineCounts {
    pub board_count: i64,
    pub in_use: i64,
    pub num_jobs: i64,
}

/// A candidate allocation request ordered for the Allocator's scan
/// (`spec.md §4.4` step 1).
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub request_id: RequestId,
    pub job: JobId,
    pub machine: MachineId,
    pub group: GroupId,
    pub request: JobRequest,
    pub importance: f64,
}

#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn list_machines(&self) -> Result<Vec<Machine>>;
    async fn get_machine(&self, id: MachineId) -> Result<Machine>;
    async fn get_machine_by_name(&self, name: &str) -> Result<Machine>;
    async fn set_in_service(&self, machine: MachineId, in_service: bool) -> Result<()>;

    async fn all_boards(&self, machine: MachineId) -> Result<Vec<Board>>;
    async fn live_boards(&self, machine: MachineId) -> Result<Vec<Board>>;
    async fn dead_boards(&self, machine: MachineId) -> Result<Vec<Board>>;
    async fn available_boards(&self, machine: MachineId) -> Result<Vec<Board>>;
    async fn boards_for_bmp(&self, bmp: BmpId) -> Result<Vec<Board>>;

    async fn all_links(&self, machine: MachineId) -> Result<Vec<Link>>;
    async fn bmp(&self, id: BmpId) -> Result<Bmp>;
    async fn bmps_for_machine(&self, machine: MachineId) -> Result<Vec<Bmp>>;

    async fn get_board(&self, id: BoardId) -> Result<Board>;
    async fn find_board(&self, machine: MachineId, query: BoardQuery) -> Result<Board>;
    async fn free_board(&self, machine: MachineId) -> Result<Option<Board>>;
    async fn set_board_enabled(&self, board: BoardId, enabled: bool) -> Result<()>;
    async fn set_board_power(&self, board: BoardId, powered: bool, at: chrono::DateTime<chrono::Utc>) -> Result<()>;

    async fn counts(&self, machine: MachineId) -> Result<MachineCounts>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(
        &self,
        machine: MachineId,
        owner: UserId,
        group: GroupId,
        keepalive_interval: std::time::Duration,
        original_request: Option<Vec<u8>>,
    ) -> Result<JobId>;

    async fn get_job(&self, id: JobId) -> Result<Job>;
    async fn list_job_ids(&self, page: Page) -> Result<Vec<JobId>>;
    async fn list_live_job_ids(&self, page: Page) -> Result<Vec<JobId>>;
    async fn list_live_jobs(&self, machine: Option<MachineId>) -> Result<Vec<Job>>;
    async fn job_boards(&self, job: JobId) -> Result<BTreeSet<BoardId>>;

    async fn insert_request(&self, job: JobId, request: JobRequest, importance: f64) -> Result<RequestId>;
    async fn delete_request(&self, job: JobId) -> Result<()>;
    async fn outstanding_requests(&self, state: JobState) -> Result<Vec<OutstandingRequest>>;
    async fn bump_importance(&self, request: RequestId, delta: f64, cap: f64) -> Result<()>;

    /// Re-queue a job after its placement was torn down (e.g. a BMP
    /// permanent failure, `spec.md §4.6` scenario S5): release its boards,
    /// drop its pending changes, reset it to `QUEUED` with `numPending=0`,
    /// and re-insert its original request (recovered from the snapshot
    /// `insert_request` keeps on the job row) at a freshly computed
    /// importance so the Allocator picks it up on the next pass.
    async fn requeue_job_for_retry(
        &self,
        job: JobId,
        base_priority: f64,
        priority_scale: &PriorityScale,
        importance_span: f64,
    ) -> Result<()>;

    async fn update_keepalive(&self, job: JobId, host: Option<String>, at: chrono::DateTime<chrono::Utc>) -> Result<()>;
    async fn find_expired_jobs(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<JobId>>;

    async fn set_job_state(&self, job: JobId, state: JobState) -> Result<()>;
    /// Destroy a job: mark it `DESTROYED`, release its boards, drop its
    /// request and any in-flight pending changes, then issue a power-off
    /// `PendingChange` per board it held so the hardware actually gets
    /// de-powered (`spec.md §4.5` scenario S6: "de-power PendingChanges
    /// equal to its former board count").
    async fn destroy_job(
        &self,
        job: JobId,
        reason: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;

    async fn board_reports(&self, board: BoardId) -> Result<Vec<BoardReport>>;
    async fn insert_board_report(&self, report: BoardReport) -> Result<BoardReportId>;
    async fn reported_boards_above(&self, threshold: u32) -> Result<Vec<BoardId>>;
    /// Boards this job has reported faulty on a previous placement attempt
    /// — excluded from the next retry (`spec.md §4.6`).
    async fn boards_reported_by_job(&self, job: JobId) -> Result<BTreeSet<BoardId>>;
}

#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Commit a placement: set job dims/root/size, mark each board
    /// allocated, delete the request, set state=POWER, numPending=|boards|.
    /// Atomic (`spec.md §4.4` step 2, §5 "allocator's allocation commit
    /// must be atomic across all boards of a job").
    async fn commit_placement(
        &self,
        job: JobId,
        placement: &PlacementResult,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;

    async fn deallocate_job(&self, job: JobId) -> Result<()>;

    async fn issue_pending_changes(&self, changes: &[PendingChange]) -> Result<()>;
    async fn outstanding_changes(&self, job: JobId) -> Result<Vec<PendingChange>>;
    /// Outstanding changes for one board, across whichever job currently
    /// owns it — what `BMPController::process_requests` actually scans
    /// (`spec.md §4.6`).
    async fn outstanding_changes_for_board(&self, board: BoardId) -> Result<Vec<PendingChange>>;
    async fn jobs_with_pending_changes(&self) -> Result<Vec<JobId>>;
    async fn count_pending_changes(&self, job: JobId) -> Result<i64>;
    async fn set_in_progress(&self, change: PendingChangeId, in_progress: bool) -> Result<()>;

    /// Delete a PendingChange and decrement `Job.numPending`; if the job is
    /// still `POWER` and `numPending` reaches zero with no pending
    /// failure, transition to `READY`. Atomic (`spec.md §4.6`).
    async fn finish_pending_change(&self, change: PendingChangeId, job: JobId) -> Result<JobState>;

    async fn powered_board_count(&self, job: JobId) -> Result<i64>;
    async fn count_powered(&self, machine: MachineId) -> Result<i64>;
    async fn board_connection_info(&self, job: JobId) -> Result<Vec<(BoardId, bool)>>;
    async fn root_coords(&self, job: JobId) -> Result<Option<TriadCoord>>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<User>;
    async fn get_group(&self, id: GroupId) -> Result<Group>;
    async fn groups_for_user(&self, user: UserId, machine: MachineId) -> Result<Vec<Group>>;
    async fn may_use_machine(&self, user: UserId, machine: MachineId) -> Result<bool>;

    async fn group_quota(&self, group: GroupId) -> Result<Quota>;
    async fn adjust_quota(&self, group: GroupId, delta_secs: i64) -> Result<()>;
    async fn mark_consolidated(&self, job: JobId) -> Result<()>;
    async fn consolidation_targets(&self) -> Result<Vec<JobId>>;

    async fn record_login(&self, user: UserId, success: bool) -> Result<()>;
    async fn set_locked(&self, user: UserId, locked: bool) -> Result<()>;
}

#[async_trait]
pub trait HistoricalStore: Send + Sync {
    /// Move destroyed jobs older than `older_than` to historical storage.
    /// Returns `(numJobs, numAllocations)` (`spec.md §4.4` `tombstone()`).
    async fn tombstone(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<(u64, u64)>;
}

/// Aggregate handle grouping every port — what `triad-alloc` actually
/// depends on, mirroring how `sem_os_postgres::PgStores` bundles its
/// adapters for `main.rs` to wire up.
pub trait Store: MachineStore + JobStore + AllocationStore + AccountStore + HistoricalStore {}
impl<T: MachineStore + JobStore + AllocationStore + AccountStore + HistoricalStore> Store for T {}
