//! End-to-end tests over the Allocator/JobSM/BMPController trio against an
//! in-memory sqlite store, exercising the scenarios in `spec.md §8`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use triad_core::config::{AllocatorConfig, TransceiverConfig};
use triad_core::error::AllocError;
use triad_core::ports::{AllocationStore, JobStore, MachineStore};
use triad_core::types::*;
use triad_store::SqliteStore;

use crate::{Allocator, BmpController, DummyTransport, JobSM};

async fn seed_machine(pool: &SqlitePool) -> (MachineId, BmpId, GroupId, UserId) {
    let machine: i64 = sqlx::query("INSERT INTO machines (name, width, height) VALUES ('spinn-test', 1, 1)")
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();

    let bmp: i64 = sqlx::query("INSERT INTO bmps (machine, address, cabinet, frame) VALUES (?, '10.0.0.1', 0, 0)")
        .bind(machine)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();

    for z in 0..3i64 {
        sqlx::query(
            "INSERT INTO boards (machine, triad_x, triad_y, triad_z, cabinet, frame, board_num, ip_address, bmp, root_chip_x, root_chip_y)
             VALUES (?, 0, 0, ?, 0, 0, ?, ?, ?, 0, 0)",
        )
        .bind(machine)
        .bind(z)
        .bind(z)
        .bind(format!("10.0.1.{z}"))
        .bind(bmp)
        .execute(pool)
        .await
        .unwrap();
    }

    let group: i64 = sqlx::query("INSERT INTO groups (name, quota_secs, group_type) VALUES ('default', NULL, 'internal')")
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();

    let user: i64 = sqlx::query("INSERT INTO users (name, is_internal) VALUES ('alice', 1)")
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid();

    sqlx::query("INSERT INTO user_groups (user_id, group_id) VALUES (?, ?)")
        .bind(user)
        .bind(group)
        .execute(pool)
        .await
        .unwrap();

    (machine, bmp, group, user)
}

async fn harness() -> (Arc<SqliteStore>, Arc<triad_core::topology::Topology>, MachineId, BmpId, GroupId, UserId) {
    let pool = triad_store::connect("sqlite::memory:", Duration::from_secs(5)).await.unwrap();
    let (machine, bmp, group, user) = seed_machine(&pool).await;
    let store = Arc::new(SqliteStore::new(pool));
    let topology = Arc::new(triad_store::load_topology(&store).await.unwrap());
    (store, topology, machine, bmp, group, user)
}

#[tokio::test]
async fn allocate_places_a_by_count_one_request() {
    let (store, topology, machine, _bmp, group, user) = harness().await;
    let jobsm = JobSM::new(Arc::clone(&store), AllocatorConfig::default());
    let allocator = Allocator::new(Arc::clone(&store), topology, AllocatorConfig::default());
    let _ = group;

    let job = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 1, max_dead: 0 }, Duration::from_secs(60), None)
        .await
        .unwrap();

    allocator.allocate().await.unwrap();

    let updated = store_job(&store, job).await;
    assert_eq!(updated.state, JobState::Power);
    assert_eq!(updated.allocation_size, Some(1));
}

#[tokio::test]
async fn allocate_bumps_importance_when_a_later_request_cannot_fit() {
    let (store, topology, _machine, _bmp, _group, user) = harness().await;
    let jobsm = JobSM::new(Arc::clone(&store), AllocatorConfig::default());
    let allocator = Allocator::new(Arc::clone(&store), topology, AllocatorConfig::default());

    // whole-triad job first, so it's processed ahead of the second by insertion order
    let whole_triad = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 3, max_dead: 0 }, Duration::from_secs(60), None)
        .await
        .unwrap();
    let leftover = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 1, max_dead: 0 }, Duration::from_secs(60), None)
        .await
        .unwrap();

    allocator.allocate().await.unwrap();

    assert_eq!(store_job(&store, whole_triad).await.state, JobState::Power);
    assert_eq!(store_job(&store, leftover).await.state, JobState::Queued);

    let outstanding = store.outstanding_requests(JobState::Queued).await.unwrap();
    let leftover_request = outstanding.iter().find(|r| r.job == leftover).unwrap();
    // base importance (internal user, Size shape, default scale) is 2.0;
    // a failed placement pass must have bumped it upward from there.
    assert!(leftover_request.importance > 2.0);
}

#[tokio::test]
async fn bmp_controller_drains_pending_changes_with_the_dummy_transport() {
    let (store, topology, machine, bmp, group, user) = harness().await;
    let jobsm = JobSM::new(Arc::clone(&store), AllocatorConfig::default());
    let allocator = Allocator::new(Arc::clone(&store), topology, AllocatorConfig::default());
    let _ = (machine, group);

    let job = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 3, max_dead: 0 }, Duration::from_secs(60), None)
        .await
        .unwrap();
    allocator.allocate().await.unwrap();
    assert_eq!(store_job(&store, job).await.state, JobState::Power);

    let transport: Arc<dyn crate::BmpTransport> = Arc::new(DummyTransport);
    let controller = BmpController::new(Arc::clone(&store), transport, bmp, TransceiverConfig::default(), AllocatorConfig::default());
    controller.process_requests(Duration::from_secs(1)).await.unwrap();

    let job_after = store_job(&store, job).await;
    assert_eq!(job_after.state, JobState::Ready);
    assert_eq!(job_after.num_pending, 0);

    let boards = store.all_boards(machine_of(&job_after)).await.unwrap();
    assert!(boards.iter().all(|b| b.powered));
}

#[tokio::test]
async fn jobsm_destroy_releases_boards_and_cancels_pending_changes() {
    let (store, topology, _machine, _bmp, _group, user) = harness().await;
    let jobsm = JobSM::new(Arc::clone(&store), AllocatorConfig::default());
    let allocator = Allocator::new(Arc::clone(&store), topology, AllocatorConfig::default());

    let job = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 3, max_dead: 0 }, Duration::from_secs(60), None)
        .await
        .unwrap();
    allocator.allocate().await.unwrap();
    assert_eq!(store_job(&store, job).await.state, JobState::Power);

    jobsm.destroy(job, "done").await.unwrap();

    let destroyed = store_job(&store, job).await;
    assert_eq!(destroyed.state, JobState::Destroyed);

    let boards = store.all_boards(machine_of(&destroyed)).await.unwrap();
    assert!(boards.iter().all(|b| b.allocated_job.is_none()));

    // destroy_job swaps pending power-on changes for de-power changes
    // rather than just cancelling them (spec.md scenario S6).
    let changes = store.outstanding_changes(job).await.unwrap();
    assert_eq!(changes.len(), boards.len());
    assert!(changes.iter().all(|c| c.power == PowerTarget::Off));
    assert_eq!(destroyed.num_pending, boards.len() as i32);
}

#[tokio::test]
async fn jobsm_create_job_rejects_exhausted_quota() {
    let pool = triad_store::connect("sqlite::memory:", Duration::from_secs(5)).await.unwrap();
    let (_machine, _bmp, group, user) = seed_machine(&pool).await;
    sqlx::query("UPDATE groups SET quota_secs = 0 WHERE id = ?")
        .bind(group)
        .execute(&pool)
        .await
        .unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    let jobsm = JobSM::new(Arc::clone(&store), AllocatorConfig::default());

    let result = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 1, max_dead: 0 }, Duration::from_secs(60), None)
        .await;
    assert!(matches!(result, Err(AllocError::QuotaExhausted(_))));
}

/// Always fails power-on immediately (non-retryable), to exercise
/// `BmpController`'s permanent-failure requeue path.
struct FailingTransport;

#[async_trait::async_trait]
impl crate::BmpTransport for FailingTransport {
    async fn set_power(&self, _board: &Board, _target: PowerTarget) -> Result<(), AllocError> {
        Err(AllocError::BmpPermanent("simulated hardware fault".into()))
    }

    async fn set_fpga_links(&self, _board: &Board, _fpga: FpgaLinks) -> Result<(), AllocError> {
        Ok(())
    }

    async fn wait_for_power_state(&self, _board: &Board, _target: PowerTarget, _timeout: Duration) -> Result<(), AllocError> {
        Ok(())
    }
}

#[tokio::test]
async fn bmp_permanent_failure_requeues_the_job_instead_of_leaving_it_stuck() {
    let (store, topology, machine, bmp, group, user) = harness().await;
    let jobsm = JobSM::new(Arc::clone(&store), AllocatorConfig::default());
    let allocator = Allocator::new(Arc::clone(&store), topology, AllocatorConfig::default());
    let _ = (machine, group);

    let job = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 3, max_dead: 0 }, Duration::from_secs(60), None)
        .await
        .unwrap();
    allocator.allocate().await.unwrap();
    assert_eq!(store_job(&store, job).await.state, JobState::Power);

    let transport: Arc<dyn crate::BmpTransport> = Arc::new(FailingTransport);
    let controller = BmpController::new(Arc::clone(&store), transport, bmp, TransceiverConfig::default(), AllocatorConfig::default());
    // process_requests must not bubble the permanent failure up and abort
    // the sweep over the rest of the BMP's boards.
    controller.process_requests(Duration::from_secs(1)).await.unwrap();

    let requeued = store_job(&store, job).await;
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.num_pending, 0);
    assert!(requeued.root_board.is_none());

    let boards = store.all_boards(machine_of(&requeued)).await.unwrap();
    assert!(boards.iter().all(|b| b.allocated_job.is_none()));

    let outstanding = store.outstanding_requests(JobState::Queued).await.unwrap();
    assert!(outstanding.iter().any(|r| r.job == job));

    // the faulty board must be excluded from the next placement attempt
    let excluded = store.boards_reported_by_job(job).await.unwrap();
    assert!(!excluded.is_empty());
}

#[tokio::test]
async fn where_is_resolves_job_relative_coordinates() {
    let (store, topology, _machine, _bmp, _group, user) = harness().await;
    let jobsm = JobSM::new(Arc::clone(&store), AllocatorConfig::default());
    let allocator = Allocator::new(Arc::clone(&store), topology, AllocatorConfig::default());

    let job = jobsm
        .create_job("spinn-test", user, None, JobRequest::ByCount { n: 1, max_dead: 0 }, Duration::from_secs(60), None)
        .await
        .unwrap();
    allocator.allocate().await.unwrap();
    let placed = store_job(&store, job).await;
    let root_board = store.get_board(placed.root_board.unwrap()).await.unwrap();

    let (chip_x, chip_y) = (root_board.root_chip.0 + 1, root_board.root_chip.1 + 2);
    let location = jobsm.where_is(job, chip_x, chip_y).await.unwrap();

    assert_eq!(location.board, root_board.id);
    assert_eq!(location.job_relative_x, 1);
    assert_eq!(location.job_relative_y, 2);
}

async fn store_job(store: &SqliteStore, job: JobId) -> Job {
    store.get_job(job).await.unwrap()
}

fn machine_of(job: &Job) -> MachineId {
    job.machine
}
