//! Integration tests against an in-memory sqlite pool, matching `spec.md
//! §8` property 7's "empty in-memory instance" baseline.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use triad_core::error::AllocError;
use triad_core::ports::*;
use triad_core::types::*;

use crate::{connect, SqliteStore};

async fn memory_store() -> SqliteStore {
    let pool = connect("sqlite::memory:", Duration::from_secs(5)).await.unwrap();
    SqliteStore::new(pool)
}

/// Seed one 1x1-triad machine (boards 1,2,3 at (0,0,{0,1,2})), one bmp, one
/// group and one user. Mirrors `triad_core::placement::tests::one_triad_machine`
/// but goes through real INSERTs instead of in-memory structs.
async fn seed_one_triad_machine(pool: &SqlitePool) -> (MachineId, BmpId, GroupId, UserId) {
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

    (machine, bmp, group, user)
}

#[tokio::test]
async fn connect_creates_schema_and_starts_empty() {
    let store = memory_store().await;
    assert!(store.list_machines().await.unwrap().is_empty());
}

#[tokio::test]
async fn boards_round_trip_through_the_store() {
    let store = memory_store().await;
    let (machine, bmp, _group, _user) = seed_one_triad_machine(store.pool()).await;

    let all = store.all_boards(machine).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|b| b.enabled && !b.powered));

    let live = store.live_boards(machine).await.unwrap();
    assert_eq!(live.len(), 3);

    let via_bmp = store.boards_for_bmp(bmp).await.unwrap();
    assert_eq!(via_bmp.len(), 3);

    let found = store
        .find_board(machine, BoardQuery::Triad(TriadCoord { x: 0, y: 0, z: 1 }))
        .await
        .unwrap();
    assert_eq!(found.triad.z, 1);
}

#[tokio::test]
async fn outstanding_requests_are_ordered_by_importance_descending() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;

    let low_job = store
        .insert_job(machine, user, group, Duration::from_secs(60), None)
        .await
        .unwrap();
    store
        .insert_request(low_job, JobRequest::ByCount { n: 1, max_dead: 0 }, 1.0)
        .await
        .unwrap();

    let high_job = store
        .insert_job(machine, user, group, Duration::from_secs(60), None)
        .await
        .unwrap();
    store
        .insert_request(high_job, JobRequest::ByCount { n: 1, max_dead: 0 }, 65.0)
        .await
        .unwrap();

    let outstanding = store.outstanding_requests(JobState::Queued).await.unwrap();
    assert_eq!(outstanding.len(), 2);
    assert_eq!(outstanding[0].job, high_job);
    assert_eq!(outstanding[1].job, low_job);
}

#[tokio::test]
async fn commit_placement_rejects_an_already_allocated_board() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;
    let boards = store.all_boards(machine).await.unwrap();
    let board_ids: std::collections::BTreeSet<BoardId> = boards.iter().map(|b| b.id).collect();

    let job_a = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();
    let job_b = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();

    let placement = PlacementResult {
        root_board: *board_ids.iter().next().unwrap(),
        width: 1,
        height: 1,
        depth: 3,
        boards: board_ids.clone(),
    };
    store.commit_placement(job_a, &placement, Utc::now()).await.unwrap();

    let conflict = store.commit_placement(job_b, &placement, Utc::now()).await;
    assert!(matches!(conflict, Err(AllocError::Conflict(_))));

    // job_b must be untouched by the rolled-back transaction.
    let job_b_row = store.get_job(job_b).await.unwrap();
    assert!(job_b_row.root_board.is_none());
}

#[tokio::test]
async fn finish_pending_change_transitions_power_to_ready_once_drained() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;
    let boards = store.all_boards(machine).await.unwrap();
    let board_ids: std::collections::BTreeSet<BoardId> = boards.iter().map(|b| b.id).collect();

    let job = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();
    let placement = PlacementResult {
        root_board: *board_ids.iter().next().unwrap(),
        width: 1,
        height: 1,
        depth: 3,
        boards: board_ids.clone(),
    };
    store.commit_placement(job, &placement, Utc::now()).await.unwrap();
    assert_eq!(store.get_job(job).await.unwrap().state, JobState::Power);

    let changes: Vec<PendingChange> = board_ids
        .iter()
        .map(|&board| PendingChange {
            id: 0,
            job,
            board,
            from_state: JobState::Queued,
            to_state: JobState::Power,
            power: PowerTarget::On,
            fpga: FpgaLinks::default(),
            in_progress: false,
        })
        .collect();
    store.issue_pending_changes(&changes).await.unwrap();

    let outstanding = store.outstanding_changes(job).await.unwrap();
    assert_eq!(outstanding.len(), 3);

    let mut last_state = JobState::Power;
    for change in &outstanding {
        last_state = store.finish_pending_change(change.id, job).await.unwrap();
    }
    assert_eq!(last_state, JobState::Ready);
    assert_eq!(store.get_job(job).await.unwrap().state, JobState::Ready);
}

#[tokio::test]
async fn tombstone_moves_destroyed_jobs_into_history() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;

    let job = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();
    store.destroy_job(job, "test teardown", Utc::now()).await.unwrap();

    let (jobs, _allocations) = store.tombstone(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
    assert_eq!(jobs, 1);
    assert!(store.get_job(job).await.is_err());
}

#[tokio::test]
async fn find_board_resolves_chip_coordinates_to_the_owning_board() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;
    let boards = store.all_boards(machine).await.unwrap();
    let board_ids: std::collections::BTreeSet<BoardId> = boards.iter().map(|b| b.id).collect();
    let root_board = *board_ids.iter().next().unwrap();

    let job = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();
    let placement = PlacementResult {
        root_board,
        width: 1,
        height: 1,
        depth: 3,
        boards: board_ids.clone(),
    };
    store.commit_placement(job, &placement, Utc::now()).await.unwrap();

    let via_machine = store
        .find_board(machine, BoardQuery::MachineChip { chip_x: 3, chip_y: 4 })
        .await
        .unwrap();
    assert_eq!(via_machine.id, root_board);

    let via_job = store
        .find_board(machine, BoardQuery::JobChip { job, chip_x: 3, chip_y: 4 })
        .await
        .unwrap();
    assert_eq!(via_job.id, root_board);

    // a chip far outside every board's 8x8 footprint belongs to nobody
    let missing = store
        .find_board(machine, BoardQuery::MachineChip { chip_x: 999, chip_y: 999 })
        .await;
    assert!(matches!(missing, Err(AllocError::NoSuchBoard(_))));
}

#[tokio::test]
async fn requeue_job_for_retry_resets_state_and_reinserts_the_request() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;
    let boards = store.all_boards(machine).await.unwrap();
    let board_ids: std::collections::BTreeSet<BoardId> = boards.iter().map(|b| b.id).collect();

    let job = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();
    store
        .insert_request(job, JobRequest::ByCount { n: 3, max_dead: 0 }, 2.0)
        .await
        .unwrap();

    let placement = PlacementResult {
        root_board: *board_ids.iter().next().unwrap(),
        width: 1,
        height: 1,
        depth: 3,
        boards: board_ids.clone(),
    };
    store.commit_placement(job, &placement, Utc::now()).await.unwrap();
    assert_eq!(store.get_job(job).await.unwrap().state, JobState::Power);

    store
        .requeue_job_for_retry(job, 2.0, &triad_core::config::PriorityScale::default(), 10_000.0)
        .await
        .unwrap();

    let requeued = store.get_job(job).await.unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.num_pending, 0);
    assert!(requeued.root_board.is_none());
    assert!(store.outstanding_changes(job).await.unwrap().is_empty());

    let boards_after = store.all_boards(machine).await.unwrap();
    assert!(boards_after.iter().all(|b| b.allocated_job.is_none()));

    let outstanding = store.outstanding_requests(JobState::Queued).await.unwrap();
    let req = outstanding.iter().find(|r| r.job == job).unwrap();
    assert!(matches!(req.request, JobRequest::ByCount { n: 3, .. }));
}

#[tokio::test]
async fn destroy_job_issues_a_depower_change_per_former_board() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;
    let boards = store.all_boards(machine).await.unwrap();
    let board_ids: std::collections::BTreeSet<BoardId> = boards.iter().map(|b| b.id).collect();

    let job = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();
    let placement = PlacementResult {
        root_board: *board_ids.iter().next().unwrap(),
        width: 1,
        height: 1,
        depth: 3,
        boards: board_ids.clone(),
    };
    store.commit_placement(job, &placement, Utc::now()).await.unwrap();

    store.destroy_job(job, "no longer needed", Utc::now()).await.unwrap();

    let destroyed = store.get_job(job).await.unwrap();
    assert_eq!(destroyed.state, JobState::Destroyed);
    assert_eq!(destroyed.num_pending, board_ids.len() as i32);

    let changes = store.outstanding_changes(job).await.unwrap();
    assert_eq!(changes.len(), board_ids.len());
    assert!(changes.iter().all(|c| c.power == PowerTarget::Off));
}

#[tokio::test]
async fn boards_reported_by_job_is_used_to_exclude_on_retry() {
    let store = memory_store().await;
    let (machine, _bmp, group, user) = seed_one_triad_machine(store.pool()).await;
    let boards = store.all_boards(machine).await.unwrap();
    let bad_board = boards[0].id;

    let job = store.insert_job(machine, user, group, Duration::from_secs(60), None).await.unwrap();
    store
        .insert_board_report(BoardReport {
            id: 0,
            board: bad_board,
            job: Some(job),
            reporter: user,
            issue: "power-on failed".into(),
            ts: Utc::now(),
        })
        .await
        .unwrap();

    let reported = store.boards_reported_by_job(job).await.unwrap();
    assert!(reported.contains(&bad_board));

    let reported_other_job = store.boards_reported_by_job(job + 1).await.unwrap();
    assert!(reported_other_job.is_empty());
}
