//! Sqlite adapters for the `triad_core::ports` traits.
//!
//! Each method is plain `sqlx::query`/`query_as` (runtime-checked, not the
//! `query!` macro) exactly as `sem_os_postgres::store` does it, so this
//! crate never needs a live database at compile time.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use triad_core::config::PriorityScale;
use triad_core::error::{AllocError, Result};
use triad_core::importance::{importance as calc_importance, RequestShape};
use triad_core::ports::*;
use triad_core::types::*;

use crate::sqlx_types::*;

/// Single adapter over one sqlite pool, implementing every store port.
/// Sqlite has no useful notion of per-table adapters the way postgres
/// does when several backends coexist, so (unlike `PgStores`, which
/// bundles N newtypes) this is one newtype implementing all five traits.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_machine(row: &sqlx::sqlite::SqliteRow) -> Machine {
    Machine {
        id: row.get("id"),
        name: row.get("name"),
        width: row.get("width"),
        height: row.get("height"),
        depth: 3,
        tags: parse_tags(row.get::<String, _>("tags").as_str()),
        in_service: row.get::<i64, _>("in_service") != 0,
        wrap_horizontal: row.get::<i64, _>("wrap_horizontal") != 0,
        wrap_vertical: row.get::<i64, _>("wrap_vertical") != 0,
    }
}

fn row_to_board(row: &sqlx::sqlite::SqliteRow) -> Board {
    Board {
        id: row.get("id"),
        machine: row.get("machine"),
        triad: TriadCoord {
            x: row.get("triad_x"),
            y: row.get("triad_y"),
            z: row.get::<i64, _>("triad_z") as u8,
        },
        physical: PhysicalCoord {
            cabinet: row.get("cabinet"),
            frame: row.get("frame"),
            board_num: row.get("board_num"),
        },
        ip_address: row.get("ip_address"),
        bmp: row.get("bmp"),
        root_chip: (row.get("root_chip_x"), row.get("root_chip_y")),
        enabled: row.get::<i64, _>("enabled") != 0,
        powered: row.get::<i64, _>("powered") != 0,
        last_power_on: row.get::<Option<DateTime<Utc>>, _>("last_power_on"),
        last_power_off: row.get::<Option<DateTime<Utc>>, _>("last_power_off"),
        allocated_job: row.get::<Option<i64>, _>("allocated_job"),
    }
}

fn row_to_bmp(row: &sqlx::sqlite::SqliteRow) -> Bmp {
    Bmp {
        id: row.get("id"),
        machine: row.get("machine"),
        address: row.get("address"),
        cabinet: row.get("cabinet"),
        frame: row.get("frame"),
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
    Job {
        id: row.get("id"),
        machine: row.get("machine"),
        owner: row.get("owner"),
        group: row.get("grp"),
        state: parse_job_state(row.get::<String, _>("state").as_str()),
        create_ts: row.get("create_ts"),
        keepalive_interval: Duration::from_secs(row.get::<i64, _>("keepalive_interval_secs") as u64),
        keepalive_ts: row.get("keepalive_ts"),
        keepalive_host: row.get("keepalive_host"),
        width: row.get("width"),
        height: row.get("height"),
        depth: row.get::<Option<i64>, _>("depth").map(|d| d as u8),
        root_board: row.get("root_board"),
        original_request: row.get("original_request"),
        death_reason: row.get("death_reason"),
        death_ts: row.get("death_ts"),
        num_pending: row.get("num_pending"),
        allocation_ts: row.get("allocation_ts"),
        allocation_size: row.get("allocation_size"),
        consolidated: row.get::<i64, _>("consolidated") != 0,
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        id: row.get("id"),
        name: row.get("name"),
        trust_level: row.get("trust_level"),
        disabled: row.get::<i64, _>("disabled") != 0,
        locked: row.get::<i64, _>("locked") != 0,
        open_id_subject: row.get("open_id_subject"),
        has_password: row.get::<Option<String>, _>("password_hash").is_some(),
        is_internal: row.get::<i64, _>("is_internal") != 0,
    }
}

fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> Group {
    Group {
        id: row.get("id"),
        name: row.get("name"),
        quota: parse_quota(row.get::<Option<i64>, _>("quota_secs")),
        group_type: parse_group_type(row.get::<String, _>("group_type").as_str()),
    }
}

fn row_to_report(row: &sqlx::sqlite::SqliteRow) -> BoardReport {
    BoardReport {
        id: row.get("id"),
        board: row.get("board"),
        job: row.get("job"),
        reporter: row.get("reporter"),
        issue: row.get("issue"),
        ts: row.get("ts"),
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> AllocError {
    AllocError::NoSuchMachine(format!("{what} {id} not found"))
}

#[async_trait]
impl MachineStore for SqliteStore {
    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let rows = sqlx::query("SELECT * FROM machines ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_machine).collect())
    }

    async fn get_machine(&self, id: MachineId) -> Result<Machine> {
        let row = sqlx::query("SELECT * FROM machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AllocError::NoSuchMachine(id.to_string()))?;
        Ok(row_to_machine(&row))
    }

    async fn get_machine_by_name(&self, name: &str) -> Result<Machine> {
        let row = sqlx::query("SELECT * FROM machines WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AllocError::NoSuchMachine(name.to_string()))?;
        Ok(row_to_machine(&row))
    }

    async fn set_in_service(&self, machine: MachineId, in_service: bool) -> Result<()> {
        sqlx::query("UPDATE machines SET in_service = ? WHERE id = ?")
            .bind(in_service as i64)
            .bind(machine)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn all_boards(&self, machine: MachineId) -> Result<Vec<Board>> {
        let rows = sqlx::query("SELECT * FROM boards WHERE machine = ? ORDER BY id")
            .bind(machine)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_board).collect())
    }

    async fn live_boards(&self, machine: MachineId) -> Result<Vec<Board>> {
        let rows = sqlx::query("SELECT * FROM boards WHERE machine = ? AND enabled = 1 ORDER BY id")
            .bind(machine)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_board).collect())
    }

    async fn dead_boards(&self, machine: MachineId) -> Result<Vec<Board>> {
        let rows = sqlx::query("SELECT * FROM boards WHERE machine = ? AND enabled = 0 ORDER BY id")
            .bind(machine)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_board).collect())
    }

    async fn available_boards(&self, machine: MachineId) -> Result<Vec<Board>> {
        let rows = sqlx::query(
            "SELECT * FROM boards WHERE machine = ? AND enabled = 1 AND allocated_job IS NULL ORDER BY id",
        )
        .bind(machine)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().map(row_to_board).collect())
    }

    async fn boards_for_bmp(&self, bmp: BmpId) -> Result<Vec<Board>> {
        let rows = sqlx::query("SELECT * FROM boards WHERE bmp = ? ORDER BY id")
            .bind(bmp)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_board).collect())
    }

    async fn all_links(&self, machine: MachineId) -> Result<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT l.* FROM links l JOIN boards b ON b.id = l.board_a WHERE b.machine = ?",
        )
        .bind(machine)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows
            .iter()
            .map(|row| Link {
                board_a: row.get("board_a"),
                direction_a: parse_direction(row.get::<String, _>("direction_a").as_str()),
                board_b: row.get("board_b"),
                live: row.get::<i64, _>("live") != 0,
            })
            .collect())
    }

    async fn bmp(&self, id: BmpId) -> Result<Bmp> {
        let row = sqlx::query("SELECT * FROM bmps WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| not_found("bmp", id))?;
        Ok(row_to_bmp(&row))
    }

    async fn bmps_for_machine(&self, machine: MachineId) -> Result<Vec<Bmp>> {
        let rows = sqlx::query("SELECT * FROM bmps WHERE machine = ? ORDER BY id")
            .bind(machine)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_bmp).collect())
    }

    async fn get_board(&self, id: BoardId) -> Result<Board> {
        let row = sqlx::query("SELECT * FROM boards WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AllocError::NoSuchBoard(id.to_string()))?;
        Ok(row_to_board(&row))
    }

    async fn find_board(&self, machine: MachineId, query: BoardQuery) -> Result<Board> {
        match query {
            BoardQuery::Triad(t) => {
                let row = sqlx::query("SELECT * FROM boards WHERE machine = ? AND triad_x = ? AND triad_y = ? AND triad_z = ?")
                    .bind(machine)
                    .bind(t.x)
                    .bind(t.y)
                    .bind(t.z as i64)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_err)?
                    .ok_or_else(|| AllocError::NoSuchBoard(format!("triad {:?} on machine {machine}", (t.x, t.y, t.z))))?;
                Ok(row_to_board(&row))
            }
            BoardQuery::Physical(p) => {
                let row = sqlx::query("SELECT * FROM boards WHERE machine = ? AND cabinet = ? AND frame = ? AND board_num = ?")
                    .bind(machine)
                    .bind(p.cabinet)
                    .bind(p.frame)
                    .bind(p.board_num)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_err)?
                    .ok_or_else(|| AllocError::NoSuchBoard(format!("physical {:?} on machine {machine}", (p.cabinet, p.frame, p.board_num))))?;
                Ok(row_to_board(&row))
            }
            BoardQuery::Ip(ip) => {
                let row = sqlx::query("SELECT * FROM boards WHERE machine = ? AND ip_address = ?")
                    .bind(machine)
                    .bind(&ip)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_err)?
                    .ok_or_else(|| AllocError::NoSuchBoard(format!("ip {ip} on machine {machine}")))?;
                Ok(row_to_board(&row))
            }
            BoardQuery::JobChip { job, chip_x, chip_y } => {
                let rows = sqlx::query("SELECT * FROM boards WHERE allocated_job = ? ORDER BY id")
                    .bind(job)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(store_err)?;
                rows.iter()
                    .map(row_to_board)
                    .find(|b| b.contains_chip(chip_x, chip_y))
                    .ok_or_else(|| AllocError::NoSuchBoard(format!("chip ({chip_x},{chip_y}) not part of job {job}")))
            }
            BoardQuery::MachineChip { chip_x, chip_y } => {
                let rows = sqlx::query("SELECT * FROM boards WHERE machine = ? ORDER BY id")
                    .bind(machine)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(store_err)?;
                rows.iter()
                    .map(row_to_board)
                    .find(|b| b.contains_chip(chip_x, chip_y))
                    .ok_or_else(|| AllocError::NoSuchBoard(format!("no board at chip ({chip_x},{chip_y}) on machine {machine}")))
            }
        }
    }

    async fn free_board(&self, machine: MachineId) -> Result<Option<Board>> {
        let row = sqlx::query(
            "SELECT * FROM boards WHERE machine = ? AND enabled = 1 AND allocated_job IS NULL ORDER BY id LIMIT 1",
        )
        .bind(machine)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.as_ref().map(row_to_board))
    }

    async fn set_board_enabled(&self, board: BoardId, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE boards SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(board)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_board_power(&self, board: BoardId, powered: bool, at: DateTime<Utc>) -> Result<()> {
        if powered {
            sqlx::query("UPDATE boards SET powered = 1, last_power_on = ? WHERE id = ?")
                .bind(at)
                .bind(board)
                .execute(&self.pool)
                .await
        } else {
            sqlx::query("UPDATE boards SET powered = 0, last_power_off = ? WHERE id = ?")
                .bind(at)
                .bind(board)
                .execute(&self.pool)
                .await
        }
        .map_err(store_err)?;
        Ok(())
    }

    async fn counts(&self, machine: MachineId) -> Result<MachineCounts> {
        let board_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM boards WHERE machine = ?")
            .bind(machine)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM boards WHERE machine = ? AND allocated_job IS NOT NULL")
            .bind(machine)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        let num_jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE machine = ? AND state != 'DESTROYED'")
            .bind(machine)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(MachineCounts { board_count, in_use, num_jobs })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(
        &self,
        machine: MachineId,
        owner: UserId,
        group: GroupId,
        keepalive_interval: Duration,
        original_request: Option<Vec<u8>>,
    ) -> Result<JobId> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO jobs (machine, owner, grp, state, create_ts, keepalive_interval_secs, keepalive_ts, original_request, num_pending, consolidated)
             VALUES (?, ?, ?, 'QUEUED', ?, ?, ?, ?, 0, 0)",
        )
        .bind(machine)
        .bind(owner)
        .bind(group)
        .bind(now)
        .bind(keepalive_interval.as_secs() as i64)
        .bind(now)
        .bind(original_request)
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .last_insert_rowid();
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or(AllocError::NoSuchJob(id))?;
        Ok(row_to_job(&row))
    }

    async fn list_job_ids(&self, page: Page) -> Result<Vec<JobId>> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT id FROM jobs ORDER BY id LIMIT ? OFFSET ?")
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows)
    }

    async fn list_live_job_ids(&self, page: Page) -> Result<Vec<JobId>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE state != 'DESTROYED' ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows)
    }

    async fn list_live_jobs(&self, machine: Option<MachineId>) -> Result<Vec<Job>> {
        let rows = match machine {
            Some(m) => {
                sqlx::query("SELECT * FROM jobs WHERE state != 'DESTROYED' AND machine = ? ORDER BY id")
                    .bind(m)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs WHERE state != 'DESTROYED' ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn job_boards(&self, job: JobId) -> Result<BTreeSet<BoardId>> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT id FROM boards WHERE allocated_job = ?")
            .bind(job)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_request(&self, job: JobId, request: JobRequest, importance: f64) -> Result<RequestId> {
        // Keep a snapshot on the job row itself — `requests` rows are
        // deleted once a placement commits, but `requeue_job_for_retry`
        // needs the original shape back if the hardware later fails it.
        let snapshot = serde_json::to_vec(&request)
            .map_err(|e| AllocError::InternalInvariantViolated(format!("failed to snapshot request: {e}")))?;
        sqlx::query("UPDATE jobs SET original_request = ? WHERE id = ?")
            .bind(&snapshot)
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        let (kind, n, w, h, max_dead, lk, lv) = match request {
            JobRequest::ByCount { n, max_dead } => ("count", Some(n), None, None, Some(max_dead), None, None),
            JobRequest::ByRect { w, h, max_dead } => ("rect", None, Some(w), Some(h), Some(max_dead), None, None),
            JobRequest::ByBoard(locator) => {
                let (lk, lv) = encode_locator(&locator);
                ("board", None, None, None, None, Some(lk), Some(lv))
            }
        };
        let id = sqlx::query(
            "INSERT INTO requests (job, kind, n, w, h, max_dead, board_locator_kind, board_locator_value, importance)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job)
        .bind(kind)
        .bind(n)
        .bind(w)
        .bind(h)
        .bind(max_dead)
        .bind(lk)
        .bind(lv)
        .bind(importance)
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .last_insert_rowid();
        Ok(id)
    }

    async fn delete_request(&self, job: JobId) -> Result<()> {
        sqlx::query("DELETE FROM requests WHERE job = ?")
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn outstanding_requests(&self, state: JobState) -> Result<Vec<OutstandingRequest>> {
        let rows = sqlx::query(
            "SELECT r.*, j.machine, j.grp FROM requests r
             JOIN jobs j ON j.id = r.job
             WHERE j.state = ?
             ORDER BY r.importance DESC, r.id ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let request = match kind.as_str() {
                    "count" => JobRequest::ByCount {
                        n: row.get("n"),
                        max_dead: row.get("max_dead"),
                    },
                    "rect" => JobRequest::ByRect {
                        w: row.get("w"),
                        h: row.get("h"),
                        max_dead: row.get("max_dead"),
                    },
                    "board" => JobRequest::ByBoard(decode_locator(
                        row.get::<String, _>("board_locator_kind").as_str(),
                        row.get::<String, _>("board_locator_value").as_str(),
                    )?),
                    other => return Err(AllocError::InternalInvariantViolated(format!("unknown request kind {other}"))),
                };
                Ok(OutstandingRequest {
                    request_id: row.get("id"),
                    job: row.get("job"),
                    machine: row.get("machine"),
                    group: row.get("grp"),
                    request,
                    importance: row.get("importance"),
                })
            })
            .collect()
    }

    async fn bump_importance(&self, request: RequestId, delta: f64, cap: f64) -> Result<()> {
        sqlx::query("UPDATE requests SET importance = MIN(importance + ?, ?) WHERE id = ?")
            .bind(delta)
            .bind(cap)
            .bind(request)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_keepalive(&self, job: JobId, host: Option<String>, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE jobs SET keepalive_ts = ?, keepalive_host = ? WHERE id = ?")
            .bind(at)
            .bind(host)
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn find_expired_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM jobs
             WHERE state != 'DESTROYED'
               AND datetime(keepalive_ts, '+' || keepalive_interval_secs || ' seconds') < datetime(?)",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows)
    }

    async fn set_job_state(&self, job: JobId, state: JobState) -> Result<()> {
        sqlx::query("UPDATE jobs SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn destroy_job(&self, job: JobId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let board_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM boards WHERE allocated_job = ? ORDER BY id")
            .bind(job)
            .fetch_all(&mut *tx)
            .await
            .map_err(store_err)?;

        sqlx::query("UPDATE jobs SET state = 'DESTROYED', death_reason = ?, death_ts = ?, num_pending = ? WHERE id = ?")
            .bind(reason)
            .bind(at)
            .bind(board_ids.len() as i64)
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("UPDATE boards SET allocated_job = NULL WHERE allocated_job = ?")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM requests WHERE job = ?")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM pending_changes WHERE job = ?")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        // De-power the hardware rather than just releasing it in software
        // (`spec.md §4.5` scenario S6: one de-power change per former board).
        for board in board_ids {
            sqlx::query(
                "INSERT INTO pending_changes
                    (job, board, from_state, to_state, power, fpga_north, fpga_south, fpga_east, fpga_west, fpga_nw, fpga_se, in_progress)
                 VALUES (?, ?, 'POWER', 'DESTROYED', 'off', 0, 0, 0, 0, 0, 0, 0)",
            )
            .bind(job)
            .bind(board)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn requeue_job_for_retry(
        &self,
        job: JobId,
        base_priority: f64,
        priority_scale: &PriorityScale,
        importance_span: f64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query("UPDATE boards SET allocated_job = NULL WHERE allocated_job = ?")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM pending_changes WHERE job = ?")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query(
            "UPDATE jobs SET state = 'QUEUED', num_pending = 0, root_board = NULL, width = NULL,
                    height = NULL, depth = NULL, allocation_ts = NULL, allocation_size = NULL
             WHERE id = ?",
        )
        .bind(job)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let snapshot: Option<Vec<u8>> = sqlx::query_scalar("SELECT original_request FROM jobs WHERE id = ?")
            .bind(job)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_err)?;
        let snapshot = snapshot
            .ok_or_else(|| AllocError::InternalInvariantViolated(format!("job {job} has no request snapshot to retry")))?;
        let request: JobRequest = serde_json::from_slice(&snapshot)
            .map_err(|e| AllocError::InternalInvariantViolated(format!("corrupt request snapshot for job {job}: {e}")))?;

        let shape = match &request {
            JobRequest::ByCount { .. } => RequestShape::Size,
            JobRequest::ByRect { .. } => RequestShape::Dimensions,
            JobRequest::ByBoard(_) => RequestShape::SpecificBoard,
        };
        let new_importance = calc_importance(base_priority, shape, 0.0, priority_scale, importance_span);

        let (kind, n, w, h, max_dead, lk, lv) = match &request {
            JobRequest::ByCount { n, max_dead } => ("count", Some(*n), None, None, Some(*max_dead), None, None),
            JobRequest::ByRect { w, h, max_dead } => ("rect", None, Some(*w), Some(*h), Some(*max_dead), None, None),
            JobRequest::ByBoard(locator) => {
                let (lk, lv) = encode_locator(locator);
                ("board", None, None, None, None, Some(lk), Some(lv))
            }
        };
        sqlx::query(
            "INSERT INTO requests (job, kind, n, w, h, max_dead, board_locator_kind, board_locator_value, importance)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job)
        .bind(kind)
        .bind(n)
        .bind(w)
        .bind(h)
        .bind(max_dead)
        .bind(lk)
        .bind(lv)
        .bind(new_importance)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn board_reports(&self, board: BoardId) -> Result<Vec<BoardReport>> {
        let rows = sqlx::query("SELECT * FROM board_reports WHERE board = ? ORDER BY ts")
            .bind(board)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_report).collect())
    }

    async fn insert_board_report(&self, report: BoardReport) -> Result<BoardReportId> {
        let id = sqlx::query(
            "INSERT INTO board_reports (board, job, reporter, issue, ts) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(report.board)
        .bind(report.job)
        .bind(report.reporter)
        .bind(&report.issue)
        .bind(report.ts)
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .last_insert_rowid();
        Ok(id)
    }

    async fn reported_boards_above(&self, threshold: u32) -> Result<Vec<BoardId>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT board FROM board_reports GROUP BY board HAVING COUNT(*) >= ?",
        )
        .bind(threshold as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows)
    }

    async fn boards_reported_by_job(&self, job: JobId) -> Result<BTreeSet<BoardId>> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT board FROM board_reports WHERE job = ?")
            .bind(job)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().collect())
    }
}

fn encode_locator(locator: &BoardLocator) -> (&'static str, String) {
    match locator {
        BoardLocator::Id(id) => ("id", id.to_string()),
        BoardLocator::Triad(t) => ("triad", format!("{},{},{}", t.x, t.y, t.z)),
        BoardLocator::Physical(p) => ("physical", format!("{},{},{}", p.cabinet, p.frame, p.board_num)),
        BoardLocator::Ip(ip) => ("ip", ip.clone()),
    }
}

fn decode_locator(kind: &str, value: &str) -> Result<BoardLocator> {
    match kind {
        "id" => value
            .parse()
            .map(BoardLocator::Id)
            .map_err(|_| AllocError::InternalInvariantViolated(format!("bad board id locator {value}"))),
        "triad" => {
            let parts: Vec<i64> = value.split(',').filter_map(|s| s.parse().ok()).collect();
            if let [x, y, z] = parts[..] {
                Ok(BoardLocator::Triad(TriadCoord { x: x as i32, y: y as i32, z: z as u8 }))
            } else {
                Err(AllocError::InternalInvariantViolated(format!("bad triad locator {value}")))
            }
        }
        "physical" => {
            let parts: Vec<i32> = value.split(',').filter_map(|s| s.parse().ok()).collect();
            if let [cabinet, frame, board_num] = parts[..] {
                Ok(BoardLocator::Physical(PhysicalCoord { cabinet, frame, board_num }))
            } else {
                Err(AllocError::InternalInvariantViolated(format!("bad physical locator {value}")))
            }
        }
        "ip" => Ok(BoardLocator::Ip(value.to_string())),
        other => Err(AllocError::InternalInvariantViolated(format!("unknown locator kind {other}"))),
    }
}

#[async_trait]
impl AllocationStore for SqliteStore {
    async fn commit_placement(&self, job: JobId, placement: &PlacementResult, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            "UPDATE jobs SET width = ?, height = ?, depth = ?, root_board = ?, state = 'POWER',
                    num_pending = ?, allocation_ts = ?, allocation_size = ? WHERE id = ?",
        )
        .bind(placement.width)
        .bind(placement.height)
        .bind(placement.depth as i64)
        .bind(placement.root_board)
        .bind(placement.boards.len() as i64)
        .bind(at)
        .bind(placement.boards.len() as i64)
        .bind(job)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        for &board in &placement.boards {
            let result = sqlx::query(
                "UPDATE boards SET allocated_job = ? WHERE id = ? AND allocated_job IS NULL",
            )
            .bind(job)
            .bind(board)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            if result.rows_affected() == 0 {
                tx.rollback().await.map_err(store_err)?;
                return Err(AllocError::Conflict(format!("board {board} already allocated")));
            }
        }
        sqlx::query("DELETE FROM requests WHERE job = ?")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn deallocate_job(&self, job: JobId) -> Result<()> {
        sqlx::query("UPDATE boards SET allocated_job = NULL WHERE allocated_job = ?")
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn issue_pending_changes(&self, changes: &[PendingChange]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        for c in changes {
            sqlx::query(
                "INSERT INTO pending_changes
                    (job, board, from_state, to_state, power, fpga_north, fpga_south, fpga_east, fpga_west, fpga_nw, fpga_se, in_progress)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            )
            .bind(c.job)
            .bind(c.board)
            .bind(encode_job_state(c.from_state))
            .bind(encode_job_state(c.to_state))
            .bind(encode_power_target(c.power))
            .bind(c.fpga.north as i64)
            .bind(c.fpga.south as i64)
            .bind(c.fpga.east as i64)
            .bind(c.fpga.west as i64)
            .bind(c.fpga.nw as i64)
            .bind(c.fpga.se as i64)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn outstanding_changes(&self, job: JobId) -> Result<Vec<PendingChange>> {
        let rows = sqlx::query("SELECT * FROM pending_changes WHERE job = ? AND in_progress = 0 ORDER BY id")
            .bind(job)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_pending_change).collect())
    }

    async fn outstanding_changes_for_board(&self, board: BoardId) -> Result<Vec<PendingChange>> {
        let rows = sqlx::query("SELECT * FROM pending_changes WHERE board = ? AND in_progress = 0 ORDER BY id")
            .bind(board)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_pending_change).collect())
    }

    async fn jobs_with_pending_changes(&self) -> Result<Vec<JobId>> {
        let rows: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT job FROM pending_changes WHERE in_progress = 0")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows)
    }

    async fn count_pending_changes(&self, job: JobId) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_changes WHERE job = ?")
            .bind(job)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn set_in_progress(&self, change: PendingChangeId, in_progress: bool) -> Result<()> {
        sqlx::query("UPDATE pending_changes SET in_progress = ? WHERE id = ?")
            .bind(in_progress as i64)
            .bind(change)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn finish_pending_change(&self, change: PendingChangeId, job: JobId) -> Result<JobState> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query("DELETE FROM pending_changes WHERE id = ?")
            .bind(change)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        sqlx::query("UPDATE jobs SET num_pending = num_pending - 1 WHERE id = ? AND num_pending > 0")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        let row = sqlx::query("SELECT state, num_pending FROM jobs WHERE id = ?")
            .bind(job)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?
            .ok_or(AllocError::NoSuchJob(job))?;
        let state = parse_job_state(row.get::<String, _>("state").as_str());
        let remaining: i64 = row.get("num_pending");

        let new_state = if state == JobState::Power && remaining == 0 {
            sqlx::query("UPDATE jobs SET state = 'READY' WHERE id = ?")
                .bind(job)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            JobState::Ready
        } else {
            state
        };
        tx.commit().await.map_err(store_err)?;
        Ok(new_state)
    }

    async fn powered_board_count(&self, job: JobId) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM boards WHERE allocated_job = ? AND powered = 1")
            .bind(job)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn count_powered(&self, machine: MachineId) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM boards WHERE machine = ? AND powered = 1")
            .bind(machine)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn board_connection_info(&self, job: JobId) -> Result<Vec<(BoardId, bool)>> {
        let rows = sqlx::query("SELECT id, powered FROM boards WHERE allocated_job = ?")
            .bind(job)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows
            .iter()
            .map(|r| (r.get("id"), r.get::<i64, _>("powered") != 0))
            .collect())
    }

    async fn root_coords(&self, job: JobId) -> Result<Option<TriadCoord>> {
        let row = sqlx::query(
            "SELECT b.triad_x, b.triad_y, b.triad_z FROM boards b
             JOIN jobs j ON j.root_board = b.id
             WHERE j.id = ?",
        )
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|r| TriadCoord {
            x: r.get("triad_x"),
            y: r.get("triad_y"),
            z: r.get::<i64, _>("triad_z") as u8,
        }))
    }
}

fn row_to_pending_change(row: &sqlx::sqlite::SqliteRow) -> PendingChange {
    let mut fpga = FpgaLinks::default();
    fpga.north = row.get::<i64, _>("fpga_north") != 0;
    fpga.south = row.get::<i64, _>("fpga_south") != 0;
    fpga.east = row.get::<i64, _>("fpga_east") != 0;
    fpga.west = row.get::<i64, _>("fpga_west") != 0;
    fpga.nw = row.get::<i64, _>("fpga_nw") != 0;
    fpga.se = row.get::<i64, _>("fpga_se") != 0;
    PendingChange {
        id: row.get("id"),
        job: row.get("job"),
        board: row.get("board"),
        from_state: parse_job_state(row.get::<String, _>("from_state").as_str()),
        to_state: parse_job_state(row.get::<String, _>("to_state").as_str()),
        power: parse_power_target(row.get::<String, _>("power").as_str()),
        fpga,
        in_progress: row.get::<i64, _>("in_progress") != 0,
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn get_user(&self, id: UserId) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AllocError::Unauthorized(format!("no such user {id}")))?;
        Ok(row_to_user(&row))
    }

    async fn get_group(&self, id: GroupId) -> Result<Group> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AllocError::NoSuchMachine(format!("no such group {id}")))?;
        Ok(row_to_group(&row))
    }

    async fn groups_for_user(&self, user: UserId, _machine: MachineId) -> Result<Vec<Group>> {
        let rows = sqlx::query(
            "SELECT g.* FROM groups g JOIN user_groups ug ON ug.group_id = g.id WHERE ug.user_id = ?",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().map(row_to_group).collect())
    }

    async fn may_use_machine(&self, user: UserId, machine: MachineId) -> Result<bool> {
        let user = self.get_user(user).await?;
        if user.disabled || user.locked {
            return Ok(false);
        }
        let _ = machine; // access is currently account-level, not per-machine (no ACL table yet)
        Ok(true)
    }

    async fn group_quota(&self, group: GroupId) -> Result<Quota> {
        Ok(self.get_group(group).await?.quota)
    }

    async fn adjust_quota(&self, group: GroupId, delta_secs: i64) -> Result<()> {
        sqlx::query("UPDATE groups SET quota_secs = quota_secs + ? WHERE id = ? AND quota_secs IS NOT NULL")
            .bind(delta_secs)
            .bind(group)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn mark_consolidated(&self, job: JobId) -> Result<()> {
        sqlx::query("UPDATE jobs SET consolidated = 1 WHERE id = ?")
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn consolidation_targets(&self) -> Result<Vec<JobId>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE state = 'DESTROYED' AND consolidated = 0 AND death_ts IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows)
    }

    async fn record_login(&self, user: UserId, success: bool) -> Result<()> {
        sqlx::query("INSERT INTO login_attempts (user_id, success, ts) VALUES (?, ?, ?)")
            .bind(user)
            .bind(success as i64)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_locked(&self, user: UserId, locked: bool) -> Result<()> {
        sqlx::query("UPDATE users SET locked = ? WHERE id = ?")
            .bind(locked as i64)
            .bind(user)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl HistoricalStore for SqliteStore {
    async fn tombstone(&self, older_than: DateTime<Utc>) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let rows = sqlx::query(
            "SELECT id, machine, owner, grp, create_ts, death_ts, death_reason, allocation_size
             FROM jobs WHERE state = 'DESTROYED' AND death_ts < ?",
        )
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let mut num_allocations = 0u64;
        for row in &rows {
            let id: i64 = row.get("id");
            let boards: i64 = row.get::<Option<i64>, _>("allocation_size").unwrap_or(0);
            num_allocations += boards as u64;

            sqlx::query(
                "INSERT INTO historical_jobs (id, machine, owner, grp, create_ts, death_ts, death_reason, allocation_size, num_boards)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(row.get::<i64, _>("machine"))
            .bind(row.get::<i64, _>("owner"))
            .bind(row.get::<i64, _>("grp"))
            .bind(row.get::<DateTime<Utc>, _>("create_ts"))
            .bind(row.get::<Option<DateTime<Utc>>, _>("death_ts"))
            .bind(row.get::<Option<String>, _>("death_reason"))
            .bind(row.get::<Option<i64>, _>("allocation_size"))
            .bind(boards)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok((rows.len() as u64, num_allocations))
    }
}

fn store_err(e: sqlx::Error) -> AllocError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.message().contains("locked") || db_err.message().contains("busy") {
            return AllocError::StoreBusy { retries: 0 };
        }
    }
    AllocError::InternalInvariantViolated(format!("store error: {e}"))
}
