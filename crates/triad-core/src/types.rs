//! Domain entities (`spec.md §3`). Semantic types, not storage layout —
//! `triad-store` owns the row shapes and converts to/from these.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MachineId = i64;
pub type BoardId = i64;
pub type BmpId = i64;
pub type GroupId = i64;
pub type UserId = i64;
pub type JobId = i64;
pub type RequestId = i64;
pub type PendingChangeId = i64;
pub type BoardReportId = i64;

/// One of the six compass directions between adjacent boards (`spec.md §4.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    N,
    S,
    E,
    W,
    NW,
    SE,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::N,
        Direction::S,
        Direction::E,
        Direction::W,
        Direction::NW,
        Direction::SE,
    ];

    /// N<->S, E<->W, NW<->SE — fixed per `spec.md §4.1`.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::N => Direction::S,
            Direction::S => Direction::N,
            Direction::E => Direction::W,
            Direction::W => Direction::E,
            Direction::NW => Direction::SE,
            Direction::SE => Direction::NW,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::N => "N",
            Direction::S => "S",
            Direction::E => "E",
            Direction::W => "W",
            Direction::NW => "NW",
            Direction::SE => "SE",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "N" => Ok(Direction::N),
            "S" => Ok(Direction::S),
            "E" => Ok(Direction::E),
            "W" => Ok(Direction::W),
            "NW" => Ok(Direction::NW),
            "SE" => Ok(Direction::SE),
            _ => Err(format!("unknown direction: {s}")),
        }
    }
}

/// Triad coordinate `(x, y, z)` with `0 <= z < 3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriadCoord {
    pub x: i32,
    pub y: i32,
    pub z: u8,
}

/// Physical coordinate `(cabinet, frame, boardNum)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalCoord {
    pub cabinet: i32,
    pub frame: i32,
    pub board_num: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub depth: u8, // always 3
    pub tags: BTreeSet<String>,
    pub in_service: bool,
    /// horizontal (x) wrap-around enabled
    pub wrap_horizontal: bool,
    /// vertical (y) wrap-around enabled
    pub wrap_vertical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub machine: MachineId,
    pub triad: TriadCoord,
    pub physical: PhysicalCoord,
    pub ip_address: String,
    pub bmp: BmpId,
    pub root_chip: (i32, i32),
    pub enabled: bool,
    pub powered: bool,
    pub last_power_on: Option<DateTime<Utc>>,
    pub last_power_off: Option<DateTime<Utc>>,
    pub allocated_job: Option<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub board_a: BoardId,
    pub direction_a: Direction,
    pub board_b: BoardId,
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bmp {
    pub id: BmpId,
    pub machine: MachineId,
    pub address: String,
    pub cabinet: i32,
    pub frame: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
    Internal,
    Organisation,
    Collabratory,
}

/// Quota in board-seconds remaining, or unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Quota {
    Unlimited,
    Seconds(i64),
}

impl Quota {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Quota::Seconds(s) if *s <= 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub quota: Quota,
    pub group_type: GroupType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub trust_level: i32,
    pub disabled: bool,
    pub locked: bool,
    pub open_id_subject: Option<String>,
    pub has_password: bool,
    pub is_internal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Power,
    Ready,
    Destroyed,
    Unknown,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Power => "POWER",
            JobState::Ready => "READY",
            JobState::Destroyed => "DESTROYED",
            JobState::Unknown => "UNKNOWN",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "POWER" => Ok(JobState::Power),
            "READY" => Ok(JobState::Ready),
            "DESTROYED" => Ok(JobState::Destroyed),
            "UNKNOWN" => Ok(JobState::Unknown),
            _ => Err(format!("unknown job state: {s}")),
        }
    }
}

/// Exactly one of three shapes (`spec.md §3` JobRequest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobRequest {
    ByCount { n: i32, max_dead: i32 },
    ByRect { w: i32, h: i32, max_dead: i32 },
    ByBoard(BoardLocator),
}

/// The four ways a specific board may be named (`spec.md §4.3` rule 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BoardLocator {
    Id(BoardId),
    Triad(TriadCoord),
    Physical(PhysicalCoord),
    Ip(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub machine: MachineId,
    pub owner: UserId,
    pub group: GroupId,
    pub state: JobState,
    pub create_ts: DateTime<Utc>,
    pub keepalive_interval: std::time::Duration,
    pub keepalive_ts: DateTime<Utc>,
    pub keepalive_host: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub depth: Option<u8>,
    pub root_board: Option<BoardId>,
    pub original_request: Option<Vec<u8>>,
    pub death_reason: Option<String>,
    pub death_ts: Option<DateTime<Utc>>,
    pub num_pending: i32,
    pub allocation_ts: Option<DateTime<Utc>>,
    pub allocation_size: Option<i32>,
    pub consolidated: bool,
}

impl Job {
    pub fn boards_allocated(&self) -> bool {
        self.root_board.is_some()
    }
}

/// Chip-grid footprint of a single board. `spec.md` leaves the exact chip
/// layout unpinned; `DESIGN.md` records the 8x8-per-board simplification
/// chosen here (a real SpiNNaker board's 48 chips fit inside this bounding
/// box with the corners unpopulated, which this model ignores).
pub const CHIPS_PER_BOARD_X: i32 = 8;
pub const CHIPS_PER_BOARD_Y: i32 = 8;

impl Board {
    /// True if the machine-global chip `(chip_x, chip_y)` falls within this
    /// board's chip rectangle, anchored at `root_chip`.
    pub fn contains_chip(&self, chip_x: i32, chip_y: i32) -> bool {
        let (rx, ry) = self.root_chip;
        chip_x >= rx && chip_x < rx + CHIPS_PER_BOARD_X && chip_y >= ry && chip_y < ry + CHIPS_PER_BOARD_Y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerTarget {
    On,
    Off,
}

/// One queued hardware op (`spec.md §3` PendingChange).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: PendingChangeId,
    pub job: JobId,
    pub board: BoardId,
    pub from_state: JobState,
    pub to_state: JobState,
    pub power: PowerTarget,
    /// FPGA link-enable booleans, one per direction.
    pub fpga: FpgaLinks,
    pub in_progress: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpgaLinks {
    pub north: bool,
    pub south: bool,
    pub east: bool,
    pub west: bool,
    pub nw: bool,
    pub se: bool,
}

impl FpgaLinks {
    pub fn get(&self, d: Direction) -> bool {
        match d {
            Direction::N => self.north,
            Direction::S => self.south,
            Direction::E => self.east,
            Direction::W => self.west,
            Direction::NW => self.nw,
            Direction::SE => self.se,
        }
    }

    pub fn set(&mut self, d: Direction, v: bool) {
        match d {
            Direction::N => self.north = v,
            Direction::S => self.south = v,
            Direction::E => self.east = v,
            Direction::W => self.west = v,
            Direction::NW => self.nw = v,
            Direction::SE => self.se = v,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardReport {
    pub id: BoardReportId,
    pub board: BoardId,
    pub job: Option<JobId>,
    pub reporter: UserId,
    pub issue: String,
    pub ts: DateTime<Utc>,
}

/// A resolved allocation from the placement engine (`spec.md §4.3`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementResult {
    pub root_board: BoardId,
    pub width: i32,
    pub height: i32,
    pub depth: u8,
    pub boards: BTreeSet<BoardId>,
}

/// `whereIs` result (`spec.md §4.5`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardLocation {
    pub job: JobId,
    pub board: BoardId,
    pub chip_x: i32,
    pub chip_y: i32,
    pub job_relative_x: i32,
    pub job_relative_y: i32,
}

/// Wire-facing job view (`spec.md §6`) — no HTTP route serves this in this
/// core; it's the shape an out-of-process API layer would serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub owner: String,
    pub machine_name: String,
    pub state: &'static str,
    pub start_time: DateTime<Utc>,
    pub keepalive_interval_secs: u64,
    pub boards: Vec<BoardView>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub triad_width: Option<i32>,
    pub triad_height: Option<i32>,
    pub powered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub triad: TriadCoord,
    pub physical: PhysicalCoord,
    /// Only populated for the job's owner or an admin.
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineView {
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub tags: BTreeSet<String>,
    pub live_boards: Vec<BoardId>,
    pub dead_boards: Vec<BoardId>,
    pub jobs: Vec<JobId>,
}
