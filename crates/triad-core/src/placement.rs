//! Placement engine (`spec.md §4.3`).
//!
//! Pure function of a machine snapshot + request; no I/O. The Allocator
//! resolves `JobRequest::ByBoard` locators to a concrete `BoardId` (via the
//! `Store`) before calling in here, so this module only ever sees a
//! resolved board id for that shape.

use std::collections::BTreeSet;

use crate::error::{AllocError, Result};
use crate::topology::Topology;
use crate::types::{BoardId, MachineId, PlacementResult, TriadCoord};

#[derive(Debug, Clone)]
pub enum PlacementRequest {
    ByBoard(BoardId),
    ByRect { w: i32, h: i32, max_dead: i32 },
    ByCount { n: i32, max_dead: i32 },
}

/// Everything Placement needs to know about the machine's current state.
/// Built fresh from the `Store` at the start of each `allocate()` pass
/// (`spec.md §5`: "Allocator always observes a transactionally consistent
/// snapshot of machine state").
pub struct MachineSnapshot<'t> {
    pub topology: &'t Topology,
    pub machine: MachineId,
    pub width: i32,
    pub height: i32,
    /// Boards that are enabled and reachable — candidates for allocation.
    pub live_boards: BTreeSet<BoardId>,
    /// Boards already owned by some job.
    pub allocated_boards: BTreeSet<BoardId>,
}

impl<'t> MachineSnapshot<'t> {
    fn is_available(&self, board: BoardId, excluded: &BTreeSet<BoardId>) -> bool {
        self.live_boards.contains(&board) && !self.allocated_boards.contains(&board) && !excluded.contains(&board)
    }

    fn available_boards_in_triad(&self, tx: i32, ty: i32, excluded: &BTreeSet<BoardId>) -> BTreeSet<BoardId> {
        self.topology
            .triad_boards_at(self.machine, tx, ty)
            .into_iter()
            .filter(|b| self.is_available(*b, excluded))
            .collect()
    }
}

/// Resolve a request against a machine snapshot. `Ok(None)` means "no room
/// right now"; `Err(RequestTooLarge)` is a permanent rejection.
pub fn place(
    request: &PlacementRequest,
    snapshot: &MachineSnapshot,
    excluded: &BTreeSet<BoardId>,
) -> Result<Option<PlacementResult>> {
    match request {
        PlacementRequest::ByBoard(board) => place_by_board(*board, snapshot, excluded),
        PlacementRequest::ByRect { w, h, max_dead } => place_by_rect(*w, *h, *max_dead, snapshot, excluded),
        PlacementRequest::ByCount { n, max_dead } => place_by_count(*n, *max_dead, snapshot, excluded),
    }
}

fn place_by_board(board: BoardId, snapshot: &MachineSnapshot, excluded: &BTreeSet<BoardId>) -> Result<Option<PlacementResult>> {
    let Some(b) = snapshot.topology.board(board) else {
        return Ok(None); // unknown board: not a permanent rejection of the *machine*, just unplaceable now
    };
    if !b.enabled || !snapshot.is_available(board, excluded) {
        return Ok(None);
    }
    Ok(Some(PlacementResult {
        root_board: board,
        width: 1,
        height: 1,
        depth: 1,
        boards: [board].into_iter().collect(),
    }))
}

fn place_by_rect(w: i32, h: i32, max_dead: i32, snapshot: &MachineSnapshot, excluded: &BTreeSet<BoardId>) -> Result<Option<PlacementResult>> {
    if w > snapshot.width || h > snapshot.height {
        return Err(AllocError::RequestTooLarge(format!(
            "{w}x{h} triads requested but machine is only {}x{}",
            snapshot.width, snapshot.height
        )));
    }

    // 1x1 is a special case: allocate the full 3-board triad.
    if w == 1 && h == 1 {
        for ty in 0..snapshot.height {
            for tx in 0..snapshot.width {
                let present = snapshot.available_boards_in_triad(tx, ty, excluded);
                let missing = 3 - present.len() as i32;
                if missing <= max_dead && !present.is_empty() && snapshot.topology.path_connected(&present) {
                    let root = *present.iter().next().unwrap();
                    return Ok(Some(PlacementResult {
                        root_board: root,
                        width: 1,
                        height: 1,
                        depth: 3,
                        boards: present,
                    }));
                }
            }
        }
        return Ok(None);
    }

    for ty in 0..snapshot.height {
        for tx in 0..snapshot.width {
            if let Some(placement) = try_rect_at(tx, ty, w, h, max_dead, snapshot, excluded) {
                return Ok(Some(placement));
            }
        }
    }
    Ok(None)
}

fn try_rect_at(
    tx: i32,
    ty: i32,
    w: i32,
    h: i32,
    max_dead: i32,
    snapshot: &MachineSnapshot,
    excluded: &BTreeSet<BoardId>,
) -> Option<PlacementResult> {
    let mut cells = Vec::with_capacity((w * h) as usize);
    for dy in 0..h {
        for dx in 0..w {
            let (wx, wy) = snapshot.topology.wrap(snapshot.machine, tx + dx, ty + dy)?;
            cells.push((wx, wy));
        }
    }

    let mut present = BTreeSet::new();
    for (wx, wy) in &cells {
        present.extend(snapshot.available_boards_in_triad(*wx, *wy, excluded));
    }

    let expected = w * h * 3;
    let missing = expected - present.len() as i32;
    if missing > max_dead || present.is_empty() {
        return None;
    }
    if !snapshot.topology.path_connected(&present) {
        return None;
    }

    let root_coord = TriadCoord { x: tx, y: ty, z: 0 };
    let root_board = snapshot
        .topology
        .triad_boards_at(snapshot.machine, root_coord.x, root_coord.y)
        .into_iter()
        .find(|b| present.contains(b))
        .or_else(|| present.iter().next().copied())?;

    Some(PlacementResult {
        root_board,
        width: w,
        height: h,
        depth: 3,
        boards: present,
    })
}

fn place_by_count(n: i32, max_dead: i32, snapshot: &MachineSnapshot, excluded: &BTreeSet<BoardId>) -> Result<Option<PlacementResult>> {
    if n == 1 {
        for &b in &snapshot.live_boards {
            if snapshot.is_available(b, excluded) {
                return Ok(Some(PlacementResult {
                    root_board: b,
                    width: 1,
                    height: 1,
                    depth: 1,
                    boards: [b].into_iter().collect(),
                }));
            }
        }
        return Ok(None);
    }

    if n <= 3 {
        // Allocate a single triad; up to (3 - n) of its boards may be dead.
        return place_by_rect(1, 1, (3 - n).max(max_dead.min(2)).min(2), snapshot, excluded);
    }

    let (w, h) = smallest_rect_for(n, snapshot.width, snapshot.height)
        .ok_or_else(|| AllocError::RequestTooLarge(format!("no rectangle on a {}x{} machine holds {n} boards", snapshot.width, snapshot.height)))?;
    place_by_rect(w, h, max_dead, snapshot, excluded)
}

/// Smallest `(w, h)` with `w*h*3 >= n` that fits the machine, tie-broken
/// nearer to square then smaller `w` (`spec.md §4.3` rule 3).
fn smallest_rect_for(n: i32, max_w: i32, max_h: i32) -> Option<(i32, i32)> {
    let min_triads = (n + 2) / 3; // ceil(n/3)
    let mut best: Option<(i32, i32)> = None;
    for w in 1..=max_w {
        for h in 1..=max_h {
            if w * h < min_triads {
                continue;
            }
            let better = match best {
                None => true,
                Some((bw, bh)) => {
                    let cur_skew = (w - h).abs();
                    let best_skew = (bw - bh).abs();
                    (cur_skew, w, w * h) < (best_skew, bw, bw * bh)
                }
            };
            if better {
                best = Some((w, h));
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;
    use crate::types::{Board, Direction::*, Link, PhysicalCoord};

    fn mk_board(id: BoardId, x: i32, y: i32, z: u8) -> Board {
        Board {
            id,
            machine: 1,
            triad: TriadCoord { x, y, z },
            physical: PhysicalCoord {
                cabinet: 0,
                frame: 0,
                board_num: id as i32,
            },
            ip_address: format!("10.0.0.{id}"),
            bmp: 1,
            root_chip: (0, 0),
            enabled: true,
            powered: false,
            last_power_on: None,
            last_power_off: None,
            allocated_job: None,
        }
    }

    /// A 1x1-triad (3 board) machine: ids 0,1,2 at (0,0).
    fn one_triad_machine() -> (Topology, BTreeSet<BoardId>) {
        let boards = vec![mk_board(0, 0, 0, 0), mk_board(1, 0, 0, 1), mk_board(2, 0, 0, 2)];
        let links = vec![
            Link { board_a: 0, direction_a: N, board_b: 2, live: true },
            Link { board_a: 0, direction_a: SE, board_b: 1, live: true },
            Link { board_a: 1, direction_a: W, board_b: 2, live: true },
        ];
        let topo = Topology::load(&[(1, 1, 1, false, false)], &boards, &links);
        (topo, [0, 1, 2].into_iter().collect())
    }

    #[test]
    fn by_count_one_picks_a_single_board() {
        let (topo, live) = one_triad_machine();
        let snap = MachineSnapshot {
            topology: &topo,
            machine: 1,
            width: 1,
            height: 1,
            live_boards: live,
            allocated_boards: BTreeSet::new(),
        };
        let req = PlacementRequest::ByCount { n: 1, max_dead: 0 };
        let placed = place(&req, &snap, &BTreeSet::new()).unwrap().unwrap();
        assert_eq!(placed.boards.len(), 1);
        assert_eq!(placed.width, 1);
        assert_eq!(placed.height, 1);
        assert_eq!(placed.depth, 1);
    }

    #[test]
    fn by_count_three_takes_the_whole_triad() {
        let (topo, live) = one_triad_machine();
        let snap = MachineSnapshot {
            topology: &topo,
            machine: 1,
            width: 1,
            height: 1,
            live_boards: live,
            allocated_boards: BTreeSet::new(),
        };
        let req = PlacementRequest::ByCount { n: 3, max_dead: 0 };
        let placed = place(&req, &snap, &BTreeSet::new()).unwrap().unwrap();
        assert_eq!(placed.boards.len(), 3);
        assert_eq!(placed.depth, 3);
    }

    #[test]
    fn by_rect_too_large_is_a_permanent_rejection() {
        let (topo, live) = one_triad_machine();
        let snap = MachineSnapshot {
            topology: &topo,
            machine: 1,
            width: 1,
            height: 1,
            live_boards: live,
            allocated_boards: BTreeSet::new(),
        };
        let req = PlacementRequest::ByRect { w: 1, h: 2, max_dead: 0 };
        let err = place(&req, &snap, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, AllocError::RequestTooLarge(_)));
    }

    #[test]
    fn by_board_fails_on_already_allocated() {
        let (topo, live) = one_triad_machine();
        let mut allocated = BTreeSet::new();
        allocated.insert(0);
        let snap = MachineSnapshot {
            topology: &topo,
            machine: 1,
            width: 1,
            height: 1,
            live_boards: live,
            allocated_boards: allocated,
        };
        let req = PlacementRequest::ByBoard(0);
        assert!(place(&req, &snap, &BTreeSet::new()).unwrap().is_none());
    }

    #[test]
    fn excluded_boards_are_skipped() {
        let (topo, live) = one_triad_machine();
        let snap = MachineSnapshot {
            topology: &topo,
            machine: 1,
            width: 1,
            height: 1,
            live_boards: live,
            allocated_boards: BTreeSet::new(),
        };
        let mut excluded = BTreeSet::new();
        excluded.insert(0);
        excluded.insert(1);
        let req = PlacementRequest::ByCount { n: 1, max_dead: 0 };
        let placed = place(&req, &snap, &excluded).unwrap().unwrap();
        assert_eq!(placed.root_board, 2);
    }
}
