//! Static mesh geometry (`spec.md §4.1`).
//!
//! Loaded once from the `Store` and held immutable for the process
//! lifetime — "the in-memory Topology is immutable after load" (`spec.md
//! §3`, Ownership). Never store the board/link graph as pointers; it has
//! cycles from wrap-around, so it's kept as an adjacency table exactly as
//! `spec.md §9` Design Notes prescribes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::types::{Board, BoardId, Direction, Link, MachineId, TriadCoord};

/// `(z, direction) -> (dx, dy, target_z, internal)` — fixed per board
/// model, per `spec.md §4.1`. `internal` edges stay within the same triad
/// (dx=dy=0); external edges cross to a neighbouring triad. The six
/// direction vectors form a standard axial hex basis (N/S, E/W, NW/SE are
/// each other's negation), and the internal triangle plus inter-triad
/// pairing below is the unique assignment that keeps every edge
/// direction-opposite-symmetric — see `DESIGN.md` for the derivation.
fn z_adjacency(z: u8, d: Direction) -> (i32, i32, u8) {
    use Direction::*;
    match (z, d) {
        // z = 0
        (0, N) => (0, 0, 2),   // internal
        (0, SE) => (0, 0, 1),  // internal
        (0, S) => (0, -1, 1),
        (0, E) => (1, 0, 2),
        (0, W) => (-1, 0, 1),
        (0, NW) => (-1, 1, 1),
        // z = 1
        (1, NW) => (0, 0, 0), // internal
        (1, W) => (0, 0, 2),  // internal
        (1, N) => (0, 1, 0),
        (1, E) => (1, 0, 0),
        (1, SE) => (1, -1, 0),
        (1, S) => (0, -1, 2),
        // z = 2
        (2, E) => (0, 0, 1), // internal
        (2, S) => (0, 0, 0), // internal
        (2, W) => (-1, 0, 0),
        (2, N) => (0, 1, 1),
        (2, NW) => (-1, 1, 2),
        (2, SE) => (1, -1, 2),
        _ => unreachable!("z must be 0..3, got {z}"),
    }
}

#[derive(Debug, Clone, Default)]
struct MachineGeometry {
    width: i32,
    height: i32,
    wrap_horizontal: bool,
    wrap_vertical: bool,
}

/// Immutable, loaded-once mesh geometry for one or more machines.
pub struct Topology {
    geometry: HashMap<MachineId, MachineGeometry>,
    /// machine -> triad(x,y) -> z -> board id
    by_triad: HashMap<MachineId, BTreeMap<(i32, i32), BTreeMap<u8, BoardId>>>,
    boards: HashMap<BoardId, Board>,
    /// board -> direction -> (neighbour board, live)
    adjacency: HashMap<BoardId, HashMap<Direction, (BoardId, bool)>>,
}

impl Topology {
    pub fn load(machines: &[(MachineId, i32, i32, bool, bool)], boards: &[Board], links: &[Link]) -> Self {
        let mut geometry = HashMap::new();
        for (id, width, height, wrap_h, wrap_v) in machines {
            geometry.insert(
                *id,
                MachineGeometry {
                    width: *width,
                    height: *height,
                    wrap_horizontal: *wrap_h,
                    wrap_vertical: *wrap_v,
                },
            );
        }

        let mut by_triad: HashMap<MachineId, BTreeMap<(i32, i32), BTreeMap<u8, BoardId>>> = HashMap::new();
        let mut board_map = HashMap::new();
        for b in boards {
            by_triad
                .entry(b.machine)
                .or_default()
                .entry((b.triad.x, b.triad.y))
                .or_default()
                .insert(b.triad.z, b.id);
            board_map.insert(b.id, b.clone());
        }

        let mut adjacency: HashMap<BoardId, HashMap<Direction, (BoardId, bool)>> = HashMap::new();
        for l in links {
            adjacency
                .entry(l.board_a)
                .or_default()
                .insert(l.direction_a, (l.board_b, l.live));
            adjacency
                .entry(l.board_b)
                .or_default()
                .insert(l.direction_a.opposite(), (l.board_a, l.live));
        }

        Self {
            geometry,
            by_triad,
            boards: board_map,
            adjacency,
        }
    }

    pub fn direction_opposite(d: Direction) -> Direction {
        d.opposite()
    }

    /// Apply horizontal/vertical wrap rules for a machine.
    pub fn wrap(&self, machine: MachineId, tx: i32, ty: i32) -> Option<(i32, i32)> {
        let g = self.geometry.get(&machine)?;
        let x = if tx < 0 || tx >= g.width {
            if g.wrap_horizontal {
                tx.rem_euclid(g.width)
            } else {
                return None;
            }
        } else {
            tx
        };
        let y = if ty < 0 || ty >= g.height {
            if g.wrap_vertical {
                ty.rem_euclid(g.height)
            } else {
                return None;
            }
        } else {
            ty
        };
        Some((x, y))
    }

    /// Derive the static `(dx, dy, target_z)` table and resolve it against
    /// the actual board graph. Returns `None` if there is no board/link
    /// there (off-machine, unpopulated triad, or the link was never loaded).
    pub fn neighbour(&self, board: BoardId, direction: Direction) -> Option<BoardId> {
        self.adjacency
            .get(&board)
            .and_then(|m| m.get(&direction))
            .map(|(b, _)| *b)
    }

    pub fn neighbour_live(&self, board: BoardId, direction: Direction) -> Option<BoardId> {
        self.adjacency.get(&board).and_then(|m| {
            m.get(&direction)
                .and_then(|(b, live)| if *live { Some(*b) } else { None })
        })
    }

    /// Geometric neighbour lookup independent of whether a `Link` row was
    /// loaded — used by `Placement` to reason about triads that may be
    /// entirely absent (dead ground).
    pub fn geometric_neighbour(
        &self,
        machine: MachineId,
        tx: i32,
        ty: i32,
        z: u8,
        direction: Direction,
    ) -> Option<(i32, i32, u8)> {
        let (dx, dy, target_z) = z_adjacency(z, direction);
        let (wx, wy) = self.wrap(machine, tx + dx, ty + dy)?;
        Some((wx, wy, target_z))
    }

    /// All boards present at triad `(tx, ty)` (up to 3, one per z).
    pub fn triad_boards_at(&self, machine: MachineId, tx: i32, ty: i32) -> BTreeSet<BoardId> {
        self.by_triad
            .get(&machine)
            .and_then(|t| t.get(&(tx, ty)))
            .map(|zs| zs.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn board(&self, id: BoardId) -> Option<&Board> {
        self.boards.get(&id)
    }

    pub fn machine_dims(&self, machine: MachineId) -> Option<(i32, i32)> {
        self.geometry.get(&machine).map(|g| (g.width, g.height))
    }

    /// BFS over live links; true iff the board set is non-empty and
    /// connected (`spec.md §4.3`).
    pub fn path_connected(&self, boards: &BTreeSet<BoardId>) -> bool {
        if boards.is_empty() {
            return false;
        }
        let start = *boards.iter().next().unwrap();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        seen.insert(start);
        queue.push_back(start);
        while let Some(b) = queue.pop_front() {
            if let Some(neighbours) = self.adjacency.get(&b) {
                for (_, (nb, live)) in neighbours {
                    if *live && boards.contains(nb) && !seen.contains(nb) {
                        seen.insert(*nb);
                        queue.push_back(*nb);
                    }
                }
            }
        }
        seen.len() == boards.len()
    }

    /// Perimeter links of a job's allocation — any live link from a board
    /// in `boards` to a board outside it (`spec.md §6` "perimeter-links of
    /// a job").
    pub fn perimeter_links(&self, boards: &BTreeSet<BoardId>) -> Vec<(BoardId, Direction, BoardId)> {
        let mut out = Vec::new();
        for &b in boards {
            if let Some(neighbours) = self.adjacency.get(&b) {
                for (&dir, &(nb, live)) in neighbours {
                    if live && !boards.contains(&nb) {
                        out.push((b, dir, nb));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction::*, PhysicalCoord};

    fn mk_board(id: BoardId, machine: MachineId, x: i32, y: i32, z: u8) -> Board {
        Board {
            id,
            machine,
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

    fn single_triad() -> Topology {
        let boards = vec![mk_board(0, 1, 0, 0, 0), mk_board(1, 1, 0, 0, 1), mk_board(2, 1, 0, 0, 2)];
        // Internal triad links per the z_adjacency table.
        let links = vec![
            Link {
                board_a: 0,
                direction_a: N,
                board_b: 2,
                live: true,
            },
            Link {
                board_a: 0,
                direction_a: SE,
                board_b: 1,
                live: true,
            },
            Link {
                board_a: 1,
                direction_a: W,
                board_b: 2,
                live: true,
            },
        ];
        Topology::load(&[(1, 1, 1, false, false)], &boards, &links)
    }

    #[test]
    fn direction_opposites_are_involutions() {
        for d in Direction::ALL {
            assert_eq!(d.opposite().opposite(), d);
        }
        assert_eq!(N.opposite(), S);
        assert_eq!(E.opposite(), W);
        assert_eq!(NW.opposite(), SE);
    }

    #[test]
    fn single_triad_is_fully_connected() {
        let topo = single_triad();
        let boards: BTreeSet<BoardId> = [0, 1, 2].into_iter().collect();
        assert!(topo.path_connected(&boards));
    }

    #[test]
    fn neighbour_lookup_is_symmetric() {
        let topo = single_triad();
        assert_eq!(topo.neighbour(0, N), Some(2));
        assert_eq!(topo.neighbour(2, S), Some(0));
        assert_eq!(topo.neighbour(0, SE), Some(1));
        assert_eq!(topo.neighbour(1, NW), Some(0));
    }

    #[test]
    fn disconnected_board_breaks_connectivity() {
        let topo = single_triad();
        let boards: BTreeSet<BoardId> = [0, 2].into_iter().collect(); // missing bridge via 1, but 0-2 direct link exists
        assert!(topo.path_connected(&boards));
        let lonely: BTreeSet<BoardId> = [0, 1, 2, 99].into_iter().collect();
        assert!(!topo.path_connected(&lonely));
    }

    #[test]
    fn wrap_respects_machine_flags() {
        let topo = Topology::load(&[(1, 2, 2, true, false)], &[], &[]);
        assert_eq!(topo.wrap(1, 2, 0), Some((0, 0)));
        assert_eq!(topo.wrap(1, -1, 0), Some((1, 0)));
        assert_eq!(topo.wrap(1, 0, 2), None); // vertical wrap disabled
    }
}
