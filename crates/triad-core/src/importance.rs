//! Request-importance scoring (`spec.md §4.4` step 1, §9 "importance
//! bumping" Open Question).
//!
//! `spec.md` leaves the exact age-bonus formula unpinned, subject to three
//! constraints; the choice made here (and why) is recorded in
//! `DESIGN.md`.

use crate::config::PriorityScale;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    Size,
    Dimensions,
    SpecificBoard,
}

/// `importance = base_priority * scale(shape) + age_bonus(now - requestTs)`,
/// with `age_bonus` linear in elapsed seconds and capped at
/// `allocator.importanceSpan` — monotonic, bounded, and leaves
/// `specificBoard` ahead of a same-age `dimensions`/`size` request because
/// its scale (default 65.0) dwarfs the age bonus at typical spans.
pub fn importance(base_priority: f64, shape: RequestShape, age_secs: f64, scale: &PriorityScale, importance_span: f64) -> f64 {
    let shape_scale = match shape {
        RequestShape::Size => scale.size,
        RequestShape::Dimensions => scale.dimensions,
        RequestShape::SpecificBoard => scale.specific_board,
    };
    let age_bonus = age_secs.max(0.0).min(importance_span);
    base_priority * shape_scale + age_bonus
}

/// Amount added to a request's stored importance each time an `allocate()`
/// pass considers it and fails to place it (`spec.md §4.4`: "Importance is
/// bumped on each unsuccessful pass so long-waiting jobs eventually win").
pub const IMPORTANCE_BUMP: f64 = 1.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_board_outranks_rect_at_same_age() {
        let scale = PriorityScale::default();
        let rect = importance(1.0, RequestShape::Dimensions, 0.0, &scale, 10_000.0);
        let board = importance(1.0, RequestShape::SpecificBoard, 0.0, &scale, 10_000.0);
        assert!(board > rect);
    }

    #[test]
    fn age_bonus_is_monotonic_and_capped() {
        let scale = PriorityScale::default();
        let a = importance(1.0, RequestShape::Size, 10.0, &scale, 100.0);
        let b = importance(1.0, RequestShape::Size, 50.0, &scale, 100.0);
        let c = importance(1.0, RequestShape::Size, 500.0, &scale, 100.0);
        assert!(b > a);
        assert!(c > b);
        assert_eq!(c, importance(1.0, RequestShape::Size, 100.0, &scale, 100.0));
    }
}
