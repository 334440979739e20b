//! XP leveling curve
//!
//! Reaching level `n` from `n - 1` costs `round(100 * n^1.5)` XP; levels are
//! capped at [`MAX_LEVEL`].

use once_cell::sync::Lazy;
use serde::Serialize;

pub const MAX_LEVEL: i64 = 30;

const K: f64 = 100.0;

/// XP needed to go from `level - 1` to `level`
pub fn xp_for_level(level: i64) -> i64 {
    if level < 1 {
        return 0;
    }
    (K * (level as f64).powf(1.5)).round() as i64
}

/// Cumulative XP to reach each level, indexed by level
pub static TOTAL_XP_TABLE: Lazy<Vec<i64>> = Lazy::new(|| {
    let mut table = Vec::with_capacity(MAX_LEVEL as usize + 1);
    let mut total = 0;
    table.push(total);
    for level in 1..=MAX_LEVEL {
        total += xp_for_level(level);
        table.push(total);
    }
    table
});

/// Total XP to reach `level`, capped at [`MAX_LEVEL`]
pub fn total_xp_for_level(level: i64) -> i64 {
    if level <= 0 {
        return 0;
    }
    TOTAL_XP_TABLE[level.min(MAX_LEVEL) as usize]
}

/// Level reached with `xp` total XP
pub fn level_for_xp(xp: i64) -> i64 {
    if xp <= 0 {
        return 0;
    }
    if xp >= TOTAL_XP_TABLE[MAX_LEVEL as usize] {
        return MAX_LEVEL;
    }
    // bisect right: first index whose total exceeds xp
    let idx = TOTAL_XP_TABLE.partition_point(|&total| total <= xp) as i64;
    (idx - 1).clamp(0, MAX_LEVEL)
}

/// XP needed to go from `level` to `level + 1`; zero at the cap
pub fn next_level_requirement(level: i64) -> i64 {
    if level >= MAX_LEVEL {
        return 0;
    }
    total_xp_for_level(level + 1) - total_xp_for_level(level)
}

/// Fraction of the current level completed, in `[0, 1]`
pub fn progress_to_next(xp: i64) -> f64 {
    let level = level_for_xp(xp);
    if level >= MAX_LEVEL {
        return 1.0;
    }
    let base = total_xp_for_level(level);
    let span = next_level_requirement(level);
    if span <= 0 {
        return 1.0;
    }
    ((xp.max(0) - base) as f64 / span as f64).clamp(0.0, 1.0)
}

/// Snapshot of a user's progression
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelProgress {
    pub xp: i64,
    pub level: i64,
    pub max_level: i64,
    pub next_level_total_xp: i64,
    pub need_for_next: i64,
    pub progress: f64,
}

impl LevelProgress {
    pub fn for_xp(xp: i64) -> Self {
        let level = level_for_xp(xp);
        let next_level_total_xp = if level >= MAX_LEVEL {
            total_xp_for_level(MAX_LEVEL)
        } else {
            total_xp_for_level(level + 1)
        };
        Self {
            xp,
            level,
            max_level: MAX_LEVEL,
            next_level_total_xp,
            need_for_next: (next_level_total_xp - xp).max(0),
            progress: progress_to_next(xp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_curve_values() {
        assert_eq!(xp_for_level(0), 0);
        assert_eq!(xp_for_level(1), 100);
        assert_eq!(xp_for_level(2), 283);
        assert_eq!(xp_for_level(4), 800);
        assert_eq!(TOTAL_XP_TABLE.len(), MAX_LEVEL as usize + 1);
        assert_eq!(total_xp_for_level(2), 383);
        assert_eq!(total_xp_for_level(99), total_xp_for_level(MAX_LEVEL));
        assert_eq!(total_xp_for_level(-1), 0);
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(level_for_xp(0), 0);
        assert_eq!(level_for_xp(-50), 0);
        assert_eq!(level_for_xp(99), 0);
        assert_eq!(level_for_xp(100), 1);
        assert_eq!(level_for_xp(382), 1);
        assert_eq!(level_for_xp(383), 2);
        assert_eq!(level_for_xp(i64::MAX), MAX_LEVEL);
    }

    #[test]
    fn test_progress_snapshot() {
        let p = LevelProgress::for_xp(150);
        assert_eq!(p.level, 1);
        assert_eq!(p.next_level_total_xp, 383);
        assert_eq!(p.need_for_next, 233);
        assert!((p.progress - 50.0 / 283.0).abs() < 1e-9);

        let max = LevelProgress::for_xp(total_xp_for_level(MAX_LEVEL));
        assert_eq!(max.level, MAX_LEVEL);
        assert_eq!(max.need_for_next, 0);
        assert_eq!(max.progress, 1.0);
        assert_eq!(next_level_requirement(MAX_LEVEL), 0);
    }

    proptest! {
        #[test]
        fn level_is_monotonic(a in 0i64..200_000, b in 0i64..200_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(level_for_xp(lo) <= level_for_xp(hi));
        }

        #[test]
        fn level_brackets_xp(xp in 0i64..200_000) {
            let level = level_for_xp(xp);
            prop_assert!(total_xp_for_level(level) <= xp);
            if level < MAX_LEVEL {
                prop_assert!(xp < total_xp_for_level(level + 1));
            }
        }

        #[test]
        fn progress_in_unit_interval(xp in -1000i64..200_000) {
            let p = progress_to_next(xp);
            prop_assert!((0.0..=1.0).contains(&p));
        }
    }
}
