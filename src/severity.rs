//! Severity scoring for error groups
//!
//! The score is a 1-10 urgency rating built from three parts: a base from the
//! reported level, a bonus for the exception category and a bonus for how often
//! the group has occurred. It is recomputed on every occurrence.

use crate::events::{ExceptionKind, Level};

/// Lowest possible score
pub const MIN_SCORE: u8 = 1;
/// Highest possible score
pub const MAX_SCORE: u8 = 10;

/// Base score contributed by the log level
pub fn level_base(level: Level) -> u8 {
    match level {
        Level::Emergency => 10,
        Level::Alert => 9,
        Level::Critical => 8,
        Level::Error => 6,
        Level::Warning => 4,
        Level::Notice => 2,
        Level::Info | Level::Debug | Level::Other => 1,
    }
}

/// Bonus contributed by the exception category
pub fn kind_bonus(kind: ExceptionKind) -> u8 {
    match kind {
        ExceptionKind::Fatal => 3,
        ExceptionKind::Runtime => 2,
        ExceptionKind::Other => 0,
    }
}

/// Bonus contributed by the lifetime occurrence count
pub fn frequency_bonus(occurrence_count: u64) -> u8 {
    match occurrence_count {
        n if n >= 100 => 3,
        n if n >= 50 => 2,
        n if n >= 10 => 1,
        _ => 0,
    }
}

/// Compute the severity score for a group
///
/// # Arguments
///
/// * `level` - Level of the most recent occurrence
/// * `kind` - Exception category (`Other` for log events)
/// * `occurrence_count` - Lifetime occurrence count including this occurrence
///
/// # Returns
///
/// A score in `1..=10`
pub fn score(level: Level, kind: ExceptionKind, occurrence_count: u64) -> u8 {
    let raw = level_base(level) + kind_bonus(kind) + frequency_bonus(occurrence_count);
    raw.clamp(MIN_SCORE, MAX_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_scores() {
        assert_eq!(score(Level::Error, ExceptionKind::Other, 1), 6);
        assert_eq!(score(Level::Warning, ExceptionKind::Other, 1), 4);
        assert_eq!(score(Level::Debug, ExceptionKind::Other, 1), 1);
        assert_eq!(score(Level::Other, ExceptionKind::Other, 1), 1);
    }

    #[test]
    fn test_kind_and_frequency_bonuses() {
        assert_eq!(score(Level::Error, ExceptionKind::Runtime, 1), 8);
        assert_eq!(score(Level::Error, ExceptionKind::Other, 10), 7);
        assert_eq!(score(Level::Error, ExceptionKind::Other, 49), 7);
        assert_eq!(score(Level::Error, ExceptionKind::Other, 50), 8);
        assert_eq!(score(Level::Notice, ExceptionKind::Other, 100), 5);
    }

    #[test]
    fn test_score_is_capped() {
        assert_eq!(score(Level::Emergency, ExceptionKind::Fatal, 1_000), 10);
        assert_eq!(score(Level::Critical, ExceptionKind::Fatal, 1), 10);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    #[derive(Debug, Clone)]
    struct AnyLevel(Level);

    impl Arbitrary for AnyLevel {
        fn arbitrary(g: &mut Gen) -> Self {
            let levels = [
                Level::Other,
                Level::Debug,
                Level::Info,
                Level::Notice,
                Level::Warning,
                Level::Error,
                Level::Critical,
                Level::Alert,
                Level::Emergency,
            ];
            AnyLevel(*g.choose(&levels).unwrap())
        }
    }

    #[derive(Debug, Clone)]
    struct AnyKind(ExceptionKind);

    impl Arbitrary for AnyKind {
        fn arbitrary(g: &mut Gen) -> Self {
            let kinds = [ExceptionKind::Fatal, ExceptionKind::Runtime, ExceptionKind::Other];
            AnyKind(*g.choose(&kinds).unwrap())
        }
    }

    #[quickcheck]
    fn prop_score_in_bounds(level: AnyLevel, kind: AnyKind, count: u64) -> bool {
        let s = score(level.0, kind.0, count);
        (MIN_SCORE..=MAX_SCORE).contains(&s)
    }

    #[quickcheck]
    fn prop_score_monotonic_in_count(level: AnyLevel, kind: AnyKind, a: u64, b: u64) -> bool {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        score(level.0, kind.0, lo) <= score(level.0, kind.0, hi)
    }
}
