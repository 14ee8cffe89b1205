use serde::{Deserialize, Serialize};

use crate::RewardError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Level {
    pub number: u32,
    pub name: String,
    pub required_points: i64,
}

impl Level {
    #[must_use]
    pub fn new(number: u32, name: &str, required_points: i64) -> Self {
        Self {
            number,
            name: name.to_string(),
            required_points,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelStanding {
    pub current: Option<Level>,
    pub next: Option<Level>,
    pub progress: f64,
}

/// Ordered thresholds mapping lifetime points to a level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelTable {
    levels: Vec<Level>,
}

impl LevelTable {
    /// Builds a table ordered by `required_points`.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when numbers or thresholds are
    /// duplicated, thresholds are negative, or level numbers do not rise with
    /// their thresholds.
    pub fn new(mut levels: Vec<Level>) -> Result<Self, RewardError> {
        levels.sort_by_key(|level| level.required_points);

        for level in &levels {
            if level.required_points < 0 {
                return Err(RewardError::Configuration(format!(
                    "level {} required_points MUST be >= 0",
                    level.number
                )));
            }
        }

        for pair in levels.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            if lower.required_points == upper.required_points {
                return Err(RewardError::Configuration(format!(
                    "levels {} and {} share required_points {}",
                    lower.number, upper.number, lower.required_points
                )));
            }
            if lower.number >= upper.number {
                return Err(RewardError::Configuration(format!(
                    "level numbers MUST increase with required_points ({} before {})",
                    lower.number, upper.number
                )));
            }
        }

        Ok(Self { levels })
    }

    #[must_use]
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Resolves the level for `total_points` and progress toward the next one.
    ///
    /// Progress is 1.0 at the top level (no higher threshold). Below the first
    /// threshold the lower bound is taken as zero points.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn standing(&self, total_points: i64) -> LevelStanding {
        let current = self
            .levels
            .iter()
            .rev()
            .find(|level| level.required_points <= total_points)
            .cloned();
        let next = self
            .levels
            .iter()
            .find(|level| level.required_points > total_points)
            .cloned();

        let progress = match &next {
            None => 1.0,
            Some(upper) => {
                let floor = current.as_ref().map_or(0, |lower| lower.required_points);
                let span = upper.required_points - floor;
                if span <= 0 {
                    1.0
                } else {
                    ((total_points - floor) as f64 / span as f64).clamp(0.0, 1.0)
                }
            }
        };

        LevelStanding {
            current,
            next,
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_table() -> LevelTable {
        must_ok(LevelTable::new(vec![
            Level::new(3, "Adept", 500),
            Level::new(1, "Novice", 0),
            Level::new(4, "Master", 1_000),
            Level::new(2, "Apprentice", 100),
        ]))
    }

    #[test]
    fn exact_threshold_starts_level_with_zero_progress() {
        let standing = fixture_table().standing(500);
        assert_eq!(standing.current.map(|level| level.number), Some(3));
        assert_eq!(standing.next.map(|level| level.number), Some(4));
        assert!(standing.progress.abs() < f64::EPSILON);
    }

    #[test]
    fn progress_is_fraction_of_span() {
        let standing = fixture_table().standing(750);
        assert_eq!(standing.current.map(|level| level.number), Some(3));
        assert!((standing.progress - 0.5).abs() < 1e-9);
    }

    #[test]
    fn max_level_reports_full_progress() {
        let standing = fixture_table().standing(5_000);
        assert_eq!(standing.current.map(|level| level.number), Some(4));
        assert!(standing.next.is_none());
        assert!((standing.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn below_first_threshold_measures_from_zero() {
        let table = must_ok(LevelTable::new(vec![
            Level::new(1, "Bronze", 200),
            Level::new(2, "Silver", 400),
        ]));
        let standing = table.standing(50);
        assert!(standing.current.is_none());
        assert!((standing.progress - 0.25).abs() < 1e-9);
    }

    #[test]
    fn empty_table_has_no_level() {
        let standing = LevelTable::default().standing(10);
        assert!(standing.current.is_none());
        assert!((standing.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_duplicate_thresholds_and_misordered_numbers() {
        let duplicate = LevelTable::new(vec![Level::new(1, "a", 0), Level::new(2, "b", 0)]);
        assert!(matches!(duplicate, Err(RewardError::Configuration(_))));

        let misordered = LevelTable::new(vec![Level::new(2, "a", 0), Level::new(1, "b", 100)]);
        assert!(matches!(misordered, Err(RewardError::Configuration(_))));
    }
}
