use serde::{Deserialize, Serialize};
use time::Date;

use crate::Streak;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StreakTransition {
    /// First recorded activity for this streak.
    Started,
    /// Activity on the day after the last one.
    Extended,
    /// A gap of more than one day; counting starts over.
    Restarted,
    /// Same-day repeat.
    Unchanged,
    /// Activity dated before the last recorded day.
    Ignored,
}

impl StreakTransition {
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Started | Self::Extended | Self::Restarted)
    }
}

/// Computes the streak state after activity on `activity_date`.
#[must_use]
pub fn advance_streak(streak: &Streak, activity_date: Date) -> (Streak, StreakTransition) {
    let transition = match streak.last_activity_date {
        None => StreakTransition::Started,
        Some(last) if last == activity_date => StreakTransition::Unchanged,
        Some(last) if activity_date < last => StreakTransition::Ignored,
        Some(last) if last.next_day() == Some(activity_date) => StreakTransition::Extended,
        Some(_) => StreakTransition::Restarted,
    };

    if !transition.is_mutation() {
        return (streak.clone(), transition);
    }

    let mut next = streak.clone();
    next.current_count = match transition {
        StreakTransition::Extended => streak.current_count.saturating_add(1),
        _ => 1,
    };
    next.longest_count = next.longest_count.max(next.current_count);
    next.last_activity_date = Some(activity_date);
    next.is_active = true;

    (next, transition)
}
