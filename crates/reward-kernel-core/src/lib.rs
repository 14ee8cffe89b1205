use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod criteria;
mod level;
mod progress;
mod streak;

pub use criteria::{
    AccountAgeEvaluator, ActionCountEvaluator, CriteriaContext, CriteriaEvaluation,
    CriteriaEvaluator, CriteriaRegistry, LevelEvaluator, PointsEvaluator, ProgressEvaluator,
    QuestCompletionEvaluator, SocialEvaluator, SpendingEvaluator, StreakEvaluator,
};
pub use level::{Level, LevelStanding, LevelTable};
pub use progress::merge_progress;
pub use streak::{advance_streak, StreakTransition};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RewardError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient funds for {user_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        user_id: UserId,
        requested: i64,
        available: i64,
    },
    #[error("unknown criteria condition: {0}")]
    UnknownCriteriaCondition(String),
    #[error("criteria condition {condition} failed: {message}")]
    Criteria { condition: String, message: String },
    #[error("ledger write conflict persisted after {attempts} attempts")]
    LedgerWriteConflict { attempts: u32 },
    #[error("aggregate drift detected for {user_id}: cached={cached} ledger={ledger}")]
    AggregateDriftDetected {
        user_id: UserId,
        cached: i64,
        ledger: i64,
    },
    #[error("definition inactive: {0}")]
    DefinitionInactive(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub Ulid);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = RewardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| RewardError::Validation(format!("invalid user id {value}: {err}")))
    }
}

/// Identity of a badge, quest, challenge or event definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DefinitionId(pub Ulid);

impl DefinitionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DefinitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DefinitionId {
    type Err = RewardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| RewardError::Validation(format!("invalid definition id {value}: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Earn,
    Spend,
    Adjustment,
    Refund,
}

impl TransactionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Spend => "spend",
            Self::Adjustment => "adjustment",
            Self::Refund => "refund",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "earn" => Some(Self::Earn),
            "spend" => Some(Self::Spend),
            "adjustment" => Some(Self::Adjustment),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Badge,
    Quest,
    Challenge,
}

impl DefinitionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Badge => "badge",
            Self::Quest => "quest",
            Self::Challenge => "challenge",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    InProgress,
    Completed,
    Expired,
}

impl ChallengeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// One immutable, signed point transaction.
///
/// `user_seq` orders a user's entries; `balance_after` of the entry with the
/// highest `user_seq` is the authoritative available balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub ledger_seq: i64,
    pub entry_id: Ulid,
    pub user_id: UserId,
    pub user_seq: i64,
    pub transaction_type: TransactionType,
    pub points: i64,
    pub balance_after: i64,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerReference {
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub description: Option<String>,
}

impl LedgerReference {
    #[must_use]
    pub fn new(reference_type: &str, reference_id: &str) -> Self {
        Self {
            reference_type: Some(reference_type.to_string()),
            reference_id: Some(reference_id.to_string()),
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileAggregate {
    pub user_id: UserId,
    pub total_points: i64,
    pub available_points: i64,
    pub current_level: Option<u32>,
    pub progress_to_next_level: f64,
    pub streak_count: u32,
    pub longest_streak: u32,
    pub consecutive_login_days: u32,
    pub last_user_seq: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ProfileAggregate {
    #[must_use]
    pub fn new(user_id: UserId, levels: &LevelTable, now: OffsetDateTime) -> Self {
        let mut profile = Self {
            user_id,
            total_points: 0,
            available_points: 0,
            current_level: None,
            progress_to_next_level: 0.0,
            streak_count: 0,
            longest_streak: 0,
            consecutive_login_days: 0,
            last_user_seq: 0,
            created_at: now,
            updated_at: now,
        };
        profile.refresh_standing(levels);
        profile
    }

    /// Folds a just-appended ledger entry into the cached aggregate.
    ///
    /// The available balance is copied from `balance_after`, never derived
    /// from the delta, so the cache cannot drift from the ledger through
    /// arithmetic.
    ///
    /// # Errors
    /// Returns [`RewardError::Validation`] when the entry belongs to another
    /// user or does not advance the user's ledger sequence.
    pub fn apply_entry(
        &mut self,
        entry: &LedgerEntry,
        levels: &LevelTable,
    ) -> Result<(), RewardError> {
        if entry.user_id != self.user_id {
            return Err(RewardError::Validation(format!(
                "ledger entry for {} applied to profile of {}",
                entry.user_id, self.user_id
            )));
        }
        if entry.user_seq <= self.last_user_seq {
            return Err(RewardError::Validation(format!(
                "ledger entry user_seq {} does not advance profile seq {}",
                entry.user_seq, self.last_user_seq
            )));
        }

        if entry.transaction_type == TransactionType::Earn && entry.points > 0 {
            self.total_points = self.total_points.saturating_add(entry.points);
        }
        self.available_points = entry.balance_after;
        self.last_user_seq = entry.user_seq;
        self.updated_at = entry.created_at;
        self.refresh_standing(levels);
        Ok(())
    }

    pub fn refresh_standing(&mut self, levels: &LevelTable) {
        let standing = levels.standing(self.total_points);
        self.current_level = standing.current.map(|level| level.number);
        self.progress_to_next_level = standing.progress;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Badge {
    pub badge_id: DefinitionId,
    pub name: String,
    pub description: String,
    pub criteria: Value,
    pub points_reward: i64,
    pub badge_type: String,
    pub rarity: String,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quest {
    pub quest_id: DefinitionId,
    pub name: String,
    pub description: String,
    pub criteria: Value,
    pub points_reward: i64,
    pub badge_reward: Option<DefinitionId>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub difficulty: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Quest {
    #[must_use]
    pub fn is_open(&self, now: OffsetDateTime) -> bool {
        self.is_active
            && self.starts_at.map_or(true, |start| start <= now)
            && self.ends_at.map_or(true, |end| now <= end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Challenge {
    pub challenge_id: DefinitionId,
    pub name: String,
    pub description: String,
    pub challenge_type: String,
    pub criteria: Value,
    pub points_reward: i64,
    pub badge_reward: Option<DefinitionId>,
    pub is_active: bool,
    pub period_seconds: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Challenge {
    /// Returns the `(start, end)` window of a period beginning at `start`.
    #[must_use]
    pub fn period_from(&self, start: OffsetDateTime) -> (OffsetDateTime, Option<OffsetDateTime>) {
        let end = self
            .period_seconds
            .map(|seconds| start + Duration::seconds(seconds));
        (start, end)
    }
}

/// Input shared by badge, quest and challenge creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefinitionInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_criteria")]
    pub criteria: Value,
    #[serde(default)]
    pub points_reward: i64,
    #[serde(default)]
    pub badge_reward: Option<DefinitionId>,
}

fn empty_criteria() -> Value {
    Value::Object(serde_json::Map::new())
}

impl DefinitionInput {
    /// Validates shared definition fields before persistence.
    ///
    /// # Errors
    /// Returns [`RewardError::Validation`] for a blank name, negative
    /// reward, or criteria that are not a JSON object.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.name.trim().is_empty() {
            return Err(RewardError::Validation(
                "definition name MUST be provided".to_string(),
            ));
        }
        if self.points_reward < 0 {
            return Err(RewardError::Validation(
                "points_reward MUST be >= 0".to_string(),
            ));
        }
        if !self.criteria.is_object() {
            return Err(RewardError::Validation(
                "criteria MUST be a JSON object of condition -> params".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserBadge {
    pub user_id: UserId,
    pub badge_id: DefinitionId,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub awarded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserQuest {
    pub user_id: UserId,
    pub quest_id: DefinitionId,
    pub progress: Value,
    pub is_completed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserChallenge {
    pub user_id: UserId,
    pub challenge_id: DefinitionId,
    pub progress: Value,
    pub status: ChallengeStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Streak {
    pub user_id: UserId,
    pub streak_type: String,
    pub current_count: u32,
    pub longest_count: u32,
    #[serde(with = "date_format::option")]
    pub last_activity_date: Option<Date>,
    pub is_active: bool,
}

impl Streak {
    #[must_use]
    pub fn new(user_id: UserId, streak_type: &str) -> Self {
        Self {
            user_id,
            streak_type: streak_type.to_string(),
            current_count: 0,
            longest_count: 0,
            last_activity_date: None,
            is_active: true,
        }
    }
}

/// A time-limited promotion that multiplies awarded points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardEvent {
    pub event_id: DefinitionId,
    pub name: String,
    pub description: String,
    pub event_type: String,
    pub point_multiplier: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub is_active: bool,
}

impl RewardEvent {
    #[must_use]
    pub fn is_running(&self, now: OffsetDateTime) -> bool {
        self.is_active && self.starts_at <= now && now <= self.ends_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardEventInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub event_type: String,
    pub point_multiplier: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
}

impl RewardEventInput {
    /// Validates the event window and multiplier.
    ///
    /// # Errors
    /// Returns [`RewardError::Validation`] when fields are blank, the
    /// multiplier is not a positive finite number, or the window is empty.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.name.trim().is_empty() || self.event_type.trim().is_empty() {
            return Err(RewardError::Validation(
                "event name and event_type MUST be provided".to_string(),
            ));
        }
        if !self.point_multiplier.is_finite() || self.point_multiplier <= 0.0 {
            return Err(RewardError::Validation(
                "point_multiplier MUST be a positive number".to_string(),
            ));
        }
        if self.ends_at <= self.starts_at {
            return Err(RewardError::Validation(
                "ends_at MUST be after starts_at".to_string(),
            ));
        }
        Ok(())
    }
}

/// Multiplies `points` by every running event of `event_type`, truncating.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn apply_event_multiplier(
    points: i64,
    event_type: &str,
    events: &[RewardEvent],
    now: OffsetDateTime,
) -> i64 {
    let multiplier = events
        .iter()
        .filter(|event| event.event_type == event_type && event.is_running(now))
        .fold(1.0_f64, |acc, event| acc * event.point_multiplier);
    (points as f64 * multiplier) as i64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardPolicy {
    pub policy_version: u32,
    pub max_award_depth: u32,
    pub max_awards_per_call: u32,
    pub max_write_retries: u32,
    pub streak_cutoff_hour_utc: u8,
    pub default_history_limit: usize,
    pub social_points: BTreeMap<String, i64>,
}

impl RewardPolicy {
    #[must_use]
    pub fn v1() -> Self {
        let social_points = [
            ("comment", 3),
            ("like", 1),
            ("share", 5),
            ("referral", 10),
            ("discussion", 10),
            ("solution", 5),
            ("follower", 3),
        ]
        .into_iter()
        .map(|(action, points)| (action.to_string(), points))
        .collect();

        Self {
            policy_version: 1,
            max_award_depth: 4,
            max_awards_per_call: 64,
            max_write_retries: 3,
            streak_cutoff_hour_utc: 0,
            default_history_limit: 50,
            social_points,
        }
    }

    /// Validates policy bounds.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when one or more policy
    /// fields are outside allowed bounds.
    pub fn validate(&self) -> Result<(), RewardError> {
        if self.policy_version == 0 {
            return Err(RewardError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }
        if self.max_awards_per_call == 0 {
            return Err(RewardError::Configuration(
                "max_awards_per_call MUST be >= 1".to_string(),
            ));
        }
        if self.max_write_retries == 0 {
            return Err(RewardError::Configuration(
                "max_write_retries MUST be >= 1".to_string(),
            ));
        }
        if self.streak_cutoff_hour_utc > 23 {
            return Err(RewardError::Configuration(
                "streak_cutoff_hour_utc MUST be in [0, 23]".to_string(),
            ));
        }
        if self.default_history_limit == 0 {
            return Err(RewardError::Configuration(
                "default_history_limit MUST be >= 1".to_string(),
            ));
        }
        if let Some((action, points)) = self.social_points.iter().find(|(_, points)| **points < 0) {
            return Err(RewardError::Configuration(format!(
                "social_points.{action} MUST be >= 0 (got {points})"
            )));
        }
        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`RewardError::Configuration`] when JSON decoding fails
    /// or decoded values violate policy constraints.
    pub fn from_json(value: &Value) -> Result<Self, RewardError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            RewardError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// The business date for `now`: days roll over at the cutoff hour.
    #[must_use]
    pub fn business_date(&self, now: OffsetDateTime) -> Date {
        (now.to_offset(UtcOffset::UTC) - Duration::hours(i64::from(self.streak_cutoff_hour_utc)))
            .date()
    }
}

/// Source of the current instant for date and streak comparisons.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// A manually driven clock for deterministic runs.
#[derive(Debug)]
pub struct FixedClock {
    instant: Mutex<OffsetDateTime>,
}

impl FixedClock {
    #[must_use]
    pub fn new(instant: OffsetDateTime) -> Self {
        Self {
            instant: Mutex::new(instant),
        }
    }

    pub fn set(&self, instant: OffsetDateTime) {
        let mut guard = match self.instant.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = instant;
    }

    pub fn advance(&self, by: Duration) {
        let current = self.now();
        self.set(current + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        match self.instant.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`RewardError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, RewardError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| RewardError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(RewardError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`RewardError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RewardError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| {
            RewardError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a calendar date in `YYYY-MM-DD` form. Month and day must be
/// zero-padded.
///
/// # Errors
/// Returns [`RewardError::Validation`] when the value is not a valid date.
pub fn parse_date(value: &str) -> Result<Date, RewardError> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|err| RewardError::Validation(format!("invalid date {value}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`RewardError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, RewardError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| RewardError::Validation(format!("failed to format date: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub mod date_format {
    //! Serde adapter writing [`time::Date`] as `YYYY-MM-DD`.

    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Fails when the date cannot be formatted.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = super::format_date(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&raw)
    }

    /// # Errors
    /// Fails when the input is not a `YYYY-MM-DD` string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        /// # Errors
        /// Fails when the date cannot be formatted.
        pub fn serialize<S: Serializer>(
            value: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(date) => super::serialize(date, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Fails when the input is neither null nor a `YYYY-MM-DD` string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.as_deref()
                .map(super::super::parse_date)
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_user() -> UserId {
        must_ok("01J0SQQP7M70P6Y3R4T8D8G8M2".parse())
    }

    fn fixture_levels() -> LevelTable {
        must_ok(LevelTable::new(vec![
            Level::new(1, "Novice", 0),
            Level::new(2, "Apprentice", 100),
            Level::new(3, "Adept", 500),
            Level::new(4, "Master", 1_000),
        ]))
    }

    fn fixture_entry(
        user_seq: i64,
        transaction_type: TransactionType,
        points: i64,
        balance_after: i64,
    ) -> LedgerEntry {
        LedgerEntry {
            ledger_seq: user_seq,
            entry_id: Ulid::new(),
            user_id: fixture_user(),
            user_seq,
            transaction_type,
            points,
            balance_after,
            reference_type: None,
            reference_id: None,
            description: String::new(),
            created_at: must_utc("2026-02-07T12:00:00Z"),
        }
    }

    #[test]
    fn profile_takes_balance_from_entry_not_delta() {
        let levels = fixture_levels();
        let mut profile =
            ProfileAggregate::new(fixture_user(), &levels, must_utc("2026-02-07T00:00:00Z"));

        must_ok(profile.apply_entry(&fixture_entry(1, TransactionType::Earn, 100, 100), &levels));
        // A spend whose balance_after disagrees with the naive delta still wins.
        must_ok(profile.apply_entry(&fixture_entry(2, TransactionType::Spend, -60, 45), &levels));

        assert_eq!(profile.total_points, 100);
        assert_eq!(profile.available_points, 45);
        assert_eq!(profile.last_user_seq, 2);
        assert_eq!(profile.current_level, Some(2));
    }

    #[test]
    fn refunds_and_adjustments_do_not_raise_lifetime_total() {
        let levels = fixture_levels();
        let mut profile =
            ProfileAggregate::new(fixture_user(), &levels, must_utc("2026-02-07T00:00:00Z"));

        must_ok(profile.apply_entry(&fixture_entry(1, TransactionType::Earn, 50, 50), &levels));
        must_ok(profile.apply_entry(&fixture_entry(2, TransactionType::Spend, -50, 0), &levels));
        must_ok(profile.apply_entry(&fixture_entry(3, TransactionType::Refund, 50, 50), &levels));
        let adjustment = fixture_entry(4, TransactionType::Adjustment, 25, 75);
        must_ok(profile.apply_entry(&adjustment, &levels));

        assert_eq!(profile.total_points, 50);
        assert_eq!(profile.available_points, 75);
    }

    #[test]
    fn stale_entries_are_rejected() {
        let levels = fixture_levels();
        let mut profile =
            ProfileAggregate::new(fixture_user(), &levels, must_utc("2026-02-07T00:00:00Z"));
        must_ok(profile.apply_entry(&fixture_entry(1, TransactionType::Earn, 10, 10), &levels));

        let result = profile.apply_entry(&fixture_entry(1, TransactionType::Earn, 10, 20), &levels);
        assert!(matches!(result, Err(RewardError::Validation(_))));
    }

    #[test]
    fn policy_round_trips_and_rejects_bad_bounds() {
        let policy = RewardPolicy::v1();
        must_ok(policy.validate());
        let decoded = must_ok(RewardPolicy::from_json(&must_ok(serde_json::to_value(&policy))));
        assert_eq!(decoded, policy);

        let mut broken = RewardPolicy::v1();
        broken.streak_cutoff_hour_utc = 24;
        assert!(matches!(broken.validate(), Err(RewardError::Configuration(_))));

        let invalid = RewardPolicy::from_json(&json!({"policy_version": 1}));
        assert!(matches!(invalid, Err(RewardError::Configuration(_))));
    }

    #[test]
    fn business_date_rolls_at_cutoff_hour() {
        let mut policy = RewardPolicy::v1();
        policy.streak_cutoff_hour_utc = 4;

        let before_cutoff = policy.business_date(must_utc("2026-02-08T03:59:00Z"));
        let after_cutoff = policy.business_date(must_utc("2026-02-08T04:00:00Z"));

        assert_eq!(must_ok(format_date(before_cutoff)), "2026-02-07");
        assert_eq!(must_ok(format_date(after_cutoff)), "2026-02-08");
    }

    #[test]
    fn calendar_dates_require_padded_iso_form() {
        let day = must_ok(parse_date("2026-02-07"));
        assert_eq!(must_ok(format_date(day)), "2026-02-07");

        for raw in [
            "2026-2-7",
            "2026-02-7",
            "26-02-07",
            "2026-02-30",
            "2026/02/07",
            "2026-02-07T00:00:00Z",
            "",
        ] {
            assert!(
                matches!(parse_date(raw), Err(RewardError::Validation(_))),
                "{raw} accepted as YYYY-MM-DD"
            );
        }
    }

    #[test]
    fn event_multiplier_only_counts_running_matching_events() {
        let now = must_utc("2026-02-07T12:00:00Z");
        let event = |event_type: &str, multiplier: f64, is_active: bool| RewardEvent {
            event_id: DefinitionId::new(),
            name: "promo".to_string(),
            description: String::new(),
            event_type: event_type.to_string(),
            point_multiplier: multiplier,
            starts_at: must_utc("2026-02-01T00:00:00Z"),
            ends_at: must_utc("2026-02-28T00:00:00Z"),
            is_active,
        };

        let events = vec![
            event("weekend", 2.0, true),
            event("weekend", 1.5, true),
            event("weekend", 10.0, false),
            event("holiday", 3.0, true),
        ];

        assert_eq!(apply_event_multiplier(10, "weekend", &events, now), 30);
        assert_eq!(apply_event_multiplier(7, "none", &events, now), 7);
    }

    #[test]
    fn definition_input_requires_object_criteria() {
        let mut input = DefinitionInput {
            name: "First Steps".to_string(),
            description: String::new(),
            criteria: json!({"points": {"min_points": 10}}),
            points_reward: 5,
            badge_reward: None,
        };
        must_ok(input.validate());

        input.criteria = json!(["points"]);
        assert!(input.validate().is_err());
    }

    #[test]
    fn streak_dates_serialize_as_calendar_days() {
        let mut streak = Streak::new(fixture_user(), "login");
        streak.last_activity_date = Some(must_ok(parse_date("2026-02-07")));

        let value = must_ok(serde_json::to_value(&streak));
        assert_eq!(value["last_activity_date"], json!("2026-02-07"));

        let decoded: Streak = must_ok(serde_json::from_value(value));
        assert_eq!(decoded, streak);
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(must_utc("2026-02-07T12:00:00Z"));
        clock.advance(Duration::days(1));
        assert_eq!(clock.now(), must_utc("2026-02-08T12:00:00Z"));
    }
}
