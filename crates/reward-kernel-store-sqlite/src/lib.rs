#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reward_kernel_core::{
    apply_event_multiplier, format_rfc3339, parse_rfc3339_utc, Badge, Challenge, Clock,
    CriteriaRegistry, DefinitionId, DefinitionInput, DefinitionKind, Level, LevelTable, Quest,
    RewardError, RewardEvent, RewardEventInput, RewardPolicy, SystemClock, UserId,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

mod dispatch;
mod ledger;
mod tracking;

pub use dispatch::{DispatchReport, RewardGrant, RewardRecordFailure};
pub use ledger::{
    AwardOutcome, AwardRequest, DriftSample, HistoryQuery, LedgerCheck, LedgerIssue,
    LedgerIssueSeverity, LedgerPage, LedgerStatus, ReconcileReport, ReconcileSummary,
    RefundTarget,
};
pub use tracking::{CompletionCheck, ProgressOutcome, StreakSweepReport, StreakUpdate};

const REWARD_MIGRATION_VERSION: i64 = 1;

const SCHEMA_REWARDS_V1: &str = r"
CREATE TABLE IF NOT EXISTS reward_policies (
  policy_version INTEGER PRIMARY KEY,
  policy_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
  ledger_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  user_seq INTEGER NOT NULL CHECK (user_seq >= 1),
  transaction_type TEXT NOT NULL CHECK (
    transaction_type IN ('earn', 'spend', 'adjustment', 'refund')
  ),
  points INTEGER NOT NULL CHECK (points <> 0),
  balance_after INTEGER NOT NULL CHECK (balance_after >= 0),
  reference_type TEXT,
  reference_id TEXT,
  description TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  UNIQUE (user_id, user_seq)
);

CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ledger_entries_user_type_seq
  ON ledger_entries(user_id, transaction_type, user_seq);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_reference
  ON ledger_entries(reference_type, reference_id);

CREATE TABLE IF NOT EXISTS point_activities (
  activity_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  action TEXT NOT NULL,
  points INTEGER NOT NULL,
  transaction_type TEXT NOT NULL CHECK (
    transaction_type IN ('earn', 'spend', 'adjustment', 'refund')
  ),
  reference_type TEXT,
  reference_id TEXT,
  description TEXT NOT NULL DEFAULT '',
  ledger_entry_id TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (ledger_entry_id) REFERENCES ledger_entries(entry_id)
);

CREATE TRIGGER IF NOT EXISTS trg_point_activities_no_update
BEFORE UPDATE ON point_activities
BEGIN
  SELECT RAISE(FAIL, 'point_activities is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_point_activities_no_delete
BEFORE DELETE ON point_activities
BEGIN
  SELECT RAISE(FAIL, 'point_activities is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_point_activities_user_action
  ON point_activities(user_id, action);

CREATE TABLE IF NOT EXISTS reward_profiles (
  user_id TEXT PRIMARY KEY,
  total_points INTEGER NOT NULL CHECK (total_points >= 0),
  available_points INTEGER NOT NULL,
  current_level INTEGER,
  progress_to_next_level REAL NOT NULL CHECK (progress_to_next_level BETWEEN 0.0 AND 1.0),
  streak_count INTEGER NOT NULL DEFAULT 0,
  longest_streak INTEGER NOT NULL DEFAULT 0,
  consecutive_login_days INTEGER NOT NULL DEFAULT 0,
  last_user_seq INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS levels (
  number INTEGER PRIMARY KEY CHECK (number >= 1),
  name TEXT NOT NULL,
  required_points INTEGER NOT NULL CHECK (required_points >= 0)
);

CREATE TABLE IF NOT EXISTS badges (
  badge_id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL DEFAULT '',
  criteria_json TEXT NOT NULL DEFAULT '{}',
  points_reward INTEGER NOT NULL DEFAULT 0 CHECK (points_reward >= 0),
  badge_type TEXT NOT NULL,
  rarity TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quests (
  quest_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  criteria_json TEXT NOT NULL DEFAULT '{}',
  points_reward INTEGER NOT NULL DEFAULT 0 CHECK (points_reward >= 0),
  badge_reward TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  starts_at TEXT,
  ends_at TEXT,
  difficulty TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (badge_reward) REFERENCES badges(badge_id)
);

CREATE TABLE IF NOT EXISTS challenges (
  challenge_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  challenge_type TEXT NOT NULL,
  criteria_json TEXT NOT NULL DEFAULT '{}',
  points_reward INTEGER NOT NULL DEFAULT 0 CHECK (points_reward >= 0),
  badge_reward TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  period_seconds INTEGER CHECK (period_seconds > 0 OR period_seconds IS NULL),
  created_at TEXT NOT NULL,
  FOREIGN KEY (badge_reward) REFERENCES badges(badge_id)
);

CREATE TABLE IF NOT EXISTS user_badges (
  user_id TEXT NOT NULL,
  badge_id TEXT NOT NULL,
  source TEXT NOT NULL,
  awarded_at TEXT NOT NULL,
  PRIMARY KEY (user_id, badge_id),
  FOREIGN KEY (badge_id) REFERENCES badges(badge_id)
);

CREATE TABLE IF NOT EXISTS user_quests (
  user_id TEXT NOT NULL,
  quest_id TEXT NOT NULL,
  progress_json TEXT NOT NULL DEFAULT '{}',
  is_completed INTEGER NOT NULL DEFAULT 0 CHECK (is_completed IN (0, 1)),
  completed_at TEXT,
  started_at TEXT NOT NULL,
  PRIMARY KEY (user_id, quest_id),
  FOREIGN KEY (quest_id) REFERENCES quests(quest_id)
);

CREATE TABLE IF NOT EXISTS user_challenges (
  user_id TEXT NOT NULL,
  challenge_id TEXT NOT NULL,
  progress_json TEXT NOT NULL DEFAULT '{}',
  status TEXT NOT NULL CHECK (status IN ('in_progress', 'completed', 'expired')),
  completed_at TEXT,
  period_start TEXT NOT NULL,
  period_end TEXT,
  PRIMARY KEY (user_id, challenge_id),
  FOREIGN KEY (challenge_id) REFERENCES challenges(challenge_id)
);

CREATE TABLE IF NOT EXISTS streaks (
  user_id TEXT NOT NULL,
  streak_type TEXT NOT NULL,
  current_count INTEGER NOT NULL DEFAULT 0 CHECK (current_count >= 0),
  longest_count INTEGER NOT NULL DEFAULT 0 CHECK (longest_count >= 0),
  last_activity_date TEXT,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, streak_type)
);

CREATE INDEX IF NOT EXISTS idx_streaks_active_last
  ON streaks(is_active, last_activity_date);

CREATE TABLE IF NOT EXISTS social_stats (
  user_id TEXT NOT NULL,
  metric TEXT NOT NULL,
  count INTEGER NOT NULL CHECK (count >= 0),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, metric)
);

CREATE TABLE IF NOT EXISTS user_accounts (
  user_id TEXT PRIMARY KEY,
  joined_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reward_events (
  event_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  event_type TEXT NOT NULL,
  point_multiplier REAL NOT NULL CHECK (point_multiplier > 0.0),
  starts_at TEXT NOT NULL,
  ends_at TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reward_events_type
  ON reward_events(event_type, is_active);
";

/// SQLite-backed rewards ledger and every transactional operation on it.
pub struct SqliteRewardStore {
    conn: Connection,
    registry: Arc<CriteriaRegistry>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BadgeInput {
    #[serde(flatten)]
    pub definition: DefinitionInput,
    #[serde(default = "default_badge_type")]
    pub badge_type: String,
    #[serde(default = "default_rarity")]
    pub rarity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestInput {
    #[serde(flatten)]
    pub definition: DefinitionInput,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChallengeInput {
    #[serde(flatten)]
    pub definition: DefinitionInput,
    #[serde(default = "default_challenge_type")]
    pub challenge_type: String,
    #[serde(default)]
    pub period_seconds: Option<i64>,
}

fn default_badge_type() -> String {
    "achievement".to_string()
}

fn default_rarity() -> String {
    "common".to_string()
}

fn default_difficulty() -> String {
    "beginner".to_string()
}

fn default_challenge_type() -> String {
    "daily".to_string()
}

impl SqliteRewardStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            registry: Arc::new(CriteriaRegistry::with_defaults()),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the criteria registry used for every evaluation.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<CriteriaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_busy_timeout(&self, timeout: std::time::Duration) -> Result<()> {
        self.conn
            .busy_timeout(timeout)
            .context("failed to set sqlite busy timeout")
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_REWARDS_V1)
            .context("failed to apply rewards schema")?;

        let now = sql_time(self.now())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REWARD_MIGRATION_VERSION, now],
            )
            .context("failed to register rewards schema migration")?;

        let seeded = RewardPolicy::v1();
        let payload = serde_json::to_string(&seeded).context("failed to serialize policy")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO reward_policies(policy_version, policy_json, created_at)
                 VALUES (?1, ?2, ?3)",
                params![i64::from(seeded.policy_version), payload, now],
            )
            .context("failed to seed reward policy")?;

        Ok(())
    }

    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    #[must_use]
    pub fn registry(&self) -> &CriteriaRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn upsert_policy(&self, policy: &RewardPolicy) -> Result<()> {
        policy.validate().map_err(domain)?;

        let payload = serde_json::to_string(policy).context("failed to serialize policy")?;
        let now = sql_time(self.now())?;

        self.conn
            .execute(
                "INSERT INTO reward_policies(policy_version, policy_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(policy_version) DO UPDATE SET
                   policy_json = excluded.policy_json,
                   created_at = excluded.created_at",
                params![i64::from(policy.policy_version), payload, now],
            )
            .context("failed to upsert reward policy")?;

        tracing::info!(policy_version = policy.policy_version, "reward policy stored");
        Ok(())
    }

    pub fn get_policies(&self) -> Result<BTreeMap<u32, RewardPolicy>> {
        let mut stmt = self.conn.prepare(
            "SELECT policy_version, policy_json FROM reward_policies ORDER BY policy_version ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut map = BTreeMap::new();

        while let Some(row) = rows.next()? {
            let version_i64: i64 = row.get(0)?;
            let version = u32::try_from(version_i64)
                .with_context(|| format!("invalid policy_version: {version_i64}"))?;
            let json: String = row.get(1)?;
            let value: Value = serde_json::from_str(&json).context("invalid stored policy JSON")?;
            let policy = RewardPolicy::from_json(&value)
                .map_err(|err| anyhow!("failed to parse policy {version}: {err}"))?;
            map.insert(version, policy);
        }

        Ok(map)
    }

    /// The active policy: the highest stored version.
    pub fn policy(&self) -> Result<RewardPolicy> {
        self.get_policies()?
            .into_values()
            .next_back()
            .ok_or_else(|| domain(RewardError::Configuration(
                "no reward policy stored; run migrate first".to_string(),
            )))
    }

    pub fn upsert_level(&mut self, level: &Level) -> Result<LevelTable> {
        if level.name.trim().is_empty() {
            return Err(domain(RewardError::Validation(
                "level name MUST be provided".to_string(),
            )));
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start level transaction")?;
        tx.execute(
            "INSERT INTO levels(number, name, required_points) VALUES (?1, ?2, ?3)
             ON CONFLICT(number) DO UPDATE SET
               name = excluded.name,
               required_points = excluded.required_points",
            params![i64::from(level.number), level.name, level.required_points],
        )
        .context("failed to upsert level")?;

        let table = LevelTable::new(load_levels(&tx)?).map_err(domain)?;
        tx.commit().context("failed to commit level transaction")?;

        Ok(table)
    }

    pub fn level_table(&self) -> Result<LevelTable> {
        LevelTable::new(load_levels(&self.conn)?).map_err(domain)
    }

    pub fn create_badge(&self, input: &BadgeInput) -> Result<Badge> {
        input.definition.validate().map_err(domain)?;
        if input.definition.badge_reward.is_some() {
            return Err(domain(RewardError::Validation(
                "badges cannot carry a badge_reward".to_string(),
            )));
        }

        let badge = Badge {
            badge_id: DefinitionId::new(),
            name: input.definition.name.trim().to_string(),
            description: input.definition.description.clone(),
            criteria: input.definition.criteria.clone(),
            points_reward: input.definition.points_reward,
            badge_type: input.badge_type.clone(),
            rarity: input.rarity.clone(),
            is_active: true,
            created_at: self.now(),
        };

        self.conn
            .execute(
                "INSERT INTO badges(
                    badge_id, name, description, criteria_json, points_reward,
                    badge_type, rarity, is_active, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
                params![
                    badge.badge_id.to_string(),
                    badge.name,
                    badge.description,
                    serde_json::to_string(&badge.criteria).context("failed to serialize criteria")?,
                    badge.points_reward,
                    badge.badge_type,
                    badge.rarity,
                    sql_time(badge.created_at)?,
                ],
            )
            .with_context(|| format!("failed to create badge {}", badge.name))?;

        self.log_unknown_conditions(DefinitionKind::Badge, badge.badge_id, &badge.criteria);
        Ok(badge)
    }

    pub fn create_quest(&self, input: &QuestInput) -> Result<Quest> {
        input.definition.validate().map_err(domain)?;
        if let (Some(starts_at), Some(ends_at)) = (input.starts_at, input.ends_at) {
            if ends_at <= starts_at {
                return Err(domain(RewardError::Validation(
                    "quest ends_at MUST be after starts_at".to_string(),
                )));
            }
        }
        self.ensure_badge_exists(input.definition.badge_reward)?;

        let quest = Quest {
            quest_id: DefinitionId::new(),
            name: input.definition.name.trim().to_string(),
            description: input.definition.description.clone(),
            criteria: input.definition.criteria.clone(),
            points_reward: input.definition.points_reward,
            badge_reward: input.definition.badge_reward,
            is_active: true,
            starts_at: input.starts_at,
            ends_at: input.ends_at,
            difficulty: input.difficulty.clone(),
            created_at: self.now(),
        };

        self.conn
            .execute(
                "INSERT INTO quests(
                    quest_id, name, description, criteria_json, points_reward, badge_reward,
                    is_active, starts_at, ends_at, difficulty, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?10)",
                params![
                    quest.quest_id.to_string(),
                    quest.name,
                    quest.description,
                    serde_json::to_string(&quest.criteria).context("failed to serialize criteria")?,
                    quest.points_reward,
                    quest.badge_reward.map(|id| id.to_string()),
                    quest.starts_at.map(sql_time).transpose()?,
                    quest.ends_at.map(sql_time).transpose()?,
                    quest.difficulty,
                    sql_time(quest.created_at)?,
                ],
            )
            .with_context(|| format!("failed to create quest {}", quest.name))?;

        self.log_unknown_conditions(DefinitionKind::Quest, quest.quest_id, &quest.criteria);
        Ok(quest)
    }

    pub fn create_challenge(&self, input: &ChallengeInput) -> Result<Challenge> {
        input.definition.validate().map_err(domain)?;
        if input.period_seconds.is_some_and(|seconds| seconds <= 0) {
            return Err(domain(RewardError::Validation(
                "challenge period_seconds MUST be > 0".to_string(),
            )));
        }
        self.ensure_badge_exists(input.definition.badge_reward)?;

        let challenge = Challenge {
            challenge_id: DefinitionId::new(),
            name: input.definition.name.trim().to_string(),
            description: input.definition.description.clone(),
            challenge_type: input.challenge_type.clone(),
            criteria: input.definition.criteria.clone(),
            points_reward: input.definition.points_reward,
            badge_reward: input.definition.badge_reward,
            is_active: true,
            period_seconds: input.period_seconds,
            created_at: self.now(),
        };

        self.conn
            .execute(
                "INSERT INTO challenges(
                    challenge_id, name, description, challenge_type, criteria_json,
                    points_reward, badge_reward, is_active, period_seconds, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
                params![
                    challenge.challenge_id.to_string(),
                    challenge.name,
                    challenge.description,
                    challenge.challenge_type,
                    serde_json::to_string(&challenge.criteria)
                        .context("failed to serialize criteria")?,
                    challenge.points_reward,
                    challenge.badge_reward.map(|id| id.to_string()),
                    challenge.period_seconds,
                    sql_time(challenge.created_at)?,
                ],
            )
            .with_context(|| format!("failed to create challenge {}", challenge.name))?;

        self.log_unknown_conditions(
            DefinitionKind::Challenge,
            challenge.challenge_id,
            &challenge.criteria,
        );
        Ok(challenge)
    }

    pub fn set_definition_active(
        &self,
        kind: DefinitionKind,
        definition_id: DefinitionId,
        is_active: bool,
    ) -> Result<()> {
        let (table, column) = definition_table(kind);
        let changed = self
            .conn
            .execute(
                &format!("UPDATE {table} SET is_active = ?1 WHERE {column} = ?2"),
                params![bool_to_sql(is_active), definition_id.to_string()],
            )
            .with_context(|| format!("failed to update {} {definition_id}", kind.as_str()))?;

        if changed == 0 {
            return Err(domain(RewardError::NotFound(format!(
                "{} {definition_id}",
                kind.as_str()
            ))));
        }

        tracing::info!(
            kind = kind.as_str(),
            definition_id = %definition_id,
            is_active,
            "definition activation changed"
        );
        Ok(())
    }

    pub fn get_badge(&self, badge_id: DefinitionId) -> Result<Option<Badge>> {
        load_badge(&self.conn, badge_id)
    }

    pub fn list_badges(&self, active_only: bool) -> Result<Vec<Badge>> {
        let mut stmt = self.conn.prepare(&format!(
            "{BADGE_COLUMNS} WHERE is_active = 1 OR ?1 = 0 ORDER BY created_at ASC, badge_id ASC"
        ))?;
        let rows = stmt.query_map(params![bool_to_sql(active_only)], parse_badge_row)?;
        collect_rows(rows)
    }

    pub fn get_quest(&self, quest_id: DefinitionId) -> Result<Option<Quest>> {
        load_quest(&self.conn, quest_id)
    }

    pub fn list_quests(&self, active_only: bool) -> Result<Vec<Quest>> {
        let mut stmt = self.conn.prepare(&format!(
            "{QUEST_COLUMNS} WHERE is_active = 1 OR ?1 = 0 ORDER BY created_at ASC, quest_id ASC"
        ))?;
        let rows = stmt.query_map(params![bool_to_sql(active_only)], parse_quest_row)?;
        collect_rows(rows)
    }

    pub fn get_challenge(&self, challenge_id: DefinitionId) -> Result<Option<Challenge>> {
        load_challenge(&self.conn, challenge_id)
    }

    pub fn list_challenges(&self, active_only: bool) -> Result<Vec<Challenge>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CHALLENGE_COLUMNS} WHERE is_active = 1 OR ?1 = 0
             ORDER BY created_at ASC, challenge_id ASC"
        ))?;
        let rows = stmt.query_map(params![bool_to_sql(active_only)], parse_challenge_row)?;
        collect_rows(rows)
    }

    pub fn create_event(&self, input: &RewardEventInput) -> Result<RewardEvent> {
        input.validate().map_err(domain)?;

        let event = RewardEvent {
            event_id: DefinitionId::new(),
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            event_type: input.event_type.clone(),
            point_multiplier: input.point_multiplier,
            starts_at: input.starts_at,
            ends_at: input.ends_at,
            is_active: true,
        };

        self.conn
            .execute(
                "INSERT INTO reward_events(
                    event_id, name, description, event_type, point_multiplier,
                    starts_at, ends_at, is_active, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
                params![
                    event.event_id.to_string(),
                    event.name,
                    event.description,
                    event.event_type,
                    event.point_multiplier,
                    sql_time(event.starts_at)?,
                    sql_time(event.ends_at)?,
                    sql_time(self.now())?,
                ],
            )
            .with_context(|| format!("failed to create event {}", event.name))?;

        Ok(event)
    }

    pub fn set_event_active(&self, event_id: DefinitionId, is_active: bool) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE reward_events SET is_active = ?1 WHERE event_id = ?2",
                params![bool_to_sql(is_active), event_id.to_string()],
            )
            .with_context(|| format!("failed to update event {event_id}"))?;

        if changed == 0 {
            return Err(domain(RewardError::NotFound(format!("event {event_id}"))));
        }
        Ok(())
    }

    pub fn list_events(&self, active_only: bool) -> Result<Vec<RewardEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, name, description, event_type, point_multiplier,
                    starts_at, ends_at, is_active
             FROM reward_events
             WHERE is_active = 1 OR ?1 = 0
             ORDER BY starts_at ASC, event_id ASC",
        )?;
        let rows = stmt.query_map(params![bool_to_sql(active_only)], parse_event_row)?;
        collect_rows(rows)
    }

    /// Events of `event_type` running right now.
    pub fn running_events(&self, event_type: &str) -> Result<Vec<RewardEvent>> {
        let now = self.now();
        Ok(self
            .list_events(true)?
            .into_iter()
            .filter(|event| event.event_type == event_type && event.is_running(now))
            .collect())
    }

    /// Product of the multipliers of every running event of `event_type`.
    pub fn event_multiplier(&self, event_type: &str) -> Result<f64> {
        Ok(self
            .running_events(event_type)?
            .iter()
            .fold(1.0_f64, |acc, event| acc * event.point_multiplier))
    }

    pub fn apply_event_multiplier(&self, points: i64, event_type: &str) -> Result<i64> {
        let events = self.running_events(event_type)?;
        Ok(apply_event_multiplier(points, event_type, &events, self.now()))
    }

    /// Deactivates active events whose window has closed, one event at a time.
    pub fn expire_events(&self, now: Option<OffsetDateTime>) -> Result<Vec<DefinitionId>> {
        let now = now.unwrap_or_else(|| self.now());
        let mut expired = Vec::new();

        for event in self.list_events(true)? {
            if event.ends_at < now {
                self.conn
                    .execute(
                        "UPDATE reward_events SET is_active = 0
                         WHERE event_id = ?1 AND is_active = 1",
                        params![event.event_id.to_string()],
                    )
                    .with_context(|| format!("failed to expire event {}", event.event_id))?;
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "event expired"
                );
                expired.push(event.event_id);
            }
        }

        Ok(expired)
    }

    /// Activates inactive events whose window is open, one event at a time.
    pub fn start_scheduled_events(&self, now: Option<OffsetDateTime>) -> Result<Vec<DefinitionId>> {
        let now = now.unwrap_or_else(|| self.now());
        let mut started = Vec::new();

        for event in self.list_events(false)? {
            if !event.is_active && event.starts_at <= now && now < event.ends_at {
                self.conn
                    .execute(
                        "UPDATE reward_events SET is_active = 1
                         WHERE event_id = ?1 AND is_active = 0",
                        params![event.event_id.to_string()],
                    )
                    .with_context(|| format!("failed to start event {}", event.event_id))?;
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "event started"
                );
                started.push(event.event_id);
            }
        }

        Ok(started)
    }

    pub fn register_user(&self, user_id: UserId, joined_at: OffsetDateTime) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_accounts(user_id, joined_at) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET joined_at = excluded.joined_at",
                params![user_id.to_string(), sql_time(joined_at)?],
            )
            .context("failed to register user")?;
        Ok(())
    }

    pub fn joined_at(&self, user_id: UserId) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT joined_at FROM user_accounts WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load user account")?;

        raw.map(|value| parse_rfc3339_utc(&value).map_err(domain))
            .transpose()
    }

    pub fn set_social_count(&self, user_id: UserId, metric: &str, count: u64) -> Result<()> {
        if metric.trim().is_empty() {
            return Err(domain(RewardError::Validation(
                "social metric MUST be provided".to_string(),
            )));
        }
        let count = i64::try_from(count).context("social count exceeds storage range")?;

        self.conn
            .execute(
                "INSERT INTO social_stats(user_id, metric, count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, metric) DO UPDATE SET
                   count = excluded.count,
                   updated_at = excluded.updated_at",
                params![user_id.to_string(), metric, count, sql_time(self.now())?],
            )
            .context("failed to store social count")?;
        Ok(())
    }

    pub fn social_stats(&self, user_id: UserId) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT metric, count FROM social_stats WHERE user_id = ?1 ORDER BY metric ASC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            let metric: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((metric, u64_from_sql(count, 1)?))
        })?;
        Ok(collect_rows(rows)?.into_iter().collect())
    }

    fn ensure_badge_exists(&self, badge_id: Option<DefinitionId>) -> Result<()> {
        let Some(badge_id) = badge_id else {
            return Ok(());
        };
        if self.get_badge(badge_id)?.is_none() {
            return Err(domain(RewardError::NotFound(format!("badge {badge_id}"))));
        }
        Ok(())
    }

    fn log_unknown_conditions(
        &self,
        kind: DefinitionKind,
        definition_id: DefinitionId,
        criteria: &Value,
    ) {
        for condition in self.registry.unknown_conditions(criteria) {
            tracing::warn!(
                kind = kind.as_str(),
                definition_id = %definition_id,
                condition = %condition,
                "definition references unknown criteria condition; it will never be satisfied"
            );
        }
    }
}

pub(crate) const BADGE_COLUMNS: &str = "SELECT badge_id, name, description, criteria_json,
        points_reward,
        badge_type, rarity, is_active, created_at
     FROM badges";

pub(crate) const QUEST_COLUMNS: &str = "SELECT quest_id, name, description, criteria_json,
        points_reward,
        badge_reward, is_active, starts_at, ends_at, difficulty, created_at
     FROM quests";

pub(crate) const CHALLENGE_COLUMNS: &str = "SELECT challenge_id, name, description, challenge_type,
        criteria_json, points_reward, badge_reward, is_active, period_seconds, created_at
     FROM challenges";

fn definition_table(kind: DefinitionKind) -> (&'static str, &'static str) {
    match kind {
        DefinitionKind::Badge => ("badges", "badge_id"),
        DefinitionKind::Quest => ("quests", "quest_id"),
        DefinitionKind::Challenge => ("challenges", "challenge_id"),
    }
}

fn load_levels(conn: &Connection) -> Result<Vec<Level>> {
    let mut stmt = conn.prepare(
        "SELECT number, name, required_points FROM levels ORDER BY required_points ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let number: i64 = row.get(0)?;
        Ok(Level {
            number: u32_from_sql(number, 0)?,
            name: row.get(1)?,
            required_points: row.get(2)?,
        })
    })?;
    collect_rows(rows)
}

pub(crate) fn load_badge(conn: &Connection, badge_id: DefinitionId) -> Result<Option<Badge>> {
    conn.query_row(
        &format!("{BADGE_COLUMNS} WHERE badge_id = ?1"),
        params![badge_id.to_string()],
        parse_badge_row,
    )
    .optional()
    .context("failed to load badge")
}

pub(crate) fn load_quest(conn: &Connection, quest_id: DefinitionId) -> Result<Option<Quest>> {
    conn.query_row(
        &format!("{QUEST_COLUMNS} WHERE quest_id = ?1"),
        params![quest_id.to_string()],
        parse_quest_row,
    )
    .optional()
    .context("failed to load quest")
}

pub(crate) fn load_challenge(
    conn: &Connection,
    challenge_id: DefinitionId,
) -> Result<Option<Challenge>> {
    conn.query_row(
        &format!("{CHALLENGE_COLUMNS} WHERE challenge_id = ?1"),
        params![challenge_id.to_string()],
        parse_challenge_row,
    )
    .optional()
    .context("failed to load challenge")
}

pub(crate) fn parse_badge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Badge> {
    Ok(Badge {
        badge_id: parse_definition_id(&row.get::<_, String>(0)?, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        criteria: parse_json(&row.get::<_, String>(3)?, 3)?,
        points_reward: row.get(4)?,
        badge_type: row.get(5)?,
        rarity: row.get(6)?,
        is_active: row.get::<_, i64>(7)? == 1,
        created_at: parse_sql_time(&row.get::<_, String>(8)?)?,
    })
}

pub(crate) fn parse_quest_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Quest> {
    let badge_reward: Option<String> = row.get(5)?;
    let starts_at: Option<String> = row.get(7)?;
    let ends_at: Option<String> = row.get(8)?;

    Ok(Quest {
        quest_id: parse_definition_id(&row.get::<_, String>(0)?, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        criteria: parse_json(&row.get::<_, String>(3)?, 3)?,
        points_reward: row.get(4)?,
        badge_reward: badge_reward
            .map(|raw| parse_definition_id(&raw, 5))
            .transpose()?,
        is_active: row.get::<_, i64>(6)? == 1,
        starts_at: starts_at.map(|raw| parse_sql_time(&raw)).transpose()?,
        ends_at: ends_at.map(|raw| parse_sql_time(&raw)).transpose()?,
        difficulty: row.get(9)?,
        created_at: parse_sql_time(&row.get::<_, String>(10)?)?,
    })
}

pub(crate) fn parse_challenge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Challenge> {
    let badge_reward: Option<String> = row.get(6)?;

    Ok(Challenge {
        challenge_id: parse_definition_id(&row.get::<_, String>(0)?, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        challenge_type: row.get(3)?,
        criteria: parse_json(&row.get::<_, String>(4)?, 4)?,
        points_reward: row.get(5)?,
        badge_reward: badge_reward
            .map(|raw| parse_definition_id(&raw, 6))
            .transpose()?,
        is_active: row.get::<_, i64>(7)? == 1,
        period_seconds: row.get(8)?,
        created_at: parse_sql_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RewardEvent> {
    Ok(RewardEvent {
        event_id: parse_definition_id(&row.get::<_, String>(0)?, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        event_type: row.get(3)?,
        point_multiplier: row.get(4)?,
        starts_at: parse_sql_time(&row.get::<_, String>(5)?)?,
        ends_at: parse_sql_time(&row.get::<_, String>(6)?)?,
        is_active: row.get::<_, i64>(7)? == 1,
    })
}

/// Wraps a domain error so callers can `downcast_ref::<RewardError>()`.
pub(crate) fn domain(err: RewardError) -> anyhow::Error {
    anyhow::Error::new(err)
}

pub(crate) fn sql_time(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

pub(crate) fn invalid_data(
    index: usize,
    kind: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn parse_sql_time(raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(to_sql_error)
}

pub(crate) fn parse_json(raw: &str, index: usize) -> rusqlite::Result<Value> {
    serde_json::from_str(raw).map_err(|err| {
        invalid_data(
            index,
            rusqlite::types::Type::Text,
            format!("invalid stored JSON: {err}"),
        )
    })
}

pub(crate) fn parse_ulid(raw: &str, index: usize) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| {
        invalid_data(
            index,
            rusqlite::types::Type::Text,
            format!("invalid ULID: {raw}"),
        )
    })
}

pub(crate) fn parse_user_id(raw: &str, index: usize) -> rusqlite::Result<UserId> {
    parse_ulid(raw, index).map(UserId)
}

pub(crate) fn parse_definition_id(raw: &str, index: usize) -> rusqlite::Result<DefinitionId> {
    parse_ulid(raw, index).map(DefinitionId)
}

pub(crate) fn u32_from_sql(value: i64, index: usize) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        invalid_data(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid unsigned value: {value}"),
        )
    })
}

pub(crate) fn u64_from_sql(value: i64, index: usize) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        invalid_data(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid unsigned value: {value}"),
        )
    })
}

pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

#[allow(clippy::needless_pass_by_value)]
pub(crate) fn to_sql_error(err: RewardError) -> rusqlite::Error {
    invalid_data(0, rusqlite::types::Type::Text, err.to_string())
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::Result;
    use reward_kernel_core::{parse_rfc3339_utc, FixedClock, Level, UserId};
    use time::OffsetDateTime;

    use super::SqliteRewardStore;

    pub(crate) fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    pub(crate) fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    pub(crate) fn fixture_user(raw: &str) -> UserId {
        match raw.parse() {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture user: {err}"),
        }
    }

    pub(crate) fn alice() -> UserId {
        fixture_user("01J0SQQP7M70P6Y3R4T8D8G8M2")
    }

    pub(crate) fn bob() -> UserId {
        fixture_user("01J0SQQP7M70P6Y3R4T8D8G8M3")
    }

    pub(crate) fn fixture_clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(must_utc("2026-02-07T12:00:00Z")))
    }

    pub(crate) fn fixture_store_with_clock(clock: Arc<FixedClock>) -> SqliteRewardStore {
        let store = must(SqliteRewardStore::open(Path::new(":memory:"))).with_clock(clock);
        must(store.migrate());
        store
    }

    pub(crate) fn fixture_store() -> SqliteRewardStore {
        fixture_store_with_clock(fixture_clock())
    }

    pub(crate) fn seed_levels(store: &mut SqliteRewardStore) {
        for level in [
            Level::new(1, "Novice", 0),
            Level::new(2, "Apprentice", 100),
            Level::new(3, "Adept", 500),
            Level::new(4, "Master", 1_000),
        ] {
            let _ = must(store.upsert_level(&level));
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::test_support::*;
    use super::*;
    use serde_json::json;

    fn definition(name: &str, criteria: Value, points_reward: i64) -> DefinitionInput {
        DefinitionInput {
            name: name.to_string(),
            description: String::new(),
            criteria,
            points_reward,
            badge_reward: None,
        }
    }

    fn table_exists(conn: &Connection, table_name: &str) -> bool {
        match conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
                params![table_name],
                |_| Ok(()),
            )
            .optional()
        {
            Ok(value) => value.is_some(),
            Err(err) => panic!("failed to query sqlite_master: {err}"),
        }
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in [
            "ledger_entries",
            "point_activities",
            "reward_profiles",
            "levels",
            "badges",
            "quests",
            "challenges",
            "user_badges",
            "user_quests",
            "user_challenges",
            "streaks",
            "social_stats",
            "user_accounts",
            "reward_events",
            "reward_policies",
            "schema_migrations",
        ] {
            assert!(table_exists(store.connection(), table), "missing table {table}");
        }

        let trigger_count = match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type='trigger'
               AND name IN (
                 'trg_ledger_entries_no_update',
                 'trg_ledger_entries_no_delete',
                 'trg_point_activities_no_update',
                 'trg_point_activities_no_delete'
               )",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 4);
    }

    #[test]
    fn migration_is_idempotent_and_keeps_custom_policy() {
        let store = fixture_store();
        let mut custom = RewardPolicy::v1();
        custom.policy_version = 2;
        custom.max_award_depth = 2;
        must(store.upsert_policy(&custom));

        must(store.migrate());
        let active = must(store.policy());
        assert_eq!(active.policy_version, 2);
        assert_eq!(active.max_award_depth, 2);
        assert_eq!(must(store.get_policies()).len(), 2);
    }

    #[test]
    fn invalid_policy_is_rejected_as_configuration_error() {
        let store = fixture_store();
        let mut broken = RewardPolicy::v1();
        broken.max_write_retries = 0;

        let err = match store.upsert_policy(&broken) {
            Ok(()) => panic!("expected invalid policy to be rejected"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<RewardError>(),
            Some(RewardError::Configuration(_))
        ));
    }

    #[test]
    fn level_upsert_validates_whole_table() {
        let mut store = fixture_store();
        seed_levels(&mut store);
        assert_eq!(must(store.level_table()).levels().len(), 4);

        let duplicate = store.upsert_level(&Level::new(5, "Legend", 1_000));
        assert!(duplicate.is_err());
        assert_eq!(must(store.level_table()).levels().len(), 4);

        let renamed = must(store.upsert_level(&Level::new(4, "Grandmaster", 2_000)));
        assert_eq!(renamed.levels()[3].name, "Grandmaster");
    }

    #[test]
    fn definitions_round_trip_and_toggle_active() {
        let store = fixture_store();
        let badge = must(store.create_badge(&BadgeInput {
            definition: definition("First Steps", json!({"points": {"min_points": 10}}), 5),
            badge_type: default_badge_type(),
            rarity: "rare".to_string(),
        }));
        let quest = must(store.create_quest(&QuestInput {
            definition: DefinitionInput {
                badge_reward: Some(badge.badge_id),
                ..definition("Intro Course", json!({"progress": {"lessons": 3}}), 20)
            },
            difficulty: default_difficulty(),
            starts_at: None,
            ends_at: None,
        }));
        let challenge = must(store.create_challenge(&ChallengeInput {
            definition: definition("Daily Grind", json!({"progress": {"tasks": 2}}), 15),
            challenge_type: default_challenge_type(),
            period_seconds: Some(86_400),
        }));

        assert_eq!(must(store.get_badge(badge.badge_id)), Some(badge.clone()));
        assert_eq!(must(store.get_quest(quest.quest_id)), Some(quest.clone()));
        assert_eq!(must(store.get_challenge(challenge.challenge_id)), Some(challenge.clone()));

        must(store.set_definition_active(DefinitionKind::Badge, badge.badge_id, false));
        assert!(must(store.list_badges(true)).is_empty());
        assert_eq!(must(store.list_badges(false)).len(), 1);

        let missing =
            store.set_definition_active(DefinitionKind::Quest, DefinitionId::new(), false);
        assert!(matches!(
            missing.as_ref().err().and_then(|err| err.downcast_ref::<RewardError>()),
            Some(RewardError::NotFound(_))
        ));
    }

    #[test]
    fn definitions_reject_bad_inputs() {
        let store = fixture_store();

        let array_criteria = store.create_badge(&BadgeInput {
            definition: definition("Broken", json!(["points"]), 0),
            badge_type: default_badge_type(),
            rarity: default_rarity(),
        });
        assert!(array_criteria.is_err());

        let dangling_badge = store.create_quest(&QuestInput {
            definition: DefinitionInput {
                badge_reward: Some(DefinitionId::new()),
                ..definition("Dangling", json!({}), 0)
            },
            difficulty: default_difficulty(),
            starts_at: None,
            ends_at: None,
        });
        assert!(dangling_badge.is_err());

        let zero_period = store.create_challenge(&ChallengeInput {
            definition: definition("Zero", json!({}), 0),
            challenge_type: default_challenge_type(),
            period_seconds: Some(0),
        });
        assert!(zero_period.is_err());
    }

    #[test]
    fn unknown_criteria_are_accepted_at_creation() {
        let store = fixture_store();
        let badge = must(store.create_badge(&BadgeInput {
            definition: definition("Mystery", json!({"karma": {"min": 1}}), 0),
            badge_type: default_badge_type(),
            rarity: default_rarity(),
        }));
        assert_eq!(
            store.registry().unknown_conditions(&badge.criteria),
            vec!["karma".to_string()]
        );
    }

    #[test]
    fn badge_input_decodes_with_defaults() {
        let decoded: BadgeInput = match serde_json::from_value(json!({
            "name": "Chatterbox",
            "criteria": {"social": {"comments": 10}},
            "points_reward": 25
        })) {
            Ok(value) => value,
            Err(err) => panic!("failed to decode badge input: {err}"),
        };
        assert_eq!(decoded.badge_type, "achievement");
        assert_eq!(decoded.rarity, "common");
        assert_eq!(decoded.definition.points_reward, 25);
    }

    #[test]
    fn event_sweeps_expire_and_start_windows() {
        let clock = fixture_clock();
        let store = fixture_store_with_clock(clock.clone());

        let running = must(store.create_event(&RewardEventInput {
            name: "Double XP".to_string(),
            description: String::new(),
            event_type: "weekend".to_string(),
            point_multiplier: 2.0,
            starts_at: must_utc("2026-02-07T00:00:00Z"),
            ends_at: must_utc("2026-02-08T00:00:00Z"),
        }));
        let later = must(store.create_event(&RewardEventInput {
            name: "Spring".to_string(),
            description: String::new(),
            event_type: "weekend".to_string(),
            point_multiplier: 1.5,
            starts_at: must_utc("2026-03-01T00:00:00Z"),
            ends_at: must_utc("2026-03-02T00:00:00Z"),
        }));
        must(store.set_event_active(later.event_id, false));

        assert_eq!(must(store.event_multiplier("weekend")), 2.0);
        assert_eq!(must(store.apply_event_multiplier(7, "weekend")), 14);
        assert_eq!(must(store.apply_event_multiplier(7, "holiday")), 7);

        let expired = must(store.expire_events(Some(must_utc("2026-02-09T00:00:00Z"))));
        assert_eq!(expired, vec![running.event_id]);

        let started = must(store.start_scheduled_events(Some(must_utc("2026-03-01T12:00:00Z"))));
        assert_eq!(started, vec![later.event_id]);

        clock.set(must_utc("2026-03-01T12:00:00Z"));
        assert_eq!(must(store.event_multiplier("weekend")), 1.5);
    }

    #[test]
    fn social_stats_and_accounts_are_upserted() {
        let store = fixture_store();
        must(store.set_social_count(alice(), "comments", 4));
        must(store.set_social_count(alice(), "comments", 6));
        must(store.set_social_count(alice(), "followers", 1));

        let stats = must(store.social_stats(alice()));
        assert_eq!(stats.get("comments"), Some(&6));
        assert_eq!(stats.len(), 2);

        must(store.register_user(alice(), must_utc("2025-12-01T00:00:00Z")));
        assert_eq!(
            must(store.joined_at(alice())),
            Some(must_utc("2025-12-01T00:00:00Z"))
        );
        assert_eq!(must(store.joined_at(bob())), None);
    }
}
