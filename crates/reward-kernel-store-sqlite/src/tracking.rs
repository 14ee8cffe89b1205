use std::collections::BTreeSet;

use anyhow::{Context, Result};
use reward_kernel_core::{
    advance_streak, format_date, merge_progress, parse_date, ChallengeStatus, DefinitionId,
    DefinitionKind, RewardError, Streak, StreakTransition, UserBadge, UserChallenge, UserId,
    UserQuest,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime};

use crate::dispatch::inactive;
use crate::ledger::UserSession;
use crate::{
    bool_to_sql, collect_rows, domain, load_challenge, load_quest, parse_definition_id,
    parse_json, parse_sql_time, parse_user_id, sql_time, to_sql_error, u32_from_sql,
    DispatchReport, SqliteRewardStore,
};

const LOGIN_STREAK: &str = "login";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreakUpdate {
    pub streak: Streak,
    pub transition: StreakTransition,
    #[serde(flatten)]
    pub dispatch: DispatchReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreakSweepReport {
    #[serde(with = "reward_kernel_core::date_format")]
    pub as_of: Date,
    pub examined: usize,
    pub decayed: usize,
    pub users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressOutcome {
    pub progress: Value,
    pub is_completed: bool,
    /// True only for the call that completed the definition.
    pub completed_now: bool,
    #[serde(flatten)]
    pub dispatch: DispatchReport,
}

/// Result of re-running criteria for one quest or challenge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionCheck {
    pub completed: bool,
    #[serde(flatten)]
    pub dispatch: DispatchReport,
}

impl UserSession<'_> {
    /// Mirrors streak state onto the cached profile.
    fn refresh_streak_mirrors(&mut self) -> Result<()> {
        let (current, longest, login): (i64, i64, Option<i64>) = self
            .conn
            .query_row(
                "SELECT
                    COALESCE(MAX(current_count), 0),
                    COALESCE(MAX(longest_count), 0),
                    MAX(CASE WHEN streak_type = ?2 THEN current_count END)
                 FROM streaks
                 WHERE user_id = ?1",
                params![self.user_id.to_string(), LOGIN_STREAK],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("failed to read streak mirrors")?;

        self.profile.streak_count = u32_from_sql(current, 0)?;
        self.profile.longest_streak = u32_from_sql(longest, 1)?;
        self.profile.consecutive_login_days = u32_from_sql(login.unwrap_or(0), 2)?;
        self.profile.updated_at = self.now;
        self.save_profile()
    }
}

impl SqliteRewardStore {
    /// Records activity on a business date, today when `activity_date` is
    /// `None`.
    pub fn record_activity(
        &mut self,
        user_id: UserId,
        streak_type: &str,
        activity_date: Option<Date>,
    ) -> Result<StreakUpdate> {
        if streak_type.trim().is_empty() {
            return Err(domain(RewardError::Validation(
                "streak_type MUST be provided".to_string(),
            )));
        }

        let update = self.within_user(user_id, "record_activity", |session| {
            let day = activity_date.unwrap_or_else(|| session.policy.business_date(session.now));
            let current = load_streak(session.conn, user_id, streak_type)?
                .unwrap_or_else(|| Streak::new(user_id, streak_type));
            let (streak, transition) = advance_streak(&current, day);

            if !transition.is_mutation() {
                return Ok(StreakUpdate {
                    streak,
                    transition,
                    dispatch: DispatchReport::default(),
                });
            }

            save_streak(session.conn, &streak, session.now)?;
            session.refresh_streak_mirrors()?;
            let dispatch = session.dispatch()?;
            Ok(StreakUpdate {
                streak,
                transition,
                dispatch,
            })
        })?;

        tracing::debug!(
            user_id = %user_id,
            streak_type,
            transition = ?update.transition,
            current_count = update.streak.current_count,
            "activity recorded"
        );
        Ok(update)
    }

    pub fn streaks(&self, user_id: UserId) -> Result<Vec<Streak>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, streak_type, current_count, longest_count, last_activity_date,
                    is_active
             FROM streaks
             WHERE user_id = ?1
             ORDER BY streak_type ASC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], parse_streak_row)?;
        collect_rows(rows)
    }

    /// Decays active streaks last extended before `as_of`.
    ///
    /// The default `as_of` is yesterday's business date, so a streak stays
    /// alive while it can still be extended today. Each user is handled in
    /// its own transaction.
    pub fn sweep_streaks(&mut self, as_of: Option<Date>) -> Result<StreakSweepReport> {
        let policy = self.policy()?;
        let as_of = match as_of {
            Some(day) => day,
            None => {
                let today = policy.business_date(self.now());
                today.previous_day().unwrap_or(today)
            }
        };
        let cutoff = format_date(as_of).map_err(domain)?;

        let mut stmt = self.conn.prepare(
            "SELECT user_id, last_activity_date FROM streaks
             WHERE is_active = 1
             ORDER BY user_id ASC, streak_type ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let user_id = parse_user_id(&row.get::<_, String>(0)?, 0)?;
            let last: Option<String> = row.get(1)?;
            let last = last
                .map(|raw| parse_date(&raw).map_err(to_sql_error))
                .transpose()?;
            Ok((user_id, last))
        })?;
        let active = collect_rows(rows)?;
        drop(stmt);

        let stale: BTreeSet<UserId> = active
            .iter()
            .filter(|(_, last)| last.is_some_and(|day| day < as_of))
            .map(|(user_id, _)| *user_id)
            .collect();

        let mut decayed = 0;
        for user_id in &stale {
            decayed += self.within_user(*user_id, "sweep_streaks", |session| {
                let changed = session
                    .conn
                    .execute(
                        "UPDATE streaks
                         SET current_count = 0, is_active = 0, updated_at = ?3
                         WHERE user_id = ?1
                           AND is_active = 1
                           AND last_activity_date < ?2",
                        params![session.user_id.to_string(), cutoff, sql_time(session.now)?],
                    )
                    .context("failed to decay streaks")?;
                session.refresh_streak_mirrors()?;
                Ok(changed)
            })?;
        }

        tracing::info!(
            as_of = %cutoff,
            examined = active.len(),
            decayed,
            users = stale.len(),
            "streak sweep finished"
        );
        Ok(StreakSweepReport {
            as_of,
            examined: active.len(),
            decayed,
            users: stale.len(),
        })
    }

    /// Merges `delta` into the user's quest progress, then re-runs criteria.
    ///
    /// Progress on a completed quest is frozen.
    pub fn update_quest_progress(
        &mut self,
        user_id: UserId,
        quest_id: DefinitionId,
        delta: &Value,
    ) -> Result<ProgressOutcome> {
        self.within_user(user_id, "update_quest_progress", |session| {
            let quest = load_quest(session.conn, quest_id)?
                .ok_or_else(|| domain(RewardError::NotFound(format!("quest {quest_id}"))))?;
            if !quest.is_open(session.now) {
                return Err(inactive(DefinitionKind::Quest, quest_id));
            }

            let record = load_user_quest(session.conn, user_id, quest_id)?;
            if let Some(record) = record.as_ref().filter(|record| record.is_completed) {
                return Ok(ProgressOutcome {
                    progress: record.progress.clone(),
                    is_completed: true,
                    completed_now: false,
                    dispatch: DispatchReport::default(),
                });
            }

            let mut progress = record
                .map_or_else(|| Value::Object(serde_json::Map::new()), |record| record.progress);
            merge_progress(&mut progress, delta).map_err(domain)?;

            let now = sql_time(session.now)?;
            session
                .conn
                .execute(
                    "INSERT INTO user_quests(
                       user_id, quest_id, progress_json, is_completed, completed_at, started_at
                     )
                     VALUES (?1, ?2, ?3, 0, NULL, ?4)
                     ON CONFLICT(user_id, quest_id) DO UPDATE SET
                        progress_json = excluded.progress_json",
                    params![user_id.to_string(), quest_id.to_string(), progress.to_string(), now],
                )
                .with_context(|| format!("failed to store progress for quest {quest_id}"))?;

            let dispatch = session.dispatch()?;
            let completed_now = dispatch.rewards.iter().any(|grant| {
                grant.kind == DefinitionKind::Quest && grant.definition_id == quest_id
            });
            Ok(ProgressOutcome {
                progress,
                is_completed: completed_now,
                completed_now,
                dispatch,
            })
        })
    }

    /// Re-runs criteria for the user and reports whether the quest is done.
    pub fn check_quest_completion(
        &mut self,
        user_id: UserId,
        quest_id: DefinitionId,
    ) -> Result<CompletionCheck> {
        self.within_user(user_id, "check_quest_completion", |session| {
            if load_quest(session.conn, quest_id)?.is_none() {
                return Err(domain(RewardError::NotFound(format!("quest {quest_id}"))));
            }
            let dispatch = session.dispatch()?;
            let completed = load_user_quest(session.conn, user_id, quest_id)?
                .is_some_and(|record| record.is_completed);
            tracing::debug!(
                user_id = %user_id,
                quest_id = %quest_id,
                completed,
                rewards = dispatch.rewards.len(),
                failures = dispatch.failures.len(),
                "quest completion checked"
            );
            Ok(CompletionCheck { completed, dispatch })
        })
    }

    /// Merges `delta` into the current challenge period, starting a new
    /// period when the previous one has ended.
    pub fn update_challenge_progress(
        &mut self,
        user_id: UserId,
        challenge_id: DefinitionId,
        delta: &Value,
    ) -> Result<ProgressOutcome> {
        self.within_user(user_id, "update_challenge_progress", |session| {
            let challenge = load_challenge(session.conn, challenge_id)?.ok_or_else(|| {
                domain(RewardError::NotFound(format!("challenge {challenge_id}")))
            })?;
            if !challenge.is_active {
                return Err(inactive(DefinitionKind::Challenge, challenge_id));
            }

            let now = session.now;
            let current = load_user_challenge(session.conn, user_id, challenge_id)?
                .filter(|record| {
                    record.status != ChallengeStatus::Expired
                        && record.period_end.map_or(true, |end| now < end)
                });

            if let Some(record) =
                current.as_ref().filter(|record| record.status == ChallengeStatus::Completed)
            {
                return Ok(ProgressOutcome {
                    progress: record.progress.clone(),
                    is_completed: true,
                    completed_now: false,
                    dispatch: DispatchReport::default(),
                });
            }

            let (mut progress, period_start, period_end) = match current {
                Some(record) => (record.progress, record.period_start, record.period_end),
                None => {
                    let (start, end) = challenge.period_from(now);
                    tracing::debug!(
                        user_id = %user_id,
                        challenge_id = %challenge_id,
                        "challenge period started"
                    );
                    (Value::Object(serde_json::Map::new()), start, end)
                }
            };
            merge_progress(&mut progress, delta).map_err(domain)?;

            session
                .conn
                .execute(
                    "INSERT INTO user_challenges(
                        user_id, challenge_id, progress_json, status, completed_at,
                        period_start, period_end
                     ) VALUES (?1, ?2, ?3, 'in_progress', NULL, ?4, ?5)
                     ON CONFLICT(user_id, challenge_id) DO UPDATE SET
                       progress_json = excluded.progress_json,
                       status = 'in_progress',
                       completed_at = NULL,
                       period_start = excluded.period_start,
                       period_end = excluded.period_end",
                    params![
                        user_id.to_string(),
                        challenge_id.to_string(),
                        progress.to_string(),
                        sql_time(period_start)?,
                        period_end.map(sql_time).transpose()?,
                    ],
                )
                .with_context(|| format!("failed to store progress for challenge {challenge_id}"))?;

            let dispatch = session.dispatch()?;
            let completed_now = dispatch.rewards.iter().any(|grant| {
                grant.kind == DefinitionKind::Challenge && grant.definition_id == challenge_id
            });
            Ok(ProgressOutcome {
                progress,
                is_completed: completed_now,
                completed_now,
                dispatch,
            })
        })
    }

    /// Re-runs criteria for the user and reports whether the current
    /// challenge period is complete.
    pub fn check_challenge_completion(
        &mut self,
        user_id: UserId,
        challenge_id: DefinitionId,
    ) -> Result<CompletionCheck> {
        self.within_user(user_id, "check_challenge_completion", |session| {
            if load_challenge(session.conn, challenge_id)?.is_none() {
                return Err(domain(RewardError::NotFound(format!("challenge {challenge_id}"))));
            }
            let dispatch = session.dispatch()?;
            let now = session.now;
            let completed =
                load_user_challenge(session.conn, user_id, challenge_id)?.is_some_and(|record| {
                    record.status == ChallengeStatus::Completed
                        && record.period_end.map_or(true, |end| now < end)
                });
            tracing::debug!(
                user_id = %user_id,
                challenge_id = %challenge_id,
                completed,
                rewards = dispatch.rewards.len(),
                failures = dispatch.failures.len(),
                "challenge completion checked"
            );
            Ok(CompletionCheck { completed, dispatch })
        })
    }

    /// Marks in-progress challenge records whose period has ended as
    /// expired, one record at a time.
    pub fn expire_challenge_periods(&self, now: Option<OffsetDateTime>) -> Result<usize> {
        let now = now.unwrap_or_else(|| self.now());

        let mut stmt = self.conn.prepare(
            "SELECT user_id, challenge_id, period_end FROM user_challenges
             WHERE status = 'in_progress' AND period_end IS NOT NULL
             ORDER BY user_id ASC, challenge_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_user_id(&row.get::<_, String>(0)?, 0)?,
                parse_definition_id(&row.get::<_, String>(1)?, 1)?,
                parse_sql_time(&row.get::<_, String>(2)?)?,
            ))
        })?;
        let open = collect_rows(rows)?;
        drop(stmt);

        let mut expired = 0;
        for (user_id, challenge_id, period_end) in open {
            if period_end > now {
                continue;
            }
            expired += self
                .conn
                .execute(
                    "UPDATE user_challenges SET status = 'expired'
                     WHERE user_id = ?1 AND challenge_id = ?2 AND status = 'in_progress'",
                    params![user_id.to_string(), challenge_id.to_string()],
                )
                .with_context(|| {
                    format!("failed to expire challenge {challenge_id} for {user_id}")
                })?;
        }

        tracing::info!(expired, "challenge periods expired");
        Ok(expired)
    }

    pub fn user_badges(&self, user_id: UserId) -> Result<Vec<UserBadge>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, badge_id, source, awarded_at FROM user_badges
             WHERE user_id = ?1
             ORDER BY awarded_at ASC, badge_id ASC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            Ok(UserBadge {
                user_id: parse_user_id(&row.get::<_, String>(0)?, 0)?,
                badge_id: parse_definition_id(&row.get::<_, String>(1)?, 1)?,
                source: row.get(2)?,
                awarded_at: parse_sql_time(&row.get::<_, String>(3)?)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn user_quests(&self, user_id: UserId) -> Result<Vec<UserQuest>> {
        let mut stmt = self.conn.prepare(&format!(
            "{USER_QUEST_COLUMNS} WHERE user_id = ?1 ORDER BY started_at ASC, quest_id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], parse_user_quest_row)?;
        collect_rows(rows)
    }

    pub fn user_challenges(&self, user_id: UserId) -> Result<Vec<UserChallenge>> {
        let mut stmt = self.conn.prepare(&format!(
            "{USER_CHALLENGE_COLUMNS} WHERE user_id = ?1
             ORDER BY period_start ASC, challenge_id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], parse_user_challenge_row)?;
        collect_rows(rows)
    }
}

const USER_QUEST_COLUMNS: &str = "SELECT user_id, quest_id, progress_json, is_completed,
        completed_at, started_at
     FROM user_quests";

const USER_CHALLENGE_COLUMNS: &str = "SELECT user_id, challenge_id, progress_json, status,
        completed_at, period_start, period_end
     FROM user_challenges";

pub(crate) fn load_user_quest(
    conn: &Connection,
    user_id: UserId,
    quest_id: DefinitionId,
) -> Result<Option<UserQuest>> {
    conn.query_row(
        &format!("{USER_QUEST_COLUMNS} WHERE user_id = ?1 AND quest_id = ?2"),
        params![user_id.to_string(), quest_id.to_string()],
        parse_user_quest_row,
    )
    .optional()
    .context("failed to load quest progress")
}

pub(crate) fn load_user_challenge(
    conn: &Connection,
    user_id: UserId,
    challenge_id: DefinitionId,
) -> Result<Option<UserChallenge>> {
    conn.query_row(
        &format!("{USER_CHALLENGE_COLUMNS} WHERE user_id = ?1 AND challenge_id = ?2"),
        params![user_id.to_string(), challenge_id.to_string()],
        parse_user_challenge_row,
    )
    .optional()
    .context("failed to load challenge progress")
}

fn load_streak(conn: &Connection, user_id: UserId, streak_type: &str) -> Result<Option<Streak>> {
    conn.query_row(
        "SELECT user_id, streak_type, current_count, longest_count, last_activity_date, is_active
         FROM streaks
         WHERE user_id = ?1 AND streak_type = ?2",
        params![user_id.to_string(), streak_type],
        parse_streak_row,
    )
    .optional()
    .context("failed to load streak")
}

fn save_streak(conn: &Connection, streak: &Streak, now: OffsetDateTime) -> Result<()> {
    let last_activity_date = streak
        .last_activity_date
        .map(format_date)
        .transpose()
        .map_err(domain)?;

    conn.execute(
        "INSERT INTO streaks(
            user_id, streak_type, current_count, longest_count, last_activity_date,
            is_active, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_id, streak_type) DO UPDATE SET
           current_count = excluded.current_count,
           longest_count = excluded.longest_count,
           last_activity_date = excluded.last_activity_date,
           is_active = excluded.is_active,
           updated_at = excluded.updated_at",
        params![
            streak.user_id.to_string(),
            streak.streak_type,
            i64::from(streak.current_count),
            i64::from(streak.longest_count),
            last_activity_date,
            bool_to_sql(streak.is_active),
            sql_time(now)?,
        ],
    )
    .with_context(|| format!("failed to save {} streak", streak.streak_type))?;
    Ok(())
}

fn parse_streak_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Streak> {
    let last_activity_date: Option<String> = row.get(4)?;

    Ok(Streak {
        user_id: parse_user_id(&row.get::<_, String>(0)?, 0)?,
        streak_type: row.get(1)?,
        current_count: u32_from_sql(row.get(2)?, 2)?,
        longest_count: u32_from_sql(row.get(3)?, 3)?,
        last_activity_date: last_activity_date
            .map(|raw| parse_date(&raw).map_err(to_sql_error))
            .transpose()?,
        is_active: row.get::<_, i64>(5)? == 1,
    })
}

fn parse_user_quest_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserQuest> {
    let completed_at: Option<String> = row.get(4)?;

    Ok(UserQuest {
        user_id: parse_user_id(&row.get::<_, String>(0)?, 0)?,
        quest_id: parse_definition_id(&row.get::<_, String>(1)?, 1)?,
        progress: parse_json(&row.get::<_, String>(2)?, 2)?,
        is_completed: row.get::<_, i64>(3)? == 1,
        completed_at: completed_at.map(|raw| parse_sql_time(&raw)).transpose()?,
        started_at: parse_sql_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_user_challenge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserChallenge> {
    let status_raw: String = row.get(3)?;
    let status = ChallengeStatus::parse(&status_raw).ok_or_else(|| {
        to_sql_error(RewardError::Validation(format!(
            "invalid challenge status: {status_raw}"
        )))
    })?;
    let completed_at: Option<String> = row.get(4)?;
    let period_end: Option<String> = row.get(6)?;

    Ok(UserChallenge {
        user_id: parse_user_id(&row.get::<_, String>(0)?, 0)?,
        challenge_id: parse_definition_id(&row.get::<_, String>(1)?, 1)?,
        progress: parse_json(&row.get::<_, String>(2)?, 2)?,
        status,
        completed_at: completed_at.map(|raw| parse_sql_time(&raw)).transpose()?,
        period_start: parse_sql_time(&row.get::<_, String>(5)?)?,
        period_end: period_end.map(|raw| parse_sql_time(&raw)).transpose()?,
    })
}
