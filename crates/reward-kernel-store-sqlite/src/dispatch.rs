use std::collections::{BTreeSet, VecDeque};

use anyhow::{Context, Result};
use reward_kernel_core::{
    Badge, Challenge, ChallengeStatus, CriteriaContext, DefinitionId, DefinitionKind,
    LedgerReference, Quest, RewardError, TransactionType, UserId,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime};
use ulid::Ulid;

use crate::ledger::UserSession;
use crate::tracking::{load_user_challenge, load_user_quest};
use crate::{
    collect_rows, domain, parse_badge_row, parse_challenge_row, parse_quest_row, parse_sql_time,
    sql_time, SqliteRewardStore, BADGE_COLUMNS, CHALLENGE_COLUMNS, QUEST_COLUMNS,
};

/// A badge, quest or challenge granted during one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardGrant {
    pub kind: DefinitionKind,
    pub definition_id: DefinitionId,
    pub name: String,
    pub points_awarded: i64,
    /// Badge granted alongside a quest or challenge completion.
    pub badge_reward: Option<DefinitionId>,
    /// Work-queue depth; grants caused directly by the triggering call are 1.
    pub depth: u32,
    pub entry_id: Option<Ulid>,
}

/// A definition that could not be read, or whose reward record could not be
/// written. The triggering award stands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardRecordFailure {
    pub kind: DefinitionKind,
    pub definition_id: DefinitionId,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchReport {
    pub rewards: Vec<RewardGrant>,
    pub failures: Vec<RewardRecordFailure>,
    /// Set when the depth or per-call bound stopped further grants.
    pub truncated: bool,
}

/// Criteria inputs read from the store inside the current transaction.
pub(crate) struct StoreContext<'a> {
    conn: &'a Connection,
    user_id: UserId,
    today: Date,
    progress: Option<&'a Value>,
}

impl<'a> StoreContext<'a> {
    pub(crate) fn new(
        conn: &'a Connection,
        user_id: UserId,
        today: Date,
        progress: Option<&'a Value>,
    ) -> Self {
        Self {
            conn,
            user_id,
            today,
            progress,
        }
    }
}

fn storage(err: &rusqlite::Error) -> RewardError {
    RewardError::Storage(err.to_string())
}

impl CriteriaContext for StoreContext<'_> {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn today(&self) -> Date {
        self.today
    }

    fn action_count(&self, action: &str) -> Result<u64, RewardError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM point_activities WHERE user_id = ?1 AND action = ?2",
                params![self.user_id.to_string(), action],
                |row| row.get(0),
            )
            .map_err(|err| storage(&err))?;
        u64::try_from(count).map_err(|err| RewardError::Storage(err.to_string()))
    }

    fn streak_count(&self, streak_type: &str) -> Result<Option<u32>, RewardError> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT current_count FROM streaks WHERE user_id = ?1 AND streak_type = ?2",
                params![self.user_id.to_string(), streak_type],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage(&err))?;
        count
            .map(u32::try_from)
            .transpose()
            .map_err(|err| RewardError::Storage(err.to_string()))
    }

    fn quest_completed(&self, quest_id: &str) -> Result<bool, RewardError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM user_quests uq
                 JOIN quests q ON q.quest_id = uq.quest_id
                 WHERE uq.user_id = ?1
                   AND uq.is_completed = 1
                   AND (q.quest_id = ?2 OR q.name = ?2)
                 LIMIT 1",
                params![self.user_id.to_string(), quest_id],
                |_| Ok(()),
            )
            .optional()
            .map_err(|err| storage(&err))?;
        Ok(found.is_some())
    }

    fn total_spent(&self) -> Result<i64, RewardError> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(-points), 0) FROM ledger_entries
                 WHERE user_id = ?1 AND transaction_type = 'spend'",
                params![self.user_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|err| storage(&err))
    }

    fn social_count(&self, metric: &str) -> Result<u64, RewardError> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT count FROM social_stats WHERE user_id = ?1 AND metric = ?2",
                params![self.user_id.to_string(), metric],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage(&err))?;
        u64::try_from(count.unwrap_or(0)).map_err(|err| RewardError::Storage(err.to_string()))
    }

    fn joined_on(&self) -> Result<Option<Date>, RewardError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT joined_at FROM user_accounts WHERE user_id = ?1",
                params![self.user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage(&err))?;
        raw.map(|value| parse_sql_time(&value).map(OffsetDateTime::date))
            .transpose()
            .map_err(|err| storage(&err))
    }

    fn progress(&self) -> Option<&Value> {
        self.progress
    }
}

enum ChallengeSlot {
    /// No record, or the previous period has ended.
    Fresh,
    /// An in-progress record in an open period.
    Open(Value),
}

enum Candidate {
    Badge(Badge),
    Quest(Quest, Option<Value>),
    Challenge(Challenge, ChallengeSlot),
}

impl Candidate {
    fn key(&self) -> (DefinitionKind, DefinitionId) {
        match self {
            Self::Badge(badge) => (DefinitionKind::Badge, badge.badge_id),
            Self::Quest(quest, _) => (DefinitionKind::Quest, quest.quest_id),
            Self::Challenge(challenge, _) => (DefinitionKind::Challenge, challenge.challenge_id),
        }
    }

    fn criteria(&self) -> &Value {
        match self {
            Self::Badge(badge) => &badge.criteria,
            Self::Quest(quest, _) => &quest.criteria,
            Self::Challenge(challenge, _) => &challenge.criteria,
        }
    }

    fn progress(&self) -> Option<&Value> {
        match self {
            Self::Badge(_) | Self::Challenge(_, ChallengeSlot::Fresh) => None,
            Self::Quest(_, progress) => progress.as_ref(),
            Self::Challenge(_, ChallengeSlot::Open(progress)) => Some(progress),
        }
    }
}

impl UserSession<'_> {
    pub(crate) fn context<'s>(&'s self, progress: Option<&'s Value>) -> StoreContext<'s> {
        StoreContext::new(
            self.conn,
            self.user_id,
            self.policy.business_date(self.now),
            progress,
        )
    }

    /// Grants every definition whose criteria now hold, as a bounded work
    /// queue.
    ///
    /// Each pass evaluates all unowned candidates against the state at the
    /// start of the pass; grants from a pass enqueue the next pass one level
    /// deeper. A definition is attempted at most once per call. Every grant
    /// runs in its own savepoint so a failed reward record never undoes the
    /// triggering award.
    pub(crate) fn dispatch(&mut self) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut attempted: BTreeSet<(DefinitionKind, DefinitionId)> = BTreeSet::new();
        let mut queue = VecDeque::from([0_u32]);
        let max_awards = usize::try_from(self.policy.max_awards_per_call).unwrap_or(usize::MAX);

        while let Some(depth) = queue.pop_front() {
            let satisfied = self.satisfied_candidates(&mut attempted, &mut report)?;
            if satisfied.is_empty() {
                continue;
            }
            if depth >= self.policy.max_award_depth {
                tracing::warn!(
                    user_id = %self.user_id,
                    depth,
                    pending = satisfied.len(),
                    "reward dispatch depth bound reached"
                );
                report.truncated = true;
                break;
            }

            let mut granted_in_pass = false;
            for candidate in satisfied {
                if report.rewards.len() >= max_awards {
                    tracing::warn!(
                        user_id = %self.user_id,
                        max_awards,
                        "reward dispatch per-call bound reached"
                    );
                    report.truncated = true;
                    return Ok(report);
                }

                let (kind, definition_id) = candidate.key();
                attempted.insert((kind, definition_id));

                match self.grant_isolated(&candidate, depth + 1) {
                    Ok(Some(grant)) => {
                        tracing::info!(
                            user_id = %self.user_id,
                            kind = kind.as_str(),
                            definition_id = %definition_id,
                            points = grant.points_awarded,
                            depth = grant.depth,
                            "reward granted"
                        );
                        report.rewards.push(grant);
                        granted_in_pass = true;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        self.record_failure(&mut report, kind, definition_id, format!("{err:#}"));
                    }
                }
            }

            if granted_in_pass {
                queue.push_back(depth + 1);
            }
        }

        Ok(report)
    }

    fn record_failure(
        &self,
        report: &mut DispatchReport,
        kind: DefinitionKind,
        definition_id: DefinitionId,
        message: String,
    ) {
        tracing::warn!(
            user_id = %self.user_id,
            kind = kind.as_str(),
            definition_id = %definition_id,
            error = %message,
            "reward record failed; triggering award kept"
        );
        report.failures.push(RewardRecordFailure {
            kind,
            definition_id,
            message,
        });
    }

    fn satisfied_candidates(
        &self,
        attempted: &mut BTreeSet<(DefinitionKind, DefinitionId)>,
        report: &mut DispatchReport,
    ) -> Result<Vec<Candidate>> {
        let candidates = self.load_candidates(attempted, report)?;
        let mut satisfied = Vec::new();

        for candidate in candidates {
            if attempted.contains(&candidate.key()) {
                continue;
            }
            let evaluation = {
                let context = self.context(candidate.progress());
                self.registry
                    .evaluate(&context, &self.profile, candidate.criteria())
            };
            if evaluation.satisfied {
                satisfied.push(candidate);
            }
        }
        Ok(satisfied)
    }

    /// Keeps decodable definitions. A definition that cannot be read is
    /// reported once per call and never evaluated.
    fn keep_decoded<T>(
        &self,
        kind: DefinitionKind,
        rows: Vec<(String, rusqlite::Result<T>)>,
        attempted: &mut BTreeSet<(DefinitionKind, DefinitionId)>,
        report: &mut DispatchReport,
    ) -> Vec<T> {
        let mut decoded = Vec::with_capacity(rows.len());
        for (raw_id, row) in rows {
            match row {
                Ok(value) => decoded.push(value),
                Err(err) => self.skip_unreadable(kind, &raw_id, &err, attempted, report),
            }
        }
        decoded
    }

    fn skip_unreadable(
        &self,
        kind: DefinitionKind,
        raw_id: &str,
        err: &dyn std::fmt::Display,
        attempted: &mut BTreeSet<(DefinitionKind, DefinitionId)>,
        report: &mut DispatchReport,
    ) {
        match raw_id.parse::<DefinitionId>() {
            Ok(definition_id) => {
                if attempted.insert((kind, definition_id)) {
                    self.record_failure(
                        report,
                        kind,
                        definition_id,
                        format!("unreadable {} definition: {err}", kind.as_str()),
                    );
                }
            }
            Err(_) => tracing::warn!(
                user_id = %self.user_id,
                kind = kind.as_str(),
                definition_id = raw_id,
                error = %err,
                "unreadable definition skipped"
            ),
        }
    }

    fn load_candidates(
        &self,
        attempted: &mut BTreeSet<(DefinitionKind, DefinitionId)>,
        report: &mut DispatchReport,
    ) -> Result<Vec<Candidate>> {
        let user = self.user_id.to_string();
        let mut candidates = Vec::new();

        let mut stmt = self.conn.prepare(&format!(
            "{BADGE_COLUMNS}
             WHERE is_active = 1
               AND NOT EXISTS (
                 SELECT 1 FROM user_badges ub
                 WHERE ub.user_id = ?1 AND ub.badge_id = badges.badge_id
               )
             ORDER BY created_at ASC, badge_id ASC"
        ))?;
        let rows = stmt.query_map(params![user], |row| {
            Ok((row.get::<_, String>(0)?, parse_badge_row(row)))
        })?;
        let badges =
            self.keep_decoded(DefinitionKind::Badge, collect_rows(rows)?, attempted, report);
        candidates.extend(badges.into_iter().map(Candidate::Badge));

        let mut stmt = self.conn.prepare(&format!(
            "{QUEST_COLUMNS}
             WHERE is_active = 1
               AND NOT EXISTS (
                 SELECT 1 FROM user_quests uq
                 WHERE uq.user_id = ?1 AND uq.quest_id = quests.quest_id AND uq.is_completed = 1
               )
             ORDER BY created_at ASC, quest_id ASC"
        ))?;
        let rows = stmt.query_map(params![user], |row| {
            Ok((row.get::<_, String>(0)?, parse_quest_row(row)))
        })?;
        let quests =
            self.keep_decoded(DefinitionKind::Quest, collect_rows(rows)?, attempted, report);
        for quest in quests {
            if !quest.is_open(self.now) {
                continue;
            }
            match load_user_quest(self.conn, self.user_id, quest.quest_id) {
                Ok(record) => {
                    let progress = record.map(|record| record.progress);
                    candidates.push(Candidate::Quest(quest, progress));
                }
                Err(err) => self.skip_unreadable(
                    DefinitionKind::Quest,
                    &quest.quest_id.to_string(),
                    &format!("{err:#}"),
                    attempted,
                    report,
                ),
            }
        }

        let mut stmt = self.conn.prepare(&format!(
            "{CHALLENGE_COLUMNS}
             WHERE is_active = 1
             ORDER BY created_at ASC, challenge_id ASC"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, parse_challenge_row(row)))
        })?;
        let challenges =
            self.keep_decoded(DefinitionKind::Challenge, collect_rows(rows)?, attempted, report);
        for challenge in challenges {
            let loaded = load_user_challenge(self.conn, self.user_id, challenge.challenge_id);
            let record = match loaded {
                Ok(record) => record,
                Err(err) => {
                    self.skip_unreadable(
                        DefinitionKind::Challenge,
                        &challenge.challenge_id.to_string(),
                        &format!("{err:#}"),
                        attempted,
                        report,
                    );
                    continue;
                }
            };
            let slot = match record {
                None => ChallengeSlot::Fresh,
                Some(record) if record.period_end.is_some_and(|end| end <= self.now) => {
                    ChallengeSlot::Fresh
                }
                Some(record) if record.status == ChallengeStatus::InProgress => {
                    ChallengeSlot::Open(record.progress)
                }
                Some(_) => continue,
            };
            candidates.push(Candidate::Challenge(challenge, slot));
        }

        Ok(candidates)
    }

    fn grant_isolated(&mut self, candidate: &Candidate, depth: u32) -> Result<Option<RewardGrant>> {
        let snapshot = self.profile.clone();
        self.conn
            .execute_batch("SAVEPOINT reward_grant")
            .context("failed to open reward savepoint")?;

        match self.grant(candidate, depth) {
            Ok(grant) => {
                self.conn
                    .execute_batch("RELEASE reward_grant")
                    .context("failed to release reward savepoint")?;
                Ok(grant)
            }
            Err(err) => {
                self.profile = snapshot;
                self.conn
                    .execute_batch("ROLLBACK TO reward_grant; RELEASE reward_grant;")
                    .context("failed to roll back reward savepoint")?;
                Err(err)
            }
        }
    }

    fn grant(&mut self, candidate: &Candidate, depth: u32) -> Result<Option<RewardGrant>> {
        match candidate {
            Candidate::Badge(badge) => self.grant_badge(badge, depth),
            Candidate::Quest(quest, _) => self.grant_quest(quest, depth),
            Candidate::Challenge(challenge, slot) => self.grant_challenge(challenge, slot, depth),
        }
    }

    fn grant_badge(&mut self, badge: &Badge, depth: u32) -> Result<Option<RewardGrant>> {
        if !self.insert_user_badge(badge.badge_id, "criteria")? {
            return Ok(None);
        }

        let entry_id = self.reward_points(
            badge.points_reward,
            "badge_reward",
            LedgerReference::new("badge", &badge.badge_id.to_string())
                .with_description(&format!("Badge earned: {}", badge.name)),
        )?;

        Ok(Some(RewardGrant {
            kind: DefinitionKind::Badge,
            definition_id: badge.badge_id,
            name: badge.name.clone(),
            points_awarded: badge.points_reward,
            badge_reward: None,
            depth,
            entry_id,
        }))
    }

    fn grant_quest(&mut self, quest: &Quest, depth: u32) -> Result<Option<RewardGrant>> {
        let now = sql_time(self.now)?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO user_quests(
                   user_id, quest_id, progress_json, is_completed, completed_at, started_at
                 )
                 VALUES (?1, ?2, '{}', 1, ?3, ?3)
                 ON CONFLICT(user_id, quest_id) DO UPDATE SET
                   is_completed = 1,
                   completed_at = excluded.completed_at
                 WHERE user_quests.is_completed = 0",
                params![self.user_id.to_string(), quest.quest_id.to_string(), now],
            )
            .with_context(|| format!("failed to record completion of quest {}", quest.quest_id))?;
        if changed == 0 {
            return Ok(None);
        }

        let entry_id = self.reward_points(
            quest.points_reward,
            "quest_reward",
            LedgerReference::new("quest", &quest.quest_id.to_string())
                .with_description(&format!("Completed quest: {}", quest.name)),
        )?;
        let source = format!("quest:{}", quest.quest_id);
        let badge_reward = self.grant_badge_reward(quest.badge_reward, &source)?;

        Ok(Some(RewardGrant {
            kind: DefinitionKind::Quest,
            definition_id: quest.quest_id,
            name: quest.name.clone(),
            points_awarded: quest.points_reward,
            badge_reward,
            depth,
            entry_id,
        }))
    }

    fn grant_challenge(
        &mut self,
        challenge: &Challenge,
        slot: &ChallengeSlot,
        depth: u32,
    ) -> Result<Option<RewardGrant>> {
        let now = sql_time(self.now)?;
        let user = self.user_id.to_string();
        let challenge_id = challenge.challenge_id.to_string();

        let changed = match slot {
            ChallengeSlot::Fresh => {
                let (period_start, period_end) = challenge.period_from(self.now);
                self.conn.execute(
                    "INSERT INTO user_challenges(
                        user_id, challenge_id, progress_json, status, completed_at,
                        period_start, period_end
                     ) VALUES (?1, ?2, '{}', 'completed', ?3, ?4, ?5)
                     ON CONFLICT(user_id, challenge_id) DO UPDATE SET
                       progress_json = '{}',
                       status = 'completed',
                       completed_at = excluded.completed_at,
                       period_start = excluded.period_start,
                       period_end = excluded.period_end",
                    params![
                        user,
                        challenge_id,
                        now,
                        sql_time(period_start)?,
                        period_end.map(sql_time).transpose()?,
                    ],
                )
            }
            ChallengeSlot::Open(_) => self.conn.execute(
                "UPDATE user_challenges
                 SET status = 'completed', completed_at = ?3
                 WHERE user_id = ?1 AND challenge_id = ?2 AND status = 'in_progress'",
                params![user, challenge_id, now],
            ),
        }
        .with_context(|| format!("failed to record completion of challenge {challenge_id}"))?;
        if changed == 0 {
            return Ok(None);
        }

        let entry_id = self.reward_points(
            challenge.points_reward,
            "challenge_reward",
            LedgerReference::new("challenge", &challenge_id)
                .with_description(&format!("Completed challenge: {}", challenge.name)),
        )?;
        let source = format!("challenge:{challenge_id}");
        let badge_reward = self.grant_badge_reward(challenge.badge_reward, &source)?;

        Ok(Some(RewardGrant {
            kind: DefinitionKind::Challenge,
            definition_id: challenge.challenge_id,
            name: challenge.name.clone(),
            points_awarded: challenge.points_reward,
            badge_reward,
            depth,
            entry_id,
        }))
    }

    /// Returns `true` when the row was inserted; an owned badge is left as is.
    fn insert_user_badge(&self, badge_id: DefinitionId, source: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO user_badges(user_id, badge_id, source, awarded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, badge_id) DO NOTHING",
                params![
                    self.user_id.to_string(),
                    badge_id.to_string(),
                    source,
                    sql_time(self.now)?
                ],
            )
            .with_context(|| format!("failed to record badge {badge_id}"))?;
        Ok(changed > 0)
    }

    fn grant_badge_reward(
        &self,
        badge_id: Option<DefinitionId>,
        source: &str,
    ) -> Result<Option<DefinitionId>> {
        let Some(badge_id) = badge_id else {
            return Ok(None);
        };
        Ok(self
            .insert_user_badge(badge_id, source)?
            .then_some(badge_id))
    }

    fn reward_points(
        &mut self,
        points: i64,
        action: &str,
        reference: LedgerReference,
    ) -> Result<Option<Ulid>> {
        if points <= 0 {
            return Ok(None);
        }
        let entry = self.append(TransactionType::Earn, points, &reference, Some(action))?;
        Ok(Some(entry.entry_id))
    }
}

impl SqliteRewardStore {
    /// Re-runs criteria for `user_id` and grants whatever is now earned.
    pub fn check_and_award_badges(&mut self, user_id: UserId) -> Result<DispatchReport> {
        let report = self.within_user(user_id, "check_and_award_badges", |session| {
            let report = session.dispatch()?;
            if !report.rewards.is_empty() && !session.persisted {
                session.save_profile()?;
            }
            Ok(report)
        })?;

        tracing::debug!(
            user_id = %user_id,
            rewards = report.rewards.len(),
            failures = report.failures.len(),
            "criteria re-evaluated"
        );
        Ok(report)
    }
}

pub(crate) fn inactive(kind: DefinitionKind, definition_id: DefinitionId) -> anyhow::Error {
    domain(RewardError::DefinitionInactive(format!(
        "{} {definition_id}",
        kind.as_str()
    )))
}
