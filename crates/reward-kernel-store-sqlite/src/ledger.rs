use anyhow::{Context, Result};
use reward_kernel_core::{
    CriteriaRegistry, LedgerEntry, LedgerReference, LevelTable, ProfileAggregate, RewardError,
    RewardPolicy, TransactionType, UserId,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    collect_rows, domain, invalid_data, parse_sql_time, parse_ulid, parse_user_id, sql_time,
    u32_from_sql, DispatchReport, SqliteRewardStore,
};

const ENTRY_COLUMNS: &str = "SELECT ledger_seq, entry_id, user_id, user_seq, transaction_type,
        points, balance_after, reference_type, reference_id, description, created_at
     FROM ledger_entries";

const PROFILE_COLUMNS: &str = "SELECT user_id, total_points, available_points, current_level,
        progress_to_next_level, streak_count, longest_streak, consecutive_login_days,
        last_user_seq, created_at, updated_at
     FROM reward_profiles";

const DRIFT_SAMPLE_LIMIT: usize = 25;

/// A point award as requested by a collaborating feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwardRequest {
    pub points: i64,
    pub action: String,
    #[serde(default)]
    pub reference: LedgerReference,
    /// Running events of this type multiply `points`.
    #[serde(default)]
    pub event_type: Option<String>,
}

impl AwardRequest {
    #[must_use]
    pub fn new(points: i64, action: &str) -> Self {
        Self {
            points,
            action: action.to_string(),
            reference: LedgerReference::default(),
            event_type: None,
        }
    }

    #[must_use]
    pub fn with_reference(mut self, reference: LedgerReference) -> Self {
        self.reference = reference;
        self
    }

    #[must_use]
    pub fn with_event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.points <= 0 {
            return Err(domain(RewardError::Validation(format!(
                "award points MUST be > 0 (got {})",
                self.points
            ))));
        }
        if self.action.trim().is_empty() {
            return Err(domain(RewardError::Validation(
                "award action MUST be provided".to_string(),
            )));
        }
        Ok(())
    }
}

/// A ledger write together with the criteria pass it triggered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AwardOutcome {
    pub entry: LedgerEntry,
    pub profile: ProfileAggregate,
    #[serde(flatten)]
    pub dispatch: DispatchReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefundTarget {
    Entry {
        entry_id: Ulid,
    },
    Purchase {
        reference_type: String,
        reference_id: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryQuery {
    pub transaction_type: Option<TransactionType>,
    pub limit: Option<usize>,
    /// Exclusive upper bound on `user_seq`, taken from a previous page.
    pub cursor: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,
    pub next_cursor: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub user_id: UserId,
    pub cached_balance: i64,
    pub ledger_balance: i64,
    pub cached_total: i64,
    pub ledger_total: i64,
    pub drift_corrected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub users_checked: usize,
    pub drift_corrected: usize,
    pub corrected: Vec<ReconcileReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub contract_version: String,
    pub ledger_entries: i64,
    pub ledger_users: usize,
    pub profiles: usize,
    pub drifted_profiles: usize,
    pub lagging_profiles: usize,
    pub ledger_users_without_profile: usize,
    pub profiles_without_ledger: usize,
    pub max_balance_gap: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerIssue {
    pub code: String,
    pub severity: LedgerIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriftSample {
    pub user_id: UserId,
    pub ledger_user_seq: i64,
    pub ledger_balance: i64,
    pub cached_user_seq: Option<i64>,
    pub cached_balance: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: LedgerStatus,
    pub issues: Vec<LedgerIssue>,
    pub drift_sample: Vec<DriftSample>,
}

/// State of one user inside the per-user transactional boundary.
pub(crate) struct UserSession<'a> {
    pub(crate) conn: &'a Connection,
    pub(crate) user_id: UserId,
    pub(crate) policy: &'a RewardPolicy,
    pub(crate) levels: &'a LevelTable,
    pub(crate) registry: &'a CriteriaRegistry,
    pub(crate) now: OffsetDateTime,
    pub(crate) profile: ProfileAggregate,
    pub(crate) persisted: bool,
}

impl UserSession<'_> {
    /// Appends one ledger entry and folds it into the cached profile.
    ///
    /// The previous balance is read from the ledger, not the profile, so a
    /// drifted cache can never leak into `balance_after`.
    pub(crate) fn append(
        &mut self,
        transaction_type: TransactionType,
        points: i64,
        reference: &LedgerReference,
        action: Option<&str>,
    ) -> Result<LedgerEntry> {
        let (last_user_seq, previous_balance) = latest_position(self.conn, self.user_id)?;
        let balance_after = previous_balance.checked_add(points).ok_or_else(|| {
            domain(RewardError::Validation(format!(
                "balance overflow for {}",
                self.user_id
            )))
        })?;
        if balance_after < 0 {
            return Err(domain(RewardError::InsufficientFunds {
                user_id: self.user_id,
                requested: points.saturating_neg(),
                available: previous_balance,
            }));
        }

        let mut entry = LedgerEntry {
            ledger_seq: 0,
            entry_id: Ulid::new(),
            user_id: self.user_id,
            user_seq: last_user_seq + 1,
            transaction_type,
            points,
            balance_after,
            reference_type: reference.reference_type.clone(),
            reference_id: reference.reference_id.clone(),
            description: reference.description.clone().unwrap_or_default(),
            created_at: self.now,
        };
        let created_at = sql_time(entry.created_at)?;

        self.conn
            .execute(
                "INSERT INTO ledger_entries(
                    entry_id, user_id, user_seq, transaction_type, points, balance_after,
                    reference_type, reference_id, description, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.entry_id.to_string(),
                    entry.user_id.to_string(),
                    entry.user_seq,
                    entry.transaction_type.as_str(),
                    entry.points,
                    entry.balance_after,
                    entry.reference_type,
                    entry.reference_id,
                    entry.description,
                    created_at,
                ],
            )
            .context("failed to append ledger entry")?;
        entry.ledger_seq = self.conn.last_insert_rowid();

        if let Some(action) = action {
            self.conn
                .execute(
                    "INSERT INTO point_activities(
                        user_id, action, points, transaction_type, reference_type,
                        reference_id, description, ledger_entry_id, recorded_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        entry.user_id.to_string(),
                        action,
                        entry.points,
                        entry.transaction_type.as_str(),
                        entry.reference_type,
                        entry.reference_id,
                        entry.description,
                        entry.entry_id.to_string(),
                        created_at,
                    ],
                )
                .context("failed to append point activity")?;
        }

        self.profile.apply_entry(&entry, self.levels).map_err(domain)?;
        self.save_profile()?;

        tracing::debug!(
            user_id = %entry.user_id,
            user_seq = entry.user_seq,
            transaction_type = entry.transaction_type.as_str(),
            points = entry.points,
            balance_after = entry.balance_after,
            "ledger entry appended"
        );
        Ok(entry)
    }

    pub(crate) fn save_profile(&mut self) -> Result<()> {
        let profile = &self.profile;
        self.conn
            .execute(
                "INSERT INTO reward_profiles(
                    user_id, total_points, available_points, current_level,
                    progress_to_next_level, streak_count, longest_streak,
                    consecutive_login_days, last_user_seq, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(user_id) DO UPDATE SET
                   total_points = excluded.total_points,
                   available_points = excluded.available_points,
                   current_level = excluded.current_level,
                   progress_to_next_level = excluded.progress_to_next_level,
                   streak_count = excluded.streak_count,
                   longest_streak = excluded.longest_streak,
                   consecutive_login_days = excluded.consecutive_login_days,
                   last_user_seq = excluded.last_user_seq,
                   updated_at = excluded.updated_at",
                params![
                    profile.user_id.to_string(),
                    profile.total_points,
                    profile.available_points,
                    profile.current_level.map(i64::from),
                    profile.progress_to_next_level,
                    i64::from(profile.streak_count),
                    i64::from(profile.longest_streak),
                    i64::from(profile.consecutive_login_days),
                    profile.last_user_seq,
                    sql_time(profile.created_at)?,
                    sql_time(profile.updated_at)?,
                ],
            )
            .context("failed to save reward profile")?;
        self.persisted = true;
        Ok(())
    }
}

impl SqliteRewardStore {
    /// Runs `body` inside the per-user transactional boundary.
    ///
    /// The transaction takes the write lock up front (`BEGIN IMMEDIATE`), so
    /// read-validate-append sequences for a user never interleave. Busy or
    /// sequence conflicts are retried up to `max_write_retries` times, then
    /// surface as [`RewardError::LedgerWriteConflict`].
    pub(crate) fn within_user<T>(
        &mut self,
        user_id: UserId,
        operation: &'static str,
        mut body: impl FnMut(&mut UserSession<'_>) -> Result<T>,
    ) -> Result<T> {
        let policy = self.policy()?;
        let levels = self.level_table()?;
        let mut attempt = 0_u32;

        loop {
            attempt += 1;
            let now = self.clock.now();
            let result = run_in_user_transaction(
                &mut self.conn,
                &self.registry,
                &policy,
                &levels,
                user_id,
                now,
                &mut body,
            );

            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_write_conflict(&err) => {
                    if attempt >= policy.max_write_retries {
                        tracing::warn!(
                            user_id = %user_id,
                            operation,
                            attempts = attempt,
                            error = %err,
                            "ledger write conflict persisted"
                        );
                        return Err(domain(RewardError::LedgerWriteConflict { attempts: attempt }));
                    }
                    tracing::debug!(
                        user_id = %user_id,
                        operation,
                        attempt,
                        "ledger write conflict, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Appends an earn entry, updates the profile and re-runs criteria.
    ///
    /// References are recorded as given; repeated calls with the same
    /// reference produce repeated awards.
    pub fn award_points(
        &mut self,
        user_id: UserId,
        request: &AwardRequest,
    ) -> Result<AwardOutcome> {
        request.validate()?;

        let points = match &request.event_type {
            Some(event_type) => self.apply_event_multiplier(request.points, event_type)?,
            None => request.points,
        };
        if points <= 0 {
            return Err(domain(RewardError::Validation(format!(
                "award of {} points rounds to {points} after event multipliers",
                request.points
            ))));
        }

        let outcome = self.within_user(user_id, "award_points", |session| {
            let entry = session.append(
                TransactionType::Earn,
                points,
                &request.reference,
                Some(&request.action),
            )?;
            let dispatch = session.dispatch()?;
            Ok(AwardOutcome {
                entry,
                profile: session.profile.clone(),
                dispatch,
            })
        })?;

        tracing::info!(
            user_id = %user_id,
            points,
            action = %request.action,
            rewards = outcome.dispatch.rewards.len(),
            "points awarded"
        );
        Ok(outcome)
    }

    /// Awards the policy's points for a social action; `None` when the
    /// action is unknown or worth nothing.
    pub fn award_social_points(
        &mut self,
        user_id: UserId,
        action_type: &str,
    ) -> Result<Option<AwardOutcome>> {
        let policy = self.policy()?;
        let points = policy.social_points.get(action_type).copied().unwrap_or(0);
        if points <= 0 {
            tracing::debug!(user_id = %user_id, action_type, "social action carries no points");
            return Ok(None);
        }

        let request = AwardRequest::new(points, &format!("social:{action_type}")).with_reference(
            LedgerReference {
                reference_type: Some("social".to_string()),
                reference_id: None,
                description: Some(format!("Social action: {action_type}")),
            },
        );
        self.award_points(user_id, &request).map(Some)
    }

    /// Spends points and returns the new balance, including any point
    /// rewards the spend unlocked.
    pub fn spend_points(
        &mut self,
        user_id: UserId,
        amount: i64,
        reference: &LedgerReference,
    ) -> Result<i64> {
        self.spend(user_id, amount, reference)
            .map(|outcome| outcome.profile.available_points)
    }

    /// Spends points, then re-runs criteria in the same transaction.
    pub fn spend(
        &mut self,
        user_id: UserId,
        amount: i64,
        reference: &LedgerReference,
    ) -> Result<AwardOutcome> {
        if amount <= 0 {
            return Err(domain(RewardError::Validation(format!(
                "spend amount MUST be > 0 (got {amount})"
            ))));
        }

        let result = self.within_user(user_id, "spend_points", |session| {
            let entry =
                session.append(TransactionType::Spend, -amount, reference, Some("spend_points"))?;
            let dispatch = session.dispatch()?;
            Ok(AwardOutcome {
                entry,
                profile: session.profile.clone(),
                dispatch,
            })
        });

        match &result {
            Ok(outcome) => tracing::info!(
                user_id = %user_id,
                amount,
                balance_after = outcome.entry.balance_after,
                rewards = outcome.dispatch.rewards.len(),
                "points spent"
            ),
            Err(err) => {
                if let Some(RewardError::InsufficientFunds { available, .. }) = err.downcast_ref() {
                    tracing::info!(
                        user_id = %user_id,
                        amount,
                        available,
                        "spend rejected: insufficient funds"
                    );
                }
            }
        }
        result
    }

    /// Appends a signed correction. Never drives the balance negative and
    /// never counts toward lifetime points.
    pub fn adjust_points(
        &mut self,
        user_id: UserId,
        delta: i64,
        description: &str,
    ) -> Result<AwardOutcome> {
        if delta == 0 {
            return Err(domain(RewardError::Validation(
                "adjustment delta MUST be non-zero".to_string(),
            )));
        }
        if description.trim().is_empty() {
            return Err(domain(RewardError::Validation(
                "adjustment description MUST be provided".to_string(),
            )));
        }

        let reference = LedgerReference {
            reference_type: None,
            reference_id: None,
            description: Some(description.to_string()),
        };
        let outcome = self.within_user(user_id, "adjust_points", |session| {
            let entry =
                session.append(TransactionType::Adjustment, delta, &reference, Some("adjustment"))?;
            let dispatch = session.dispatch()?;
            Ok(AwardOutcome {
                entry,
                profile: session.profile.clone(),
                dispatch,
            })
        })?;

        tracing::info!(user_id = %user_id, delta, "points adjusted");
        Ok(outcome)
    }

    /// Appends a compensating entry for a spend, then re-runs criteria.
    /// The original entry is untouched.
    pub fn refund(&mut self, target: &RefundTarget) -> Result<AwardOutcome> {
        let user_id = self.refund_owner(target)?;

        let outcome = self.within_user(user_id, "refund", |session| {
            let original = resolve_refundable(session.conn, user_id, target)?;
            let original_id = original.entry_id.to_string();
            let description = match (&original.reference_type, &original.reference_id) {
                (Some(kind), Some(id)) => format!("Refund of {kind} {id}"),
                _ => format!("Refund of ledger entry {original_id}"),
            };
            let reference =
                LedgerReference::new("ledger_entry", &original_id).with_description(&description);
            let entry = session.append(
                TransactionType::Refund,
                -original.points,
                &reference,
                Some("refund"),
            )?;
            let dispatch = session.dispatch()?;
            Ok(AwardOutcome {
                entry,
                profile: session.profile.clone(),
                dispatch,
            })
        })?;

        tracing::info!(user_id = %user_id, points = outcome.entry.points, "spend refunded");
        Ok(outcome)
    }

    /// Latest `balance_after` from the ledger, 0 when the user has none.
    pub fn get_balance(&self, user_id: UserId) -> Result<i64> {
        Ok(latest_position(&self.conn, user_id)?.1)
    }

    pub fn get_profile(&self, user_id: UserId) -> Result<Option<ProfileAggregate>> {
        load_profile(&self.conn, user_id)
    }

    /// Ledger entries newest first.
    pub fn history(&self, user_id: UserId, query: &HistoryQuery) -> Result<LedgerPage> {
        let limit = match query.limit {
            Some(limit) => limit.max(1),
            None => self.policy()?.default_history_limit,
        };
        let fetch = i64::try_from(limit.saturating_add(1)).context("history limit out of range")?;

        let mut stmt = self.conn.prepare(&format!(
            "{ENTRY_COLUMNS}
             WHERE user_id = ?1
               AND (?2 IS NULL OR transaction_type = ?2)
               AND (?3 IS NULL OR user_seq < ?3)
             ORDER BY user_seq DESC
             LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                user_id.to_string(),
                query.transaction_type.map(TransactionType::as_str),
                query.cursor,
                fetch
            ],
            parse_entry_row,
        )?;
        let mut entries = collect_rows(rows)?;

        let next_cursor = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(|entry| entry.user_seq)
        } else {
            None
        };

        Ok(LedgerPage {
            entries,
            next_cursor,
        })
    }

    pub fn get_entry(&self, entry_id: Ulid) -> Result<Option<LedgerEntry>> {
        self.conn
            .query_row(
                &format!("{ENTRY_COLUMNS} WHERE entry_id = ?1"),
                params![entry_id.to_string()],
                parse_entry_row,
            )
            .optional()
            .context("failed to load ledger entry")
    }

    /// Overwrites the cached balance with the ledger's and returns it.
    pub fn reconcile_balance(&mut self, user_id: UserId) -> Result<i64> {
        Ok(self.reconcile_profile(user_id)?.ledger_balance)
    }

    /// Recomputes the cached aggregate from the ledger, correcting drift.
    pub fn reconcile_profile(&mut self, user_id: UserId) -> Result<ReconcileReport> {
        self.within_user(user_id, "reconcile", |session| {
            let (ledger_seq, ledger_balance) = latest_position(session.conn, user_id)?;
            let ledger_total = lifetime_earned(session.conn, user_id)?;

            let report = ReconcileReport {
                user_id,
                cached_balance: session.profile.available_points,
                ledger_balance,
                cached_total: session.profile.total_points,
                ledger_total,
                drift_corrected: session.profile.available_points != ledger_balance
                    || session.profile.total_points != ledger_total
                    || session.profile.last_user_seq != ledger_seq,
            };

            if report.drift_corrected {
                let drift = RewardError::AggregateDriftDetected {
                    user_id,
                    cached: report.cached_balance,
                    ledger: report.ledger_balance,
                };
                tracing::warn!(
                    user_id = %user_id,
                    error = %drift,
                    cached_total = report.cached_total,
                    ledger_total = report.ledger_total,
                    cached_seq = session.profile.last_user_seq,
                    ledger_seq,
                    "aggregate drift corrected from ledger"
                );
                session.profile.available_points = ledger_balance;
                session.profile.total_points = ledger_total;
                session.profile.last_user_seq = ledger_seq;
                session.profile.updated_at = session.now;
            }

            session.profile.refresh_standing(session.levels);
            if session.persisted || ledger_seq > 0 {
                session.save_profile()?;
            }
            Ok(report)
        })
    }

    /// Reconciles every known user, one transaction per user.
    pub fn reconcile_all(&mut self) -> Result<ReconcileSummary> {
        let users = self.known_users()?;
        let mut corrected = Vec::new();

        for user_id in &users {
            let report = self.reconcile_profile(*user_id)?;
            if report.drift_corrected {
                corrected.push(report);
            }
        }

        tracing::info!(users = users.len(), corrected = corrected.len(), "reconciliation finished");
        Ok(ReconcileSummary {
            users_checked: users.len(),
            drift_corrected: corrected.len(),
            corrected,
        })
    }

    /// Read-only health report comparing cached profiles to the ledger.
    pub fn ledger_check(&self) -> Result<LedgerCheck> {
        let samples = self.drift_samples(None)?;
        let ledger_entries: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))
            .context("failed to count ledger entries")?;
        let ledger_users = count(&self.conn, "SELECT COUNT(DISTINCT user_id) FROM ledger_entries")?;
        let profiles = count(&self.conn, "SELECT COUNT(*) FROM reward_profiles")?;
        let profiles_without_ledger = count(
            &self.conn,
            "SELECT COUNT(*) FROM reward_profiles p
             WHERE NOT EXISTS (SELECT 1 FROM ledger_entries e WHERE e.user_id = p.user_id)
               AND (p.available_points <> 0 OR p.total_points <> 0 OR p.last_user_seq <> 0)",
        )?;

        let drifted_profiles = samples
            .iter()
            .filter(|sample| {
                sample.cached_balance.is_some_and(|cached| cached != sample.ledger_balance)
            })
            .count();
        let lagging_profiles = samples
            .iter()
            .filter(|sample| {
                sample.cached_user_seq.is_some_and(|cached| cached != sample.ledger_user_seq)
            })
            .count();
        let ledger_users_without_profile = samples
            .iter()
            .filter(|sample| sample.cached_user_seq.is_none())
            .count();
        let max_balance_gap = samples
            .iter()
            .map(|sample| (sample.ledger_balance - sample.cached_balance.unwrap_or(0)).abs())
            .max()
            .unwrap_or(0);

        let status = LedgerStatus {
            contract_version: "ledger_status.v1".to_string(),
            ledger_entries,
            ledger_users,
            profiles,
            drifted_profiles,
            lagging_profiles,
            ledger_users_without_profile,
            profiles_without_ledger,
            max_balance_gap,
        };

        let mut issues = Vec::new();
        if status.drifted_profiles > 0 {
            issues.push(LedgerIssue {
                code: "balance_drift".to_string(),
                severity: LedgerIssueSeverity::Error,
                message: format!(
                    "cached balance differs from ledger for {} profiles (max gap {})",
                    status.drifted_profiles, status.max_balance_gap
                ),
            });
        }
        if status.lagging_profiles > 0 {
            issues.push(LedgerIssue {
                code: "ledger_seq_lag".to_string(),
                severity: LedgerIssueSeverity::Error,
                message: format!(
                    "profile ledger position differs from ledger head for {} profiles",
                    status.lagging_profiles
                ),
            });
        }
        if status.ledger_users_without_profile > 0 {
            issues.push(LedgerIssue {
                code: "missing_profile".to_string(),
                severity: LedgerIssueSeverity::Error,
                message: format!(
                    "ledger users without a profile: {}",
                    status.ledger_users_without_profile
                ),
            });
        }
        if status.profiles_without_ledger > 0 {
            issues.push(LedgerIssue {
                code: "orphan_profile".to_string(),
                severity: LedgerIssueSeverity::Warning,
                message: format!(
                    "profiles with balances but no ledger entries: {}",
                    status.profiles_without_ledger
                ),
            });
        }

        let healthy = !issues
            .iter()
            .any(|issue| issue.severity == LedgerIssueSeverity::Error);

        Ok(LedgerCheck {
            contract_version: "ledger_check.v1".to_string(),
            healthy,
            status,
            issues,
            drift_sample: samples.into_iter().take(DRIFT_SAMPLE_LIMIT).collect(),
        })
    }

    pub fn drift_samples(&self, limit: Option<usize>) -> Result<Vec<DriftSample>> {
        let mut query = "SELECT
                head.user_id,
                head.user_seq,
                head.balance_after,
                profile.last_user_seq,
                profile.available_points
             FROM ledger_entries head
             JOIN (
                SELECT user_id, MAX(user_seq) AS max_seq
                FROM ledger_entries
                GROUP BY user_id
             ) latest
               ON latest.user_id = head.user_id
              AND latest.max_seq = head.user_seq
             LEFT JOIN reward_profiles profile
               ON profile.user_id = head.user_id
             WHERE profile.user_id IS NULL
                OR profile.available_points <> head.balance_after
                OR profile.last_user_seq <> head.user_seq
             ORDER BY head.user_id ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            Ok(DriftSample {
                user_id: parse_user_id(&row.get::<_, String>(0)?, 0)?,
                ledger_user_seq: row.get(1)?,
                ledger_balance: row.get(2)?,
                cached_user_seq: row.get(3)?,
                cached_balance: row.get(4)?,
            })
        })?;
        collect_rows(rows)
    }

    fn known_users(&self) -> Result<Vec<UserId>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM ledger_entries
             UNION
             SELECT user_id FROM reward_profiles
             ORDER BY 1 ASC",
        )?;
        let rows = stmt.query_map([], |row| parse_user_id(&row.get::<_, String>(0)?, 0))?;
        collect_rows(rows)
    }

    fn refund_owner(&self, target: &RefundTarget) -> Result<UserId> {
        let owner: Option<String> = match target {
            RefundTarget::Entry { entry_id } => self
                .conn
                .query_row(
                    "SELECT user_id FROM ledger_entries WHERE entry_id = ?1",
                    params![entry_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to resolve refund target")?,
            RefundTarget::Purchase {
                reference_type,
                reference_id,
            } => self
                .conn
                .query_row(
                    "SELECT user_id FROM ledger_entries
                     WHERE transaction_type = 'spend' AND reference_type = ?1 AND reference_id = ?2
                     ORDER BY ledger_seq DESC
                     LIMIT 1",
                    params![reference_type, reference_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to resolve refund target")?,
        };

        let Some(raw) = owner else {
            return Err(domain(RewardError::NotFound(describe_target(target))));
        };
        raw.parse::<UserId>().map_err(domain)
    }
}

fn run_in_user_transaction<T>(
    conn: &mut Connection,
    registry: &CriteriaRegistry,
    policy: &RewardPolicy,
    levels: &LevelTable,
    user_id: UserId,
    now: OffsetDateTime,
    body: &mut impl FnMut(&mut UserSession<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to begin per-user transaction")?;

    let value = {
        let stored = load_profile(&tx, user_id)?;
        let persisted = stored.is_some();
        let profile = stored.unwrap_or_else(|| ProfileAggregate::new(user_id, levels, now));
        let mut session = UserSession {
            conn: &tx,
            user_id,
            policy,
            levels,
            registry,
            now,
            profile,
            persisted,
        };
        body(&mut session)?
    };

    tx.commit().context("failed to commit per-user transaction")?;
    Ok(value)
}

fn is_write_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, message)) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
            ErrorCode::ConstraintViolation => message
                .as_deref()
                .is_some_and(|text| text.contains("ledger_entries.user_seq")),
            _ => false,
        },
        _ => false,
    })
}

fn describe_target(target: &RefundTarget) -> String {
    match target {
        RefundTarget::Entry { entry_id } => format!("ledger entry {entry_id}"),
        RefundTarget::Purchase {
            reference_type,
            reference_id,
        } => format!("spend for {reference_type} {reference_id}"),
    }
}

fn resolve_refundable(
    conn: &Connection,
    user_id: UserId,
    target: &RefundTarget,
) -> Result<LedgerEntry> {
    match target {
        RefundTarget::Entry { entry_id } => {
            let entry = conn
                .query_row(
                    &format!("{ENTRY_COLUMNS} WHERE entry_id = ?1 AND user_id = ?2"),
                    params![entry_id.to_string(), user_id.to_string()],
                    parse_entry_row,
                )
                .optional()
                .context("failed to load refund target")?
                .ok_or_else(|| domain(RewardError::NotFound(describe_target(target))))?;

            if entry.transaction_type != TransactionType::Spend {
                return Err(domain(RewardError::Validation(format!(
                    "only spend entries can be refunded; {} is {}",
                    entry.entry_id,
                    entry.transaction_type.as_str()
                ))));
            }
            if is_refunded(conn, entry.entry_id)? {
                return Err(domain(RewardError::Validation(format!(
                    "ledger entry {} was already refunded",
                    entry.entry_id
                ))));
            }
            Ok(entry)
        }
        RefundTarget::Purchase {
            reference_type,
            reference_id,
        } => conn
            .query_row(
                &format!(
                    "{ENTRY_COLUMNS}
                     WHERE user_id = ?1
                       AND transaction_type = 'spend'
                       AND reference_type = ?2
                       AND reference_id = ?3
                       AND NOT EXISTS (
                         SELECT 1 FROM ledger_entries refund
                         WHERE refund.transaction_type = 'refund'
                           AND refund.reference_type = 'ledger_entry'
                           AND refund.reference_id = ledger_entries.entry_id
                       )
                     ORDER BY user_seq DESC
                     LIMIT 1"
                ),
                params![user_id.to_string(), reference_type, reference_id],
                parse_entry_row,
            )
            .optional()
            .context("failed to load refund target")?
            .ok_or_else(|| {
                domain(RewardError::Validation(format!(
                    "no unrefunded {} remains",
                    describe_target(target)
                )))
            }),
    }
}

fn is_refunded(conn: &Connection, entry_id: Ulid) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM ledger_entries
             WHERE transaction_type = 'refund'
               AND reference_type = 'ledger_entry'
               AND reference_id = ?1
             LIMIT 1",
            params![entry_id.to_string()],
            |_| Ok(()),
        )
        .optional()
        .context("failed to check refund status")?;
    Ok(found.is_some())
}

/// `(user_seq, balance_after)` of the user's newest entry, `(0, 0)` if none.
pub(crate) fn latest_position(conn: &Connection, user_id: UserId) -> Result<(i64, i64)> {
    let position = conn
        .query_row(
            "SELECT user_seq, balance_after FROM ledger_entries
             WHERE user_id = ?1
             ORDER BY user_seq DESC
             LIMIT 1",
            params![user_id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .context("failed to read latest ledger balance")?;
    Ok(position.unwrap_or((0, 0)))
}

fn lifetime_earned(conn: &Connection, user_id: UserId) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(points), 0) FROM ledger_entries
         WHERE user_id = ?1 AND transaction_type = 'earn' AND points > 0",
        params![user_id.to_string()],
        |row| row.get(0),
    )
    .context("failed to sum lifetime points")
}

fn count(conn: &Connection, sql: &str) -> Result<usize> {
    let value: i64 = conn
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    usize::try_from(value).context("count out of range")
}

pub(crate) fn load_profile(conn: &Connection, user_id: UserId) -> Result<Option<ProfileAggregate>> {
    conn.query_row(
        &format!("{PROFILE_COLUMNS} WHERE user_id = ?1"),
        params![user_id.to_string()],
        parse_profile_row,
    )
    .optional()
    .context("failed to load reward profile")
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileAggregate> {
    let current_level: Option<i64> = row.get(3)?;

    Ok(ProfileAggregate {
        user_id: parse_user_id(&row.get::<_, String>(0)?, 0)?,
        total_points: row.get(1)?,
        available_points: row.get(2)?,
        current_level: current_level
            .map(|level| u32_from_sql(level, 3))
            .transpose()?,
        progress_to_next_level: row.get(4)?,
        streak_count: u32_from_sql(row.get(5)?, 5)?,
        longest_streak: u32_from_sql(row.get(6)?, 6)?,
        consecutive_login_days: u32_from_sql(row.get(7)?, 7)?,
        last_user_seq: row.get(8)?,
        created_at: parse_sql_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_sql_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let transaction_type_raw: String = row.get(4)?;
    let transaction_type = TransactionType::parse(&transaction_type_raw).ok_or_else(|| {
        invalid_data(
            4,
            rusqlite::types::Type::Text,
            format!("invalid transaction_type: {transaction_type_raw}"),
        )
    })?;

    Ok(LedgerEntry {
        ledger_seq: row.get(0)?,
        entry_id: parse_ulid(&row.get::<_, String>(1)?, 1)?,
        user_id: parse_user_id(&row.get::<_, String>(2)?, 2)?,
        user_seq: row.get(3)?,
        transaction_type,
        points: row.get(5)?,
        balance_after: row.get(6)?,
        reference_type: row.get(7)?,
        reference_id: row.get(8)?,
        description: row.get(9)?,
        created_at: parse_sql_time(&row.get::<_, String>(10)?)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use crate::test_support::*;
    use proptest::prelude::*;
    use std::path::Path;

    fn award(store: &mut SqliteRewardStore, user_id: UserId, points: i64) -> AwardOutcome {
        must(store.award_points(user_id, &AwardRequest::new(points, "complete_lesson")))
    }

    fn purchase(order: &str) -> LedgerReference {
        LedgerReference::new("purchase", order)
    }

    fn all_entries(store: &SqliteRewardStore, user_id: UserId) -> Vec<LedgerEntry> {
        let page = must(store.history(
            user_id,
            &HistoryQuery {
                limit: Some(10_000),
                ..HistoryQuery::default()
            },
        ));
        page.entries
    }

    fn downcast(err: &anyhow::Error) -> Option<&RewardError> {
        err.downcast_ref::<RewardError>()
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut raw = path.as_os_str().to_owned();
            raw.push(suffix);
            let _ = std::fs::remove_file(raw);
        }
    }

    #[test]
    fn award_then_spend_leaves_two_entries_with_running_balance() {
        let mut store = fixture_store();
        assert_eq!(must(store.get_balance(alice())), 0);

        let _ = award(&mut store, alice(), 100);
        let balance = must(store.spend_points(alice(), 60, &purchase("order-1")));
        assert_eq!(balance, 40);
        assert_eq!(must(store.get_balance(alice())), 40);

        let entries = all_entries(&store, alice());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].balance_after, 40);
        assert_eq!(entries[0].transaction_type, TransactionType::Spend);
        assert_eq!(entries[0].points, -60);
        assert_eq!(entries[1].balance_after, 100);

        let profile = must(store.get_profile(alice())).unwrap_or_else(|| panic!("missing profile"));
        assert_eq!(profile.available_points, 40);
        assert_eq!(profile.total_points, 100);
        assert_eq!(profile.last_user_seq, 2);
    }

    #[test]
    fn overdraft_is_rejected_without_appending() {
        let mut store = fixture_store();
        let _ = award(&mut store, alice(), 50);

        let err = match store.spend_points(alice(), 51, &purchase("order-1")) {
            Ok(balance) => panic!("overdraft succeeded with balance {balance}"),
            Err(err) => err,
        };
        assert_eq!(
            downcast(&err),
            Some(&RewardError::InsufficientFunds {
                user_id: alice(),
                requested: 51,
                available: 50,
            })
        );
        assert_eq!(all_entries(&store, alice()).len(), 1);
        assert_eq!(must(store.get_balance(alice())), 50);

        let never_seen = store.spend_points(bob(), 1, &purchase("order-2"));
        assert!(matches!(
            never_seen.as_ref().err().and_then(downcast),
            Some(RewardError::InsufficientFunds { available: 0, .. })
        ));
        assert!(must(store.get_profile(bob())).is_none());
    }

    #[test]
    fn invalid_amounts_are_validation_errors() {
        let mut store = fixture_store();
        for result in [
            store.award_points(alice(), &AwardRequest::new(0, "noop")).map(|_| ()),
            store.award_points(alice(), &AwardRequest::new(5, " ")).map(|_| ()),
            store.spend_points(alice(), -5, &purchase("order")).map(|_| ()),
            store.adjust_points(alice(), 0, "nothing").map(|_| ()),
        ] {
            assert!(matches!(
                result.as_ref().err().and_then(downcast),
                Some(RewardError::Validation(_))
            ));
        }
        assert!(all_entries(&store, alice()).is_empty());
    }

    #[test]
    fn ledger_entries_are_append_only() {
        let mut store = fixture_store();
        let outcome = award(&mut store, alice(), 10);

        let update = store.connection().execute(
            "UPDATE ledger_entries SET points = 1000 WHERE entry_id = ?1",
            params![outcome.entry.entry_id.to_string()],
        );
        assert!(update.is_err());

        let delete = store.connection().execute(
            "DELETE FROM ledger_entries WHERE entry_id = ?1",
            params![outcome.entry.entry_id.to_string()],
        );
        assert!(delete.is_err());

        let activity_delete = store.connection().execute("DELETE FROM point_activities", []);
        assert!(activity_delete.is_err());
    }

    #[test]
    fn refund_appends_compensating_entry_once() {
        let mut store = fixture_store();
        let earned = award(&mut store, alice(), 100);
        let spent = must(store.spend(alice(), 70, &purchase("order-7"))).entry;

        let refund = must(store.refund(&RefundTarget::Entry {
            entry_id: spent.entry_id,
        }))
        .entry;
        assert_eq!(refund.transaction_type, TransactionType::Refund);
        assert_eq!(refund.points, 70);
        assert_eq!(refund.balance_after, 100);
        assert_eq!(refund.reference_type.as_deref(), Some("ledger_entry"));
        assert_eq!(refund.reference_id, Some(spent.entry_id.to_string()));

        let original = must(store.get_entry(spent.entry_id))
            .unwrap_or_else(|| panic!("original entry missing"));
        assert_eq!(original, spent);

        let again = store.refund(&RefundTarget::Entry {
            entry_id: spent.entry_id,
        });
        assert!(matches!(
            again.as_ref().err().and_then(downcast),
            Some(RewardError::Validation(_))
        ));

        let earn_refund = store.refund(&RefundTarget::Entry {
            entry_id: earned.entry.entry_id,
        });
        assert!(matches!(
            earn_refund.as_ref().err().and_then(downcast),
            Some(RewardError::Validation(_))
        ));

        let missing = store.refund(&RefundTarget::Entry { entry_id: Ulid::new() });
        assert!(matches!(
            missing.as_ref().err().and_then(downcast),
            Some(RewardError::NotFound(_))
        ));

        let profile = must(store.get_profile(alice())).unwrap_or_else(|| panic!("missing profile"));
        assert_eq!(profile.total_points, 100);
        assert_eq!(profile.available_points, 100);
    }

    #[test]
    fn refund_by_purchase_reference_picks_unrefunded_spend() {
        let mut store = fixture_store();
        let _ = award(&mut store, alice(), 100);
        let first = must(store.spend(alice(), 10, &purchase("order-9"))).entry;
        let second = must(store.spend(alice(), 20, &purchase("order-9"))).entry;

        let target = RefundTarget::Purchase {
            reference_type: "purchase".to_string(),
            reference_id: "order-9".to_string(),
        };
        let refund_a = must(store.refund(&target)).entry;
        let refund_b = must(store.refund(&target)).entry;
        assert_eq!(refund_a.reference_id, Some(second.entry_id.to_string()));
        assert_eq!(refund_b.reference_id, Some(first.entry_id.to_string()));
        assert!(store.refund(&target).is_err());
        assert_eq!(must(store.get_balance(alice())), 100);
    }

    #[test]
    fn adjustments_never_overdraw_or_raise_lifetime_points() {
        let mut store = fixture_store();
        let _ = award(&mut store, alice(), 30);

        let up = must(store.adjust_points(alice(), 20, "support credit"));
        assert_eq!(up.entry.balance_after, 50);
        assert_eq!(up.profile.total_points, 30);

        let down = must(store.adjust_points(alice(), -45, "chargeback"));
        assert_eq!(down.entry.balance_after, 5);

        let overdraw = store.adjust_points(alice(), -6, "too much");
        assert!(matches!(
            overdraw.as_ref().err().and_then(downcast),
            Some(RewardError::InsufficientFunds { requested: 6, available: 5, .. })
        ));
    }

    #[test]
    fn history_pages_newest_first_with_type_filter() {
        let mut store = fixture_store();
        for points in [10, 20, 30, 40, 50] {
            let _ = award(&mut store, alice(), points);
        }
        let _ = must(store.spend_points(alice(), 5, &purchase("order-1")));

        let first = must(store.history(
            alice(),
            &HistoryQuery {
                limit: Some(2),
                ..HistoryQuery::default()
            },
        ));
        assert_eq!(
            first.entries.iter().map(|entry| entry.user_seq).collect::<Vec<_>>(),
            vec![6, 5]
        );
        assert_eq!(first.next_cursor, Some(5));

        let second = must(store.history(
            alice(),
            &HistoryQuery {
                transaction_type: Some(TransactionType::Earn),
                limit: Some(10),
                cursor: first.next_cursor,
            },
        ));
        assert_eq!(
            second.entries.iter().map(|entry| entry.points).collect::<Vec<_>>(),
            vec![40, 30, 20, 10]
        );
        assert_eq!(second.next_cursor, None);
    }

    #[test]
    fn reconcile_corrects_drift_and_check_reports_it() {
        let mut store = fixture_store();
        seed_levels(&mut store);
        let _ = award(&mut store, alice(), 100);
        let _ = must(store.spend_points(alice(), 60, &purchase("order-1")));
        let _ = award(&mut store, bob(), 5);

        assert!(must(store.ledger_check()).healthy);

        if let Err(err) = store.connection().execute(
            "UPDATE reward_profiles SET available_points = 999 WHERE user_id = ?1",
            params![alice().to_string()],
        ) {
            panic!("failed to inject drift: {err}");
        }

        let check = must(store.ledger_check());
        assert!(!check.healthy);
        assert_eq!(check.status.drifted_profiles, 1);
        assert_eq!(check.status.max_balance_gap, 959);
        assert_eq!(check.drift_sample[0].user_id, alice());
        assert!(check.issues.iter().any(|issue| issue.code == "balance_drift"));

        assert_eq!(must(store.reconcile_balance(alice())), 40);
        let profile = must(store.get_profile(alice())).unwrap_or_else(|| panic!("missing profile"));
        assert_eq!(profile.available_points, 40);
        assert_eq!(profile.current_level, Some(2));
        assert!(must(store.ledger_check()).healthy);

        let summary = must(store.reconcile_all());
        assert_eq!(summary.users_checked, 2);
        assert_eq!(summary.drift_corrected, 0);
    }

    #[test]
    fn reconcile_rebuilds_missing_profile_from_ledger() {
        let mut store = fixture_store();
        let _ = award(&mut store, alice(), 25);
        if let Err(err) = store.connection().execute("DELETE FROM reward_profiles", []) {
            panic!("failed to drop profile: {err}");
        }

        let check = must(store.ledger_check());
        assert_eq!(check.status.ledger_users_without_profile, 1);
        assert!(!check.healthy);

        let report = must(store.reconcile_profile(alice()));
        assert!(report.drift_corrected);
        assert_eq!(report.ledger_total, 25);
        let profile = must(store.get_profile(alice())).unwrap_or_else(|| panic!("missing profile"));
        assert_eq!(profile.total_points, 25);
        assert_eq!(profile.last_user_seq, 1);
    }

    #[test]
    fn duplicate_references_are_awarded_twice() {
        // Awards are not deduplicated by reference; callers own idempotency.
        let mut store = fixture_store();
        let request = AwardRequest::new(10, "complete_lesson")
            .with_reference(LedgerReference::new("lesson", "lesson-42"));

        let _ = must(store.award_points(alice(), &request));
        let _ = must(store.award_points(alice(), &request));

        assert_eq!(must(store.get_balance(alice())), 20);
        assert_eq!(all_entries(&store, alice()).len(), 2);
    }

    #[test]
    fn event_type_applies_running_multipliers() {
        let store_clock = fixture_clock();
        let mut store = fixture_store_with_clock(store_clock);
        let _ = must(store.create_event(&reward_kernel_core::RewardEventInput {
            name: "Double Weekend".to_string(),
            description: String::new(),
            event_type: "weekend".to_string(),
            point_multiplier: 2.5,
            starts_at: must_utc("2026-02-07T00:00:00Z"),
            ends_at: must_utc("2026-02-09T00:00:00Z"),
        }));

        let boosted = must(store.award_points(
            alice(),
            &AwardRequest::new(11, "complete_lesson").with_event_type("weekend"),
        ));
        assert_eq!(boosted.entry.points, 27);

        let plain = must(store.award_points(
            alice(),
            &AwardRequest::new(11, "complete_lesson").with_event_type("holiday"),
        ));
        assert_eq!(plain.entry.points, 11);
    }

    #[test]
    fn social_points_follow_policy() {
        let mut store = fixture_store();
        let outcome = must(store.award_social_points(alice(), "share"));
        assert_eq!(outcome.map(|value| value.entry.points), Some(5));
        assert!(must(store.award_social_points(alice(), "wave")).is_none());

        let mut policy = must(store.policy());
        policy.policy_version = 2;
        policy.social_points.insert("wave".to_string(), 2);
        must(store.upsert_policy(&policy));
        let outcome = must(store.award_social_points(alice(), "wave"));
        assert_eq!(outcome.map(|value| value.entry.balance_after), Some(7));
    }

    #[derive(Debug, Clone, Copy)]
    enum LedgerOp {
        Award(i64),
        Spend(i64),
        Adjust(i64),
    }

    fn ledger_op() -> impl Strategy<Value = LedgerOp> {
        prop_oneof![
            (1_i64..200).prop_map(LedgerOp::Award),
            (1_i64..200).prop_map(LedgerOp::Spend),
            (-100_i64..100)
                .prop_filter("non-zero", |delta| *delta != 0)
                .prop_map(LedgerOp::Adjust),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_balance_tracks_latest_entry(ops in prop::collection::vec(ledger_op(), 1..60)) {
            let mut store = fixture_store();
            let mut model_balance = 0_i64;
            let mut model_total = 0_i64;

            for op in ops {
                let result = match op {
                    LedgerOp::Award(points) => store
                        .award_points(alice(), &AwardRequest::new(points, "prop"))
                        .map(|outcome| outcome.entry),
                    LedgerOp::Spend(amount) => store
                        .spend(alice(), amount, &LedgerReference::default())
                        .map(|outcome| outcome.entry),
                    LedgerOp::Adjust(delta) => store
                        .adjust_points(alice(), delta, "prop adjustment")
                        .map(|outcome| outcome.entry),
                };

                let delta = match op {
                    LedgerOp::Award(points) => points,
                    LedgerOp::Spend(amount) => -amount,
                    LedgerOp::Adjust(delta) => delta,
                };
                if model_balance + delta >= 0 {
                    let entry = must(result);
                    model_balance += delta;
                    if let LedgerOp::Award(points) = op {
                        model_total += points;
                    }
                    prop_assert_eq!(entry.balance_after, model_balance);
                } else {
                    let is_insufficient_funds = matches!(
                        result.as_ref().err().and_then(downcast),
                        Some(RewardError::InsufficientFunds { .. })
                    );
                    prop_assert!(is_insufficient_funds);
                }

                let balance = must(store.get_balance(alice()));
                prop_assert_eq!(balance, model_balance);
                prop_assert!(balance >= 0);
                if let Some(profile) = must(store.get_profile(alice())) {
                    prop_assert_eq!(profile.available_points, balance);
                    prop_assert_eq!(profile.total_points, model_total);
                }
            }

            let report = must(store.reconcile_profile(alice()));
            prop_assert!(!report.drift_corrected);
        }
    }

    #[test]
    fn concurrent_spends_never_overdraw() {
        let db_path =
            std::env::temp_dir().join(format!("reward-spend-race-{}.sqlite3", Ulid::new()));

        let mut setup = must(SqliteRewardStore::open(&db_path));
        must(setup.migrate());
        let _ = must(setup.award_points(alice(), &AwardRequest::new(100, "seed")));
        drop(setup);

        let handles: Vec<_> = (0..8)
            .map(|index| {
                let path = db_path.clone();
                std::thread::spawn(move || -> Result<i64> {
                    let mut store = SqliteRewardStore::open(&path)?;
                    store.spend_points(
                        alice(),
                        30,
                        &LedgerReference::new("purchase", &format!("order-{index}")),
                    )
                })
            })
            .collect();

        let mut succeeded = 0;
        let mut insufficient = 0;
        for handle in handles {
            let result = match handle.join() {
                Ok(result) => result,
                Err(err) => panic!("spend thread join failed: {err:?}"),
            };
            match result {
                Ok(_) => succeeded += 1,
                Err(err) => match downcast(&err) {
                    Some(RewardError::InsufficientFunds { .. }) => insufficient += 1,
                    _ => panic!("unexpected spend failure: {err:#}"),
                },
            }
        }

        assert_eq!(succeeded, 3);
        assert_eq!(insufficient, 5);

        let store = must(SqliteRewardStore::open(&db_path));
        assert_eq!(must(store.get_balance(alice())), 10);
        let entries = all_entries(&store, alice());
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|entry| entry.balance_after >= 0));
        drop(store);

        remove_db(&db_path);
    }

    #[test]
    fn held_write_lock_surfaces_as_write_conflict_after_retries() {
        let db_path =
            std::env::temp_dir().join(format!("reward-conflict-{}.sqlite3", Ulid::new()));
        let setup = must(SqliteRewardStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let mut store = must(SqliteRewardStore::open(&db_path));
        must(store.set_busy_timeout(std::time::Duration::from_millis(20)));
        let result = store.award_points(alice(), &AwardRequest::new(10, "lesson"));
        assert_eq!(
            result.as_ref().err().and_then(downcast),
            Some(&RewardError::LedgerWriteConflict { attempts: 3 })
        );

        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }
        let _ = must(store.award_points(alice(), &AwardRequest::new(10, "lesson")));
        assert_eq!(must(store.get_balance(alice())), 10);
        drop(store);
        drop(lock_conn);

        remove_db(&db_path);
    }

    #[test]
    fn busy_timeout_allows_award_after_lock_release() {
        let db_path = std::env::temp_dir().join(format!("reward-lock-{}.sqlite3", Ulid::new()));
        let setup = must(SqliteRewardStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let award_path = db_path.clone();
        let award_handle = std::thread::spawn(move || {
            let mut store = SqliteRewardStore::open(&award_path)?;
            store.award_points(alice(), &AwardRequest::new(10, "lesson"))
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let award_result = match award_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("award thread join failed: {err:?}"),
        };
        assert!(
            award_result.is_ok(),
            "award should succeed after lock release: {:?}",
            award_result.err()
        );
        drop(lock_conn);

        remove_db(&db_path);
    }
}
