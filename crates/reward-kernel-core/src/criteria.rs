use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use serde_json::Value;
use time::Date;

use crate::{ProfileAggregate, RewardError, UserId};

/// Read access to the per-user state evaluators consult.
///
/// The store implements this over an open transaction so evaluation sees the
/// same snapshot as the award that triggered it.
pub trait CriteriaContext {
    fn user_id(&self) -> UserId;

    /// Business date used for age comparisons.
    fn today(&self) -> Date;

    /// # Errors
    /// Returns an error when the activity log cannot be read.
    fn action_count(&self, action: &str) -> Result<u64, RewardError>;

    /// Current count of the streak, `None` when the user has no such streak.
    ///
    /// # Errors
    /// Returns an error when streak state cannot be read.
    fn streak_count(&self, streak_type: &str) -> Result<Option<u32>, RewardError>;

    /// # Errors
    /// Returns an error when quest state cannot be read.
    fn quest_completed(&self, quest_id: &str) -> Result<bool, RewardError>;

    /// Gross points spent across all spend entries.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be read.
    fn total_spent(&self) -> Result<i64, RewardError>;

    /// # Errors
    /// Returns an error when social stats cannot be read.
    fn social_count(&self, metric: &str) -> Result<u64, RewardError>;

    /// # Errors
    /// Returns an error when the account record cannot be read.
    fn joined_on(&self) -> Result<Option<Date>, RewardError>;

    /// Progress object of the quest or challenge under evaluation, if any.
    fn progress(&self) -> Option<&Value>;
}

/// A single named condition: `Evaluate(user, profile, params) -> bool`.
pub trait CriteriaEvaluator: Send + Sync {
    /// # Errors
    /// Returns an error when params are malformed or state cannot be read.
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError>;
}

fn int_param(
    params: &Value,
    condition: &str,
    key: &str,
    default: Option<i64>,
) -> Result<i64, RewardError> {
    match params.get(key) {
        None | Some(Value::Null) => default.ok_or_else(|| RewardError::Criteria {
            condition: condition.to_string(),
            message: format!("missing required parameter {key}"),
        }),
        Some(value) => value.as_i64().ok_or_else(|| RewardError::Criteria {
            condition: condition.to_string(),
            message: format!("parameter {key} MUST be an integer"),
        }),
    }
}

fn str_param<'a>(
    params: &'a Value,
    condition: &str,
    key: &str,
    default: Option<&'a str>,
) -> Result<&'a str, RewardError> {
    match params.get(key) {
        None | Some(Value::Null) => default.ok_or_else(|| RewardError::Criteria {
            condition: condition.to_string(),
            message: format!("missing required parameter {key}"),
        }),
        Some(value) => value.as_str().ok_or_else(|| RewardError::Criteria {
            condition: condition.to_string(),
            message: format!("parameter {key} MUST be a string"),
        }),
    }
}

fn object_param<'a>(
    params: &'a Value,
    condition: &str,
) -> Result<&'a serde_json::Map<String, Value>, RewardError> {
    params.as_object().ok_or_else(|| RewardError::Criteria {
        condition: condition.to_string(),
        message: "parameters MUST be a JSON object".to_string(),
    })
}

/// `{"min_points": N}` against lifetime points.
#[derive(Debug, Default, Clone, Copy)]
pub struct PointsEvaluator;

impl CriteriaEvaluator for PointsEvaluator {
    fn evaluate(
        &self,
        _context: &dyn CriteriaContext,
        profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let min_points = int_param(params, "points", "min_points", Some(0))?;
        Ok(profile.total_points >= min_points)
    }
}

/// `{"action": "complete_lesson", "count": N}` against the activity log.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActionCountEvaluator;

impl CriteriaEvaluator for ActionCountEvaluator {
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        _profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let action = str_param(params, "actions", "action", None)?;
        let count = int_param(params, "actions", "count", Some(1))?;
        let seen = context.action_count(action)?;
        Ok(i64::try_from(seen).unwrap_or(i64::MAX) >= count)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StreakEvaluator;

impl CriteriaEvaluator for StreakEvaluator {
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        _profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let streak_type = str_param(params, "streak", "streak_type", Some("login"))?;
        let min_streak = int_param(params, "streak", "min_streak", Some(1))?;
        Ok(context
            .streak_count(streak_type)?
            .is_some_and(|current| i64::from(current) >= min_streak))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QuestCompletionEvaluator;

impl CriteriaEvaluator for QuestCompletionEvaluator {
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        _profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let quest_id = str_param(params, "quest", "quest_id", None)?;
        context.quest_completed(quest_id)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpendingEvaluator;

impl CriteriaEvaluator for SpendingEvaluator {
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        _profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let min_spent = int_param(params, "spending", "min_spent", Some(0))?;
        Ok(context.total_spent()? >= min_spent)
    }
}

/// `{"comments": 5, "followers": 10}`: every metric must reach its minimum.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocialEvaluator;

impl CriteriaEvaluator for SocialEvaluator {
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        _profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        for (metric, minimum) in object_param(params, "social")? {
            let minimum = minimum.as_u64().ok_or_else(|| RewardError::Criteria {
                condition: "social".to_string(),
                message: format!("minimum for {metric} MUST be a non-negative integer"),
            })?;
            if context.social_count(metric)? < minimum {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LevelEvaluator;

impl CriteriaEvaluator for LevelEvaluator {
    fn evaluate(
        &self,
        _context: &dyn CriteriaContext,
        profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let min_level = int_param(params, "level", "min_level", Some(1))?;
        Ok(profile
            .current_level
            .is_some_and(|level| i64::from(level) >= min_level))
    }
}

/// `{"min_days": N}` since the account was registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccountAgeEvaluator;

impl CriteriaEvaluator for AccountAgeEvaluator {
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        _profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let min_days = int_param(params, "time", "min_days", Some(0))?;
        let Some(joined) = context.joined_on()? else {
            return Ok(false);
        };
        Ok((context.today() - joined).whole_days() >= min_days)
    }
}

/// `{"lessons": 5}` against the progress object of the quest/challenge.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressEvaluator;

impl CriteriaEvaluator for ProgressEvaluator {
    fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        _profile: &ProfileAggregate,
        params: &Value,
    ) -> Result<bool, RewardError> {
        let thresholds = object_param(params, "progress")?;
        let Some(progress) = context.progress() else {
            return Ok(thresholds.is_empty());
        };

        for (key, minimum) in thresholds {
            let minimum = minimum.as_f64().ok_or_else(|| RewardError::Criteria {
                condition: "progress".to_string(),
                message: format!("minimum for {key} MUST be numeric"),
            })?;
            match progress.get(key).and_then(Value::as_f64) {
                Some(reached) if reached >= minimum => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// Outcome of evaluating one criteria mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriteriaEvaluation {
    pub satisfied: bool,
    /// Condition names that evaluated false, were unknown, or faulted.
    pub unmet: Vec<String>,
    pub faults: Vec<RewardError>,
}

/// Condition name → evaluator. Built once, then shared read-only.
pub struct CriteriaRegistry {
    evaluators: BTreeMap<String, Box<dyn CriteriaEvaluator>>,
}

impl Debug for CriteriaRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriteriaRegistry")
            .field("conditions", &self.names())
            .finish()
    }
}

impl Default for CriteriaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CriteriaRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            evaluators: BTreeMap::new(),
        }
    }

    /// Registry with every built-in condition.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry
            .register("points", PointsEvaluator)
            .register("actions", ActionCountEvaluator)
            .register("streak", StreakEvaluator)
            .register("quest", QuestCompletionEvaluator)
            .register("spending", SpendingEvaluator)
            .register("social", SocialEvaluator)
            .register("level", LevelEvaluator)
            .register("time", AccountAgeEvaluator)
            .register("progress", ProgressEvaluator);
        registry
    }

    /// Adds or replaces the evaluator for `name`.
    pub fn register(
        &mut self,
        name: &str,
        evaluator: impl CriteriaEvaluator + 'static,
    ) -> &mut Self {
        self.evaluators.insert(name.to_string(), Box::new(evaluator));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.evaluators.contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.evaluators.keys().map(String::as_str).collect()
    }

    /// Condition names in `criteria` with no registered evaluator.
    #[must_use]
    pub fn unknown_conditions(&self, criteria: &Value) -> Vec<String> {
        criteria
            .as_object()
            .map(|conditions| {
                conditions
                    .keys()
                    .filter(|name| !self.contains(name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evaluates a conjunctive criteria mapping.
    ///
    /// Every condition is evaluated even after one fails, so a faulting
    /// evaluator never hides the result of another. Unknown conditions and
    /// faults count as unmet.
    pub fn evaluate(
        &self,
        context: &dyn CriteriaContext,
        profile: &ProfileAggregate,
        criteria: &Value,
    ) -> CriteriaEvaluation {
        let conditions = match criteria {
            Value::Null => return satisfied(),
            Value::Object(conditions) => conditions,
            _ => {
                let fault = RewardError::Criteria {
                    condition: "*".to_string(),
                    message: "criteria MUST be a JSON object".to_string(),
                };
                tracing::warn!(user_id = %context.user_id(), error = %fault, "malformed criteria");
                return CriteriaEvaluation {
                    satisfied: false,
                    unmet: vec!["*".to_string()],
                    faults: vec![fault],
                };
            }
        };

        let mut evaluation = satisfied();
        for (name, params) in conditions {
            let Some(evaluator) = self.evaluators.get(name) else {
                tracing::warn!(
                    user_id = %context.user_id(),
                    condition = %name,
                    "unknown criteria condition treated as failing"
                );
                evaluation.unmet.push(name.clone());
                evaluation
                    .faults
                    .push(RewardError::UnknownCriteriaCondition(name.clone()));
                continue;
            };

            match evaluator.evaluate(context, profile, params) {
                Ok(true) => {}
                Ok(false) => evaluation.unmet.push(name.clone()),
                Err(err) => {
                    tracing::warn!(
                        user_id = %context.user_id(),
                        condition = %name,
                        error = %err,
                        "criteria evaluator failed"
                    );
                    evaluation.unmet.push(name.clone());
                    evaluation.faults.push(err);
                }
            }
        }
        evaluation.unmet.sort();
        evaluation.satisfied = evaluation.unmet.is_empty();
        evaluation
    }
}

fn satisfied() -> CriteriaEvaluation {
    CriteriaEvaluation {
        satisfied: true,
        unmet: Vec::new(),
        faults: Vec::new(),
    }
}
