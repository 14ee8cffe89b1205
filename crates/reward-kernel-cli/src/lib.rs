//! Stable embedded rewards command surface for host runtimes.
//!
//! Hosts (schedulers, shop backends, admin tooling) embed reward behavior
//! through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_rewards_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_rewards`] for execution against an existing [`SqliteRewardStore`].
//!
//! Every command prints one pretty JSON document on stdout. Logs go to
//! stderr through [`init_tracing`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reward_kernel_core::{
    parse_date, parse_rfc3339_utc, DefinitionId, DefinitionKind, LedgerReference, Level,
    RewardEventInput, RewardPolicy, TransactionType, UserId,
};
use reward_kernel_store_sqlite::{
    AwardRequest, BadgeInput, ChallengeInput, HistoryQuery, LedgerCheck, LedgerIssueSeverity,
    QuestInput, RefundTarget, SqliteRewardStore,
};
use serde::Serialize;
use serde_json::{json, Value};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Reward Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./reward_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Points {
        #[command(subcommand)]
        command: Box<PointsCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
    Profile {
        #[command(subcommand)]
        command: Box<ProfileCommand>,
    },
    Streak {
        #[command(subcommand)]
        command: Box<StreakCommand>,
    },
    Badge {
        #[command(subcommand)]
        command: Box<BadgeCommand>,
    },
    Quest {
        #[command(subcommand)]
        command: Box<QuestCommand>,
    },
    Challenge {
        #[command(subcommand)]
        command: Box<ChallengeCommand>,
    },
    Level {
        #[command(subcommand)]
        command: Box<LevelCommand>,
    },
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Policy {
        #[command(subcommand)]
        command: Box<PolicyCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PointsCommand {
    Award(AwardArgs),
    Spend(SpendArgs),
    Adjust(AdjustArgs),
    Refund(RefundArgs),
    Balance(UserArgs),
    Social(SocialAwardArgs),
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
pub struct ReferenceArgs {
    #[arg(long)]
    reference_type: Option<String>,
    #[arg(long)]
    reference_id: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Args)]
pub struct AwardArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    points: i64,
    #[arg(long)]
    action: String,
    #[command(flatten)]
    reference: ReferenceArgs,
    /// Apply multipliers of running events of this type.
    #[arg(long)]
    event_type: Option<String>,
}

#[derive(Debug, Args)]
pub struct SpendArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    amount: i64,
    #[command(flatten)]
    reference: ReferenceArgs,
}

#[derive(Debug, Args)]
pub struct AdjustArgs {
    #[arg(long)]
    user: String,
    #[arg(long, allow_negative_numbers = true)]
    delta: i64,
    #[arg(long)]
    description: String,
}

#[derive(Debug, Args)]
pub struct RefundArgs {
    #[arg(long, conflicts_with_all = ["reference_type", "reference_id"])]
    entry_id: Option<String>,
    #[arg(long, requires = "reference_id")]
    reference_type: Option<String>,
    #[arg(long, requires = "reference_type")]
    reference_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SocialAwardArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    action_type: String,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    History(HistoryArgs),
    Reconcile(UserArgs),
    ReconcileAll,
    Check,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TransactionTypeArg {
    Earn,
    Spend,
    Adjustment,
    Refund,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "type")]
    transaction_type: Option<TransactionTypeArg>,
    #[arg(long)]
    limit: Option<usize>,
    /// `next_cursor` from a previous page.
    #[arg(long)]
    cursor: Option<i64>,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    Show(UserArgs),
}

#[derive(Debug, Subcommand)]
pub enum StreakCommand {
    Record(StreakRecordArgs),
    Sweep(StreakSweepArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
pub struct StreakRecordArgs {
    #[arg(long)]
    user: String,
    #[arg(long, default_value = "login")]
    streak_type: String,
    /// Business date `YYYY-MM-DD`; defaults to today.
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Args)]
pub struct StreakSweepArgs {
    /// Decay active streaks last extended before this date.
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct FileArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    active_only: bool,
}

#[derive(Debug, Args)]
pub struct DefinitionArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct ProgressArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
    #[arg(long)]
    delta_json: String,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// RFC3339 UTC instant; defaults to now.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum BadgeCommand {
    Create(FileArgs),
    List(ListArgs),
    Activate(DefinitionArgs),
    Deactivate(DefinitionArgs),
    /// Re-run criteria for a user and grant whatever is now earned.
    Check(UserArgs),
    Owned(UserArgs),
}

#[derive(Debug, Subcommand)]
pub enum QuestCommand {
    Create(FileArgs),
    List(ListArgs),
    Activate(DefinitionArgs),
    Deactivate(DefinitionArgs),
    Progress(ProgressArgs),
    Check(CompletionArgs),
    Status(UserArgs),
}

#[derive(Debug, Subcommand)]
pub enum ChallengeCommand {
    Create(FileArgs),
    List(ListArgs),
    Activate(DefinitionArgs),
    Deactivate(DefinitionArgs),
    Progress(ProgressArgs),
    Check(CompletionArgs),
    Status(UserArgs),
    Expire(SweepArgs),
}

#[derive(Debug, Subcommand)]
pub enum LevelCommand {
    Set(LevelSetArgs),
    List,
}

#[derive(Debug, Args)]
pub struct LevelSetArgs {
    #[arg(long)]
    number: u32,
    #[arg(long)]
    name: String,
    #[arg(long)]
    required_points: i64,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Create(FileArgs),
    List(ListArgs),
    Activate(DefinitionArgs),
    Deactivate(DefinitionArgs),
    Expire(SweepArgs),
    Start(SweepArgs),
    Multiplier(EventTypeArgs),
}

#[derive(Debug, Args)]
pub struct EventTypeArgs {
    #[arg(long)]
    event_type: String,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,
    Set(FileArgs),
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Register(RegisterArgs),
    SetSocial(SetSocialArgs),
    Social(UserArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    user: String,
    /// RFC3339 UTC instant; defaults to now.
    #[arg(long)]
    joined_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct SetSocialArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    metric: String,
    #[arg(long)]
    count: u64,
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the default
/// `warn` filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes a parsed top-level CLI command.
///
/// # Errors
/// Returns an error when store initialization fails or the selected command
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_rewards_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_rewards_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteRewardStore::open(db_path)?;
    store.migrate()?;
    tracing::debug!(db = %db_path.display(), "reward store ready");
    run_rewards(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, validation, or the store
/// operation fails.
pub fn run_rewards(command: Command, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        Command::Points { command } => run_points(*command, store),
        Command::Ledger { command } => run_ledger(*command, store),
        Command::Profile { command } => match *command {
            ProfileCommand::Show(args) => {
                let user_id = parse_user_id(&args.user)?;
                let Some(profile) = store.get_profile(user_id)? else {
                    return Err(anyhow!("profile not found for {user_id}"));
                };
                print_json(&profile)
            }
        },
        Command::Streak { command } => run_streak(*command, store),
        Command::Badge { command } => run_badge(*command, store),
        Command::Quest { command } => run_quest(*command, store),
        Command::Challenge { command } => run_challenge(*command, store),
        Command::Level { command } => match *command {
            LevelCommand::Set(args) => {
                let level = Level::new(args.number, &args.name, args.required_points);
                let table = store.upsert_level(&level)?;
                print_json(&table.levels())
            }
            LevelCommand::List => print_json(&store.level_table()?.levels()),
        },
        Command::Event { command } => run_event(*command, store),
        Command::Policy { command } => match *command {
            PolicyCommand::Show => print_json(&store.policy()?),
            PolicyCommand::Set(args) => {
                let raw = read_json_file(&args.file)?;
                let policy = RewardPolicy::from_json(&raw).map_err(anyhow::Error::new)?;
                store.upsert_policy(&policy)?;
                print_json(&policy)
            }
        },
        Command::User { command } => run_user(*command, store),
    }
}

fn run_points(command: PointsCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        PointsCommand::Award(args) => {
            let user_id = parse_user_id(&args.user)?;
            let mut request = AwardRequest::new(args.points, &args.action)
                .with_reference(build_reference(args.reference));
            if let Some(event_type) = args.event_type.as_deref() {
                request = request.with_event_type(event_type);
            }
            print_json(&store.award_points(user_id, &request)?)
        }
        PointsCommand::Spend(args) => {
            let user_id = parse_user_id(&args.user)?;
            let outcome = store.spend(user_id, args.amount, &build_reference(args.reference))?;
            print_json(&outcome)
        }
        PointsCommand::Adjust(args) => {
            let user_id = parse_user_id(&args.user)?;
            print_json(&store.adjust_points(user_id, args.delta, &args.description)?)
        }
        PointsCommand::Refund(args) => {
            let target = match (args.entry_id, args.reference_type, args.reference_id) {
                (Some(raw), None, None) => RefundTarget::Entry {
                    entry_id: Ulid::from_string(&raw)
                        .with_context(|| format!("invalid --entry-id value: {raw}"))?,
                },
                (None, Some(reference_type), Some(reference_id)) => RefundTarget::Purchase {
                    reference_type,
                    reference_id,
                },
                _ => {
                    return Err(anyhow!(
                        "refund requires --entry-id or both --reference-type and --reference-id"
                    ))
                }
            };
            print_json(&store.refund(&target)?)
        }
        PointsCommand::Balance(args) => {
            let user_id = parse_user_id(&args.user)?;
            let balance = store.get_balance(user_id)?;
            print_json(&json!({
                "user_id": user_id,
                "balance": balance,
            }))
        }
        PointsCommand::Social(args) => {
            let user_id = parse_user_id(&args.user)?;
            match store.award_social_points(user_id, &args.action_type)? {
                Some(outcome) => print_json(&outcome),
                None => print_json(&json!({
                    "user_id": user_id,
                    "action_type": args.action_type,
                    "awarded": false,
                })),
            }
        }
    }
}

fn run_ledger(command: LedgerCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        LedgerCommand::History(args) => {
            let query = HistoryQuery {
                transaction_type: args.transaction_type.map(map_transaction_type),
                limit: args.limit,
                cursor: args.cursor,
            };
            print_json(&store.history(parse_user_id(&args.user)?, &query)?)
        }
        LedgerCommand::Reconcile(args) => {
            print_json(&store.reconcile_profile(parse_user_id(&args.user)?)?)
        }
        LedgerCommand::ReconcileAll => print_json(&store.reconcile_all()?),
        LedgerCommand::Check => {
            let check = store.ledger_check()?;
            print_json(&check)?;
            ensure_healthy(&check)
        }
    }
}

fn run_streak(command: StreakCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        StreakCommand::Record(args) => {
            let user_id = parse_user_id(&args.user)?;
            let date = args.date.as_deref().map(parse_day).transpose()?;
            print_json(&store.record_activity(user_id, &args.streak_type, date)?)
        }
        StreakCommand::Sweep(args) => {
            let as_of = args.as_of.as_deref().map(parse_day).transpose()?;
            print_json(&store.sweep_streaks(as_of)?)
        }
        StreakCommand::List(args) => print_json(&store.streaks(parse_user_id(&args.user)?)?),
    }
}

fn run_badge(command: BadgeCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        BadgeCommand::Create(args) => {
            let input: BadgeInput = decode_file(&args.file)?;
            print_json(&store.create_badge(&input)?)
        }
        BadgeCommand::List(args) => print_json(&store.list_badges(args.active_only)?),
        BadgeCommand::Activate(args) => set_active(store, DefinitionKind::Badge, &args.id, true),
        BadgeCommand::Deactivate(args) => set_active(store, DefinitionKind::Badge, &args.id, false),
        BadgeCommand::Check(args) => {
            print_json(&store.check_and_award_badges(parse_user_id(&args.user)?)?)
        }
        BadgeCommand::Owned(args) => print_json(&store.user_badges(parse_user_id(&args.user)?)?),
    }
}

fn run_quest(command: QuestCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        QuestCommand::Create(args) => {
            let input: QuestInput = decode_file(&args.file)?;
            print_json(&store.create_quest(&input)?)
        }
        QuestCommand::List(args) => print_json(&store.list_quests(args.active_only)?),
        QuestCommand::Activate(args) => set_active(store, DefinitionKind::Quest, &args.id, true),
        QuestCommand::Deactivate(args) => set_active(store, DefinitionKind::Quest, &args.id, false),
        QuestCommand::Progress(args) => {
            let delta = parse_delta_json(&args.delta_json)?;
            let outcome = store.update_quest_progress(
                parse_user_id(&args.user)?,
                parse_definition_id(&args.id)?,
                &delta,
            )?;
            print_json(&outcome)
        }
        QuestCommand::Check(args) => {
            let user_id = parse_user_id(&args.user)?;
            let quest_id = parse_definition_id(&args.id)?;
            let check = store.check_quest_completion(user_id, quest_id)?;
            print_json(&json!({
                "user_id": user_id,
                "quest_id": quest_id,
                "completed": check.completed,
                "rewards": check.dispatch.rewards,
                "failures": check.dispatch.failures,
                "truncated": check.dispatch.truncated,
            }))
        }
        QuestCommand::Status(args) => print_json(&store.user_quests(parse_user_id(&args.user)?)?),
    }
}

fn run_challenge(command: ChallengeCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        ChallengeCommand::Create(args) => {
            let input: ChallengeInput = decode_file(&args.file)?;
            print_json(&store.create_challenge(&input)?)
        }
        ChallengeCommand::List(args) => print_json(&store.list_challenges(args.active_only)?),
        ChallengeCommand::Activate(args) => {
            set_active(store, DefinitionKind::Challenge, &args.id, true)
        }
        ChallengeCommand::Deactivate(args) => {
            set_active(store, DefinitionKind::Challenge, &args.id, false)
        }
        ChallengeCommand::Progress(args) => {
            let delta = parse_delta_json(&args.delta_json)?;
            let outcome = store.update_challenge_progress(
                parse_user_id(&args.user)?,
                parse_definition_id(&args.id)?,
                &delta,
            )?;
            print_json(&outcome)
        }
        ChallengeCommand::Check(args) => {
            let user_id = parse_user_id(&args.user)?;
            let challenge_id = parse_definition_id(&args.id)?;
            let check = store.check_challenge_completion(user_id, challenge_id)?;
            print_json(&json!({
                "user_id": user_id,
                "challenge_id": challenge_id,
                "completed": check.completed,
                "rewards": check.dispatch.rewards,
                "failures": check.dispatch.failures,
                "truncated": check.dispatch.truncated,
            }))
        }
        ChallengeCommand::Status(args) => {
            print_json(&store.user_challenges(parse_user_id(&args.user)?)?)
        }
        ChallengeCommand::Expire(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            let expired = store.expire_challenge_periods(now)?;
            print_json(&json!({ "expired": expired }))
        }
    }
}

fn run_event(command: EventCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        EventCommand::Create(args) => {
            let input: RewardEventInput = decode_file(&args.file)?;
            print_json(&store.create_event(&input)?)
        }
        EventCommand::List(args) => print_json(&store.list_events(args.active_only)?),
        EventCommand::Activate(args) => {
            store.set_event_active(parse_definition_id(&args.id)?, true)?;
            print_json(&json!({ "event_id": args.id, "is_active": true }))
        }
        EventCommand::Deactivate(args) => {
            store.set_event_active(parse_definition_id(&args.id)?, false)?;
            print_json(&json!({ "event_id": args.id, "is_active": false }))
        }
        EventCommand::Expire(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            print_json(&json!({ "expired": store.expire_events(now)? }))
        }
        EventCommand::Start(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            print_json(&json!({ "started": store.start_scheduled_events(now)? }))
        }
        EventCommand::Multiplier(args) => {
            let multiplier = store.event_multiplier(&args.event_type)?;
            print_json(&json!({
                "event_type": args.event_type,
                "multiplier": multiplier,
            }))
        }
    }
}

fn run_user(command: UserCommand, store: &mut SqliteRewardStore) -> Result<()> {
    match command {
        UserCommand::Register(args) => {
            let user_id = parse_user_id(&args.user)?;
            let joined_at =
                parse_optional_utc(args.joined_at.as_deref())?.unwrap_or_else(|| store.now());
            store.register_user(user_id, joined_at)?;
            print_json(&json!({
                "user_id": user_id,
                "joined_at": reward_kernel_core::format_rfc3339(joined_at)
                    .map_err(anyhow::Error::new)?,
            }))
        }
        UserCommand::SetSocial(args) => {
            let user_id = parse_user_id(&args.user)?;
            store.set_social_count(user_id, &args.metric, args.count)?;
            print_json(&store.social_stats(user_id)?)
        }
        UserCommand::Social(args) => print_json(&store.social_stats(parse_user_id(&args.user)?)?),
    }
}

fn set_active(
    store: &SqliteRewardStore,
    kind: DefinitionKind,
    raw_id: &str,
    is_active: bool,
) -> Result<()> {
    let definition_id = parse_definition_id(raw_id)?;
    store.set_definition_active(kind, definition_id, is_active)?;
    print_json(&json!({
        "kind": kind,
        "definition_id": definition_id,
        "is_active": is_active,
    }))
}

fn ensure_healthy(check: &LedgerCheck) -> Result<()> {
    if check.healthy {
        return Ok(());
    }
    Err(anyhow!(
        "ledger consistency check failed: {}",
        check
            .issues
            .iter()
            .filter(|item| item.severity == LedgerIssueSeverity::Error)
            .map(|item| format!("{}:{}", item.code, item.message))
            .collect::<Vec<_>>()
            .join("; ")
    ))
}

fn build_reference(args: ReferenceArgs) -> LedgerReference {
    LedgerReference {
        reference_type: args.reference_type,
        reference_id: args.reference_id,
        description: args.description,
    }
}

fn map_transaction_type(value: TransactionTypeArg) -> TransactionType {
    match value {
        TransactionTypeArg::Earn => TransactionType::Earn,
        TransactionTypeArg::Spend => TransactionType::Spend,
        TransactionTypeArg::Adjustment => TransactionType::Adjustment,
        TransactionTypeArg::Refund => TransactionType::Refund,
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("{} must contain valid JSON", path.display()))
}

fn decode_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = read_json_file(path)?;
    serde_json::from_value(raw).with_context(|| format!("invalid definition in {}", path.display()))
}

fn parse_delta_json(raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("delta_json must be valid JSON: {raw}"))?;
    if !value.is_object() {
        return Err(anyhow!("delta_json must be a JSON object: {raw}"));
    }
    Ok(value)
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    raw.parse::<UserId>()
        .map_err(|err| anyhow!("invalid --user value: {err}"))
}

fn parse_definition_id(raw: &str) -> Result<DefinitionId> {
    raw.parse::<DefinitionId>()
        .map_err(|err| anyhow!("invalid --id value: {err}"))
}

fn parse_day(raw: &str) -> Result<time::Date> {
    parse_date(raw).map_err(|err| anyhow!("invalid date: {err}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<time::OffsetDateTime>> {
    raw.map(|value| parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")))
        .transpose()
}
