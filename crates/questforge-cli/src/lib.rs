//! Operator command surface for `QuestForge`.
//!
//! Every command prints a single JSON document on stdout. Hosts can skip the
//! printing and take the document directly through [`execute`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use questforge_billing_core::{sign_payload, WebhookConfig, WebhookReconciler};
use questforge_integrations::{
    EmailTemplate, EmailTemplateKind, Mailer, PostmarkConfig, PostmarkMailer, StripeClient,
    StripeConfig,
};
use questforge_progression_core::{
    accumulate_weekly_xp, calculate_quest_xp, can_upgrade_tier, get_tier_status, now_utc,
    parse_rfc3339_utc, recommend_actions_for_tier_upgrade, tier_report, xp_needed_for_next_tier,
    Difficulty, QuestPerformance, UserProgress,
};
use questforge_store_sqlite::{NewProfile, QuestCompletionInput, SqliteStore};
use serde_json::{json, Value};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "qf")]
#[command(about = "QuestForge progression and billing CLI")]
pub struct Cli {
    #[arg(long, env = "QUESTFORGE_DB", default_value = "./questforge.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Xp {
        #[command(subcommand)]
        command: Box<XpCommand>,
    },
    Tier {
        #[command(subcommand)]
        command: Box<TierCommand>,
    },
    Profile {
        #[command(subcommand)]
        command: Box<ProfileCommand>,
    },
    Quest {
        #[command(subcommand)]
        command: Box<QuestCommand>,
    },
    Subscription {
        #[command(subcommand)]
        command: Box<SubscriptionCommand>,
    },
    Webhook {
        #[command(subcommand)]
        command: Box<WebhookCommand>,
    },
    Email {
        #[command(subcommand)]
        command: Box<EmailCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum XpCommand {
    /// Scores a single quest completion.
    Quest(PerformanceArgs),
    /// Scales a weekly base by the number of quests completed.
    Weekly(WeeklyArgs),
}

#[derive(Debug, Args)]
pub struct PerformanceArgs {
    #[arg(long)]
    base_xp: f64,
    #[arg(long, default_value_t = 60.0)]
    minutes: f64,
    #[arg(long, default_value_t = 0)]
    optional_objectives: u32,
    #[arg(long, default_value_t = 0)]
    streak_days: u32,
    #[arg(long, value_enum, default_value_t = DifficultyArg::Easy)]
    difficulty: DifficultyArg,
}

#[derive(Debug, Args)]
pub struct WeeklyArgs {
    #[arg(long)]
    base_xp: f64,
    #[arg(long)]
    quests: u32,
    #[arg(long, value_enum, default_value_t = DifficultyArg::Easy)]
    difficulty: DifficultyArg,
}

#[derive(Debug, Subcommand)]
pub enum TierCommand {
    Status(ProgressArgs),
    Next(XpArgs),
    Recommend(RecommendArgs),
    CanUpgrade(ProgressArgs),
    /// Full tier report for a stored profile.
    Report(UserArgs),
}

#[derive(Debug, Args)]
pub struct XpArgs {
    #[arg(long)]
    xp: u64,
}

#[derive(Debug, Args)]
pub struct ProgressArgs {
    #[arg(long)]
    xp: u64,
    #[arg(long, default_value_t = 0)]
    quests: u32,
    #[arg(long, default_value_t = 0)]
    days: u32,
}

#[derive(Debug, Args)]
pub struct RecommendArgs {
    #[arg(long)]
    xp: u64,
    #[arg(long, default_value_t = 0)]
    quests: u32,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    Create(ProfileCreateArgs),
    Show(UserArgs),
    Login(LoginArgs),
}

#[derive(Debug, Args)]
pub struct ProfileCreateArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum QuestCommand {
    Complete(QuestCompleteArgs),
    List(QuestListArgs),
}

#[derive(Debug, Args)]
pub struct QuestCompleteArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    quest_id: String,
    #[command(flatten)]
    performance: PerformanceArgs,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct QuestListArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum SubscriptionCommand {
    Show(SubscriptionShowArgs),
    List(UserArgs),
}

#[derive(Debug, Args)]
pub struct SubscriptionShowArgs {
    #[arg(long)]
    provider_subscription_id: String,
}

#[derive(Debug, Subcommand)]
pub enum WebhookCommand {
    /// Runs a captured delivery through reconciliation against the local DB.
    Replay(WebhookReplayArgs),
    /// Prints the signature header the provider would send for a payload.
    Sign(WebhookSignArgs),
}

#[derive(Debug, Args)]
pub struct WebhookSecretArgs {
    #[arg(long, env = "STRIPE_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,
}

#[derive(Debug, Args)]
pub struct WebhookReplayArgs {
    #[arg(long)]
    payload_file: PathBuf,
    /// Signature header; when omitted the payload is signed locally.
    #[arg(long)]
    signature: Option<String>,
    #[arg(long)]
    at: Option<String>,
    #[command(flatten)]
    secret: WebhookSecretArgs,
    #[arg(long, env = "STRIPE_SECRET_KEY", hide_env_values = true)]
    stripe_secret_key: Option<String>,
    #[arg(long, env = "STRIPE_API_BASE")]
    stripe_api_base: Option<String>,
}

#[derive(Debug, Args)]
pub struct WebhookSignArgs {
    #[arg(long)]
    payload_file: PathBuf,
    #[arg(long)]
    at: Option<String>,
    #[command(flatten)]
    secret: WebhookSecretArgs,
}

#[derive(Debug, Subcommand)]
pub enum EmailCommand {
    Send(EmailSendArgs),
}

#[derive(Debug, Args)]
pub struct EmailSendArgs {
    #[arg(long, value_enum)]
    template: EmailTemplateArg,
    #[arg(long)]
    to: String,
    /// Template parameter as `key=value`; repeatable.
    #[arg(long = "param")]
    params: Vec<String>,
    #[arg(long, env = "POSTMARK_SERVER_TOKEN", hide_env_values = true)]
    postmark_server_token: Option<String>,
    #[arg(long, env = "POSTMARK_FROM_EMAIL")]
    from_email: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DifficultyArg {
    Easy,
    Medium,
    Hard,
    Legendary,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EmailTemplateArg {
    Welcome,
    Verification,
    PasswordReset,
    TierUpgrade,
}

/// Executes the parsed CLI and prints its JSON result.
///
/// # Errors
/// Returns an error when argument validation, store access, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = execute(cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes the parsed CLI and returns the JSON document it would print.
///
/// Commands that need persistence open and migrate the `--db` store first.
///
/// # Errors
/// Returns an error when argument validation, store access, or command
/// execution fails.
pub fn execute(cli: Cli) -> Result<Value> {
    match cli.command {
        Command::Xp { command } => run_xp(*command),
        Command::Tier { command } => run_tier(*command, &cli.db),
        Command::Profile { command } => run_profile(*command, &mut open_store(&cli.db)?),
        Command::Quest { command } => run_quest(*command, &mut open_store(&cli.db)?),
        Command::Subscription { command } => run_subscription(*command, &open_store(&cli.db)?),
        Command::Webhook { command } => run_webhook(*command, &cli.db),
        Command::Email { command } => run_email(*command),
    }
}

fn open_store(db_path: &Path) -> Result<SqliteStore> {
    let store = SqliteStore::open(db_path)?;
    store.migrate()?;
    Ok(store)
}

fn run_xp(command: XpCommand) -> Result<Value> {
    match command {
        XpCommand::Quest(args) => {
            let performance = performance_from(&args)?;
            Ok(json!({ "xp": calculate_quest_xp(&performance) }))
        }
        XpCommand::Weekly(args) => {
            if !args.base_xp.is_finite() || args.base_xp < 0.0 {
                return Err(anyhow!("--base-xp must be a finite, non-negative number"));
            }
            Ok(json!({
                "xp": accumulate_weekly_xp(args.base_xp, args.quests, map_difficulty(args.difficulty))
            }))
        }
    }
}

fn run_tier(command: TierCommand, db_path: &Path) -> Result<Value> {
    match command {
        TierCommand::Status(args) => Ok(serde_json::to_value(get_tier_status(
            args.xp, args.quests, args.days,
        ))?),
        TierCommand::Next(args) => Ok(serde_json::to_value(xp_needed_for_next_tier(args.xp))?),
        TierCommand::Recommend(args) => Ok(json!({
            "recommendations": recommend_actions_for_tier_upgrade(args.xp, args.quests)
        })),
        TierCommand::CanUpgrade(args) => {
            let progress = UserProgress {
                xp: args.xp,
                quests_completed: args.quests,
                consecutive_login_days: args.days,
            };
            Ok(json!({ "can_upgrade": can_upgrade_tier(&progress) }))
        }
        TierCommand::Report(args) => {
            let store = open_store(db_path)?;
            let Some(profile) = store.get_profile(&args.user_id)? else {
                return Err(anyhow!("profile not found: {}", args.user_id));
            };
            Ok(json!({
                "user_id": profile.user_id,
                "xp": profile.xp,
                "report": tier_report(&profile.progress()),
            }))
        }
    }
}

fn run_profile(command: ProfileCommand, store: &mut SqliteStore) -> Result<Value> {
    match command {
        ProfileCommand::Create(args) => {
            let profile = store.create_profile(
                &NewProfile {
                    user_id: args.user_id,
                    username: args.username,
                    email: args.email,
                },
                parse_optional_utc(args.at.as_deref())?,
            )?;
            Ok(serde_json::to_value(profile)?)
        }
        ProfileCommand::Show(args) => {
            let Some(profile) = store.get_profile(&args.user_id)? else {
                return Err(anyhow!("profile not found: {}", args.user_id));
            };
            Ok(serde_json::to_value(profile)?)
        }
        ProfileCommand::Login(args) => {
            let profile =
                store.record_login(&args.user_id, parse_optional_utc(args.at.as_deref())?)?;
            Ok(serde_json::to_value(profile)?)
        }
    }
}

fn run_quest(command: QuestCommand, store: &mut SqliteStore) -> Result<Value> {
    match command {
        QuestCommand::Complete(args) => {
            let input = QuestCompletionInput {
                quest_id: args.quest_id,
                performance: performance_from(&args.performance)?,
                notes: args.notes,
            };
            let report = store.record_quest_completion(
                &args.user_id,
                &input,
                parse_optional_utc(args.at.as_deref())?,
            )?;
            Ok(serde_json::to_value(report)?)
        }
        QuestCommand::List(args) => Ok(serde_json::to_value(
            store.list_quest_completions(&args.user_id, args.limit)?,
        )?),
    }
}

fn run_subscription(command: SubscriptionCommand, store: &SqliteStore) -> Result<Value> {
    match command {
        SubscriptionCommand::Show(args) => {
            let Some(record) = store.get_subscription(&args.provider_subscription_id)? else {
                return Err(anyhow!(
                    "subscription not found: {}",
                    args.provider_subscription_id
                ));
            };
            Ok(serde_json::to_value(record)?)
        }
        SubscriptionCommand::List(args) => Ok(serde_json::to_value(
            store.list_subscriptions_for_user(&args.user_id)?,
        )?),
    }
}

fn run_webhook(command: WebhookCommand, db_path: &Path) -> Result<Value> {
    match command {
        WebhookCommand::Replay(args) => {
            let payload = read_payload(&args.payload_file)?;
            let now = parse_optional_utc(args.at.as_deref())?;
            let config = WebhookConfig::new(args.secret.webhook_secret);

            let signature = match args.signature {
                Some(value) => value,
                None => {
                    let secret = config.webhook_secret.as_deref().ok_or_else(|| {
                        anyhow!("--webhook-secret is required to sign a replayed payload")
                    })?;
                    sign_payload(&payload, secret, now.unix_timestamp())?
                }
            };

            let provider = StripeClient::new(StripeConfig::new(
                args.stripe_secret_key,
                args.stripe_api_base,
            ));
            let mut store = open_store(db_path)?;
            let outcome = WebhookReconciler::new(config).handle(
                &provider,
                &mut store,
                &payload,
                &signature,
                now,
            );
            Ok(serde_json::to_value(outcome)?)
        }
        WebhookCommand::Sign(args) => {
            let payload = read_payload(&args.payload_file)?;
            let secret = args
                .secret
                .webhook_secret
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| anyhow!("--webhook-secret is required"))?;
            let now = parse_optional_utc(args.at.as_deref())?;
            Ok(json!({
                "signature": sign_payload(&payload, &secret, now.unix_timestamp())?
            }))
        }
    }
}

fn run_email(command: EmailCommand) -> Result<Value> {
    match command {
        EmailCommand::Send(args) => {
            let params = parse_params(&args.params)?;
            let template = EmailTemplate::from_params(map_template(args.template), &params)
                .map_err(|err| anyhow!(err))?;
            let mailer = PostmarkMailer::new(PostmarkConfig::new(
                args.postmark_server_token,
                args.from_email,
            ));
            Ok(serde_json::to_value(mailer.send(&args.to, &template))?)
        }
    }
}

fn performance_from(args: &PerformanceArgs) -> Result<QuestPerformance> {
    let performance = QuestPerformance {
        base_xp: args.base_xp,
        completion_time_minutes: args.minutes,
        optional_objectives_completed: args.optional_objectives,
        streak_days: args.streak_days,
        difficulty: map_difficulty(args.difficulty),
    };
    performance.validate()?;
    Ok(performance)
}

fn read_payload(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read payload {}", path.display()))
}

fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.to_string()))
                .ok_or_else(|| anyhow!("--param must be key=value: {pair}"))
        })
        .collect()
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn map_difficulty(value: DifficultyArg) -> Difficulty {
    match value {
        DifficultyArg::Easy => Difficulty::Easy,
        DifficultyArg::Medium => Difficulty::Medium,
        DifficultyArg::Hard => Difficulty::Hard,
        DifficultyArg::Legendary => Difficulty::Legendary,
    }
}

fn map_template(value: EmailTemplateArg) -> EmailTemplateKind {
    match value {
        EmailTemplateArg::Welcome => EmailTemplateKind::Welcome,
        EmailTemplateArg::Verification => EmailTemplateKind::Verification,
        EmailTemplateArg::PasswordReset => EmailTemplateKind::PasswordReset,
        EmailTemplateArg::TierUpgrade => EmailTemplateKind::TierUpgrade,
    }
}
