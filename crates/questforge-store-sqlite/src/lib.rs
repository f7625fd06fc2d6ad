#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use questforge_billing_core::{
    BillingError, BillingStore, CommitReport, ReconciliationPlan, StoreWrite, SubscriptionRecord,
    SubscriptionStatus,
};
use questforge_progression_core::{
    format_rfc3339, next_login_streak, parse_rfc3339_utc, Difficulty, QuestPerformance,
    QuestReward, UserProgress,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const SCHEMA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS profiles (
  user_id TEXT PRIMARY KEY,
  username TEXT NOT NULL,
  email TEXT NOT NULL,
  xp INTEGER NOT NULL DEFAULT 0 CHECK (xp >= 0),
  quests_completed INTEGER NOT NULL DEFAULT 0 CHECK (quests_completed >= 0),
  consecutive_login_days INTEGER NOT NULL DEFAULT 0 CHECK (consecutive_login_days >= 0),
  last_login_at TEXT,
  tier_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quest_completions (
  completion_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  completion_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  quest_id TEXT NOT NULL,
  xp_awarded INTEGER NOT NULL CHECK (xp_awarded >= 0),
  difficulty TEXT NOT NULL CHECK (difficulty IN ('easy', 'medium', 'hard', 'legendary')),
  notes TEXT,
  completed_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES profiles(user_id)
);

CREATE INDEX IF NOT EXISTS idx_quest_completions_user
  ON quest_completions(user_id, completion_seq);

CREATE TABLE IF NOT EXISTS subscriptions (
  subscription_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  tier_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN ('trialing', 'active', 'past_due', 'canceled', 'incomplete')
  ),
  provider_customer_id TEXT,
  provider_subscription_id TEXT NOT NULL UNIQUE,
  current_period_start TEXT,
  current_period_end TEXT,
  cancel_at TEXT,
  canceled_at TEXT,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_user
  ON subscriptions(user_id, subscription_seq);
";

const PROFILE_COLUMNS: &str = "user_id, username, email, xp, quests_completed,
    consecutive_login_days, last_login_at, tier_id, created_at";

const SUBSCRIPTION_COLUMNS: &str = "user_id, tier_id, status, provider_customer_id,
    provider_subscription_id, current_period_start, current_period_end, cancel_at, canceled_at";

const COMPLETION_COLUMNS: &str =
    "completion_id, user_id, quest_id, xp_awarded, difficulty, notes, completed_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewProfile {
    pub user_id: String,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub xp: u64,
    pub quests_completed: u32,
    pub consecutive_login_days: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    /// Active paid tier, maintained by subscription reconciliation.
    pub tier_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Profile {
    #[must_use]
    pub fn progress(&self) -> UserProgress {
        UserProgress {
            xp: self.xp,
            quests_completed: self.quests_completed,
            consecutive_login_days: self.consecutive_login_days,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestCompletionInput {
    pub quest_id: String,
    pub performance: QuestPerformance,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestCompletion {
    pub completion_id: Ulid,
    pub user_id: String,
    pub quest_id: String,
    pub xp_awarded: u64,
    pub difficulty: Difficulty,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestCompletionReport {
    pub completion: QuestCompletion,
    pub reward: QuestReward,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
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
            .execute_batch(SCHEMA_V1)
            .context("failed to apply questforge schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, timestamp(questforge_progression_core::now_utc())?],
            )
            .context("failed to register schema migration")?;

        Ok(())
    }

    pub fn create_profile(&self, input: &NewProfile, now: OffsetDateTime) -> Result<Profile> {
        for (field, value) in [
            ("user_id", &input.user_id),
            ("username", &input.username),
            ("email", &input.email),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} must be non-empty"));
            }
        }

        let created_at = timestamp(now)?;
        self.conn
            .execute(
                "INSERT INTO profiles(user_id, username, email, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![input.user_id, input.username, input.email, created_at],
            )
            .with_context(|| format!("failed to create profile {}", input.user_id))?;

        self.get_profile(&input.user_id)?
            .ok_or_else(|| anyhow!("profile {} vanished after insert", input.user_id))
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1");
        let profile = self
            .conn
            .query_row(&query, params![user_id], parse_profile_row)
            .optional()
            .with_context(|| format!("failed to load profile {user_id}"))?;
        Ok(profile)
    }

    /// Scores a completed quest and adds it to the profile's totals in one
    /// transaction.
    pub fn record_quest_completion(
        &mut self,
        user_id: &str,
        input: &QuestCompletionInput,
        now: OffsetDateTime,
    ) -> Result<QuestCompletionReport> {
        input
            .performance
            .validate()
            .map_err(|err| anyhow!("quest performance validation failed: {err}"))?;
        if input.quest_id.trim().is_empty() {
            return Err(anyhow!("quest_id must be non-empty"));
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start quest completion transaction")?;

        let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1");
        let profile = tx
            .query_row(&query, params![user_id], parse_profile_row)
            .optional()?
            .ok_or_else(|| anyhow!("profile not found: {user_id}"))?;

        let mut progress = profile.progress();
        let reward = progress.record_quest(&input.performance);

        let completion = QuestCompletion {
            completion_id: Ulid::new(),
            user_id: user_id.to_string(),
            quest_id: input.quest_id.clone(),
            xp_awarded: reward.xp_awarded,
            difficulty: input.performance.difficulty,
            notes: input.notes.clone(),
            completed_at: now,
        };

        tx.execute(
            &format!("INSERT INTO quest_completions({COMPLETION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                completion.completion_id.to_string(),
                completion.user_id,
                completion.quest_id,
                to_sql_u64(completion.xp_awarded)?,
                completion.difficulty.as_str(),
                completion.notes,
                timestamp(now)?,
            ],
        )
        .context("failed to insert quest completion")?;

        tx.execute(
            "UPDATE profiles SET xp = ?2, quests_completed = ?3, updated_at = ?4 WHERE user_id = ?1",
            params![
                user_id,
                to_sql_u64(progress.xp)?,
                i64::from(progress.quests_completed),
                timestamp(now)?,
            ],
        )
        .context("failed to update profile progress")?;

        tx.commit()
            .context("failed to commit quest completion transaction")?;

        debug!(
            user_id,
            quest_id = %completion.quest_id,
            xp_awarded = reward.xp_awarded,
            tier_changed = reward.tier_changed,
            "recorded quest completion"
        );

        Ok(QuestCompletionReport { completion, reward })
    }

    pub fn list_quest_completions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<QuestCompletion>> {
        let mut query = format!(
            "SELECT {COMPLETION_COLUMNS} FROM quest_completions
             WHERE user_id = ?1
             ORDER BY completion_seq ASC"
        );
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id], parse_completion_row)?;
        collect_rows(rows)
    }

    /// Advances the login streak for a login at `now` and returns the
    /// updated profile.
    pub fn record_login(&mut self, user_id: &str, now: OffsetDateTime) -> Result<Profile> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start login transaction")?;

        let query = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = ?1");
        let profile = tx
            .query_row(&query, params![user_id], parse_profile_row)
            .optional()?
            .ok_or_else(|| anyhow!("profile not found: {user_id}"))?;

        let streak = next_login_streak(
            profile.last_login_at.map(OffsetDateTime::date),
            profile.consecutive_login_days,
            now.date(),
        );

        tx.execute(
            "UPDATE profiles
             SET consecutive_login_days = ?2, last_login_at = ?3, updated_at = ?3
             WHERE user_id = ?1",
            params![user_id, i64::from(streak), timestamp(now)?],
        )
        .context("failed to record login")?;

        tx.commit().context("failed to commit login transaction")?;

        self.get_profile(user_id)?
            .ok_or_else(|| anyhow!("profile not found: {user_id}"))
    }

    pub fn get_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<SubscriptionRecord>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_subscription_id = ?1"
        );
        let record = self
            .conn
            .query_row(&query, params![provider_subscription_id], parse_subscription_row)
            .optional()
            .with_context(|| format!("failed to load subscription {provider_subscription_id}"))?;
        Ok(record)
    }

    pub fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<SubscriptionRecord>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE user_id = ?1
             ORDER BY subscription_seq ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![user_id], parse_subscription_row)?;
        collect_rows(rows)
    }

    fn apply_plan(&mut self, plan: &ReconciliationPlan) -> Result<CommitReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start reconciliation transaction")?;

        let mut report = CommitReport::default();
        for write in &plan.writes {
            match write {
                StoreWrite::UpsertSubscription(record) => {
                    upsert_subscription(&tx, record)?;
                    report.subscriptions_upserted += 1;
                }
                StoreWrite::CancelSubscription {
                    provider_subscription_id,
                    canceled_at,
                } => {
                    let changed = tx
                        .execute(
                            "UPDATE subscriptions
                             SET status = ?2, canceled_at = ?3, updated_at = ?3
                             WHERE provider_subscription_id = ?1",
                            params![
                                provider_subscription_id,
                                SubscriptionStatus::Canceled.as_str(),
                                timestamp(*canceled_at)?,
                            ],
                        )
                        .with_context(|| {
                            format!("failed to cancel subscription {provider_subscription_id}")
                        })?;
                    if changed == 0 {
                        debug!(%provider_subscription_id, "cancel matched no subscription row");
                    }
                    report.subscriptions_canceled += changed;
                }
                StoreWrite::SetProfileTier { user_id, tier_id } => {
                    let changed = tx
                        .execute(
                            "UPDATE profiles SET tier_id = ?2 WHERE user_id = ?1",
                            params![user_id, tier_id],
                        )
                        .with_context(|| format!("failed to set tier for profile {user_id}"))?;
                    if changed == 0 {
                        debug!(%user_id, "tier update matched no profile row");
                    }
                    report.profiles_updated += changed;
                }
            }
        }

        tx.commit()
            .context("failed to commit reconciliation transaction")?;
        Ok(report)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl BillingStore for SqliteStore {
    fn commit(&mut self, plan: &ReconciliationPlan) -> Result<CommitReport, BillingError> {
        self.apply_plan(plan)
            .map_err(|err| BillingError::Store(format!("{err:#}")))
    }
}

fn upsert_subscription(tx: &Transaction<'_>, record: &SubscriptionRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO subscriptions(
            user_id, tier_id, status, provider_customer_id, provider_subscription_id,
            current_period_start, current_period_end, cancel_at, canceled_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(provider_subscription_id) DO UPDATE SET
            user_id = excluded.user_id,
            tier_id = excluded.tier_id,
            status = excluded.status,
            provider_customer_id = excluded.provider_customer_id,
            current_period_start = excluded.current_period_start,
            current_period_end = excluded.current_period_end,
            cancel_at = excluded.cancel_at,
            canceled_at = excluded.canceled_at,
            updated_at = excluded.updated_at",
        params![
            record.user_id,
            record.tier_id,
            record.status.as_str(),
            record.provider_customer_id,
            record.provider_subscription_id,
            optional_timestamp(record.current_period_start)?,
            optional_timestamp(record.current_period_end)?,
            optional_timestamp(record.cancel_at)?,
            optional_timestamp(record.canceled_at)?,
            timestamp(questforge_progression_core::now_utc())?,
        ],
    )
    .with_context(|| {
        format!(
            "failed to upsert subscription {}",
            record.provider_subscription_id
        )
    })?;
    Ok(())
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Profile> {
    let xp: i64 = row.get(3)?;
    let quests_completed: i64 = row.get(4)?;
    let consecutive_login_days: i64 = row.get(5)?;
    let last_login_at: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;

    Ok(Profile {
        user_id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        xp: u64::try_from(xp)
            .map_err(|_| conversion_error(3, rusqlite::types::Type::Integer, format!("invalid xp: {xp}")))?,
        quests_completed: sql_u32(4, quests_completed, "quests_completed")?,
        consecutive_login_days: sql_u32(5, consecutive_login_days, "consecutive_login_days")?,
        last_login_at: last_login_at
            .as_deref()
            .map(|raw| sql_timestamp(6, raw))
            .transpose()?,
        tier_id: row.get(7)?,
        created_at: sql_timestamp(8, &created_at)?,
    })
}

fn parse_completion_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuestCompletion> {
    let completion_id_raw: String = row.get(0)?;
    let xp_awarded: i64 = row.get(3)?;
    let difficulty_raw: String = row.get(4)?;
    let completed_at: String = row.get(6)?;

    let completion_id = Ulid::from_string(&completion_id_raw).map_err(|err| {
        conversion_error(
            0,
            rusqlite::types::Type::Text,
            format!("invalid completion_id {completion_id_raw}: {err}"),
        )
    })?;
    let difficulty = Difficulty::parse(&difficulty_raw).ok_or_else(|| {
        conversion_error(
            4,
            rusqlite::types::Type::Text,
            format!("invalid difficulty: {difficulty_raw}"),
        )
    })?;

    Ok(QuestCompletion {
        completion_id,
        user_id: row.get(1)?,
        quest_id: row.get(2)?,
        xp_awarded: u64::try_from(xp_awarded).map_err(|_| {
            conversion_error(
                3,
                rusqlite::types::Type::Integer,
                format!("invalid xp_awarded: {xp_awarded}"),
            )
        })?,
        difficulty,
        notes: row.get(5)?,
        completed_at: sql_timestamp(6, &completed_at)?,
    })
}

fn parse_subscription_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
    let status_raw: String = row.get(2)?;
    let status = SubscriptionStatus::parse(&status_raw).ok_or_else(|| {
        conversion_error(
            2,
            rusqlite::types::Type::Text,
            format!("invalid subscription status: {status_raw}"),
        )
    })?;

    let optional = |index: usize| -> rusqlite::Result<Option<OffsetDateTime>> {
        let raw: Option<String> = row.get(index)?;
        raw.as_deref().map(|value| sql_timestamp(index, value)).transpose()
    };

    Ok(SubscriptionRecord {
        user_id: row.get(0)?,
        tier_id: row.get(1)?,
        status,
        provider_customer_id: row.get(3)?,
        provider_subscription_id: row.get(4)?,
        current_period_start: optional(5)?,
        current_period_end: optional(6)?,
        cancel_at: optional(7)?,
        canceled_at: optional(8)?,
    })
}

fn conversion_error(
    index: usize,
    column_type: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_u32(index: usize, value: i64, column: &str) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        conversion_error(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid {column}: {value}"),
        )
    })
}

fn sql_timestamp(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw)
        .map_err(|err| conversion_error(index, rusqlite::types::Type::Text, err.to_string()))
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn optional_timestamp(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(timestamp).transpose()
}

fn to_sql_u64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds sqlite integer range"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
