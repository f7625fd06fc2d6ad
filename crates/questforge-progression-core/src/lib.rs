//! Deterministic XP and tier progression.
//!
//! Everything in this crate is pure: no I/O, no shared state. Callers own
//! persistence and are expected to validate external input with
//! [`QuestPerformance::validate`] before scoring it.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressionError {
    #[error("validation error: {0}")]
    Validation(String),
}

pub const OPTIONAL_OBJECTIVE_BONUS: f64 = 25.0;
pub const SPEED_BONUS_TARGET_MINUTES: f64 = 60.0;
pub const SPEED_BONUS_PER_MINUTE: f64 = 0.5;
pub const STREAK_STEP_DAYS: u32 = 7;
pub const STREAK_BONUS_STEPS: [f64; 5] = [0.0, 0.05, 0.10, 0.15, 0.20];
pub const WEEKLY_QUEST_SCALING: f64 = 0.05;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Legendary,
}

impl Difficulty {
    pub const ALL: [Self; 4] = [Self::Easy, Self::Medium, Self::Hard, Self::Legendary];

    #[must_use]
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Easy => 1.0,
            Self::Medium => 1.25,
            Self::Hard => 1.5,
            Self::Legendary => 2.0,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
            Self::Legendary => "legendary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "easy" => Some(Self::Easy),
            "medium" => Some(Self::Medium),
            "hard" => Some(Self::Hard),
            "legendary" => Some(Self::Legendary),
            _ => None,
        }
    }
}

/// Membership levels, ordered by ascending XP threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl Tier {
    pub const ALL: [Self; 5] = [
        Self::Bronze,
        Self::Silver,
        Self::Gold,
        Self::Platinum,
        Self::Diamond,
    ];

    /// Minimum cumulative XP for membership in this tier.
    #[must_use]
    pub fn threshold(self) -> u64 {
        match self {
            Self::Bronze => 0,
            Self::Silver => 1_000,
            Self::Gold => 2_500,
            Self::Platinum => 5_000,
            Self::Diamond => 10_000,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bronze => "Bronze",
            Self::Silver => "Silver",
            Self::Gold => "Gold",
            Self::Platinum => "Platinum",
            Self::Diamond => "Diamond",
        }
    }

    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
            Self::Diamond => "diamond",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.slug().eq_ignore_ascii_case(value))
    }

    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Bronze => Some(Self::Silver),
            Self::Silver => Some(Self::Gold),
            Self::Gold => Some(Self::Platinum),
            Self::Platinum => Some(Self::Diamond),
            Self::Diamond => None,
        }
    }

    #[must_use]
    pub fn top() -> Self {
        Self::Diamond
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QuestPerformance {
    pub base_xp: f64,
    pub completion_time_minutes: f64,
    pub optional_objectives_completed: u32,
    pub streak_days: u32,
    pub difficulty: Difficulty,
}

impl QuestPerformance {
    /// Checks the scoring preconditions for externally supplied input.
    ///
    /// # Errors
    /// Returns [`ProgressionError::Validation`] when `base_xp` or
    /// `completion_time_minutes` is negative or not finite.
    pub fn validate(&self) -> Result<(), ProgressionError> {
        for (name, value) in [
            ("base_xp", self.base_xp),
            ("completion_time_minutes", self.completion_time_minutes),
        ] {
            if !value.is_finite() {
                return Err(ProgressionError::Validation(format!(
                    "{name} MUST be a finite number"
                )));
            }
            if value < 0.0 {
                return Err(ProgressionError::Validation(format!("{name} MUST be >= 0")));
            }
        }

        Ok(())
    }
}

/// Scores a single quest completion.
///
/// Finishing under [`SPEED_BONUS_TARGET_MINUTES`] earns a speed bonus; the
/// streak bonus steps every [`STREAK_STEP_DAYS`] days and saturates at the
/// last entry of [`STREAK_BONUS_STEPS`].
#[must_use]
pub fn calculate_quest_xp(performance: &QuestPerformance) -> u64 {
    let multiplier = performance.difficulty.multiplier();
    let optional_bonus =
        f64::from(performance.optional_objectives_completed) * OPTIONAL_OBJECTIVE_BONUS;
    let speed_bonus = (SPEED_BONUS_TARGET_MINUTES - performance.completion_time_minutes).max(0.0)
        * SPEED_BONUS_PER_MINUTE;
    let streak_multiplier = 1.0 + streak_bonus(performance.streak_days);

    let raw_xp = (performance.base_xp + optional_bonus + speed_bonus) * multiplier;
    round_half_up(raw_xp * streak_multiplier)
}

/// Scales a weekly base reward linearly by quests completed. Uncapped.
#[must_use]
pub fn accumulate_weekly_xp(base: f64, quests_completed: u32, difficulty: Difficulty) -> u64 {
    let scaling = 1.0 + f64::from(quests_completed) * WEEKLY_QUEST_SCALING;
    round_half_up(base * scaling * difficulty.multiplier())
}

#[must_use]
pub fn get_tier_from_xp(xp: u64) -> Tier {
    Tier::ALL
        .into_iter()
        .rev()
        .find(|tier| xp >= tier.threshold())
        .unwrap_or(Tier::Bronze)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct NextTier {
    pub next_tier: Option<Tier>,
    pub xp_remaining: u64,
}

/// Distance to the next tier. The top tier reports `{None, 0}`.
#[must_use]
pub fn xp_needed_for_next_tier(xp: u64) -> NextTier {
    match get_tier_from_xp(xp).next() {
        Some(next) => NextTier {
            next_tier: Some(next),
            xp_remaining: next.threshold().saturating_sub(xp),
        },
        None => NextTier {
            next_tier: None,
            xp_remaining: 0,
        },
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCombinator {
    /// XP threshold met AND quest/streak minimums met.
    All,
    /// XP threshold met OR quest/streak minimums met.
    Any,
}

/// Named upgrade-eligibility rule.
///
/// The XP threshold clause is `xp_remaining == 0` against the next tier.
/// Since tier membership already absorbs any XP at or above a threshold,
/// that clause never holds while a next tier exists, so [`Self::STATUS_GATE`]
/// never reports eligibility and [`Self::UPGRADE_GATE`] reduces to its
/// quest/streak clause.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpgradePolicy {
    pub min_quests: u32,
    pub min_consecutive_days: u32,
    pub combinator: PolicyCombinator,
}

impl UpgradePolicy {
    /// Rule behind [`TierStatus::eligible`].
    pub const STATUS_GATE: Self = Self {
        min_quests: 5,
        min_consecutive_days: 7,
        combinator: PolicyCombinator::All,
    };

    /// Rule behind [`can_upgrade_tier`]. This is the authoritative upgrade
    /// decision surfaced by the CLI and service.
    pub const UPGRADE_GATE: Self = Self {
        min_quests: 10,
        min_consecutive_days: 14,
        combinator: PolicyCombinator::Any,
    };

    #[must_use]
    pub fn allows(&self, next: &NextTier, quests_completed: u32, consecutive_days: u32) -> bool {
        if next.next_tier.is_none() {
            return false;
        }

        let threshold_met = next.xp_remaining == 0;
        let activity_met =
            quests_completed >= self.min_quests && consecutive_days >= self.min_consecutive_days;

        match self.combinator {
            PolicyCombinator::All => threshold_met && activity_met,
            PolicyCombinator::Any => threshold_met || activity_met,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TierStatus {
    pub current_tier: Tier,
    pub next_tier: Option<Tier>,
    pub xp_remaining: u64,
    pub eligible: bool,
}

#[must_use]
pub fn get_tier_status(xp: u64, completed_quests: u32, consecutive_days: u32) -> TierStatus {
    let next = xp_needed_for_next_tier(xp);
    TierStatus {
        current_tier: get_tier_from_xp(xp),
        next_tier: next.next_tier,
        xp_remaining: next.xp_remaining,
        eligible: UpgradePolicy::STATUS_GATE.allows(&next, completed_quests, consecutive_days),
    }
}

#[must_use]
pub fn can_upgrade_tier(progress: &UserProgress) -> bool {
    UpgradePolicy::UPGRADE_GATE.allows(
        &xp_needed_for_next_tier(progress.xp),
        progress.quests_completed,
        progress.consecutive_login_days,
    )
}

#[must_use]
pub fn recommend_actions_for_tier_upgrade(xp: u64, quests_completed: u32) -> Vec<String> {
    let NextTier {
        next_tier,
        xp_remaining,
    } = xp_needed_for_next_tier(xp);

    let Some(next_tier) = next_tier else {
        return vec![format!(
            "Maintain current pace to retain {} tier",
            Tier::top()
        )];
    };

    let mut actions = vec![format!("Earn {xp_remaining} more XP for {next_tier}")];
    if quests_completed < 10 {
        actions.push("Complete additional quests to unlock milestone bonuses".to_string());
    }
    actions.push("Engage with community challenges for bonus XP".to_string());
    actions
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserProgress {
    pub xp: u64,
    pub quests_completed: u32,
    pub consecutive_login_days: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuestReward {
    pub xp_awarded: u64,
    pub total_xp: u64,
    pub previous_tier: Tier,
    pub current_tier: Tier,
    pub tier_changed: bool,
}

impl UserProgress {
    #[must_use]
    pub fn current_tier(&self) -> Tier {
        get_tier_from_xp(self.xp)
    }

    /// Scores `performance` and folds it into the running totals.
    pub fn record_quest(&mut self, performance: &QuestPerformance) -> QuestReward {
        let previous_tier = self.current_tier();
        let xp_awarded = calculate_quest_xp(performance);

        self.xp = self.xp.saturating_add(xp_awarded);
        self.quests_completed = self.quests_completed.saturating_add(1);

        let current_tier = self.current_tier();
        QuestReward {
            xp_awarded,
            total_xp: self.xp,
            previous_tier,
            current_tier,
            tier_changed: current_tier != previous_tier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TierReport {
    pub status: TierStatus,
    pub can_upgrade: bool,
    pub recommendations: Vec<String>,
}

#[must_use]
pub fn tier_report(progress: &UserProgress) -> TierReport {
    TierReport {
        status: get_tier_status(
            progress.xp,
            progress.quests_completed,
            progress.consecutive_login_days,
        ),
        can_upgrade: can_upgrade_tier(progress),
        recommendations: recommend_actions_for_tier_upgrade(
            progress.xp,
            progress.quests_completed,
        ),
    }
}

/// Streak length after a login on `today`.
///
/// A repeat login on the same calendar day keeps the streak, a login on the
/// following day extends it, anything else starts over at one.
#[must_use]
pub fn next_login_streak(last_login_on: Option<Date>, current_streak: u32, today: Date) -> u32 {
    match last_login_on {
        Some(last) if last >= today => current_streak.max(1),
        Some(last) if today.previous_day() == Some(last) => current_streak.saturating_add(1),
        _ => 1,
    }
}

fn streak_bonus(streak_days: u32) -> f64 {
    let step = usize::try_from(streak_days / STREAK_STEP_DAYS).unwrap_or(usize::MAX);
    STREAK_BONUS_STEPS[step.min(STREAK_BONUS_STEPS.len() - 1)]
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_half_up(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    (value + 0.5).floor() as u64
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProgressionError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProgressionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProgressionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProgressionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProgressionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProgressionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ProgressionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
