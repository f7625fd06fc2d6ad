use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::BillingError;

pub const METADATA_USER_ID: &str = "user_id";
pub const METADATA_TIER_ID: &str = "tier_id";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trialing" => Some(Self::Trialing),
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "canceled" => Some(Self::Canceled),
            "incomplete" => Some(Self::Incomplete),
            _ => None,
        }
    }
}

/// Collapses a provider status into the local vocabulary.
///
/// Only `past_due` and `canceled` survive; every other provider status,
/// including ones this code has never seen, is treated as `active`.
#[must_use]
pub fn normalize_provider_status(provider_status: &str) -> SubscriptionStatus {
    match provider_status {
        "past_due" => SubscriptionStatus::PastDue,
        "canceled" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Active,
    }
}

/// Subscription object as delivered by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default, deserialize_with = "nullable_metadata")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "nullable_metadata")]
    pub metadata: BTreeMap<String, String>,
}

impl CheckoutSession {
    #[must_use]
    pub fn is_subscription_mode(&self) -> bool {
        self.mode.as_deref() == Some("subscription")
    }
}

/// The `(user, tier)` pair a checkout or subscription was created for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierAssignment {
    pub user_id: String,
    pub tier_id: String,
}

impl TierAssignment {
    /// Reads the assignment from provider metadata. Blank values count as
    /// missing.
    #[must_use]
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> Option<Self> {
        let user_id = non_blank(metadata.get(METADATA_USER_ID))?;
        let tier_id = non_blank(metadata.get(METADATA_TIER_ID))?;
        Some(Self { user_id, tier_id })
    }
}

/// Local subscription row, keyed by `provider_subscription_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub tier_id: String,
    pub status: SubscriptionStatus,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    /// Builds the row to upsert for a provider subscription.
    ///
    /// # Errors
    /// Returns [`BillingError::Payload`] when a provider timestamp is out of
    /// range.
    pub fn from_provider(
        subscription: &ProviderSubscription,
        assignment: &TierAssignment,
        customer_id: Option<String>,
    ) -> Result<Self, BillingError> {
        Ok(Self {
            user_id: assignment.user_id.clone(),
            tier_id: assignment.tier_id.clone(),
            status: normalize_provider_status(&subscription.status),
            provider_customer_id: customer_id,
            provider_subscription_id: subscription.id.clone(),
            current_period_start: subscription.current_period_start.map(unix_to_utc).transpose()?,
            current_period_end: subscription.current_period_end.map(unix_to_utc).transpose()?,
            cancel_at: subscription.cancel_at.map(unix_to_utc).transpose()?,
            canceled_at: subscription.canceled_at.map(unix_to_utc).transpose()?,
        })
    }
}

/// Converts provider epoch seconds into a UTC timestamp.
///
/// # Errors
/// Returns [`BillingError::Payload`] when `seconds` is outside the
/// representable range.
pub fn unix_to_utc(seconds: i64) -> Result<OffsetDateTime, BillingError> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|err| BillingError::Payload(format!("invalid unix timestamp {seconds}: {err}")))
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|raw| raw.trim())
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_string)
}

// Providers send either a bare id or the expanded object carrying an `id`.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(
        Option::<Expandable>::deserialize(deserializer)?.map(|value| match value {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }),
    )
}

// `"metadata": null` reads the same as an absent map.
fn nullable_metadata<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}
