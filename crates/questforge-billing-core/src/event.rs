use serde::Deserialize;
use serde_json::Value;

use crate::model::{CheckoutSession, ProviderSubscription};
use crate::BillingError;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    CheckoutCompleted(CheckoutSession),
    /// Covers both `created` and `updated` deliveries.
    SubscriptionChanged(ProviderSubscription),
    SubscriptionDeleted(ProviderSubscription),
    Unhandled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub event: WebhookEvent,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<RawEventData>,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

/// Decodes a verified delivery body.
///
/// Only the four recognized event types have their `data.object` decoded;
/// anything else becomes [`WebhookEvent::Unhandled`].
///
/// # Errors
/// Returns [`BillingError::Payload`] when the body is not an event or a
/// recognized event carries a malformed object.
pub fn parse_event(payload: &[u8]) -> Result<EventEnvelope, BillingError> {
    let raw: RawEvent = serde_json::from_slice(payload)
        .map_err(|err| BillingError::Payload(format!("malformed event body: {err}")))?;

    let event = match raw.event_type.as_str() {
        CHECKOUT_COMPLETED => WebhookEvent::CheckoutCompleted(decode_object(&raw)?),
        SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED => {
            WebhookEvent::SubscriptionChanged(decode_object(&raw)?)
        }
        SUBSCRIPTION_DELETED => WebhookEvent::SubscriptionDeleted(decode_object(&raw)?),
        _ => WebhookEvent::Unhandled,
    };

    Ok(EventEnvelope {
        id: raw.id,
        event_type: raw.event_type,
        event,
    })
}

fn decode_object<T>(raw: &RawEvent) -> Result<T, BillingError>
where
    T: serde::de::DeserializeOwned,
{
    let data = raw.data.as_ref().ok_or_else(|| {
        BillingError::Payload(format!("{} event is missing data.object", raw.event_type))
    })?;

    T::deserialize(&data.object).map_err(|err| {
        BillingError::Payload(format!("invalid {} object: {err}", raw.event_type))
    })
}
