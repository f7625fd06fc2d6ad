//! Payment-provider webhook reconciliation.
//!
//! Deliveries are verified, decoded into [`WebhookEvent`]s, turned into a
//! [`ReconciliationPlan`] and committed through a [`BillingStore`] in one
//! step. The store and the provider are handed in by the caller; nothing
//! here holds process-wide state.

mod event;
mod model;
mod reconcile;
mod signature;

pub use event::{
    parse_event, EventEnvelope, WebhookEvent, CHECKOUT_COMPLETED, SUBSCRIPTION_CREATED,
    SUBSCRIPTION_DELETED, SUBSCRIPTION_UPDATED,
};
pub use model::{
    normalize_provider_status, unix_to_utc, CheckoutSession, ProviderSubscription,
    SubscriptionRecord, SubscriptionStatus, TierAssignment, METADATA_TIER_ID, METADATA_USER_ID,
};
pub use reconcile::{
    BillingStore, CommitReport, Disposition, FailureKind, PaymentProvider, PlanDecision,
    ReconciliationPlan, StoreWrite, WebhookConfig, WebhookOutcome, WebhookReconciler,
};
pub use signature::{sign_payload, verify_signature, DEFAULT_SIGNATURE_TOLERANCE};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BillingError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("signature verification failed: {0}")]
    Signature(String),
    #[error("invalid webhook payload: {0}")]
    Payload(String),
    #[error("payment provider error: {0}")]
    Provider(String),
    #[error("store error: {0}")]
    Store(String),
}
