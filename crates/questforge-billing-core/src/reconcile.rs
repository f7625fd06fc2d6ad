use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use crate::event::{parse_event, WebhookEvent};
use crate::model::{SubscriptionRecord, TierAssignment};
use crate::signature::{verify_signature, DEFAULT_SIGNATURE_TOLERANCE};
use crate::BillingError;

/// Remote subscription lookup.
pub trait PaymentProvider {
    /// Fetches the current state of a subscription by provider id.
    ///
    /// # Errors
    /// Returns [`BillingError::Configuration`] when the provider is not
    /// configured and [`BillingError::Provider`] for transport or decoding
    /// failures.
    fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<crate::ProviderSubscription, BillingError>;
}

/// Durable side of reconciliation. A plan is committed all-or-nothing.
pub trait BillingStore {
    /// Applies every write in `plan` inside one transaction.
    ///
    /// # Errors
    /// Returns [`BillingError::Store`] when any write fails; nothing from
    /// the plan is persisted in that case.
    fn commit(&mut self, plan: &ReconciliationPlan) -> Result<CommitReport, BillingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    UpsertSubscription(SubscriptionRecord),
    CancelSubscription {
        provider_subscription_id: String,
        canceled_at: OffsetDateTime,
    },
    SetProfileTier {
        user_id: String,
        tier_id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub writes: Vec<StoreWrite>,
}

impl ReconciliationPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitReport {
    pub subscriptions_upserted: usize,
    pub subscriptions_canceled: usize,
    pub profiles_updated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Apply(ReconciliationPlan),
    Drop { reason: String },
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied(CommitReport),
    Dropped { reason: String },
    Ignored,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Authentication,
    Processing,
}

/// Acknowledgement returned to the provider.
///
/// Serializes as `{"success":true}` or `{"success":false,"error":"..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

impl WebhookOutcome {
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            success: true,
            error: None,
            failure: None,
        }
    }

    #[must_use]
    pub fn failed(err: &BillingError) -> Self {
        let failure = match err {
            BillingError::Configuration(_) => FailureKind::Configuration,
            BillingError::Signature(_) => FailureKind::Authentication,
            BillingError::Payload(_) | BillingError::Provider(_) | BillingError::Store(_) => {
                FailureKind::Processing
            }
        };
        Self {
            success: false,
            error: Some(err.to_string()),
            failure: Some(failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub webhook_secret: Option<String>,
    pub signature_tolerance: Duration,
}

impl WebhookConfig {
    #[must_use]
    pub fn new(webhook_secret: Option<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.filter(|secret| !secret.trim().is_empty()),
            signature_tolerance: DEFAULT_SIGNATURE_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookReconciler {
    config: WebhookConfig,
}

impl WebhookReconciler {
    #[must_use]
    pub fn new(config: WebhookConfig) -> Self {
        Self { config }
    }

    /// Runs one delivery end to end and folds every failure into the
    /// returned outcome. Dropped and ignored events still acknowledge.
    pub fn handle<P, S>(
        &self,
        provider: &P,
        store: &mut S,
        payload: &[u8],
        signature: &str,
        now: OffsetDateTime,
    ) -> WebhookOutcome
    where
        P: PaymentProvider + ?Sized,
        S: BillingStore + ?Sized,
    {
        match self.process(provider, store, payload, signature, now) {
            Ok(_) => WebhookOutcome::accepted(),
            Err(err) => {
                match err {
                    BillingError::Signature(_) | BillingError::Configuration(_) => {
                        warn!(error = %err, "rejected webhook delivery");
                    }
                    _ => error!(error = %err, "webhook handling error"),
                }
                WebhookOutcome::failed(&err)
            }
        }
    }

    /// Verifies, decodes, plans and commits one delivery.
    ///
    /// # Errors
    /// Returns [`BillingError::Configuration`] when no webhook secret is
    /// configured, [`BillingError::Signature`] when verification fails, and
    /// payload, provider or store errors raised while planning or
    /// committing. No writes happen unless the plan was built completely.
    pub fn process<P, S>(
        &self,
        provider: &P,
        store: &mut S,
        payload: &[u8],
        signature: &str,
        now: OffsetDateTime,
    ) -> Result<Disposition, BillingError>
    where
        P: PaymentProvider + ?Sized,
        S: BillingStore + ?Sized,
    {
        let secret = self.config.webhook_secret.as_deref().ok_or_else(|| {
            BillingError::Configuration("Webhook secret not configured".to_string())
        })?;
        verify_signature(
            payload,
            signature,
            secret,
            now,
            self.config.signature_tolerance,
        )?;

        let envelope = parse_event(payload)?;
        match Self::plan_event(provider, &envelope.event, now)? {
            PlanDecision::Apply(plan) => {
                let report = store.commit(&plan)?;
                info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    upserted = report.subscriptions_upserted,
                    canceled = report.subscriptions_canceled,
                    profiles = report.profiles_updated,
                    "applied webhook event"
                );
                Ok(Disposition::Applied(report))
            }
            PlanDecision::Drop { reason } => {
                warn!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    %reason,
                    "dropping webhook event"
                );
                Ok(Disposition::Dropped { reason })
            }
            PlanDecision::Ignore => {
                info!(event_type = %envelope.event_type, "unhandled webhook event type");
                Ok(Disposition::Ignored)
            }
        }
    }

    /// Translates an event into store writes without touching the store.
    ///
    /// # Errors
    /// Returns provider errors from the subscription lookup performed for
    /// subscription-mode checkouts, and payload errors for out-of-range
    /// timestamps.
    pub fn plan_event<P>(
        provider: &P,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> Result<PlanDecision, BillingError>
    where
        P: PaymentProvider + ?Sized,
    {
        match event {
            WebhookEvent::CheckoutCompleted(session) => {
                let Some(assignment) = TierAssignment::from_metadata(&session.metadata) else {
                    return Ok(PlanDecision::Drop {
                        reason: "Missing metadata in checkout session".to_string(),
                    });
                };

                let mut writes = Vec::new();
                if session.is_subscription_mode() {
                    if let Some(subscription_id) = session.subscription.as_deref() {
                        let subscription = provider.retrieve_subscription(subscription_id)?;
                        writes.push(StoreWrite::UpsertSubscription(
                            SubscriptionRecord::from_provider(
                                &subscription,
                                &assignment,
                                session.customer.clone(),
                            )?,
                        ));
                    }
                }
                writes.push(StoreWrite::SetProfileTier {
                    user_id: assignment.user_id,
                    tier_id: assignment.tier_id,
                });
                Ok(PlanDecision::Apply(ReconciliationPlan { writes }))
            }
            WebhookEvent::SubscriptionChanged(subscription) => {
                let Some(assignment) = TierAssignment::from_metadata(&subscription.metadata)
                else {
                    return Ok(PlanDecision::Drop {
                        reason: "Missing metadata in subscription".to_string(),
                    });
                };

                let record = SubscriptionRecord::from_provider(
                    subscription,
                    &assignment,
                    subscription.customer.clone(),
                )?;
                Ok(PlanDecision::Apply(ReconciliationPlan {
                    writes: vec![
                        StoreWrite::UpsertSubscription(record),
                        StoreWrite::SetProfileTier {
                            user_id: assignment.user_id,
                            tier_id: assignment.tier_id,
                        },
                    ],
                }))
            }
            // Profile tier stays as-is; downgrades are not decided here.
            WebhookEvent::SubscriptionDeleted(subscription) => {
                Ok(PlanDecision::Apply(ReconciliationPlan {
                    writes: vec![StoreWrite::CancelSubscription {
                        provider_subscription_id: subscription.id.clone(),
                        canceled_at: now,
                    }],
                }))
            }
            WebhookEvent::Unhandled => Ok(PlanDecision::Ignore),
        }
    }
}
