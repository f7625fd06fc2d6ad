use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use questforge_billing_core::{
    BillingError, PaymentProvider, WebhookConfig, WebhookOutcome, WebhookReconciler,
};
use questforge_integrations::{EmailResult, EmailTemplate, Mailer};
use questforge_progression_core::{now_utc, tier_report, TierReport};
use questforge_store_sqlite::{
    NewProfile, Profile, QuestCompletion, QuestCompletionInput, SqliteStore,
};
use serde::Serialize;
use tracing::warn;

pub type SharedProvider = Arc<dyn PaymentProvider + Send + Sync>;
pub type SharedMailer = Arc<dyn Mailer + Send + Sync>;

/// Blocking operations behind the HTTP surface. Cheap to clone; each call
/// opens its own store connection.
#[derive(Clone)]
pub struct ServiceApi {
    db_path: PathBuf,
    reconciler: WebhookReconciler,
    provider: SharedProvider,
    mailer: SharedMailer,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileCreated {
    pub profile: Profile,
    pub welcome_email: EmailResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestRecorded {
    pub completion: QuestCompletion,
    pub reward: questforge_progression_core::QuestReward,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_upgrade_email: Option<EmailResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileTier {
    pub user_id: String,
    pub xp: u64,
    pub tier_id: Option<String>,
    pub report: TierReport,
}

impl ServiceApi {
    pub fn new(
        db_path: PathBuf,
        webhook: WebhookConfig,
        provider: SharedProvider,
        mailer: SharedMailer,
    ) -> Self {
        Self {
            db_path,
            reconciler: WebhookReconciler::new(webhook),
            provider,
            mailer,
        }
    }

    pub fn migrate(&self) -> Result<()> {
        self.open_store()?;
        Ok(())
    }

    pub fn handle_webhook(&self, payload: &[u8], signature: &str) -> WebhookOutcome {
        let mut store = match self.open_store() {
            Ok(store) => store,
            Err(err) => return WebhookOutcome::failed(&BillingError::Store(format!("{err:#}"))),
        };
        self.reconciler.handle(
            self.provider.as_ref(),
            &mut store,
            payload,
            signature,
            now_utc(),
        )
    }

    pub fn create_profile(&self, input: &NewProfile) -> Result<ProfileCreated> {
        let profile = self.open_store()?.create_profile(input, now_utc())?;
        let welcome_email = self.send_email(
            &profile.email,
            &EmailTemplate::Welcome {
                username: profile.username.clone(),
            },
        );
        Ok(ProfileCreated {
            profile,
            welcome_email,
        })
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Profile> {
        self.open_store()?
            .get_profile(user_id)?
            .ok_or_else(|| anyhow!("profile not found: {user_id}"))
    }

    pub fn profile_tier(&self, user_id: &str) -> Result<ProfileTier> {
        let profile = self.get_profile(user_id)?;
        Ok(ProfileTier {
            report: tier_report(&profile.progress()),
            user_id: profile.user_id,
            xp: profile.xp,
            tier_id: profile.tier_id,
        })
    }

    pub fn record_quest(&self, user_id: &str, input: &QuestCompletionInput) -> Result<QuestRecorded> {
        let mut store = self.open_store()?;
        let report = store.record_quest_completion(user_id, input, now_utc())?;

        let tier_upgrade_email = if report.reward.tier_changed {
            let profile = store
                .get_profile(user_id)?
                .ok_or_else(|| anyhow!("profile not found: {user_id}"))?;
            Some(self.send_email(
                &profile.email,
                &EmailTemplate::TierUpgrade {
                    tier_name: report.reward.current_tier.name().to_string(),
                },
            ))
        } else {
            None
        };

        Ok(QuestRecorded {
            completion: report.completion,
            reward: report.reward,
            tier_upgrade_email,
        })
    }

    pub fn record_login(&self, user_id: &str) -> Result<Profile> {
        self.open_store()?.record_login(user_id, now_utc())
    }

    fn send_email(&self, recipient: &str, template: &EmailTemplate) -> EmailResult {
        let result = self.mailer.send(recipient, template);
        if let Some(error) = result.error.as_deref() {
            warn!(template = template.kind().as_str(), %error, "email not delivered");
        }
        result
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }
}
