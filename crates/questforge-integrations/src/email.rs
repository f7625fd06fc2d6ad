use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{http_client, DEFAULT_HTTP_TIMEOUT};

pub const DEFAULT_POSTMARK_API_BASE: &str = "https://api.postmarkapp.com";
pub const DEFAULT_FROM_EMAIL: &str = "noreply@example.com";

const PRODUCT_NAME: &str = "Adventure Quest Platform";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplateKind {
    Welcome,
    Verification,
    PasswordReset,
    TierUpgrade,
}

impl EmailTemplateKind {
    pub const ALL: [Self; 4] = [
        Self::Welcome,
        Self::Verification,
        Self::PasswordReset,
        Self::TierUpgrade,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Verification => "verification",
            Self::PasswordReset => "password_reset",
            Self::TierUpgrade => "tier_upgrade",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "welcome" => Some(Self::Welcome),
            "verification" => Some(Self::Verification),
            "password_reset" | "password-reset" => Some(Self::PasswordReset),
            "tier_upgrade" | "tier-upgrade" => Some(Self::TierUpgrade),
            _ => None,
        }
    }

    /// Name of the single parameter each template is rendered from.
    #[must_use]
    pub fn required_param(self) -> &'static str {
        match self {
            Self::Welcome => "username",
            Self::Verification => "verification_url",
            Self::PasswordReset => "reset_url",
            Self::TierUpgrade => "tier_name",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum EmailTemplate {
    Welcome { username: String },
    Verification { verification_url: String },
    PasswordReset { reset_url: String },
    TierUpgrade { tier_name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

impl EmailTemplate {
    /// Builds a template from loosely typed parameters.
    ///
    /// # Errors
    /// Returns a message naming the missing parameter when
    /// `kind.required_param()` is absent or blank.
    pub fn from_params(
        kind: EmailTemplateKind,
        params: &BTreeMap<String, String>,
    ) -> Result<Self, String> {
        let key = kind.required_param();
        let value = params
            .get(key)
            .map(|raw| raw.trim())
            .filter(|trimmed| !trimmed.is_empty())
            .ok_or_else(|| format!("{} email requires parameter `{key}`", kind.as_str()))?
            .to_string();

        Ok(match kind {
            EmailTemplateKind::Welcome => Self::Welcome { username: value },
            EmailTemplateKind::Verification => Self::Verification {
                verification_url: value,
            },
            EmailTemplateKind::PasswordReset => Self::PasswordReset { reset_url: value },
            EmailTemplateKind::TierUpgrade => Self::TierUpgrade { tier_name: value },
        })
    }

    #[must_use]
    pub fn kind(&self) -> EmailTemplateKind {
        match self {
            Self::Welcome { .. } => EmailTemplateKind::Welcome,
            Self::Verification { .. } => EmailTemplateKind::Verification,
            Self::PasswordReset { .. } => EmailTemplateKind::PasswordReset,
            Self::TierUpgrade { .. } => EmailTemplateKind::TierUpgrade,
        }
    }

    #[must_use]
    pub fn render(&self) -> RenderedEmail {
        match self {
            Self::Welcome { username } => RenderedEmail {
                subject: format!("Welcome to {PRODUCT_NAME}!"),
                html_body: format!(
                    "<h1>Welcome, {}!</h1><p>We're excited to have you join the {PRODUCT_NAME}.</p>",
                    escape_html(username)
                ),
                text_body: format!(
                    "Welcome, {username}! We're excited to have you join the {PRODUCT_NAME}."
                ),
            },
            Self::Verification { verification_url } => RenderedEmail {
                subject: "Verify Your Email Address".to_string(),
                html_body: format!(
                    "<h1>Verify Your Email</h1><p>Click <a href=\"{}\">here</a> to verify your email.</p>",
                    escape_html(verification_url)
                ),
                text_body: format!("Verify your email: {verification_url}"),
            },
            Self::PasswordReset { reset_url } => RenderedEmail {
                subject: "Reset Your Password".to_string(),
                html_body: format!(
                    "<h1>Reset Your Password</h1><p>Click <a href=\"{}\">here</a> to reset your password.</p>",
                    escape_html(reset_url)
                ),
                text_body: format!("Reset your password: {reset_url}"),
            },
            Self::TierUpgrade { tier_name } => RenderedEmail {
                subject: format!("Welcome to {tier_name} Tier!"),
                html_body: format!(
                    "<h1>Congratulations!</h1><p>You've upgraded to the {} tier.</p>",
                    escape_html(tier_name)
                ),
                text_body: format!("Congratulations! You've upgraded to the {tier_name} tier."),
            },
        }
    }
}

/// Outcome of a send attempt. Failures are reported here, never raised.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EmailResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmailResult {
    #[must_use]
    pub fn sent() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

pub trait Mailer {
    fn send(&self, recipient: &str, template: &EmailTemplate) -> EmailResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostmarkConfig {
    pub server_token: Option<String>,
    pub from_email: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl PostmarkConfig {
    #[must_use]
    pub fn new(server_token: Option<String>, from_email: Option<String>) -> Self {
        Self {
            server_token: server_token.filter(|token| !token.trim().is_empty()),
            from_email: from_email
                .filter(|from| !from.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FROM_EMAIL.to_string()),
            api_base: DEFAULT_POSTMARK_API_BASE.to_string(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostmarkMailer {
    config: PostmarkConfig,
}

impl PostmarkMailer {
    #[must_use]
    pub fn new(config: PostmarkConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.server_token.is_some()
    }

    fn deliver(&self, token: &str, recipient: &str, email: &RenderedEmail) -> Result<(), String> {
        let client = http_client(self.config.timeout)?;
        let url = format!("{}/email", self.config.api_base.trim_end_matches('/'));

        let response = client
            .post(&url)
            .header("Accept", "application/json")
            .header("X-Postmark-Server-Token", token)
            .json(&json!({
                "From": self.config.from_email,
                "To": recipient,
                "Subject": email.subject,
                "HtmlBody": email.html_body,
                "TextBody": email.text_body,
            }))
            .send()
            .map_err(|err| format!("email request failed: {err}"))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        Err(postmark_error_message(&body).unwrap_or_else(|| format!("Postmark returned {status}")))
    }
}

impl Mailer for PostmarkMailer {
    fn send(&self, recipient: &str, template: &EmailTemplate) -> EmailResult {
        let Some(token) = self.config.server_token.as_deref() else {
            warn!("postmark server token not configured");
            return EmailResult::failed("Postmark not configured");
        };

        match self.deliver(token, recipient, &template.render()) {
            Ok(()) => {
                info!(template = template.kind().as_str(), "sent transactional email");
                EmailResult::sent()
            }
            Err(error) => {
                warn!(template = template.kind().as_str(), %error, "transactional email failed");
                EmailResult::failed(error)
            }
        }
    }
}

fn postmark_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("Message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
