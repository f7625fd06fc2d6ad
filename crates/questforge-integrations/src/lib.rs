//! Blocking HTTP collaborators for the payment and email providers.
//!
//! Both clients build their HTTP client per call, so they are safe to
//! construct anywhere and must only be *used* from blocking contexts
//! (a CLI, or `spawn_blocking` inside the service).

mod email;
mod stripe;

#[cfg(test)]
mod stub;

pub use email::{
    EmailResult, EmailTemplate, EmailTemplateKind, Mailer, PostmarkConfig, PostmarkMailer,
    RenderedEmail, DEFAULT_FROM_EMAIL, DEFAULT_POSTMARK_API_BASE,
};
pub use stripe::{StripeClient, StripeConfig, DEFAULT_STRIPE_API_BASE};

use std::time::Duration;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, String> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| format!("failed to create HTTP client: {err}"))
}
