mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use questforge_billing_core::{FailureKind, WebhookConfig, WebhookOutcome};
use questforge_integrations::{PostmarkConfig, PostmarkMailer, StripeClient, StripeConfig};
use questforge_progression_core::{
    accumulate_weekly_xp, calculate_quest_xp, Difficulty, QuestPerformance,
};
use questforge_store_sqlite::{NewProfile, Profile, QuestCompletionInput};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::{ProfileCreated, ProfileTier, QuestRecorded, ServiceApi};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone)]
struct ServiceState {
    api: ServiceApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct WeeklyXpRequest {
    base_xp: f64,
    quests_completed: u32,
    difficulty: Difficulty,
}

#[derive(Debug, Clone, Serialize)]
struct XpResponse {
    xp: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    write_conflict_total: AtomicU64,
    other_error_total: AtomicU64,
    webhooks_accepted_total: AtomicU64,
    webhooks_rejected_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    write_conflict_total: u64,
    other_error_total: u64,
    webhooks_accepted_total: u64,
    webhooks_rejected_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "questforge-service")]
#[command(about = "HTTP service for QuestForge progression and billing webhooks")]
struct Args {
    #[arg(long, env = "QUESTFORGE_DB", default_value = "./questforge.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "QUESTFORGE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "QUESTFORGE_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "STRIPE_SECRET_KEY", hide_env_values = true)]
    stripe_secret_key: Option<String>,
    #[arg(long, env = "STRIPE_WEBHOOK_SECRET", hide_env_values = true)]
    stripe_webhook_secret: Option<String>,
    #[arg(long, env = "STRIPE_API_BASE")]
    stripe_api_base: Option<String>,
    #[arg(long, env = "POSTMARK_SERVER_TOKEN", hide_env_values = true)]
    postmark_server_token: Option<String>,
    #[arg(long, env = "POSTMARK_FROM_EMAIL")]
    postmark_from_email: Option<String>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn validation_error(&self, message: impl Into<String>) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let normalized = format!("{err:#}").to_ascii_lowercase();

        if normalized.contains("profile not found") {
            return Self::failure(StatusCode::NOT_FOUND, "profile_not_found", message, None);
        }

        if normalized.contains("unique constraint failed")
            || normalized.contains("foreign key constraint failed")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("validation failed")
            || normalized.contains("validation error")
            || normalized.contains("must be non-empty")
        {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ServiceApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle)
                .await
                .map_err(|_| {
                    self.telemetry.record_failure(default_code, true);
                    Self::failure(
                        default_status,
                        default_code,
                        format!(
                            "{operation_label} timed out after {} ms",
                            self.operation_timeout.as_millis()
                        ),
                        Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                    )
                })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "profile_not_found" => &self.not_found_total,
            "write_conflict" => &self.write_conflict_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_webhook(&self, outcome: &WebhookOutcome) {
        let counter = if outcome.success {
            &self.webhooks_accepted_total
        } else {
            &self.webhooks_rejected_total
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            write_conflict_total: self.write_conflict_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            webhooks_accepted_total: self.webhooks_accepted_total.load(Ordering::Relaxed),
            webhooks_rejected_total: self.webhooks_rejected_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn webhook_status(outcome: &WebhookOutcome) -> StatusCode {
    match outcome.failure {
        None => StatusCode::OK,
        Some(FailureKind::Authentication) => StatusCode::BAD_REQUEST,
        Some(FailureKind::Configuration | FailureKind::Processing) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/webhooks/stripe", post(stripe_webhook))
        .route("/v1/xp/quest", post(xp_quest))
        .route("/v1/xp/weekly", post(xp_weekly))
        .route("/v1/profiles", post(profile_create))
        .route("/v1/profiles/:user_id", get(profile_show))
        .route("/v1/profiles/:user_id/tier", get(profile_tier))
        .route("/v1/profiles/:user_id/quests", post(profile_quest))
        .route("/v1/profiles/:user_id/logins", post(profile_login))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let api = ServiceApi::new(
        args.db,
        WebhookConfig::new(args.stripe_webhook_secret),
        Arc::new(StripeClient::new(StripeConfig::new(
            args.stripe_secret_key,
            args.stripe_api_base,
        ))),
        Arc::new(PostmarkMailer::new(PostmarkConfig::new(
            args.postmark_server_token,
            args.postmark_from_email,
        ))),
    );

    let migrate_api = api.clone();
    tokio::task::spawn_blocking(move || migrate_api.migrate()).await??;

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "questforge service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

/// Provider-facing endpoint. Always answers with the bare outcome so the
/// provider sees `{"success":...}` regardless of failure kind.
///
/// Runs to completion without `operation_timeout`: the reply must describe
/// what was committed, and the provider client carries its own HTTP timeout.
async fn stripe_webhook(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    let api = state.api.clone();
    let handle = tokio::task::spawn_blocking(move || api.handle_webhook(&body, &signature));
    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(err) => WebhookOutcome {
            success: false,
            error: Some(format!("stripe_webhook join failure: {err}")),
            failure: Some(FailureKind::Processing),
        },
    };

    if outcome.success {
        state
            .telemetry
            .requests_success_total
            .fetch_add(1, Ordering::Relaxed);
    } else {
        state.telemetry.record_failure("webhook_failed", false);
    }
    state.telemetry.record_webhook(&outcome);
    (webhook_status(&outcome), Json(outcome)).into_response()
}

async fn xp_quest(
    State(state): State<ServiceState>,
    payload: Result<Json<QuestPerformance>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<XpResponse>>, ServiceFailure> {
    let Json(performance) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    performance
        .validate()
        .map_err(|err| state.validation_error(err.to_string()))?;
    Ok(Json(envelope(XpResponse {
        xp: calculate_quest_xp(&performance),
    })))
}

async fn xp_weekly(
    State(state): State<ServiceState>,
    payload: Result<Json<WeeklyXpRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<XpResponse>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    if !request.base_xp.is_finite() || request.base_xp < 0.0 {
        return Err(state.validation_error("base_xp must be a finite, non-negative number"));
    }
    Ok(Json(envelope(XpResponse {
        xp: accumulate_weekly_xp(request.base_xp, request.quests_completed, request.difficulty),
    })))
}

async fn profile_create(
    State(state): State<ServiceState>,
    payload: Result<Json<NewProfile>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ProfileCreated>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let created = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "profile_write_failed",
            "profile_create",
            move |api| api.create_profile(&request),
        )
        .await?;
    Ok(Json(envelope(created)))
}

async fn profile_show(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Profile>>, ServiceFailure> {
    let profile = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "profile_lookup_failed",
            "profile_show",
            move |api| api.get_profile(&user_id),
        )
        .await?;
    Ok(Json(envelope(profile)))
}

async fn profile_tier(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ProfileTier>>, ServiceFailure> {
    let tier = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "profile_lookup_failed",
            "profile_tier",
            move |api| api.profile_tier(&user_id),
        )
        .await?;
    Ok(Json(envelope(tier)))
}

async fn profile_quest(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    payload: Result<Json<QuestCompletionInput>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<QuestRecorded>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let recorded = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "profile_write_failed",
            "profile_quest",
            move |api| api.record_quest(&user_id, &request),
        )
        .await?;
    Ok(Json(envelope(recorded)))
}

async fn profile_login(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Profile>>, ServiceFailure> {
    let profile = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "profile_write_failed",
            "profile_login",
            move |api| api.record_login(&user_id),
        )
        .await?;
    Ok(Json(envelope(profile)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use crate::api::{SharedMailer, SharedProvider};
    use axum::body::{to_bytes, Body};
    use http::Request;
    use questforge_billing_core::{sign_payload, BillingError, PaymentProvider, ProviderSubscription};
    use questforge_integrations::{EmailResult, EmailTemplate, Mailer};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const SECRET: &str = "whsec_service_tests";

    struct NoSubscriptions;

    impl PaymentProvider for NoSubscriptions {
        fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<ProviderSubscription, BillingError> {
            Err(BillingError::Provider(format!(
                "no such subscription: {subscription_id}"
            )))
        }
    }

    struct SlowProvider {
        delay: Duration,
    }

    impl PaymentProvider for SlowProvider {
        fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<ProviderSubscription, BillingError> {
            std::thread::sleep(self.delay);
            let mut metadata = std::collections::BTreeMap::new();
            metadata.insert("user_id".to_string(), "user-slow".to_string());
            metadata.insert("tier_id".to_string(), "gold".to_string());
            Ok(ProviderSubscription {
                id: subscription_id.to_string(),
                customer: Some("cus_slow".to_string()),
                status: "active".to_string(),
                current_period_start: Some(1_770_465_600),
                current_period_end: Some(1_773_144_000),
                cancel_at: None,
                canceled_at: None,
                metadata,
            })
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, EmailTemplate)>>,
    }

    impl RecordingMailer {
        fn sent(&self) -> Vec<(String, EmailTemplate)> {
            match self.sent.lock() {
                Ok(guard) => guard.clone(),
                Err(err) => panic!("mailer lock poisoned: {err}"),
            }
        }
    }

    impl Mailer for RecordingMailer {
        fn send(&self, recipient: &str, template: &EmailTemplate) -> EmailResult {
            match self.sent.lock() {
                Ok(mut guard) => guard.push((recipient.to_string(), template.clone())),
                Err(err) => panic!("mailer lock poisoned: {err}"),
            }
            EmailResult::sent()
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("questforge-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state_with(
        db_path: PathBuf,
        webhook_secret: Option<&str>,
        mailer: SharedMailer,
        timeout_ms: u64,
    ) -> ServiceState {
        let provider: SharedProvider = Arc::new(NoSubscriptions);
        ServiceState {
            api: ServiceApi::new(
                db_path,
                WebhookConfig::new(webhook_secret.map(str::to_string)),
                provider,
                mailer,
            ),
            operation_timeout: Duration::from_millis(timeout_ms),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn test_state(db_path: PathBuf, timeout_ms: u64) -> ServiceState {
        test_state_with(
            db_path,
            Some(SECRET),
            Arc::new(RecordingMailer::default()),
            timeout_ms,
        )
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method(method)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method(method)
            .body(Body::empty())
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    fn webhook_request(payload: &[u8], signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/v1/webhooks/stripe")
            .method("POST")
            .header("content-type", "application/json");
        if let Some(value) = signature {
            builder = builder.header("Stripe-Signature", value);
        }
        builder
            .body(Body::from(payload.to_vec()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!(
                "response body is not JSON: {err}; body={}",
                String::from_utf8_lossy(&bytes)
            ),
        }
    }

    fn error_code(value: &serde_json::Value) -> Option<&str> {
        value
            .get("error")
            .and_then(|error| error.get("code"))
            .and_then(serde_json::Value::as_str)
    }

    fn subscription_event(user_id: &str) -> Vec<u8> {
        let event = json!({
            "id": "evt_service",
            "type": "customer.subscription.created",
            "data": {"object": {
                "id": "sub_service",
                "customer": "cus_service",
                "status": "active",
                "current_period_start": 1_770_465_600,
                "current_period_end": 1_773_144_000,
                "metadata": {"user_id": user_id, "tier_id": "platinum"}
            }}
        });
        match serde_json::to_vec(&event) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode event: {err}"),
        }
    }

    fn sign_now(payload: &[u8]) -> String {
        let now = questforge_progression_core::now_utc().unix_timestamp();
        match sign_payload(payload, SECRET, now) {
            Ok(value) => value,
            Err(err) => panic!("failed to sign payload: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(unique_temp_db_path(), 2500));

        let response = send(&router, empty_request("GET", "/v1/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value
                .get("service_contract_version")
                .and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], json!("ok"));
    }

    #[tokio::test]
    async fn xp_endpoints_score_and_validate() {
        let router = app(test_state(unique_temp_db_path(), 2500));

        let quest = send(
            &router,
            json_request(
                "POST",
                "/v1/xp/quest",
                &json!({
                    "base_xp": 100.0,
                    "completion_time_minutes": 45.0,
                    "optional_objectives_completed": 1,
                    "streak_days": 7,
                    "difficulty": "legendary"
                }),
            ),
        )
        .await;
        assert_eq!(quest.status(), StatusCode::OK);
        // (100 + 25 + 7.5) * 2 * 1.05 = 278.25
        assert_eq!(response_json(quest).await["data"]["xp"], json!(278));

        let weekly = send(
            &router,
            json_request(
                "POST",
                "/v1/xp/weekly",
                &json!({"base_xp": 100.0, "quests_completed": 10, "difficulty": "hard"}),
            ),
        )
        .await;
        assert_eq!(response_json(weekly).await["data"]["xp"], json!(225));

        let negative = send(
            &router,
            json_request(
                "POST",
                "/v1/xp/quest",
                &json!({
                    "base_xp": -1.0,
                    "completion_time_minutes": 45.0,
                    "optional_objectives_completed": 0,
                    "streak_days": 0,
                    "difficulty": "easy"
                }),
            ),
        )
        .await;
        assert_eq!(negative.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response_json(negative).await), Some("validation_error"));
    }

    #[tokio::test]
    async fn invalid_json_payload_returns_invalid_json_error() {
        let router = app(test_state(unique_temp_db_path(), 2500));

        let response = send(
            &router,
            Request::builder()
                .uri("/v1/profiles")
                .method("POST")
                .header("content-type", "application/json")
                .body(Body::from("{".to_string()))
                .unwrap_or_else(|err| panic!("failed to build request: {err}")),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_json"));
        assert!(
            value
                .get("error")
                .and_then(|error| error.get("details"))
                .and_then(|details| details.get("rejection"))
                .is_some(),
            "missing json rejection details: {value}"
        );
    }

    #[tokio::test]
    async fn profile_flow_sends_welcome_and_tier_upgrade_emails() {
        let db_path = unique_temp_db_path();
        let mailer = Arc::new(RecordingMailer::default());
        let shared: SharedMailer = mailer.clone();
        let router = app(test_state_with(db_path.clone(), Some(SECRET), shared, 2500));

        let created = send(
            &router,
            json_request(
                "POST",
                "/v1/profiles",
                &json!({"user_id": "user-1", "username": "ada", "email": "ada@example.com"}),
            ),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);
        let created = response_json(created).await;
        assert_eq!(created["data"]["profile"]["xp"], json!(0));
        assert_eq!(created["data"]["welcome_email"], json!({"success": true}));

        let duplicate = send(
            &router,
            json_request(
                "POST",
                "/v1/profiles",
                &json!({"user_id": "user-1", "username": "ada", "email": "ada@example.com"}),
            ),
        )
        .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(&response_json(duplicate).await), Some("write_conflict"));

        let small = send(
            &router,
            json_request(
                "POST",
                "/v1/profiles/user-1/quests",
                &json!({"quest_id": "q-1", "performance": {
                    "base_xp": 100.0,
                    "completion_time_minutes": 60.0,
                    "optional_objectives_completed": 0,
                    "streak_days": 0,
                    "difficulty": "easy"
                }}),
            ),
        )
        .await;
        let small = response_json(small).await;
        assert_eq!(small["data"]["reward"]["tier_changed"], json!(false));
        assert!(small["data"].get("tier_upgrade_email").is_none());

        let big = send(
            &router,
            json_request(
                "POST",
                "/v1/profiles/user-1/quests",
                &json!({"quest_id": "q-2", "performance": {
                    "base_xp": 1000.0,
                    "completion_time_minutes": 60.0,
                    "optional_objectives_completed": 0,
                    "streak_days": 0,
                    "difficulty": "easy"
                }}),
            ),
        )
        .await;
        let big = response_json(big).await;
        assert_eq!(big["data"]["reward"]["current_tier"], json!("Silver"));
        assert_eq!(big["data"]["tier_upgrade_email"], json!({"success": true}));

        let sent = mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            (
                "ada@example.com".to_string(),
                EmailTemplate::Welcome {
                    username: "ada".to_string()
                }
            )
        );
        assert_eq!(
            sent[1].1,
            EmailTemplate::TierUpgrade {
                tier_name: "Silver".to_string()
            }
        );

        let login = send(&router, empty_request("POST", "/v1/profiles/user-1/logins")).await;
        assert_eq!(
            response_json(login).await["data"]["consecutive_login_days"],
            json!(1)
        );

        let tier = send(&router, empty_request("GET", "/v1/profiles/user-1/tier")).await;
        let tier = response_json(tier).await;
        assert_eq!(tier["data"]["xp"], json!(1100));
        assert_eq!(tier["data"]["report"]["status"]["next_tier"], json!("Gold"));
        assert_eq!(tier["data"]["report"]["status"]["xp_remaining"], json!(1400));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn missing_profile_returns_not_found_machine_error() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));

        let response = send(&router, empty_request("GET", "/v1/profiles/ghost")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("profile_not_found"));
        assert_eq!(
            value
                .get("service_contract_version")
                .and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn signed_webhook_reconciles_subscription_and_profile_tier() {
        let db_path = unique_temp_db_path();
        let state = test_state(db_path.clone(), 2500);
        let telemetry = Arc::clone(&state.telemetry);
        let router = app(state);

        let created = send(
            &router,
            json_request(
                "POST",
                "/v1/profiles",
                &json!({"user_id": "user-9", "username": "lin", "email": "lin@example.com"}),
            ),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);

        let payload = subscription_event("user-9");
        for _ in 0..2 {
            let response = send(&router, webhook_request(&payload, Some(&sign_now(&payload)))).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response_json(response).await, json!({"success": true}));
        }

        let profile = send(&router, empty_request("GET", "/v1/profiles/user-9")).await;
        assert_eq!(
            response_json(profile).await["data"]["tier_id"],
            json!("platinum")
        );

        let store = match questforge_store_sqlite::SqliteStore::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open store: {err}"),
        };
        let rows = match store.list_subscriptions_for_user("user-9") {
            Ok(value) => value,
            Err(err) => panic!("failed to list subscriptions: {err}"),
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provider_subscription_id, "sub_service");

        assert_eq!(telemetry.snapshot().webhooks_accepted_total, 2);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn webhook_with_bad_or_missing_signature_is_rejected() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone(), 2500));
        let payload = subscription_event("user-1");

        let forged = send(&router, webhook_request(&payload, Some("t=1,v1=deadbeef"))).await;
        assert_eq!(forged.status(), StatusCode::BAD_REQUEST);
        let forged = response_json(forged).await;
        assert_eq!(forged["success"], json!(false));
        assert!(forged["error"].as_str().is_some_and(|message| !message.is_empty()));

        let unsigned = send(&router, webhook_request(&payload, None)).await;
        assert_eq!(unsigned.status(), StatusCode::BAD_REQUEST);

        let store = match questforge_store_sqlite::SqliteStore::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open store: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate store: {err}");
        }
        match store.get_subscription("sub_service") {
            Ok(row) => assert!(row.is_none()),
            Err(err) => panic!("failed to read subscription: {err}"),
        }

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn webhook_without_secret_is_a_server_error() {
        let router = app(test_state_with(
            unique_temp_db_path(),
            None,
            Arc::new(RecordingMailer::default()),
            2500,
        ));
        let payload = subscription_event("user-1");

        let response = send(&router, webhook_request(&payload, Some("t=1,v1=00"))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response_json(response).await,
            json!({
                "success": false,
                "error": "configuration error: Webhook secret not configured"
            })
        );
    }

    #[tokio::test]
    async fn unhandled_event_types_are_acknowledged() {
        let router = app(test_state(unique_temp_db_path(), 2500));
        let payload = br#"{"id":"evt_x","type":"invoice.paid","data":{"object":{"id":"in_1"}}}"#;

        let response = send(&router, webhook_request(payload, Some(&sign_now(payload)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({"success": true}));
    }

    #[tokio::test]
    async fn webhook_reply_waits_for_slow_provider_past_operation_timeout() {
        let db_path = unique_temp_db_path();
        let provider: SharedProvider = Arc::new(SlowProvider {
            delay: Duration::from_millis(300),
        });
        let state = ServiceState {
            api: ServiceApi::new(
                db_path.clone(),
                WebhookConfig::new(Some(SECRET.to_string())),
                provider,
                Arc::new(RecordingMailer::default()),
            ),
            operation_timeout: Duration::from_millis(100),
            telemetry: Arc::new(ServiceTelemetry::default()),
        };
        let router = app(state);

        let payload = match serde_json::to_vec(&json!({
            "id": "evt_slow",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_slow",
                "mode": "subscription",
                "customer": "cus_slow",
                "subscription": "sub_slow",
                "metadata": {"user_id": "user-slow", "tier_id": "gold"}
            }}
        })) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode event: {err}"),
        };

        let response = send(&router, webhook_request(&payload, Some(&sign_now(&payload)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json!({"success": true}));

        let store = match questforge_store_sqlite::SqliteStore::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open store: {err}"),
        };
        match store.get_subscription("sub_slow") {
            Ok(Some(row)) => assert_eq!(row.tier_id, "gold"),
            Ok(None) => panic!("acknowledged delivery was not committed"),
            Err(err) => panic!("failed to read subscription: {err}"),
        }

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn run_blocking_times_out_with_mapped_error_status() {
        let state = test_state(unique_temp_db_path(), 1);

        let result = state
            .run_blocking(
                StatusCode::INTERNAL_SERVER_ERROR,
                "profile_lookup_failed",
                "unit_timeout_operation",
                |_api| {
                    std::thread::sleep(Duration::from_millis(25));
                    Ok::<_, anyhow::Error>(())
                },
            )
            .await;

        match result {
            Ok(()) => panic!("expected timeout for slow blocking operation"),
            Err(err) => {
                assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(err.code, "profile_lookup_failed");
                assert!(
                    err.message.contains("timed out"),
                    "timeout error message must mention timeout: {}",
                    err.message
                );
                assert!(err.details.is_some(), "timeout error should include details");
            }
        }

        let snapshot = state.telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 1);
        assert_eq!(snapshot.timeout_total, 1);
    }
}
