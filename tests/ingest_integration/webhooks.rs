use std::time::Duration;

use ingest_core::{
    application::{
        config::{ProviderSettings, ProvidersConfig},
        pipeline::PipelineOptions,
    },
    domain::models::{Channel, IngestionStatus, PipelineStage, RawHeaders},
    interfaces::webhooks::raw_provider_message,
    security::signature::{SignatureVerifier, TWILIO_SIGNATURE_HEADER},
    storage::SqliteStore,
};
use serde_json::Value;

use super::support::{ServerHandle, eventually, harness, spawn_server_with};

const TWILIO_SECRET: &str = "tw-secret";
const TWILIO_URL: &str = "https://hooks.acme.test/webhooks/twilio";
const FORM_BODY: &str =
    "MessageSid=SM900&AccountSid=AC123&From=%2B15551234567&To=%2B15559876543&Body=Is+it+shipped%3F";

async fn spawn_signed_twilio() -> ServerHandle {
    spawn_server_with(|config| {
        config.providers = ProvidersConfig::default().with_provider(
            "twilio",
            ProviderSettings {
                secret: Some(TWILIO_SECRET.to_owned()),
                business_identifier: Some("+15559876543".to_owned()),
                webhook_url: Some(TWILIO_URL.to_owned()),
                enabled: true,
            },
        );
    })
    .await
}

fn twilio_signature(body: &str) -> String {
    let headers = SignatureVerifier::default()
        .generate_signature("twilio", body.as_bytes(), TWILIO_SECRET, Some(TWILIO_URL), 0)
        .expect("signature should generate");
    headers
        .get(TWILIO_SIGNATURE_HEADER)
        .cloned()
        .expect("twilio header")
}

async fn post_form(server: &ServerHandle, signature: Option<String>) -> reqwest::Response {
    let mut request = reqwest::Client::new()
        .post(format!("http://{}/webhooks/twilio", server.addr))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(FORM_BODY);
    if let Some(signature) = signature {
        request = request.header(TWILIO_SIGNATURE_HEADER, signature);
    }
    request.send().await.expect("request should send")
}

async fn health(server: &ServerHandle) -> Value {
    reqwest::get(format!("http://{}/healthz", server.addr))
        .await
        .expect("healthz should respond")
        .json()
        .await
        .expect("healthz should be json")
}

#[tokio::test]
async fn healthz_reports_providers_and_queue() {
    let server = spawn_server_with(|_| {}).await;

    let body = health(&server).await;
    assert_eq!(body["ok"], true);
    let providers = body["providers"].as_array().expect("providers array");
    assert!(providers.iter().any(|provider| provider == "twilio"));
    assert_eq!(body["jobs"]["enqueued"], 0);
    assert_eq!(body["deadLetters"], 0);

    server.stop().await;
}

#[tokio::test]
async fn missing_or_wrong_signature_is_unauthorized() {
    let server = spawn_signed_twilio().await;

    let unsigned = post_form(&server, None).await;
    assert_eq!(unsigned.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = unsigned.json().await.expect("json body");
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let forged = post_form(&server, Some(twilio_signature("MessageSid=SM-other"))).await;
    assert_eq!(forged.status(), reqwest::StatusCode::UNAUTHORIZED);

    assert_eq!(health(&server).await["jobs"]["enqueued"], 0);
    server.stop().await;
}

#[tokio::test]
async fn signed_webhook_is_accepted_and_processed_once() {
    let server = spawn_signed_twilio().await;
    let signature = twilio_signature(FORM_BODY);

    let accepted = post_form(&server, Some(signature.clone())).await;
    assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);
    let body: Value = accepted.json().await.expect("json body");
    assert_eq!(body["ok"], true);
    assert_eq!(body["accepted"], true);
    assert!(body["jobId"].as_str().is_some_and(|id| !id.is_empty()));

    // Provider redelivery is accepted too; the pipeline reports it as a duplicate.
    let redelivered = post_form(&server, Some(signature)).await;
    assert_eq!(redelivered.status(), reqwest::StatusCode::ACCEPTED);

    let handle = &server;
    let settled =
        eventually(|| async move { health(handle).await["jobs"]["completed"] == 2 }).await;
    assert!(settled, "both webhook jobs should complete");
    assert_eq!(health(&server).await["deadLetters"], 0);

    let store = SqliteStore::connect(&server.db_path)
        .await
        .expect("store should open");
    assert_eq!(store.count_messages().await.expect("count"), 1);
    let stored = store
        .find_message_by_provider_id("twilio", "SM900")
        .await
        .expect("lookup")
        .expect("message stored");
    assert_eq!(stored.body.as_deref(), Some("Is it shipped?"));

    server.stop().await;
}

#[tokio::test]
async fn redelivered_body_stops_at_idempotency_check() {
    let harness = harness().await;
    let options = PipelineOptions::default();
    let decode = || {
        raw_provider_message("twilio", Channel::Sms, FORM_BODY.as_bytes(), RawHeaders::new())
            .expect("form body should decode")
    };

    let first = harness.pipeline.process_message(&decode(), &options).await;
    assert_eq!(first.status, IngestionStatus::Success);

    // Twilio sends no event time here, so the two receipts differ.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let redelivery = decode();
    let second = harness.pipeline.process_message(&redelivery, &options).await;
    assert_eq!(second.status, IngestionStatus::Duplicate);
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(
        second.processing_metrics.stages_completed.last(),
        Some(&PipelineStage::IdempotencyCheck)
    );
}

#[tokio::test]
async fn unknown_provider_and_bad_body_are_rejected() {
    let server = spawn_server_with(|_| {}).await;
    let client = reqwest::Client::new();

    let unknown = client
        .post(format!("http://{}/webhooks/pager", server.addr))
        .body("{}")
        .send()
        .await
        .expect("request should send");
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = unknown.json().await.expect("json body");
    assert_eq!(body["error"]["code"], "PROVIDER_NOT_SUPPORTED");

    let malformed = client
        .post(format!("http://{}/webhooks/whatsapp", server.addr))
        .header("content-type", "application/json")
        .body("[1, 2, 3]")
        .send()
        .await
        .expect("request should send");
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = malformed.json().await.expect("json body");
    assert_eq!(body["error"]["code"], "INVALID_PAYLOAD");

    server.stop().await;
}
