use ingest_core::{
    application::pipeline::{PipelineOptions, RetryPolicy},
    domain::{
        error::IngestionErrorCode,
        models::{Direction, IngestionStatus, MessageStatus, PipelineStage},
    },
};
use serde_json::json;

use super::support::{
    BUSINESS_PHONE, CUSTOMER_PHONE, gmail_raw, harness, inbound_sms, twilio_raw,
};

#[tokio::test]
async fn inbound_sms_creates_customer_conversation_and_message() {
    let harness = harness().await;
    let raw = inbound_sms("SM100", "Hi, is my order ready?");

    let result = harness
        .pipeline
        .process_message(&raw, &PipelineOptions::default())
        .await;

    assert_eq!(result.status, IngestionStatus::Success, "{:?}", result.error);
    let message_id = result.message_id.clone().expect("message id expected");

    let normalized = result.normalized_message.as_ref().expect("normalized message");
    assert_eq!(normalized.direction, Direction::Inbound);
    assert_eq!(normalized.from.normalized_value, CUSTOMER_PHONE);
    assert_eq!(normalized.to.normalized_value, BUSINESS_PHONE);
    assert_eq!(
        normalized.thread_key.as_deref(),
        Some("sms:+15551234567:+15559876543")
    );

    let identity = result.identity_resolution.as_ref().expect("identity expected");
    assert!(identity.is_new_customer);
    let customer_id = identity.customer_id.clone().expect("customer id expected");

    let threading = result.threading_context.as_ref().expect("threading expected");
    assert!(threading.is_new_conversation);
    let conversation_id = threading.conversation_id.clone().expect("conversation expected");

    assert_eq!(
        result.processing_metrics.stages_completed,
        vec![
            PipelineStage::Validation,
            PipelineStage::IdempotencyCheck,
            PipelineStage::Normalization,
            PipelineStage::DuplicateCheck,
            PipelineStage::IdentityResolution,
            PipelineStage::Threading,
            PipelineStage::Persistence,
            PipelineStage::ConversationUpdate,
        ]
    );
    assert!(result.processing_metrics.stages_failed.is_empty());
    assert!(result.processing_metrics.duration_ms.is_some());

    let stored = harness
        .store
        .get_message(&message_id)
        .await
        .expect("message lookup should succeed")
        .expect("message should be stored");
    assert_eq!(stored.customer_id.as_deref(), Some(customer_id.as_str()));
    assert_eq!(stored.conversation_id.as_deref(), Some(conversation_id.as_str()));
    assert_eq!(stored.status, MessageStatus::Processed);
    assert_eq!(stored.metadata["providerPayload"]["MessageSid"], "SM100");
    assert_eq!(stored.metadata["contentType"], "text/plain");
    assert_eq!(stored.metadata["messageHash"], json!(normalized.message_hash));

    let conversation = harness
        .store
        .get_conversation(&conversation_id)
        .await
        .expect("conversation lookup should succeed")
        .expect("conversation should exist");
    assert_eq!(conversation.message_count, 1);
    assert_eq!(conversation.customer_id, customer_id);

    assert_eq!(harness.store.count_customers().await.expect("count"), 1);
    assert_eq!(harness.store.count_identities().await.expect("count"), 1);
}

#[tokio::test]
async fn redelivery_is_reported_as_duplicate_with_original_id() {
    let harness = harness().await;
    let raw = inbound_sms("SM200", "Second delivery test");
    let options = PipelineOptions::default();

    let first = harness.pipeline.process_message(&raw, &options).await;
    assert_eq!(first.status, IngestionStatus::Success);

    let cached = harness.pipeline.process_message(&raw, &options).await;
    assert_eq!(cached.status, IngestionStatus::Duplicate);
    assert_eq!(cached.message_id, first.message_id);
    assert_eq!(
        cached.processing_metrics.stages_completed.last(),
        Some(&PipelineStage::IdempotencyCheck)
    );

    // A cold cache falls through to the stored provider id.
    let cold = harness.fresh_pipeline().process_message(&raw, &options).await;
    assert_eq!(cold.status, IngestionStatus::Duplicate);
    assert_eq!(cold.message_id, first.message_id);

    assert_eq!(harness.store.count_messages().await.expect("count"), 1);
}

#[tokio::test]
async fn unknown_provider_fails_with_provider_not_supported() {
    let harness = harness().await;
    let mut raw = inbound_sms("SM300", "hello");
    raw.provider_type = "unknown_carrier".to_owned();

    let result = harness
        .pipeline
        .process_message(&raw, &PipelineOptions::default())
        .await;

    assert_eq!(result.status, IngestionStatus::Failed);
    let error = result.error.expect("error expected");
    assert_eq!(error.code, "PROVIDER_NOT_SUPPORTED");
    let details = error.details.expect("details expected");
    assert_eq!(details["providerMessageId"], "SM300");
    assert_eq!(
        result.processing_metrics.stages_failed,
        vec![PipelineStage::Normalization]
    );
    assert_eq!(harness.store.count_messages().await.expect("count"), 0);
}

#[tokio::test]
async fn malformed_payload_fails_validation_stage() {
    let harness = harness().await;
    let mut raw = inbound_sms("SM301", "hello");
    raw.payload = json!("not an object");

    let result = harness
        .pipeline
        .process_message(&raw, &PipelineOptions::default())
        .await;
    assert_eq!(result.status, IngestionStatus::Failed);
    assert_eq!(result.error.expect("error expected").code, "INVALID_PAYLOAD");
    assert_eq!(
        result.processing_metrics.stages_failed,
        vec![PipelineStage::Validation]
    );

    let mut raw = inbound_sms("SM302", "hello");
    raw.payload = json!({ "MessageSid": "SM302", "To": BUSINESS_PHONE });
    let result = harness
        .pipeline
        .process_message(&raw, &PipelineOptions::default())
        .await;
    assert_eq!(result.error.expect("error expected").code, "INVALID_PAYLOAD");
    assert_eq!(
        result.processing_metrics.stages_failed,
        vec![PipelineStage::Normalization]
    );
}

#[tokio::test]
async fn zero_timeout_fails_with_timeout_details() {
    let harness = harness().await;
    let raw = inbound_sms("SM400", "slow lane");
    let options = PipelineOptions {
        timeout_ms: Some(0),
        ..PipelineOptions::default()
    };

    let result = harness.pipeline.process_message(&raw, &options).await;

    assert_eq!(result.status, IngestionStatus::Failed);
    let error = result.error.expect("error expected");
    assert_eq!(error.code, "UNKNOWN_ERROR");
    assert_eq!(error.retryable, Some(true));
    let details = error.details.expect("details expected");
    assert_eq!(details["context"]["timeoutMs"], 0);
}

#[tokio::test]
async fn skipped_stages_leave_message_unassigned() {
    let harness = harness().await;
    let raw = inbound_sms("SM500", "no identity please");
    let options = PipelineOptions {
        skip_identity_resolution: true,
        skip_duplicate_check: true,
        ..PipelineOptions::default()
    };

    let result = harness.pipeline.process_message(&raw, &options).await;

    assert_eq!(result.status, IngestionStatus::Success);
    assert!(result.identity_resolution.is_none());
    assert!(result.threading_context.is_none());
    let stored = harness
        .store
        .get_message(result.message_id.as_deref().expect("message id"))
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(stored.status, MessageStatus::Received);
    assert!(stored.customer_id.is_none());
    assert_eq!(
        stored.thread_key.as_deref(),
        Some("sms:+15551234567:+15559876543")
    );
    assert_eq!(harness.store.count_customers().await.expect("count"), 0);
}

#[tokio::test]
async fn batch_preserves_input_order_and_isolates_failures() {
    let harness = harness().await;
    let mut broken = inbound_sms("SM602", "broken");
    broken.provider_type = "pager".to_owned();
    let batch = vec![
        inbound_sms("SM600", "first in batch"),
        gmail_raw("18c601", "Jane Doe <jane.doe@example.com>", "Email in batch"),
        broken,
        inbound_sms("SM600", "first in batch"),
    ];

    let results = harness
        .pipeline
        .process_message_batch(batch, &PipelineOptions::default())
        .await;

    assert_eq!(results.len(), 4);
    assert_eq!(results[1].status, IngestionStatus::Success);
    assert_eq!(results[2].status, IngestionStatus::Failed);
    // The repeated delivery races the original; exactly one of them wins.
    let mut repeated = [results[0].status, results[3].status];
    repeated.sort_by_key(|status| *status == IngestionStatus::Duplicate);
    assert_eq!(
        repeated,
        [IngestionStatus::Success, IngestionStatus::Duplicate]
    );
    assert_eq!(results[0].message_id, results[3].message_id);
    let email = results[1]
        .normalized_message
        .as_ref()
        .expect("normalized email");
    assert_eq!(email.from.normalized_value, "jane.doe@example.com");
    assert_eq!(email.thread_key.as_deref(), Some("email:thread-18c601"));
    assert_eq!(harness.store.count_messages().await.expect("count"), 2);
}

#[tokio::test]
async fn retry_returns_success_or_final_error() {
    let harness = harness().await;
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(5),
    };

    let ok = harness
        .pipeline
        .retry_failed_message(
            &inbound_sms("SM700", "retry me"),
            &PipelineOptions::default(),
            &policy,
        )
        .await
        .expect("retry should succeed");
    assert_eq!(ok.status, IngestionStatus::Success);

    let mut broken = twilio_raw("SM701", CUSTOMER_PHONE, BUSINESS_PHONE, "x", "2024-03-01T10:00:00Z");
    broken.provider_type = "pager".to_owned();
    let error = harness
        .pipeline
        .retry_failed_message(&broken, &PipelineOptions::default(), &policy)
        .await
        .expect_err("retry should give up");
    assert_eq!(error.code, IngestionErrorCode::ProviderNotSupported);
    assert!(error.message.contains("2 attempts"));
}
