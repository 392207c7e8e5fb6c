use ingest_core::{
    application::{
        dedup::{DedupOptions, DeduplicationEngine, DuplicateType},
        pipeline::PipelineOptions,
    },
    domain::models::IngestionStatus,
};

use super::support::{BUSINESS_PHONE, CUSTOMER_PHONE, harness, twilio_raw};

#[tokio::test]
async fn same_content_from_second_provider_account_matches_hash() {
    let harness = harness().await;
    let original = twilio_raw("SM1", CUSTOMER_PHONE, BUSINESS_PHONE, "Order #42 please", "2024-03-01T10:00:00Z");
    let first = harness
        .pipeline
        .process_message(&original, &PipelineOptions::default())
        .await;
    assert_eq!(first.status, IngestionStatus::Success);

    let mut mirrored = original.clone();
    mirrored.provider_id = "twilio-backup".to_owned();
    let normalized = harness
        .pipeline
        .registry()
        .get_normalizer("twilio")
        .expect("twilio normalizer")
        .normalize(&mirrored)
        .expect("mirrored message normalizes");

    let check = DeduplicationEngine::new(harness.store.clone())
        .check_for_duplicate(&normalized, &mirrored, &DedupOptions::default())
        .await
        .expect("dedup should run");
    assert!(check.is_duplicate);
    assert_eq!(check.duplicate_type, DuplicateType::ContentHash);
    assert_eq!(check.existing_message_id, first.message_id);

    let second = harness
        .pipeline
        .process_message(&mirrored, &PipelineOptions::default())
        .await;
    assert_eq!(second.status, IngestionStatus::Duplicate);
    assert_eq!(second.message_id, first.message_id);
}

#[tokio::test]
async fn near_identical_body_within_window_is_similar_content() {
    let harness = harness().await;
    let first = harness
        .pipeline
        .process_message(
            &twilio_raw("SM10", CUSTOMER_PHONE, BUSINESS_PHONE, "Hello, is my order ready?", "2024-03-01T10:00:00Z"),
            &PipelineOptions::default(),
        )
        .await;
    assert_eq!(first.status, IngestionStatus::Success);

    let resend = harness
        .pipeline
        .process_message(
            &twilio_raw("SM11", CUSTOMER_PHONE, BUSINESS_PHONE, "Hello, is my order ready??", "2024-03-01T10:02:00Z"),
            &PipelineOptions::default(),
        )
        .await;
    assert_eq!(resend.status, IngestionStatus::Duplicate);
    assert_eq!(resend.message_id, first.message_id);

    // Outside the five minute SMS window the same text is a new message.
    let later = harness
        .pipeline
        .process_message(
            &twilio_raw("SM12", CUSTOMER_PHONE, BUSINESS_PHONE, "Hello, is my order ready??", "2024-03-01T10:30:00Z"),
            &PipelineOptions::default(),
        )
        .await;
    assert_eq!(later.status, IngestionStatus::Success);
    assert_ne!(later.message_id, first.message_id);
}

#[tokio::test]
async fn different_body_or_disabled_similarity_is_unique() {
    let harness = harness().await;
    harness
        .pipeline
        .process_message(
            &twilio_raw("SM20", CUSTOMER_PHONE, BUSINESS_PHONE, "Can I change my delivery address?", "2024-03-01T10:00:00Z"),
            &PipelineOptions::default(),
        )
        .await;

    let near_copy = twilio_raw("SM21", CUSTOMER_PHONE, BUSINESS_PHONE, "Can I change my delivery address!", "2024-03-01T10:01:00Z");
    let normalized = harness
        .pipeline
        .registry()
        .get_normalizer("twilio")
        .expect("twilio normalizer")
        .normalize(&near_copy)
        .expect("near copy normalizes");
    let engine = DeduplicationEngine::new(harness.store.clone());

    let strict = DedupOptions {
        check_similar_content: false,
        ..DedupOptions::default()
    };
    let check = engine
        .check_for_duplicate(&normalized, &near_copy, &strict)
        .await
        .expect("dedup should run");
    assert!(!check.is_duplicate);
    assert_eq!(check.duplicate_type, DuplicateType::None);

    let other = twilio_raw("SM22", CUSTOMER_PHONE, BUSINESS_PHONE, "Thanks, all sorted now", "2024-03-01T10:01:00Z");
    let normalized = harness
        .pipeline
        .registry()
        .get_normalizer("twilio")
        .expect("twilio normalizer")
        .normalize(&other)
        .expect("other normalizes");
    let check = engine
        .check_for_duplicate(&normalized, &other, &DedupOptions::default())
        .await
        .expect("dedup should run");
    assert!(!check.is_duplicate);
}
