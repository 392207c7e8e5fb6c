use std::collections::HashMap;

use ingest_core::{
    application::pipeline::PipelineOptions,
    domain::models::{
        Channel, ConversationRecord, ConversationStatus, Direction, IngestionStatus,
    },
};
use serde_json::json;

use super::support::{
    BUSINESS_PHONE, CUSTOMER_PHONE, harness, harness_with, inbound_sms, twilio_raw,
};

#[tokio::test]
async fn follow_up_messages_share_the_conversation() {
    let harness = harness_with(HashMap::from([(
        "twilio".to_owned(),
        BUSINESS_PHONE.to_owned(),
    )]))
    .await;
    let options = PipelineOptions::default();

    let first = harness
        .pipeline
        .process_message(&inbound_sms("SM1", "Hello"), &options)
        .await;
    let reply = harness
        .pipeline
        .process_message(
            &twilio_raw("SM2", BUSINESS_PHONE, CUSTOMER_PHONE, "Hi! How can we help?", "2024-03-01T10:05:00Z"),
            &options,
        )
        .await;

    assert_eq!(first.status, IngestionStatus::Success);
    assert_eq!(reply.status, IngestionStatus::Success);
    assert_eq!(
        reply.normalized_message.as_ref().map(|message| message.direction),
        Some(Direction::Outbound)
    );
    let first_thread = first.threading_context.expect("threading expected");
    let reply_thread = reply.threading_context.expect("threading expected");
    assert_eq!(first_thread.thread_key, reply_thread.thread_key);
    assert_eq!(first_thread.conversation_id, reply_thread.conversation_id);
    assert!(!reply_thread.is_new_conversation);
    assert_eq!(
        reply_thread.related_messages,
        vec![first.message_id.clone().expect("first id")]
    );

    let conversation = harness
        .store
        .get_conversation(first_thread.conversation_id.as_deref().expect("id"))
        .await
        .expect("lookup")
        .expect("conversation");
    assert_eq!(conversation.message_count, 2);
    assert!(conversation.tags.contains(&"sms".to_owned()));
    assert!(conversation.tags.contains(&"business_hours".to_owned()));
    assert_eq!(harness.store.count_conversations().await.expect("count"), 1);
}

#[tokio::test]
async fn archived_conversation_reopens_on_new_message() {
    let harness = harness().await;
    let options = PipelineOptions::default();

    let first = harness
        .pipeline
        .process_message(&inbound_sms("SM10", "Old question"), &options)
        .await;
    let conversation_id = first
        .threading_context
        .and_then(|context| context.conversation_id)
        .expect("conversation expected");

    // Activity is in 2024, well past a one-hour cutoff.
    let summary = harness
        .pipeline
        .grouper()
        .archive_inactive_conversations(1)
        .await
        .expect("archive should succeed");
    assert_eq!(summary.archived, 1);
    assert_eq!(summary.failed, 0);
    let archived = harness
        .store
        .get_conversation(&conversation_id)
        .await
        .expect("lookup")
        .expect("conversation");
    assert_eq!(archived.status, ConversationStatus::Archived);

    let again = harness
        .pipeline
        .process_message(
            &twilio_raw("SM11", CUSTOMER_PHONE, BUSINESS_PHONE, "Back again", "2024-03-09T10:00:00Z"),
            &options,
        )
        .await;
    let context = again.threading_context.expect("threading expected");
    assert_eq!(context.conversation_id.as_deref(), Some(conversation_id.as_str()));
    let reopened = harness
        .store
        .get_conversation(&conversation_id)
        .await
        .expect("lookup")
        .expect("conversation");
    assert_eq!(reopened.status, ConversationStatus::Active);
}

#[tokio::test]
async fn huge_inactivity_window_archives_nothing() {
    let harness = harness().await;
    harness
        .pipeline
        .process_message(&inbound_sms("SM15", "Still here"), &PipelineOptions::default())
        .await;

    let summary = harness
        .pipeline
        .grouper()
        .archive_inactive_conversations(u64::MAX)
        .await
        .expect("archive should succeed");
    assert_eq!(summary.archived, 0);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn reassign_moves_message_and_counters() {
    let harness = harness().await;
    let first = harness
        .pipeline
        .process_message(&inbound_sms("SM20", "Move me"), &PipelineOptions::default())
        .await;
    let message_id = first.message_id.clone().expect("message id");
    let customer_id = first
        .identity_resolution
        .and_then(|identity| identity.customer_id)
        .expect("customer id");
    let original_id = first
        .threading_context
        .and_then(|context| context.conversation_id)
        .expect("conversation id");

    let target = ConversationRecord {
        id: "conv-target".to_owned(),
        customer_id,
        thread_key: "sms:manual".to_owned(),
        channel: Channel::Sms,
        status: ConversationStatus::Active,
        tags: vec!["manual".to_owned()],
        metadata: json!({}),
        message_count: 0,
        created_at_ms: 1,
        last_activity_ms: 1,
    };
    harness
        .store
        .insert_conversation(&target)
        .await
        .expect("target should insert");

    let moved = harness
        .pipeline
        .grouper()
        .reassign_message(&message_id, "conv-target")
        .await
        .expect("reassign should succeed");
    assert_eq!(moved.conversation_id.as_deref(), Some("conv-target"));

    let original = harness
        .store
        .get_conversation(&original_id)
        .await
        .expect("lookup")
        .expect("conversation");
    let target = harness
        .store
        .get_conversation("conv-target")
        .await
        .expect("lookup")
        .expect("conversation");
    assert_eq!(original.message_count, 0);
    assert_eq!(target.message_count, 1);
    assert!(target.last_activity_ms > 1);

    let missing = harness
        .pipeline
        .grouper()
        .reassign_message(&message_id, "conv-missing")
        .await;
    assert!(missing.is_err());
}
