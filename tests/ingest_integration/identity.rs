use ingest_core::{
    application::{
        identity::{IdentityOptions, IdentityResolver},
        normalize::make_contact,
        pipeline::PipelineOptions,
    },
    domain::models::{ContactType, CustomerRecord, Direction, IdentityRecord, IngestionStatus},
    storage::{IdentityProbe, SqliteStore},
};
use serde_json::json;

use super::support::{BUSINESS_PHONE, harness, twilio_raw};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).expect("positive clock")
}

async fn seed_customer(store: &SqliteStore, phone: &str, verified: bool, age_days: u64) -> String {
    let created_at_ms = now_ms() - age_days * DAY_MS;
    let customer = CustomerRecord {
        id: format!("cust-{phone}"),
        display_name: Some("Existing".to_owned()),
        metadata: json!({}),
        created_at_ms,
        updated_at_ms: created_at_ms,
    };
    let identity = IdentityRecord {
        id: format!("ident-{phone}"),
        customer_id: customer.id.clone(),
        identity_type: ContactType::Phone,
        normalized_value: phone.to_owned(),
        raw_value: phone.to_owned(),
        provider: Some("twilio".to_owned()),
        verified,
        created_at_ms,
        last_seen_ms: created_at_ms,
    };
    store
        .insert_customer_with_identity(&customer, &identity)
        .await
        .expect("seed customer should insert");
    customer.id
}

#[tokio::test]
async fn exact_match_links_to_existing_customer() {
    let harness = harness().await;
    let customer_id = seed_customer(&harness.store, "+15551234567", false, 400).await;

    let result = harness
        .pipeline
        .process_message(
            &twilio_raw("SM1", "(555) 123-4567", BUSINESS_PHONE, "hello again", "2024-03-01T10:00:00Z"),
            &PipelineOptions::default(),
        )
        .await;

    assert_eq!(result.status, IngestionStatus::Success);
    let identity = result.identity_resolution.expect("identity expected");
    assert_eq!(identity.customer_id.as_deref(), Some(customer_id.as_str()));
    assert!(!identity.is_new_customer);
    assert!((identity.confidence - 1.0).abs() < f64::EPSILON);
    assert_eq!(identity.matched_identities, vec!["ident-+15551234567".to_owned()]);
    assert_eq!(harness.store.count_customers().await.expect("count"), 1);
}

#[tokio::test]
async fn low_confidence_fuzzy_match_creates_new_customer() {
    let harness = harness().await;
    // Same subscriber digits, different country code; unverified and old: score 0.5.
    seed_customer(&harness.store, "+445551234567", false, 120).await;

    let result = harness
        .pipeline
        .process_message(
            &twilio_raw("SM2", "+15551234567", BUSINESS_PHONE, "new here", "2024-03-01T10:00:00Z"),
            &PipelineOptions::default(),
        )
        .await;

    assert_eq!(result.status, IngestionStatus::Success);
    let identity = result.identity_resolution.expect("identity expected");
    assert!(identity.is_new_customer);
    assert_ne!(identity.customer_id.as_deref(), Some("cust-+445551234567"));
    assert_eq!(harness.store.count_customers().await.expect("count"), 2);
}

#[tokio::test]
async fn confident_fuzzy_match_links_identity_to_candidate() {
    let harness = harness().await;
    let customer_id = seed_customer(&harness.store, "+445551234567", true, 3).await;
    let resolver = IdentityResolver::new(harness.store.clone());
    let contact = make_contact(ContactType::Phone, "+15551234567", false, "twilio");

    let resolution = resolver
        .resolve_identity(&contact, &IdentityOptions::default())
        .await
        .expect("resolution should succeed");
    assert_eq!(resolution.customer_id.as_deref(), Some(customer_id.as_str()));
    assert!((resolution.confidence - 0.99).abs() < 1e-9);

    let linked = resolver
        .create_or_link_identity(&contact, &resolution)
        .await
        .expect("link should succeed");
    assert_eq!(linked.customer_id, customer_id);
    assert!(!linked.is_new_customer);
    assert_eq!(harness.store.count_identities().await.expect("count"), 2);
}

#[tokio::test]
async fn concurrent_first_contacts_create_one_customer() {
    let harness = harness().await;
    let resolver = IdentityResolver::new(harness.store.clone());
    let contact = make_contact(ContactType::Email, "Jane.Doe@Example.com", false, "gmail");
    let options = IdentityOptions::default();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let resolver = resolver.clone();
        let contact = contact.clone();
        let options = options.clone();
        tasks.push(tokio::spawn(async move {
            let resolution = resolver.resolve_identity(&contact, &options).await?;
            resolver.create_or_link_identity(&contact, &resolution).await
        }));
    }

    let mut customers = Vec::new();
    for task in tasks {
        let linked = task
            .await
            .expect("task should not panic")
            .expect("link should succeed");
        customers.push(linked.customer_id);
    }
    customers.dedup();
    assert_eq!(customers.len(), 1);
    let customer = harness
        .store
        .get_customer(&customers[0])
        .await
        .expect("lookup")
        .expect("customer stored");
    assert_eq!(customer.display_name.as_deref(), Some("Jane Doe"));
    assert_eq!(harness.store.count_customers().await.expect("count"), 1);
    assert_eq!(harness.store.count_identities().await.expect("count"), 1);
}

#[tokio::test]
async fn business_side_is_never_created() {
    let harness = harness().await;
    let resolver = IdentityResolver::new(harness.store.clone());
    let customer = make_contact(ContactType::Phone, "+15551234567", false, "twilio");
    let business = make_contact(ContactType::Phone, BUSINESS_PHONE, false, "twilio");

    let resolutions = resolver
        .resolve_both_contacts(&business, &customer, Direction::Outbound, &IdentityOptions::default())
        .await
        .expect("resolution should succeed");

    assert!(resolutions.customer.is_new_customer);
    assert!(!resolutions.business.is_new_customer);
    assert!(resolutions.business.customer_id.is_none());
    assert_eq!(harness.store.count_customers().await.expect("count"), 0);
}

#[tokio::test]
async fn email_local_part_is_matched_literally() {
    let harness = harness().await;
    let created_at_ms = now_ms();
    let customer = CustomerRecord {
        id: "cust-jxdoe".to_owned(),
        display_name: None,
        metadata: json!({}),
        created_at_ms,
        updated_at_ms: created_at_ms,
    };
    let identity = IdentityRecord {
        id: "ident-jxdoe".to_owned(),
        customer_id: customer.id.clone(),
        identity_type: ContactType::Email,
        normalized_value: "jxdoe@example.com".to_owned(),
        raw_value: "jxdoe@example.com".to_owned(),
        provider: Some("gmail".to_owned()),
        verified: true,
        created_at_ms,
        last_seen_ms: created_at_ms,
    };
    harness
        .store
        .insert_customer_with_identity(&customer, &identity)
        .await
        .expect("seed customer should insert");

    let wildcard = harness
        .store
        .find_potential_identity_matches(
            ContactType::Email,
            &IdentityProbe::EmailLocalPart("j_doe".to_owned()),
            "j_doe@other.test",
            10,
        )
        .await
        .expect("lookup should run");
    assert!(wildcard.is_empty());

    let literal = harness
        .store
        .find_potential_identity_matches(
            ContactType::Email,
            &IdentityProbe::EmailLocalPart("jxdoe".to_owned()),
            "jxdoe@other.test",
            10,
        )
        .await
        .expect("lookup should run");
    assert_eq!(literal.len(), 1);
    assert_eq!(literal[0].id, "ident-jxdoe");
}
