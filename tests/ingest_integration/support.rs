use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use chrono::{DateTime, Utc};
use ingest_core::{
    application::{
        config::RuntimeConfig,
        idempotency::IdempotencyManager,
        normalize::NormalizerRegistry,
        pipeline::{IngestionPipeline, PipelineSettings},
        startup,
    },
    domain::models::{Channel, RawProviderMessage},
    storage::SqliteStore,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub(crate) const CUSTOMER_PHONE: &str = "+15551234567";
pub(crate) const BUSINESS_PHONE: &str = "+15559876543";

pub(crate) struct Harness {
    pub(crate) store: SqliteStore,
    pub(crate) pipeline: IngestionPipeline,
    _temp_dir: TempDir,
}

impl Harness {
    /// A second pipeline over the same database with a cold idempotency cache.
    pub(crate) fn fresh_pipeline(&self) -> IngestionPipeline {
        build_pipeline(self.store.clone(), &HashMap::new())
    }
}

fn build_pipeline(
    store: SqliteStore,
    business_identifiers: &HashMap<String, String>,
) -> IngestionPipeline {
    IngestionPipeline::new(
        store,
        NormalizerRegistry::builtin(business_identifiers),
        IdempotencyManager::in_memory(1_000),
        PipelineSettings {
            timeout: Duration::from_secs(10),
            strict_validation: true,
            batch_concurrency: 4,
        },
    )
}

pub(crate) async fn harness() -> Harness {
    harness_with(HashMap::new()).await
}

pub(crate) async fn harness_with(business_identifiers: HashMap<String, String>) -> Harness {
    let temp_dir = tempfile::tempdir().expect("temp dir should be created");
    let store = SqliteStore::connect(&temp_dir.path().join("ingest.db"))
        .await
        .expect("store should open");
    Harness {
        pipeline: build_pipeline(store.clone(), &business_identifiers),
        store,
        _temp_dir: temp_dir,
    }
}

pub(crate) fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub(crate) fn twilio_payload(sid: &str, from: &str, to: &str, body: &str, sent: &str) -> Value {
    json!({
        "MessageSid": sid,
        "AccountSid": "AC123",
        "From": from,
        "To": to,
        "Body": body,
        "DateSent": sent,
        "NumMedia": "0",
    })
}

pub(crate) fn twilio_raw(sid: &str, from: &str, to: &str, body: &str, sent: &str) -> RawProviderMessage {
    RawProviderMessage {
        provider_id: "twilio-main".to_owned(),
        provider_message_id: sid.to_owned(),
        provider_type: "twilio".to_owned(),
        channel: Channel::Sms,
        timestamp: at(sent),
        payload: twilio_payload(sid, from, to, body, sent),
        webhook_signature: None,
        raw_headers: None,
    }
}

pub(crate) fn inbound_sms(sid: &str, body: &str) -> RawProviderMessage {
    twilio_raw(sid, CUSTOMER_PHONE, BUSINESS_PHONE, body, "2024-03-01T10:00:00Z")
}

pub(crate) fn gmail_raw(id: &str, from: &str, body: &str) -> RawProviderMessage {
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};

    RawProviderMessage {
        provider_id: "gmail-support".to_owned(),
        provider_message_id: id.to_owned(),
        provider_type: "gmail".to_owned(),
        channel: Channel::Email,
        timestamp: at("2024-03-01T10:00:00Z"),
        payload: json!({
            "id": id,
            "threadId": format!("thread-{id}"),
            "labelIds": ["INBOX"],
            "internalDate": "1709287200000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    { "name": "From", "value": from },
                    { "name": "To", "value": "support@acme.test" },
                    { "name": "Subject", "value": "Question" }
                ],
                "body": { "data": URL_SAFE_NO_PAD.encode(body.as_bytes()) }
            }
        }),
        webhook_signature: None,
        raw_headers: None,
    }
}

pub(crate) struct ServerHandle {
    pub(crate) addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    pub(crate) db_path: std::path::PathBuf,
    _temp_dir: TempDir,
}

impl ServerHandle {
    pub(crate) async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.join.await;
    }
}

pub(crate) async fn spawn_server_with(configure: impl FnOnce(&mut RuntimeConfig)) -> ServerHandle {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose local addr");

    let temp_dir = tempfile::tempdir().expect("temp dir should be created");
    let db_path = temp_dir.path().join("ingest.db");

    let mut config =
        RuntimeConfig::for_test(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port(), db_path.clone());
    configure(&mut config);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        let _ = startup::run_with_listener(listener, config, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    ServerHandle {
        addr,
        shutdown: Some(shutdown_tx),
        join,
        db_path,
        _temp_dir: temp_dir,
    }
}

/// Polls `check` until it holds or roughly five seconds pass.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
