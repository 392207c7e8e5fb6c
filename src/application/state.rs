use std::{sync::Arc, time::Instant};

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    application::{
        config::{ProviderSettings, RuntimeConfig},
        idempotency::IdempotencyManager,
        jobs::{
            JobKind, JobProcessor, JobQueue, JobQueueSettings, MessageProcessingProcessor,
            WebhookIngestionProcessor,
        },
        normalize::NormalizerRegistry,
        pipeline::{IngestionPipeline, PipelineSettings},
    },
    domain::error::DomainError,
    security::SignatureVerifier,
    storage::SqliteStore,
};

#[derive(Clone)]
pub struct SharedState {
    inner: Arc<InnerState>,
}

struct InnerState {
    config: RuntimeConfig,
    store: SqliteStore,
    pipeline: IngestionPipeline,
    jobs: JobQueue,
    verifier: SignatureVerifier,
    started_at: Instant,
}

impl SharedState {
    /// Connects storage, wires the services and starts the job workers.
    pub async fn new(config: RuntimeConfig) -> Result<Self, DomainError> {
        let store = SqliteStore::connect(&config.db_path).await?;

        let registry = NormalizerRegistry::builtin(&config.providers.business_identifiers());
        for (provider_type, settings) in config.providers.iter() {
            if !registry.is_provider_supported(provider_type) {
                warn!(%provider_type, "configured provider has no normalizer");
            } else if settings.enabled && settings.secret().is_none() {
                warn!(%provider_type, "no webhook secret configured; signatures will not be checked");
            }
        }

        let pipeline = IngestionPipeline::new(
            store.clone(),
            registry,
            IdempotencyManager::in_memory(config.idempotency_capacity),
            PipelineSettings {
                timeout: config.pipeline_timeout,
                strict_validation: config.strict_validation,
                batch_concurrency: config.processing_concurrency,
            },
        );

        let processors: Vec<Arc<dyn JobProcessor>> = vec![
            Arc::new(WebhookIngestionProcessor::new(pipeline.clone())),
            Arc::new(MessageProcessingProcessor::new(pipeline.clone())),
        ];
        let jobs = JobQueue::start(
            processors,
            JobQueueSettings {
                max_attempts: config.job_max_attempts,
                base_backoff: config.job_base_backoff,
                concurrency: [
                    (JobKind::WebhookIngestion, config.webhook_concurrency),
                    (JobKind::MessageProcessing, config.processing_concurrency),
                ]
                .into(),
                ..JobQueueSettings::default()
            },
        );

        info!(
            providers = ?pipeline.registry().supported_providers(),
            "ingestion services ready"
        );

        Ok(Self {
            inner: Arc::new(InnerState {
                verifier: SignatureVerifier::new(config.slack_tolerance),
                started_at: Instant::now(),
                config,
                store,
                pipeline,
                jobs,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.inner.store
    }

    #[must_use]
    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.inner.pipeline
    }

    #[must_use]
    pub fn jobs(&self) -> &JobQueue {
        &self.inner.jobs
    }

    #[must_use]
    pub fn verifier(&self) -> &SignatureVerifier {
        &self.inner.verifier
    }

    /// Settings for a provider type; `None` when it is not configured.
    #[must_use]
    pub fn provider(&self, provider_type: &str) -> Option<&ProviderSettings> {
        self.inner.config.providers.get(provider_type)
    }

    #[must_use]
    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.inner.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn health_snapshot(&self) -> Value {
        let stats = self.inner.jobs.stats();
        json!({
            "ok": true,
            "uptimeMs": self.uptime_ms(),
            "providers": self.inner.pipeline.registry().supported_providers(),
            "jobs": stats,
            "deadLetters": stats.dead_lettered,
        })
    }

    pub async fn shutdown(&self) {
        self.inner.jobs.shutdown().await;
    }
}
