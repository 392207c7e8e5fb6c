use std::{sync::Arc, time::Duration};

use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    application::{
        dedup::{DedupOptions, DeduplicationEngine},
        idempotency::IdempotencyManager,
        identity::{IdentityOptions, IdentityResolver},
        normalize::NormalizerRegistry,
        threading::{ConversationGrouper, ThreadingOptions},
    },
    domain::{
        error::{DomainError, IngestionError, IngestionErrorCode},
        models::{
            IdentityResolution, IngestionResult, IngestionStatus, MessageRecord, MessageStatus,
            NormalizedMessage, PipelineStage, RawProviderMessage,
        },
    },
    storage::{SqliteStore, now_unix_ms},
};

/// Per-call switches. Serializable so they can ride along in queued jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineOptions {
    pub skip_duplicate_check: bool,
    pub skip_identity_resolution: bool,
    pub skip_threading: bool,
    pub strict_validation: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub similarity_threshold: Option<f64>,
    pub identity_confidence_threshold: Option<f64>,
    pub create_new_customer: Option<bool>,
    pub create_new_conversation: Option<bool>,
}

/// Process-wide defaults, taken from the runtime config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub timeout: Duration,
    pub strict_validation: bool,
    pub batch_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            strict_validation: false,
            batch_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^(attempt-1), max)` for a 1-based attempt number.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct IngestionPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    store: SqliteStore,
    registry: NormalizerRegistry,
    idempotency: IdempotencyManager,
    dedup: DeduplicationEngine,
    identity: IdentityResolver,
    grouper: ConversationGrouper,
    settings: PipelineSettings,
}

/// Outcome of the stages that ran before the pipeline stopped early.
enum Halt {
    Duplicate(String),
}

impl IngestionPipeline {
    #[must_use]
    pub fn new(
        store: SqliteStore,
        registry: NormalizerRegistry,
        idempotency: IdempotencyManager,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                dedup: DeduplicationEngine::new(store.clone()),
                identity: IdentityResolver::new(store.clone()),
                grouper: ConversationGrouper::new(store.clone()),
                store,
                registry,
                idempotency,
                settings,
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &NormalizerRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn identity(&self) -> &IdentityResolver {
        &self.inner.identity
    }

    #[must_use]
    pub fn grouper(&self) -> &ConversationGrouper {
        &self.inner.grouper
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.inner.store
    }

    /// Runs one message through every stage. Never fails: errors, panics and
    /// timeouts all come back as a `failed` result. A timed-out run keeps
    /// going on the runtime; its writes stay guarded by the unique constraints.
    pub async fn process_message(
        &self,
        raw: &RawProviderMessage,
        options: &PipelineOptions,
    ) -> IngestionResult {
        let timeout = options
            .timeout_ms
            .map_or(self.inner.settings.timeout, Duration::from_millis);
        let pipeline = self.clone();
        let task_raw = raw.clone();
        let task_options = options.clone();
        let task = tokio::spawn(async move { pipeline.run(&task_raw, &task_options).await });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                warn!(
                    provider_id = %raw.provider_id,
                    provider_message_id = %raw.provider_message_id,
                    "pipeline task aborted: {join_error}"
                );
                IngestionResult::failed(
                    IngestionError::new(
                        IngestionErrorCode::UnknownError,
                        format!("pipeline task aborted: {join_error}"),
                        &raw.provider_id,
                    )
                    .with_message_id(&raw.provider_message_id)
                    .to_shape(),
                )
            }
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    provider_id = %raw.provider_id,
                    provider_message_id = %raw.provider_message_id,
                    timeout_ms,
                    "pipeline timed out"
                );
                IngestionResult::failed(
                    IngestionError::new(
                        IngestionErrorCode::UnknownError,
                        format!("pipeline did not finish within {timeout_ms}ms"),
                        &raw.provider_id,
                    )
                    .with_message_id(&raw.provider_message_id)
                    .with_details(json!({ "timeoutMs": timeout_ms }))
                    .to_shape(),
                )
            }
        }
    }

    /// Processes every message independently, preserving input order.
    pub async fn process_message_batch(
        &self,
        messages: Vec<RawProviderMessage>,
        options: &PipelineOptions,
    ) -> Vec<IngestionResult> {
        let concurrency = self.inner.settings.batch_concurrency.max(1);
        stream::iter(messages.into_iter().map(|raw| {
            let pipeline = self.clone();
            let options = options.clone();
            async move { pipeline.process_message(&raw, &options).await }
        }))
        .buffered(concurrency)
        .collect()
        .await
    }

    /// Re-runs a message until it succeeds or is found duplicate. Exhausting
    /// `policy.max_attempts` is returned as an error.
    pub async fn retry_failed_message(
        &self,
        raw: &RawProviderMessage,
        options: &PipelineOptions,
        policy: &RetryPolicy,
    ) -> Result<IngestionResult, IngestionError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let result = self.process_message(raw, options).await;
            if matches!(
                result.status,
                IngestionStatus::Success | IngestionStatus::Duplicate
            ) {
                return Ok(result);
            }
            debug!(
                provider_message_id = %raw.provider_message_id,
                attempt,
                "retry attempt failed"
            );
            last_error = result.error;
            if attempt < max_attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }

        let (code, message) = last_error.as_ref().map_or(
            (IngestionErrorCode::UnknownError, "no error recorded".to_owned()),
            |shape| (IngestionErrorCode::from_code(&shape.code), shape.message.clone()),
        );
        Err(IngestionError::new(
            code,
            format!("message failed after {max_attempts} attempts: {message}"),
            &raw.provider_id,
        )
        .with_message_id(&raw.provider_message_id)
        .with_details(json!({ "attempts": max_attempts, "lastError": last_error })))
    }

    async fn run(&self, raw: &RawProviderMessage, options: &PipelineOptions) -> IngestionResult {
        let mut result = IngestionResult::pending();
        result.status = IngestionStatus::Processing;

        match self.execute(raw, options, &mut result).await {
            Ok(None) => result.status = IngestionStatus::Success,
            Ok(Some(Halt::Duplicate(existing_id))) => {
                result.status = IngestionStatus::Duplicate;
                result.message_id = Some(existing_id);
            }
            Err(error) => {
                let stage = result.processing_metrics.last_stage();
                result.processing_metrics.fail_current();
                result.status = IngestionStatus::Failed;
                warn!(
                    provider_id = %raw.provider_id,
                    provider_message_id = %raw.provider_message_id,
                    stage = stage.map_or("none", |stage| stage.as_str()),
                    code = %error.code,
                    "ingestion failed: {}",
                    error.message
                );
                result.error = Some(error.to_shape());
            }
        }
        result.processing_metrics.finish();

        let strict = options
            .strict_validation
            .unwrap_or(self.inner.settings.strict_validation);
        if strict && let Err(reason) = validate_result(&result) {
            result.status = IngestionStatus::Failed;
            result.error = Some(
                IngestionError::new(
                    IngestionErrorCode::ValidationFailed,
                    format!("ingestion result failed validation: {reason}"),
                    &raw.provider_id,
                )
                .with_message_id(&raw.provider_message_id)
                .to_shape(),
            );
        }

        info!(
            provider_id = %raw.provider_id,
            provider_message_id = %raw.provider_message_id,
            status = ?result.status,
            duration_ms = result.processing_metrics.duration_ms.unwrap_or(0),
            "message processed"
        );
        result
    }

    async fn execute(
        &self,
        raw: &RawProviderMessage,
        options: &PipelineOptions,
        result: &mut IngestionResult,
    ) -> Result<Option<Halt>, IngestionError> {
        let inner = &self.inner;

        result.processing_metrics.enter(PipelineStage::Validation);
        self.validate_raw(raw)?;

        result.processing_metrics.enter(PipelineStage::IdempotencyCheck);
        if let Some(existing_id) = inner.idempotency.check(raw).await {
            debug!(provider_message_id = %raw.provider_message_id, "idempotency cache hit");
            return Ok(Some(Halt::Duplicate(existing_id)));
        }

        result.processing_metrics.enter(PipelineStage::Normalization);
        let normalizer = inner
            .registry
            .get_normalizer(&raw.provider_type)
            .map_err(|error| error.for_message(&raw.provider_id, &raw.provider_message_id))?;
        let normalized = normalizer.normalize(raw)?;
        result.normalized_message = Some(normalized.clone());

        if !options.skip_duplicate_check {
            result.processing_metrics.enter(PipelineStage::DuplicateCheck);
            let mut dedup_options = DedupOptions::default()
                .with_window_minutes(normalizer.config().duplicate_window_minutes);
            if let Some(threshold) = options.similarity_threshold {
                dedup_options.similarity_threshold = threshold;
            }
            let check = inner
                .dedup
                .check_for_duplicate(&normalized, raw, &dedup_options)
                .await
                .map_err(|error| stage_error(IngestionErrorCode::UnknownError, &error, raw))?;
            if check.is_duplicate
                && let Some(existing_id) = check.existing_message_id
            {
                debug!(
                    provider_message_id = %raw.provider_message_id,
                    duplicate_type = ?check.duplicate_type,
                    confidence = check.confidence,
                    "duplicate detected"
                );
                inner.idempotency.record(raw, &existing_id).await;
                return Ok(Some(Halt::Duplicate(existing_id)));
            }
        }

        let mut customer_id = None;
        if !options.skip_identity_resolution {
            result.processing_metrics.enter(PipelineStage::IdentityResolution);
            let resolution = self.resolve_customer(&normalized, options, raw).await?;
            customer_id = resolution.customer_id.clone();
            result.identity_resolution = Some(resolution);
        }

        if !options.skip_threading
            && let Some(customer_id) = customer_id.as_deref()
        {
            result.processing_metrics.enter(PipelineStage::Threading);
            let threading_options = ThreadingOptions {
                create_new_conversation: options.create_new_conversation.unwrap_or(true),
                ..ThreadingOptions::default()
            };
            let context = inner
                .grouper
                .group_into_conversation(&normalized, customer_id, &threading_options)
                .await
                .map_err(|error| stage_error(IngestionErrorCode::ThreadingFailed, &error, raw))?;
            result.threading_context = Some(context);
        }

        result.processing_metrics.enter(PipelineStage::Persistence);
        let conversation_id = result
            .threading_context
            .as_ref()
            .and_then(|context| context.conversation_id.clone());
        let thread_key = result
            .threading_context
            .as_ref()
            .map(|context| context.thread_key.clone())
            .or_else(|| normalized.thread_key.clone());
        let record = message_record(raw, &normalized, customer_id, conversation_id.clone(), thread_key);

        match inner.store.insert_message(&record).await {
            Ok(()) => {}
            Err(DomainError::Conflict(_)) => {
                let existing = inner
                    .store
                    .find_message_by_provider_id(&raw.provider_id, &raw.provider_message_id)
                    .await
                    .map_err(|error| stage_error(IngestionErrorCode::UnknownError, &error, raw))?;
                if let Some(existing) = existing {
                    inner.idempotency.record(raw, &existing.id).await;
                    return Ok(Some(Halt::Duplicate(existing.id)));
                }
                return Err(IngestionError::new(
                    IngestionErrorCode::DuplicateMessage,
                    "message conflicted with a stored message that could not be loaded",
                    &raw.provider_id,
                )
                .with_message_id(&raw.provider_message_id));
            }
            Err(error) => {
                return Err(stage_error(IngestionErrorCode::UnknownError, &error, raw));
            }
        }
        inner.idempotency.record(raw, &record.id).await;
        result.message_id = Some(record.id);

        if let Some(conversation_id) = conversation_id {
            result
                .processing_metrics
                .enter(PipelineStage::ConversationUpdate);
            inner
                .grouper
                .update_conversation_activity(&conversation_id, normalized.timestamp)
                .await;
        }
        Ok(None)
    }

    fn validate_raw(&self, raw: &RawProviderMessage) -> Result<(), IngestionError> {
        let invalid = |message: &str| {
            IngestionError::new(IngestionErrorCode::InvalidPayload, message, &raw.provider_id)
                .with_message_id(&raw.provider_message_id)
        };
        if raw.provider_id.trim().is_empty() {
            return Err(invalid("providerId must not be empty"));
        }
        if raw.provider_message_id.trim().is_empty() {
            return Err(invalid("providerMessageId must not be empty"));
        }
        if raw.provider_type.trim().is_empty() {
            return Err(invalid("providerType must not be empty"));
        }
        if !raw.payload.is_object() {
            return Err(invalid("payload must be a JSON object"));
        }
        if let Some(channel) = self.inner.registry.channel_for_provider(&raw.provider_type)
            && channel != raw.channel
        {
            return Err(invalid(&format!(
                "channel {} does not match provider {}",
                raw.channel.as_str(),
                raw.provider_type
            )));
        }
        Ok(())
    }

    async fn resolve_customer(
        &self,
        normalized: &NormalizedMessage,
        options: &PipelineOptions,
        raw: &RawProviderMessage,
    ) -> Result<IdentityResolution, IngestionError> {
        let identity_options = IdentityOptions {
            confidence_threshold: options.identity_confidence_threshold.unwrap_or(0.7),
            create_new_customer: options.create_new_customer.unwrap_or(true),
            ..IdentityOptions::default()
        };
        let failed =
            |error: DomainError| stage_error(IngestionErrorCode::IdentityResolutionFailed, &error, raw);

        let resolutions = self
            .inner
            .identity
            .resolve_both_contacts(
                &normalized.from,
                &normalized.to,
                normalized.direction,
                &identity_options,
            )
            .await
            .map_err(failed)?;
        let mut resolution = resolutions.customer;

        if resolution.customer_id.is_some() || resolution.is_new_customer {
            let linked = self
                .inner
                .identity
                .create_or_link_identity(normalized.customer_contact(), &resolution)
                .await
                .map_err(failed)?;
            if resolution.is_new_customer && !linked.is_new_customer {
                // another delivery created the identity first
                resolution.confidence = 1.0;
            }
            resolution.is_new_customer = linked.is_new_customer;
            resolution.customer_id = Some(linked.customer_id);
            if !resolution.matched_identities.contains(&linked.identity_id) {
                resolution.matched_identities.push(linked.identity_id);
            }
        }
        Ok(resolution)
    }
}

fn stage_error(
    code: IngestionErrorCode,
    error: &DomainError,
    raw: &RawProviderMessage,
) -> IngestionError {
    IngestionError::from_domain(code, error, &raw.provider_id, &raw.provider_message_id)
}

fn message_record(
    raw: &RawProviderMessage,
    normalized: &NormalizedMessage,
    customer_id: Option<String>,
    conversation_id: Option<String>,
    thread_key: Option<String>,
) -> MessageRecord {
    let status = if conversation_id.is_some() {
        MessageStatus::Processed
    } else {
        MessageStatus::Received
    };
    MessageRecord {
        id: uuid::Uuid::new_v4().to_string(),
        provider_message_id: normalized.provider_message_id.clone(),
        provider_id: normalized.provider_id.clone(),
        customer_id,
        conversation_id,
        channel: normalized.channel,
        direction: normalized.direction,
        from_identifier: normalized.from.normalized_value.clone(),
        to_identifier: normalized.to.normalized_value.clone(),
        thread_key,
        timestamp_ms: u64::try_from(normalized.timestamp.timestamp_millis()).unwrap_or(0),
        body: normalized.body.clone(),
        status,
        message_hash: normalized.message_hash.clone(),
        metadata: json!({
            "providerType": raw.provider_type,
            "providerPayload": raw.payload,
            "providerMeta": normalized.provider_meta,
            "messageHash": normalized.message_hash,
            "contentType": normalized.content_type,
            "attachments": normalized.attachments,
        }),
        created_at_ms: now_unix_ms(),
    }
}

/// Shape check applied to the final result in strict mode.
fn validate_result(result: &IngestionResult) -> Result<(), String> {
    if !result.status.is_terminal() {
        return Err("result is not terminal".to_owned());
    }
    let metrics = &result.processing_metrics;
    if metrics.end_time.is_none() || metrics.duration_ms.is_none() {
        return Err("processing metrics were not finished".to_owned());
    }
    if metrics
        .stages_failed
        .iter()
        .any(|stage| !metrics.stages_completed.contains(stage))
    {
        return Err("a failed stage was never entered".to_owned());
    }
    match result.status {
        IngestionStatus::Success => {
            if result.message_id.is_none() || result.normalized_message.is_none() {
                return Err("success requires messageId and normalizedMessage".to_owned());
            }
        }
        IngestionStatus::Duplicate => {
            if result.message_id.is_none() {
                return Err("duplicate requires the existing messageId".to_owned());
            }
        }
        IngestionStatus::Failed => {
            if result.error.is_none() {
                return Err("failed requires an error".to_owned());
            }
        }
        IngestionStatus::Pending | IngestionStatus::Processing => {}
    }
    if let Some(identity) = &result.identity_resolution {
        if !(0.0..=1.0).contains(&identity.confidence) {
            return Err("identity confidence is outside [0, 1]".to_owned());
        }
        if identity.confidence >= 1.0 && identity.matched_identities.is_empty() {
            return Err("exact identity match lists no identities".to_owned());
        }
    }
    Ok(())
}
