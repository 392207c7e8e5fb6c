use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    application::pipeline::{IngestionPipeline, PipelineOptions},
    domain::{
        error::DomainError,
        models::{IngestionResult, IngestionStatus, RawProviderMessage},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    WebhookIngestion,
    MessageProcessing,
}

impl JobKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebhookIngestion => "webhook_ingestion",
            Self::MessageProcessing => "message_processing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookIngestionJob {
    pub raw: RawProviderMessage,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProcessingJob {
    pub raw: RawProviderMessage,
    #[serde(default)]
    pub options: PipelineOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    WebhookIngestion(WebhookIngestionJob),
    MessageProcessing(MessageProcessingJob),
}

impl JobPayload {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::WebhookIngestion(_) => JobKind::WebhookIngestion,
            Self::MessageProcessing(_) => JobKind::MessageProcessing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub attempts: u32,
    pub payload: JobPayload,
}

impl Job {
    #[must_use]
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: payload.kind(),
            attempts: 0,
            payload,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("ingestion failed with {code}: {message}")]
    Ingestion { code: String, message: String },
    #[error("job {job_id} carries a {actual} payload, expected {expected}")]
    WrongPayload {
        job_id: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Runs the job once. `Err` asks the queue to retry.
    async fn process(&self, job: &Job) -> Result<IngestionResult, JobError>;
}

fn settle(result: IngestionResult) -> Result<IngestionResult, JobError> {
    match result.status {
        IngestionStatus::Success | IngestionStatus::Duplicate => Ok(result),
        _ => {
            let (code, message) = result.error.as_ref().map_or_else(
                || ("UNKNOWN_ERROR".to_owned(), "pipeline returned no error".to_owned()),
                |shape| (shape.code.clone(), shape.message.clone()),
            );
            Err(JobError::Ingestion { code, message })
        }
    }
}

fn wrong_payload(job: &Job, expected: JobKind) -> JobError {
    JobError::WrongPayload {
        job_id: job.id.clone(),
        expected: expected.as_str(),
        actual: job.payload.kind().as_str(),
    }
}

pub struct WebhookIngestionProcessor {
    pipeline: IngestionPipeline,
}

impl WebhookIngestionProcessor {
    #[must_use]
    pub fn new(pipeline: IngestionPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobProcessor for WebhookIngestionProcessor {
    fn kind(&self) -> JobKind {
        JobKind::WebhookIngestion
    }

    async fn process(&self, job: &Job) -> Result<IngestionResult, JobError> {
        let JobPayload::WebhookIngestion(payload) = &job.payload else {
            return Err(wrong_payload(job, self.kind()));
        };
        let lag_ms = (Utc::now() - payload.received_at).num_milliseconds();
        debug!(job_id = %job.id, lag_ms, "processing webhook job");
        settle(
            self.pipeline
                .process_message(&payload.raw, &PipelineOptions::default())
                .await,
        )
    }
}

pub struct MessageProcessingProcessor {
    pipeline: IngestionPipeline,
}

impl MessageProcessingProcessor {
    #[must_use]
    pub fn new(pipeline: IngestionPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobProcessor for MessageProcessingProcessor {
    fn kind(&self) -> JobKind {
        JobKind::MessageProcessing
    }

    async fn process(&self, job: &Job) -> Result<IngestionResult, JobError> {
        let JobPayload::MessageProcessing(payload) = &job.payload else {
            return Err(wrong_payload(job, self.kind()));
        };
        settle(
            self.pipeline
                .process_message(&payload.raw, &payload.options)
                .await,
        )
    }
}

#[derive(Debug, Clone)]
pub struct JobQueueSettings {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub concurrency: HashMap<JobKind, usize>,
    /// Most recent dead letters kept for inspection; older ones are dropped.
    pub dead_letter_capacity: usize,
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(1_000),
            concurrency: HashMap::from([
                (JobKind::WebhookIngestion, 8),
                (JobKind::MessageProcessing, 4),
            ]),
            dead_letter_capacity: 1_000,
        }
    }
}

impl JobQueueSettings {
    /// `min(base * 2^(attempt-1), 10 * base)` for a 1-based attempt number.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.base_backoff.saturating_mul(10))
    }

    fn concurrency_for(&self, kind: JobKind) -> usize {
        self.concurrency.get(&kind).copied().unwrap_or(1).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// In-process queue with one worker loop per job kind.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    senders: HashMap<JobKind, mpsc::UnboundedSender<Job>>,
    dead_letters: RwLock<VecDeque<DeadLetter>>,
    counters: Counters,
    settings: JobQueueSettings,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobQueue {
    /// Spawns a worker loop for every processor. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(processors: Vec<Arc<dyn JobProcessor>>, settings: JobQueueSettings) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for processor in processors {
            let (sender, receiver) = mpsc::unbounded_channel();
            senders.insert(processor.kind(), sender);
            receivers.push((processor, receiver));
        }

        let inner = Arc::new(QueueInner {
            senders,
            dead_letters: RwLock::new(VecDeque::new()),
            counters: Counters::default(),
            settings,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        for (processor, receiver) in receivers {
            let concurrency = inner.settings.concurrency_for(processor.kind());
            info!(
                kind = processor.kind().as_str(),
                concurrency, "starting job worker"
            );
            inner
                .tracker
                .spawn(worker_loop(inner.clone(), processor, receiver, concurrency));
        }

        Self { inner }
    }

    pub fn enqueue(&self, payload: JobPayload) -> Result<String, DomainError> {
        let job = Job::new(payload);
        let job_id = job.id.clone();
        let kind = job.kind;
        if self.inner.cancel.is_cancelled() {
            return Err(DomainError::Unavailable("job queue is shutting down".to_owned()));
        }
        let sender = self.inner.senders.get(&kind).ok_or_else(|| {
            DomainError::Unavailable(format!("no worker registered for {}", kind.as_str()))
        })?;
        sender.send(job).map_err(|_| {
            DomainError::Unavailable(format!("{} worker has stopped", kind.as_str()))
        })?;
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %job_id, kind = kind.as_str(), "job enqueued");
        Ok(job_id)
    }

    pub fn enqueue_webhook(&self, raw: RawProviderMessage) -> Result<String, DomainError> {
        self.enqueue(JobPayload::WebhookIngestion(WebhookIngestionJob {
            raw,
            received_at: Utc::now(),
        }))
    }

    pub fn enqueue_processing(
        &self,
        raw: RawProviderMessage,
        options: PipelineOptions,
    ) -> Result<String, DomainError> {
        self.enqueue(JobPayload::MessageProcessing(MessageProcessingJob {
            raw,
            options,
        }))
    }

    /// Retained dead letters, oldest first. `stats().dead_lettered` counts every one.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.read().await.iter().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> JobStats {
        let counters = &self.inner.counters;
        JobStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting work and waits for in-flight jobs. Jobs still queued or
    /// waiting out a backoff are dead-lettered.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("job queue stopped");
    }
}

const STOPPED_BEFORE_START: &str = "queue stopped before start";

async fn worker_loop(
    inner: Arc<QueueInner>,
    processor: Arc<dyn JobProcessor>,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    loop {
        let job = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let permit = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => {
                dead_letter(&inner, job, STOPPED_BEFORE_START.to_owned()).await;
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    dead_letter(&inner, job, STOPPED_BEFORE_START.to_owned()).await;
                    break;
                }
            },
        };

        let task_inner = inner.clone();
        let task_processor = processor.clone();
        inner.tracker.spawn(async move {
            let _permit = permit;
            run_job(&task_inner, task_processor.as_ref(), job).await;
        });
    }

    // Closing first makes later sends fail, so nothing slips in after the drain.
    receiver.close();
    let mut drained = 0_usize;
    while let Ok(job) = receiver.try_recv() {
        dead_letter(&inner, job, STOPPED_BEFORE_START.to_owned()).await;
        drained += 1;
    }
    if drained > 0 {
        warn!(
            kind = processor.kind().as_str(),
            drained, "dead-lettered jobs still queued at shutdown"
        );
    }
    debug!(kind = processor.kind().as_str(), "job worker exiting");
}

async fn run_job(inner: &QueueInner, processor: &dyn JobProcessor, mut job: Job) {
    let max_attempts = inner.settings.max_attempts.max(1);
    loop {
        job.attempts += 1;
        let error = match processor.process(&job).await {
            Ok(result) => {
                inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    status = ?result.status,
                    message_id = result.message_id.as_deref().unwrap_or(""),
                    "job completed"
                );
                return;
            }
            Err(error) => error,
        };

        if job.attempts >= max_attempts {
            error!(
                job_id = %job.id,
                kind = job.kind.as_str(),
                attempts = job.attempts,
                "job moved to dead letters: {error}"
            );
            dead_letter(inner, job, error.to_string()).await;
            return;
        }

        let delay = inner.settings.backoff_for(job.attempts);
        warn!(
            job_id = %job.id,
            attempts = job.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "job failed, retrying: {error}"
        );
        inner.counters.retried.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            () = inner.cancel.cancelled() => {
                dead_letter(inner, job, format!("queue stopped before retry: {error}")).await;
                return;
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn dead_letter(inner: &QueueInner, job: Job, error: String) {
    inner.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    let mut dead_letters = inner.dead_letters.write().await;
    dead_letters.push_back(DeadLetter {
        job,
        error,
        failed_at: Utc::now(),
    });
    while dead_letters.len() > inner.settings.dead_letter_capacity.max(1) {
        dead_letters.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::{
        Job, JobError, JobKind, JobPayload, JobProcessor, JobQueue, JobQueueSettings,
        JobStats, MessageProcessingJob,
    };
    use crate::{
        application::pipeline::PipelineOptions,
        domain::models::{Channel, IngestionResult, IngestionStatus, RawProviderMessage},
    };

    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobProcessor for Flaky {
        fn kind(&self) -> JobKind {
            JobKind::MessageProcessing
        }

        async fn process(&self, _job: &Job) -> Result<IngestionResult, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                return Err(JobError::Ingestion {
                    code: "UNKNOWN_ERROR".to_owned(),
                    message: format!("call {call} failed"),
                });
            }
            let mut result = IngestionResult::pending();
            result.status = IngestionStatus::Success;
            Ok(result)
        }
    }

    fn raw() -> RawProviderMessage {
        RawProviderMessage {
            provider_id: "twilio-main".to_owned(),
            provider_message_id: "SM1".to_owned(),
            provider_type: "twilio".to_owned(),
            channel: Channel::Sms,
            timestamp: Utc::now(),
            payload: json!({}),
            webhook_signature: None,
            raw_headers: None,
        }
    }

    fn settings(max_attempts: u32) -> JobQueueSettings {
        JobQueueSettings {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            concurrency: HashMap::from([(JobKind::MessageProcessing, 2)]),
            dead_letter_capacity: 100,
        }
    }

    struct Slow {
        delay: Duration,
    }

    #[async_trait]
    impl JobProcessor for Slow {
        fn kind(&self) -> JobKind {
            JobKind::MessageProcessing
        }

        async fn process(&self, _job: &Job) -> Result<IngestionResult, JobError> {
            tokio::time::sleep(self.delay).await;
            let mut result = IngestionResult::pending();
            result.status = IngestionStatus::Success;
            Ok(result)
        }
    }

    async fn wait_until(queue: &JobQueue, done: impl Fn(JobStats) -> bool) -> JobStats {
        for _ in 0..200 {
            let stats = queue.stats();
            if done(stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.stats()
    }

    #[test]
    fn backoff_doubles_and_caps_at_ten_times_base() {
        let settings = JobQueueSettings {
            base_backoff: Duration::from_millis(1_000),
            ..JobQueueSettings::default()
        };
        assert_eq!(settings.backoff_for(1), Duration::from_millis(1_000));
        assert_eq!(settings.backoff_for(3), Duration::from_millis(4_000));
        assert_eq!(settings.backoff_for(4), Duration::from_millis(8_000));
        assert_eq!(settings.backoff_for(5), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn flaky_job_is_retried_until_it_succeeds() {
        let processor = Arc::new(Flaky {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        });
        let queue = JobQueue::start(vec![processor.clone() as Arc<dyn JobProcessor>], settings(5));
        queue
            .enqueue_processing(raw(), PipelineOptions::default())
            .expect("enqueue should succeed");

        let stats = wait_until(&queue, |stats| stats.completed == 1).await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().await.is_empty());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_job_lands_in_dead_letters() {
        let processor = Arc::new(Flaky {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let queue = JobQueue::start(vec![processor as Arc<dyn JobProcessor>], settings(3));
        let job_id = queue
            .enqueue(JobPayload::MessageProcessing(MessageProcessingJob {
                raw: raw(),
                options: PipelineOptions::default(),
            }))
            .expect("enqueue should succeed");

        let stats = wait_until(&queue, |stats| stats.dead_lettered == 1).await;
        assert_eq!(stats.dead_lettered, 1);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, job_id);
        assert_eq!(dead[0].job.attempts, 3);
        assert!(dead[0].error.contains("call 3 failed"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_accounts_for_every_queued_job() {
        let processor = Arc::new(Slow {
            delay: Duration::from_millis(100),
        });
        let queue = JobQueue::start(
            vec![processor as Arc<dyn JobProcessor>],
            JobQueueSettings {
                concurrency: HashMap::from([(JobKind::MessageProcessing, 1)]),
                ..settings(1)
            },
        );
        for _ in 0..5 {
            queue
                .enqueue_processing(raw(), PipelineOptions::default())
                .expect("enqueue should succeed");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.shutdown().await;
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.completed + stats.dead_lettered, stats.enqueued);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 4);
        assert!(dead.iter().all(|letter| letter.error == "queue stopped before start"));
        assert!(dead.iter().all(|letter| letter.job.attempts == 0));
    }

    #[tokio::test]
    async fn dead_letters_keep_only_the_newest() {
        let processor = Arc::new(Flaky {
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let queue = JobQueue::start(
            vec![processor as Arc<dyn JobProcessor>],
            JobQueueSettings {
                concurrency: HashMap::from([(JobKind::MessageProcessing, 1)]),
                dead_letter_capacity: 2,
                ..settings(1)
            },
        );
        let ids: Vec<String> = (0..3)
            .map(|_| {
                queue
                    .enqueue_processing(raw(), PipelineOptions::default())
                    .expect("enqueue should succeed")
            })
            .collect();

        let stats = wait_until(&queue, |stats| stats.dead_lettered == 3).await;
        assert_eq!(stats.dead_lettered, 3);
        let retained: Vec<String> = queue
            .dead_letters()
            .await
            .into_iter()
            .map(|letter| letter.job.id)
            .collect();
        assert_eq!(retained, ids[1..].to_vec());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_without_worker_or_after_shutdown_is_rejected() {
        let processor = Arc::new(Flaky {
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        });
        let queue = JobQueue::start(vec![processor as Arc<dyn JobProcessor>], settings(1));
        assert!(queue.enqueue_webhook(raw()).is_err());

        queue.shutdown().await;
        assert!(
            queue
                .enqueue_processing(raw(), PipelineOptions::default())
                .is_err()
        );
    }
}
