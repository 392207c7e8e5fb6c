use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    application::normalize::sorted_pair_thread_key,
    domain::{
        error::DomainError,
        models::{
            ConversationRecord, ConversationStatus, MessageRecord, NormalizedMessage,
            ThreadingContext,
        },
    },
    storage::{SqliteStore, now_unix_ms},
};

const RELATED_MESSAGE_LIMIT: usize = 20;
const ARCHIVE_BATCH_LIMIT: usize = 500;
const HOUR_MS: u64 = 60 * 60 * 1000;
const MATCH_SCORE_FLOOR: f64 = 0.6;
const BUSINESS_HOURS: std::ops::Range<u32> = 9..17;

#[derive(Debug, Clone)]
pub struct ThreadingOptions {
    pub create_new_conversation: bool,
    pub max_conversation_age: Duration,
    pub max_message_gap: Duration,
    pub prefer_existing_threads: bool,
}

impl Default for ThreadingOptions {
    fn default() -> Self {
        Self {
            create_new_conversation: true,
            max_conversation_age: Duration::hours(168),
            max_message_gap: Duration::hours(4),
            prefer_existing_threads: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub archived: usize,
    pub failed: usize,
}

/// Groups messages into per-customer conversations.
#[derive(Clone)]
pub struct ConversationGrouper {
    store: SqliteStore,
}

impl ConversationGrouper {
    #[must_use]
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub async fn group_into_conversation(
        &self,
        message: &NormalizedMessage,
        customer_id: &str,
        options: &ThreadingOptions,
    ) -> Result<ThreadingContext, DomainError> {
        let thread_key = message.thread_key.clone().unwrap_or_else(|| {
            sorted_pair_thread_key(
                message.channel,
                &message.from.normalized_value,
                &message.to.normalized_value,
            )
        });

        if let Some(conversation) = self
            .store
            .find_conversation_by_thread_key(customer_id, &thread_key)
            .await?
        {
            self.reopen_if_archived(&conversation).await?;
            return self.existing_context(thread_key, &conversation.id).await;
        }

        if options.prefer_existing_threads
            && let Some(conversation) = self
                .best_active_conversation(message, customer_id, options)
                .await?
        {
            debug!(
                conversation_id = %conversation.id,
                thread_key = %thread_key,
                "reusing recent conversation"
            );
            return self.existing_context(thread_key, &conversation.id).await;
        }

        if !options.create_new_conversation {
            return Ok(ThreadingContext {
                thread_key,
                conversation_id: None,
                is_new_conversation: false,
                related_messages: Vec::new(),
            });
        }

        let conversation = new_conversation(message, customer_id, &thread_key);
        match self.store.insert_conversation(&conversation).await {
            Ok(()) => {
                info!(
                    conversation_id = %conversation.id,
                    customer_id = %customer_id,
                    "created conversation"
                );
                Ok(ThreadingContext {
                    thread_key,
                    conversation_id: Some(conversation.id),
                    is_new_conversation: true,
                    related_messages: Vec::new(),
                })
            }
            Err(DomainError::Conflict(reason)) => {
                debug!(%reason, "conversation created concurrently, re-fetching");
                let existing = self
                    .store
                    .find_conversation_by_thread_key(customer_id, &thread_key)
                    .await?
                    .ok_or_else(|| {
                        DomainError::Storage(format!(
                            "conversation conflict for {thread_key} but none found"
                        ))
                    })?;
                self.existing_context(thread_key, &existing.id).await
            }
            Err(error) => Err(error),
        }
    }

    /// Bumps the message counter and last activity. Failures are logged only.
    pub async fn update_conversation_activity(&self, conversation_id: &str, at: DateTime<Utc>) {
        let activity_ms = u64::try_from(at.timestamp_millis()).unwrap_or(0);
        match self
            .store
            .record_conversation_activity(conversation_id, activity_ms)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(%conversation_id, "conversation vanished before activity update"),
            Err(error) => warn!(%conversation_id, "failed to update conversation activity: {error}"),
        }
    }

    /// Archives active conversations idle for longer than `max_inactive_hours`.
    pub async fn archive_inactive_conversations(
        &self,
        max_inactive_hours: u64,
    ) -> Result<ArchiveSummary, DomainError> {
        let cutoff_ms = now_unix_ms().saturating_sub(max_inactive_hours.saturating_mul(HOUR_MS));
        let stale = self
            .store
            .list_inactive_conversations(cutoff_ms, ARCHIVE_BATCH_LIMIT)
            .await?;

        let mut summary = ArchiveSummary::default();
        for conversation in stale {
            match self
                .store
                .transition_conversation_status(
                    &conversation.id,
                    ConversationStatus::Active,
                    ConversationStatus::Archived,
                )
                .await
            {
                Ok(true) => summary.archived += 1,
                Ok(false) => {}
                Err(error) => {
                    summary.failed += 1;
                    warn!(
                        conversation_id = %conversation.id,
                        "failed to archive conversation: {error}"
                    );
                }
            }
        }

        if summary.archived > 0 || summary.failed > 0 {
            info!(
                archived = summary.archived,
                failed = summary.failed,
                "archived inactive conversations"
            );
        }
        Ok(summary)
    }

    pub async fn reassign_message(
        &self,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<MessageRecord, DomainError> {
        self.store.reassign_message(message_id, conversation_id).await
    }

    async fn existing_context(
        &self,
        thread_key: String,
        conversation_id: &str,
    ) -> Result<ThreadingContext, DomainError> {
        let related_messages = self
            .store
            .list_conversation_message_ids(conversation_id, RELATED_MESSAGE_LIMIT)
            .await?;
        Ok(ThreadingContext {
            thread_key,
            conversation_id: Some(conversation_id.to_owned()),
            is_new_conversation: false,
            related_messages,
        })
    }

    async fn reopen_if_archived(&self, conversation: &ConversationRecord) -> Result<(), DomainError> {
        if conversation.status == ConversationStatus::Archived
            && self
                .store
                .transition_conversation_status(
                    &conversation.id,
                    ConversationStatus::Archived,
                    ConversationStatus::Active,
                )
                .await?
        {
            info!(conversation_id = %conversation.id, "reopened archived conversation");
        }
        Ok(())
    }

    async fn best_active_conversation(
        &self,
        message: &NormalizedMessage,
        customer_id: &str,
        options: &ThreadingOptions,
    ) -> Result<Option<ConversationRecord>, DomainError> {
        let message_ms = message.timestamp.timestamp_millis();
        let since_ms = message_ms.saturating_sub(options.max_conversation_age.num_milliseconds());
        let candidates = self
            .store
            .list_active_conversations(
                customer_id,
                message.channel,
                u64::try_from(since_ms).unwrap_or(0),
            )
            .await?;

        let gap_ms = options.max_message_gap.num_milliseconds();
        let mut best: Option<(ConversationRecord, f64)> = None;
        for conversation in candidates {
            let last_activity_ms = i64::try_from(conversation.last_activity_ms).unwrap_or(i64::MAX);
            let mut score = 0.5;
            if message_ms.saturating_sub(last_activity_ms).abs() <= gap_ms {
                score += 0.3;
            }
            if conversation.channel == message.channel {
                score += 0.2;
            }
            // candidates arrive most recent first; ties keep the earlier one
            if score > MATCH_SCORE_FLOOR && best.as_ref().is_none_or(|(_, top)| score > *top) {
                best = Some((conversation, score));
            }
        }
        Ok(best.map(|(conversation, _)| conversation))
    }
}

fn new_conversation(
    message: &NormalizedMessage,
    customer_id: &str,
    thread_key: &str,
) -> ConversationRecord {
    let mut tags = vec![
        message.channel.as_str().to_owned(),
        message.direction.as_str().to_owned(),
    ];
    let content_family = message
        .content_type
        .split('/')
        .next()
        .unwrap_or_default()
        .trim();
    if !content_family.is_empty() {
        tags.push(format!("content:{content_family}"));
    }
    if let Some(provider) = &message.from.provider {
        tags.push(format!("provider:{provider}"));
    }
    tags.push(
        if BUSINESS_HOURS.contains(&message.timestamp.hour()) {
            "business_hours"
        } else {
            "after_hours"
        }
        .to_owned(),
    );

    let now_ms = now_unix_ms();
    ConversationRecord {
        id: uuid::Uuid::new_v4().to_string(),
        customer_id: customer_id.to_owned(),
        thread_key: thread_key.to_owned(),
        channel: message.channel,
        status: ConversationStatus::Active,
        tags,
        metadata: json!({
            "providerId": message.provider_id,
            "firstProviderMessageId": message.provider_message_id,
        }),
        message_count: 0,
        created_at_ms: now_ms,
        last_activity_ms: u64::try_from(message.timestamp.timestamp_millis()).unwrap_or(now_ms),
    }
}
