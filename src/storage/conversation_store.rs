use crate::{
    domain::{
        error::DomainError,
        models::{Channel, ConversationRecord, ConversationStatus},
    },
    storage::{SqliteStore, util},
};

type ConversationRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
);

const CONVERSATION_COLUMNS: &str = "conversation_id, customer_id, thread_key, channel, status, tags_json, metadata_json, message_count, created_at_ms, last_activity_ms";

impl SqliteStore {
    pub async fn get_conversation(
        &self,
        id: &str,
    ) -> Result<Option<ConversationRecord>, DomainError> {
        let query =
            format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = ? LIMIT 1");
        let row = sqlx::query_as::<_, ConversationRow>(&query)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to get conversation: {error}")))?;

        row.map(map_conversation_row).transpose()
    }

    pub async fn find_conversation_by_thread_key(
        &self,
        customer_id: &str,
        thread_key: &str,
    ) -> Result<Option<ConversationRecord>, DomainError> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE customer_id = ? AND thread_key = ? LIMIT 1"
        );
        let row = sqlx::query_as::<_, ConversationRow>(&query)
            .bind(customer_id)
            .bind(thread_key)
            .fetch_optional(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to find conversation by thread key: {error}"))
            })?;

        row.map(map_conversation_row).transpose()
    }

    pub async fn list_active_conversations(
        &self,
        customer_id: &str,
        channel: Channel,
        active_since_ms: u64,
    ) -> Result<Vec<ConversationRecord>, DomainError> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE customer_id = ? AND channel = ? AND status = 'active' AND last_activity_ms >= ? \
             ORDER BY last_activity_ms DESC"
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&query)
            .bind(customer_id)
            .bind(channel.as_str())
            .bind(util::to_db_ms(active_since_ms))
            .fetch_all(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to list active conversations: {error}"))
            })?;

        rows.into_iter().map(map_conversation_row).collect()
    }

    pub async fn list_inactive_conversations(
        &self,
        inactive_before_ms: u64,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, DomainError> {
        let query = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE status = 'active' AND last_activity_ms < ? \
             ORDER BY last_activity_ms ASC LIMIT {limit}"
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&query)
            .bind(util::to_db_ms(inactive_before_ms))
            .fetch_all(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to list inactive conversations: {error}"))
            })?;

        rows.into_iter().map(map_conversation_row).collect()
    }

    /// Inserts a conversation; `DomainError::Conflict` when the
    /// `(customer, thread key)` pair already exists.
    pub async fn insert_conversation(
        &self,
        conversation: &ConversationRecord,
    ) -> Result<(), DomainError> {
        let tags_json = util::to_json_text(&conversation.tags).map_err(DomainError::Storage)?;
        let metadata_json =
            util::value_to_json_text(&conversation.metadata).map_err(DomainError::Storage)?;

        sqlx::query(
            "INSERT INTO conversations(conversation_id, customer_id, thread_key, channel, status, tags_json, metadata_json, message_count, created_at_ms, last_activity_ms) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.customer_id)
        .bind(&conversation.thread_key)
        .bind(conversation.channel.as_str())
        .bind(conversation.status.as_str())
        .bind(tags_json)
        .bind(metadata_json)
        .bind(i64::try_from(conversation.message_count).unwrap_or(i64::MAX))
        .bind(util::to_db_ms(conversation.created_at_ms))
        .bind(util::to_db_ms(conversation.last_activity_ms))
        .execute(self.pool())
        .await
        .map_err(|error| util::write_error(error, "failed to insert conversation"))?;
        Ok(())
    }

    pub async fn record_conversation_activity(
        &self,
        id: &str,
        activity_ms: u64,
    ) -> Result<bool, DomainError> {
        let result = sqlx::query(
            "UPDATE conversations SET message_count = message_count + 1, \
             last_activity_ms = MAX(last_activity_ms, ?) WHERE conversation_id = ?",
        )
        .bind(util::to_db_ms(activity_ms))
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|error| {
            DomainError::Storage(format!("failed to record conversation activity: {error}"))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves a conversation from `from` to `to`; false when it was not in `from`.
    pub async fn transition_conversation_status(
        &self,
        id: &str,
        from: ConversationStatus,
        to: ConversationStatus,
    ) -> Result<bool, DomainError> {
        let result = sqlx::query(
            "UPDATE conversations SET status = ? WHERE conversation_id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .execute(self.pool())
        .await
        .map_err(|error| {
            DomainError::Storage(format!("failed to update conversation status: {error}"))
        })?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_conversations(&self) -> Result<u64, DomainError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations")
            .fetch_one(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to count conversations: {error}"))
            })?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn map_conversation_row(row: ConversationRow) -> Result<ConversationRecord, DomainError> {
    let (
        id,
        customer_id,
        thread_key,
        channel,
        status,
        tags_json,
        metadata_json,
        message_count,
        created_at_ms,
        last_activity_ms,
    ) = row;
    let channel = Channel::parse(&channel)
        .ok_or_else(|| DomainError::Storage(format!("unknown channel in store: {channel}")))?;
    let status = ConversationStatus::parse(&status).ok_or_else(|| {
        DomainError::Storage(format!("unknown conversation status in store: {status}"))
    })?;
    let tags = util::from_json_text::<Vec<String>>(&tags_json).map_err(DomainError::Storage)?;
    let metadata = util::json_text_to_value(&metadata_json).map_err(DomainError::Storage)?;

    Ok(ConversationRecord {
        id,
        customer_id,
        thread_key,
        channel,
        status,
        tags,
        metadata,
        message_count: u64::try_from(message_count).unwrap_or(0),
        created_at_ms: util::from_db_ms(created_at_ms),
        last_activity_ms: util::from_db_ms(last_activity_ms),
    })
}
