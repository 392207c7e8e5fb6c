use crate::{
    domain::{
        error::DomainError,
        models::{Channel, Direction, MessageRecord, MessageStatus},
    },
    storage::{SqliteStore, util},
};

type MessageRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<String>,
    String,
    String,
    String,
    i64,
);

const MESSAGE_COLUMNS: &str = "message_id, provider_message_id, provider_id, customer_id, conversation_id, channel, direction, from_identifier, to_identifier, thread_key, timestamp_ms, body, status, message_hash, metadata_json, created_at_ms";

impl SqliteStore {
    /// Inserts a message; `DomainError::Conflict` when the
    /// `(provider_id, provider_message_id)` pair was already stored.
    pub async fn insert_message(&self, message: &MessageRecord) -> Result<(), DomainError> {
        let metadata_json =
            util::value_to_json_text(&message.metadata).map_err(DomainError::Storage)?;

        sqlx::query(
            "INSERT INTO messages(message_id, provider_message_id, provider_id, customer_id, conversation_id, channel, direction, from_identifier, to_identifier, thread_key, timestamp_ms, body, status, message_hash, metadata_json, created_at_ms) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.provider_message_id)
        .bind(&message.provider_id)
        .bind(&message.customer_id)
        .bind(&message.conversation_id)
        .bind(message.channel.as_str())
        .bind(message.direction.as_str())
        .bind(&message.from_identifier)
        .bind(&message.to_identifier)
        .bind(&message.thread_key)
        .bind(util::to_db_ms(message.timestamp_ms))
        .bind(&message.body)
        .bind(message.status.as_str())
        .bind(&message.message_hash)
        .bind(metadata_json)
        .bind(util::to_db_ms(message.created_at_ms))
        .execute(self.pool())
        .await
        .map_err(|error| util::write_error(error, "failed to insert message"))?;
        Ok(())
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DomainError> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ? LIMIT 1");
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to get message: {error}")))?;

        row.map(map_message_row).transpose()
    }

    pub async fn find_message_by_provider_id(
        &self,
        provider_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<MessageRecord>, DomainError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE provider_id = ? AND provider_message_id = ? LIMIT 1"
        );
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(provider_id)
            .bind(provider_message_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to find message by provider id: {error}"))
            })?;

        row.map(map_message_row).transpose()
    }

    pub async fn find_message_by_hash(
        &self,
        message_hash: &str,
        window_start_ms: u64,
        window_end_ms: u64,
    ) -> Result<Option<MessageRecord>, DomainError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE message_hash = ? AND timestamp_ms BETWEEN ? AND ? \
             ORDER BY timestamp_ms DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(message_hash)
            .bind(util::to_db_ms(window_start_ms))
            .bind(util::to_db_ms(window_end_ms))
            .fetch_optional(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to find message by hash: {error}"))
            })?;

        row.map(map_message_row).transpose()
    }

    /// Messages exchanged between two identifiers in either direction.
    pub async fn list_messages_between(
        &self,
        first: &str,
        second: &str,
        window_start_ms: u64,
        window_end_ms: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DomainError> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE ((from_identifier = ? AND to_identifier = ?) OR (from_identifier = ? AND to_identifier = ?)) \
             AND timestamp_ms BETWEEN ? AND ? \
             ORDER BY timestamp_ms DESC LIMIT {limit}"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(first)
            .bind(second)
            .bind(second)
            .bind(first)
            .bind(util::to_db_ms(window_start_ms))
            .bind(util::to_db_ms(window_end_ms))
            .fetch_all(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to list messages between contacts: {error}"))
            })?;

        rows.into_iter().map(map_message_row).collect()
    }

    pub async fn list_conversation_message_ids(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, DomainError> {
        let query = format!(
            "SELECT message_id FROM messages WHERE conversation_id = ? \
             ORDER BY timestamp_ms DESC LIMIT {limit}"
        );
        sqlx::query_scalar::<_, String>(&query)
            .bind(conversation_id)
            .fetch_all(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to list conversation messages: {error}"))
            })
    }

    /// Moves a message to `conversation_id`: the old assignment is cleared,
    /// the new one is written, counters and the message status follow, all in
    /// one transaction.
    pub async fn reassign_message(
        &self,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<MessageRecord, DomainError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|error| DomainError::Storage(format!("failed to start tx: {error}")))?;

        let current = sqlx::query_as::<_, (Option<String>, i64)>(
            "SELECT conversation_id, timestamp_ms FROM messages WHERE message_id = ? LIMIT 1",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| DomainError::Storage(format!("failed to read message: {error}")))?;
        let Some((previous, timestamp_ms)) = current else {
            return Err(DomainError::NotFound(format!("message not found: {message_id}")));
        };

        if let Some(previous) = previous.as_deref()
            && previous != conversation_id
        {
            sqlx::query(
                "UPDATE conversations SET message_count = MAX(message_count - 1, 0) WHERE conversation_id = ?",
            )
            .bind(previous)
            .execute(&mut *tx)
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to release old assignment: {error}"))
            })?;
        }

        let updated = sqlx::query(
            "UPDATE conversations SET message_count = message_count + 1, \
             last_activity_ms = MAX(last_activity_ms, ?) WHERE conversation_id = ?",
        )
        .bind(timestamp_ms)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await
        .map_err(|error| DomainError::Storage(format!("failed to assign conversation: {error}")))?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::NotFound(format!(
                "conversation not found: {conversation_id}"
            )));
        }

        sqlx::query("UPDATE messages SET conversation_id = ?, status = ? WHERE message_id = ?")
            .bind(conversation_id)
            .bind(MessageStatus::Processed.as_str())
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(|error| DomainError::Storage(format!("failed to update message: {error}")))?;

        tx.commit()
            .await
            .map_err(|error| DomainError::Storage(format!("failed to commit tx: {error}")))?;

        self.get_message(message_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("message not found: {message_id}")))
    }

    pub async fn count_messages(&self) -> Result<u64, DomainError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to count messages: {error}")))?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn map_message_row(row: MessageRow) -> Result<MessageRecord, DomainError> {
    let (
        id,
        provider_message_id,
        provider_id,
        customer_id,
        conversation_id,
        channel,
        direction,
        from_identifier,
        to_identifier,
        thread_key,
        timestamp_ms,
        body,
        status,
        message_hash,
        metadata_json,
        created_at_ms,
    ) = row;
    let channel = Channel::parse(&channel)
        .ok_or_else(|| DomainError::Storage(format!("unknown channel in store: {channel}")))?;
    let direction = Direction::parse(&direction)
        .ok_or_else(|| DomainError::Storage(format!("unknown direction in store: {direction}")))?;
    let status = MessageStatus::parse(&status)
        .ok_or_else(|| DomainError::Storage(format!("unknown message status in store: {status}")))?;
    let metadata = util::json_text_to_value(&metadata_json).map_err(DomainError::Storage)?;

    Ok(MessageRecord {
        id,
        provider_message_id,
        provider_id,
        customer_id,
        conversation_id,
        channel,
        direction,
        from_identifier,
        to_identifier,
        thread_key,
        timestamp_ms: util::from_db_ms(timestamp_ms),
        body,
        status,
        message_hash,
        metadata,
        created_at_ms: util::from_db_ms(created_at_ms),
    })
}
