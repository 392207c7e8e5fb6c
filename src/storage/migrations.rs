use sqlx::{Executor, SqlitePool};

use crate::domain::error::DomainError;

pub async fn migrate(pool: &SqlitePool) -> Result<(), DomainError> {
    let migration = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS customers (
        customer_id TEXT PRIMARY KEY NOT NULL,
        display_name TEXT,
        metadata_json TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS identities (
        identity_id TEXT PRIMARY KEY NOT NULL,
        customer_id TEXT NOT NULL REFERENCES customers(customer_id),
        identity_type TEXT NOT NULL,
        normalized_value TEXT NOT NULL,
        raw_value TEXT NOT NULL,
        provider TEXT,
        verified INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        last_seen_ms INTEGER NOT NULL,
        UNIQUE(identity_type, normalized_value)
    );
    CREATE INDEX IF NOT EXISTS idx_identities_customer ON identities(customer_id);

    CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY NOT NULL,
        customer_id TEXT NOT NULL REFERENCES customers(customer_id),
        thread_key TEXT NOT NULL,
        channel TEXT NOT NULL,
        status TEXT NOT NULL,
        tags_json TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        message_count INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        last_activity_ms INTEGER NOT NULL,
        UNIQUE(customer_id, thread_key)
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_customer_activity
        ON conversations(customer_id, channel, status, last_activity_ms DESC);

    CREATE TABLE IF NOT EXISTS messages (
        message_id TEXT PRIMARY KEY NOT NULL,
        provider_message_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        customer_id TEXT,
        conversation_id TEXT,
        channel TEXT NOT NULL,
        direction TEXT NOT NULL,
        from_identifier TEXT NOT NULL,
        to_identifier TEXT NOT NULL,
        thread_key TEXT,
        timestamp_ms INTEGER NOT NULL,
        body TEXT,
        status TEXT NOT NULL,
        message_hash TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        UNIQUE(provider_id, provider_message_id)
    );
    CREATE INDEX IF NOT EXISTS idx_messages_hash_ts ON messages(message_hash, timestamp_ms);
    CREATE INDEX IF NOT EXISTS idx_messages_pair_ts ON messages(from_identifier, to_identifier, timestamp_ms);
    CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts ON messages(conversation_id, timestamp_ms DESC);
    "#;

    pool.execute(migration)
        .await
        .map_err(|error| DomainError::Storage(format!("migration failed: {error}")))?;

    Ok(())
}
