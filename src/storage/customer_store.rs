use crate::{
    domain::{
        error::DomainError,
        models::{ContactType, CustomerRecord, IdentityRecord},
    },
    storage::{SqliteStore, util},
};

type IdentityRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    i64,
);

type CustomerRow = (String, Option<String>, String, i64, i64);

const IDENTITY_COLUMNS: &str = "identity_id, customer_id, identity_type, normalized_value, raw_value, provider, verified, created_at_ms, last_seen_ms";

/// Lookup key for identities that may belong to the same person without
/// sharing an exact normalized value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityProbe {
    /// Trailing subscriber digits of a phone number.
    PhoneSuffix(String),
    /// Mailbox name before the `@`.
    EmailLocalPart(String),
    /// Handle with `.`, `_` and `-` removed.
    SocialHandle(String),
}

impl SqliteStore {
    pub async fn get_customer(&self, id: &str) -> Result<Option<CustomerRecord>, DomainError> {
        let row = sqlx::query_as::<_, CustomerRow>(
            "SELECT customer_id, display_name, metadata_json, created_at_ms, updated_at_ms \
             FROM customers WHERE customer_id = ? LIMIT 1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to get customer: {error}")))?;

        row.map(map_customer_row).transpose()
    }

    /// Creates a customer and its first identity in one transaction.
    ///
    /// Returns `DomainError::Conflict` when another writer already owns the
    /// identity; nothing is persisted in that case.
    pub async fn insert_customer_with_identity(
        &self,
        customer: &CustomerRecord,
        identity: &IdentityRecord,
    ) -> Result<(), DomainError> {
        let metadata_json =
            util::value_to_json_text(&customer.metadata).map_err(DomainError::Storage)?;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|error| DomainError::Storage(format!("failed to start tx: {error}")))?;

        sqlx::query(
            "INSERT INTO customers(customer_id, display_name, metadata_json, created_at_ms, updated_at_ms) \
             VALUES(?, ?, ?, ?, ?)",
        )
        .bind(&customer.id)
        .bind(&customer.display_name)
        .bind(metadata_json)
        .bind(util::to_db_ms(customer.created_at_ms))
        .bind(util::to_db_ms(customer.updated_at_ms))
        .execute(&mut *tx)
        .await
        .map_err(|error| util::write_error(error, "failed to insert customer"))?;

        bind_identity_insert(identity)
            .execute(&mut *tx)
            .await
            .map_err(|error| util::write_error(error, "failed to insert identity"))?;

        tx.commit()
            .await
            .map_err(|error| util::write_error(error, "failed to commit tx"))?;
        Ok(())
    }

    pub async fn insert_identity(&self, identity: &IdentityRecord) -> Result<(), DomainError> {
        bind_identity_insert(identity)
            .execute(self.pool())
            .await
            .map_err(|error| util::write_error(error, "failed to insert identity"))?;
        Ok(())
    }

    pub async fn find_identity(
        &self,
        identity_type: ContactType,
        normalized_value: &str,
    ) -> Result<Option<IdentityRecord>, DomainError> {
        let query = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE identity_type = ? AND normalized_value = ? LIMIT 1"
        );
        let row = sqlx::query_as::<_, IdentityRow>(&query)
            .bind(identity_type.as_str())
            .bind(normalized_value)
            .fetch_optional(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to find identity: {error}")))?;

        row.map(map_identity_row).transpose()
    }

    pub async fn find_potential_identity_matches(
        &self,
        identity_type: ContactType,
        probe: &IdentityProbe,
        exclude_value: &str,
        limit: usize,
    ) -> Result<Vec<IdentityRecord>, DomainError> {
        let (predicate, argument) = match probe {
            IdentityProbe::PhoneSuffix(suffix) => (
                "normalized_value LIKE ? ESCAPE '\\'",
                format!("%{}", escape_like(suffix)),
            ),
            IdentityProbe::EmailLocalPart(local) => (
                "normalized_value LIKE ? ESCAPE '\\'",
                format!("{}@%", escape_like(local)),
            ),
            IdentityProbe::SocialHandle(handle) => (
                "REPLACE(REPLACE(REPLACE(normalized_value, '.', ''), '_', ''), '-', '') = ?",
                handle.clone(),
            ),
        };

        let query = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities \
             WHERE identity_type = ? AND normalized_value != ? AND {predicate} \
             ORDER BY last_seen_ms DESC LIMIT {limit}"
        );
        let rows = sqlx::query_as::<_, IdentityRow>(&query)
            .bind(identity_type.as_str())
            .bind(exclude_value)
            .bind(argument)
            .fetch_all(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to find potential identity matches: {error}"))
            })?;

        rows.into_iter().map(map_identity_row).collect()
    }

    pub async fn touch_identity(&self, identity_id: &str, seen_at_ms: u64) -> Result<(), DomainError> {
        sqlx::query("UPDATE identities SET last_seen_ms = MAX(last_seen_ms, ?) WHERE identity_id = ?")
            .bind(util::to_db_ms(seen_at_ms))
            .bind(identity_id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to touch identity: {error}")))?;
        Ok(())
    }

    pub async fn count_customers(&self) -> Result<u64, DomainError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM customers")
            .fetch_one(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to count customers: {error}")))?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn count_identities(&self) -> Result<u64, DomainError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM identities")
            .fetch_one(self.pool())
            .await
            .map_err(|error| {
                DomainError::Storage(format!("failed to count identities: {error}"))
            })?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn bind_identity_insert<'q>(
    identity: &'q IdentityRecord,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(
        "INSERT INTO identities(identity_id, customer_id, identity_type, normalized_value, raw_value, provider, verified, created_at_ms, last_seen_ms) \
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&identity.id)
    .bind(&identity.customer_id)
    .bind(identity.identity_type.as_str())
    .bind(&identity.normalized_value)
    .bind(&identity.raw_value)
    .bind(&identity.provider)
    .bind(if identity.verified { 1_i64 } else { 0_i64 })
    .bind(util::to_db_ms(identity.created_at_ms))
    .bind(util::to_db_ms(identity.last_seen_ms))
}

fn map_identity_row(row: IdentityRow) -> Result<IdentityRecord, DomainError> {
    let (
        id,
        customer_id,
        identity_type,
        normalized_value,
        raw_value,
        provider,
        verified,
        created_at_ms,
        last_seen_ms,
    ) = row;
    let identity_type = ContactType::parse(&identity_type).ok_or_else(|| {
        DomainError::Storage(format!("unknown identity type in store: {identity_type}"))
    })?;

    Ok(IdentityRecord {
        id,
        customer_id,
        identity_type,
        normalized_value,
        raw_value,
        provider,
        verified: verified != 0,
        created_at_ms: util::from_db_ms(created_at_ms),
        last_seen_ms: util::from_db_ms(last_seen_ms),
    })
}

fn map_customer_row(row: CustomerRow) -> Result<CustomerRecord, DomainError> {
    let (id, display_name, metadata_json, created_at_ms, updated_at_ms) = row;
    let metadata = util::json_text_to_value(&metadata_json).map_err(DomainError::Storage)?;
    Ok(CustomerRecord {
        id,
        display_name,
        metadata,
        created_at_ms: util::from_db_ms(created_at_ms),
        updated_at_ms: util::from_db_ms(updated_at_ms),
    })
}

/// Makes `%`, `_` and `\` in `value` match themselves under `ESCAPE '\'`.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
