mod conversation_store;
mod customer_store;
mod message_store;
mod migrations;
mod sqlite_store;
mod util;

pub use customer_store::IdentityProbe;
pub use sqlite_store::SqliteStore;
pub(crate) use util::now_unix_ms;
