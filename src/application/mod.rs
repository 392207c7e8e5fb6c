pub mod config;
pub mod dedup;
pub mod identity;
pub mod idempotency;
pub mod jobs;
pub mod normalize;
pub mod pipeline;
pub mod startup;
pub mod state;
pub mod threading;
