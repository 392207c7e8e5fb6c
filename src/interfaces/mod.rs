pub mod http;
pub mod webhooks;
