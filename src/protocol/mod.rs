mod errors;

pub use errors::{ERROR_UNAUTHORIZED, ERROR_UNAVAILABLE, ErrorShape};
