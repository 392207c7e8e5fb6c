pub mod signature;

pub use signature::{SignatureScheme, SignatureVerifier, VerificationResult};
