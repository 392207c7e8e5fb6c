pub mod application;
pub mod domain;
pub mod interfaces;
pub mod protocol;
pub mod security;
pub mod storage;
