//! Credential storage and lifecycle.

pub mod manager;
pub mod store;

pub use manager::TokenManager;
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
