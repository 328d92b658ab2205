//! User authentication for the relay.
//!
//! Provides:
//! - Password hashing (PBKDF2-HMAC-SHA256, per-record salt, constant-time verify)
//! - Credential storage behind a trait (in-memory or SQLite)
//! - Stateless bearer tokens (HS256 JWT, 24h lifetime)
//!
//! ## Design Decisions
//! - Tokens are self-contained, so the session gateway needs no shared
//!   session table. The cost is that tokens cannot be revoked before expiry.
//! - Unknown users and wrong passwords are the same outcome to callers;
//!   verification of an unknown user still spends a full hash derivation.

pub mod password;
pub mod store;
pub mod token;

pub use password::PasswordHasher;
pub use store::{
    create_credential_store, CredentialError, CredentialStore, Credentials,
    MemoryCredentialStore, SqliteCredentialStore,
};
pub use token::{Claims, TokenError, TokenService};
