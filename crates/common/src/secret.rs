//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for every sensitive value Switchyard
//! handles: the JWT signing secret, the Redis URL (it may embed a password)
//! and bearer tokens read from connection URLs.
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so a
//! struct that derives `Debug` while holding a secret is safe to log. Secrets
//! are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct BusSettings {
//!     channel_prefix: String,
//!     redis_url: SecretString,
//! }
//!
//! let settings = BusSettings {
//!     channel_prefix: "switchyard:".to_string(),
//!     redis_url: SecretString::from("redis://:hunter2@cache:6379"),
//! };
//!
//! // The URL (and its password) never reaches the log output.
//! assert!(!format!("{settings:?}").contains("hunter2"));
//!
//! // Access must be explicit.
//! let url: &str = settings.redis_url.expose_secret();
//! assert!(url.starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
