//! Common utilities and types shared across Switchyard crates.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, HS256 verification, user claims)
pub mod jwt;
