//! # kasse-policy
//!
//! A TOML-driven retry and escalation policy for the Kasse coordinator.
//!
//! ## Overview
//!
//! This crate provides [`TomlRetryPolicy`], which implements the
//! [`RetryPolicy`](kasse_core::traits::RetryPolicy) trait.  Limits are
//! declared in a TOML file; every section is optional and falls back to the
//! defaults (3 attempts, 500 ms base backoff doubling up to 30 s, 5 s device
//! timeout, 60 s recovery sweep).
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::path::Path;
//! use kasse_policy::TomlRetryPolicy;
//!
//! let policy = TomlRetryPolicy::from_file(Path::new("policies/default.toml"))?;
//! let settings = policy.coordinator_settings();
//! // Pass `policy` and `settings` to `kasse_core::Coordinator::new(...)`.
//! ```

pub mod engine;
pub mod rule;

pub use engine::TomlRetryPolicy;
pub use rule::{DeviceSection, PolicyConfig, RecoverySection, RetrySection};

// ── Tests ─────────────────────────────────────────────────────────────────────
