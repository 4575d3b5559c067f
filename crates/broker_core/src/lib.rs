//! Shared device-broker domain primitives.
//!
//! This crate owns identity derivation, policy and shadow document semantics,
//! and the inbound event contracts. It intentionally excludes AWS SDK, Lambda
//! runtime, and async concerns; storage lives behind the adapter traits of
//! `broker_lambda`.

pub mod config;
pub mod contract;
pub mod error;
pub mod identity;
pub mod policy;
pub mod shadow;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
pub mod threshold;
