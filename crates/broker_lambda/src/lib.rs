//! AWS-oriented adapters and handlers for the device broker.
//!
//! This crate owns runtime integration details: Lambda handlers, the adapter
//! traits with their in-memory and IoT-backed implementations, and a single
//! runtime module boundary for the `broker_core` primitives.

pub mod adapters;
pub mod handlers;
pub mod runtime;
