//! Consumer service library crate.
//!
//! Exposes the service configuration, sample handlers, and the demo publisher
//! for the binary and integration tests.
pub mod config;
pub mod handlers;
pub mod publisher;
