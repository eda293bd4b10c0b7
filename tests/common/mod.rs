//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory leader/follower cluster wired into a controller
//! - Polling helpers with a timeout
//! - Status and task listing shortcuts

pub mod harness;

pub use harness::*;
