//! Testing utilities and mock implementations
//!
//! This module provides an in-memory bus and a recording sink for exercising
//! the connection lifecycle without a running broker.

pub mod mocks;

pub use mocks::*;
