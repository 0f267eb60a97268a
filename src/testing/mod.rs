//! Testing utilities and mock implementations
//!
//! Scripted in-process doubles for the transport, the metrics collectors and
//! the report id source, so the agent can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
