//! Structured writer capability used to assemble defender reports
//!
//! The report builder and the metrics collectors only see the
//! [`StructuredWriter`] trait: nested maps and arrays with explicit
//! open/close, plus text and unsigned integer scalars. [`CborWriter`] is the
//! wire implementation and encodes into a fixed, caller-owned buffer.

pub mod cbor;

pub use cbor::CborWriter;

use thiserror::Error;

/// Encoding failures surfaced by a [`StructuredWriter`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("Insufficient buffer space: needed {needed} bytes, {available} available")]
    InsufficientSpace { needed: usize, available: usize },
    #[error("Container closed while none was open")]
    UnbalancedClose,
    #[error("Container declared {declared} items but {written} were written")]
    LengthMismatch { declared: usize, written: usize },
    #[error("Map closed with an odd number of items ({0})")]
    OddMapEntries(usize),
    #[error("{0} container(s) left open")]
    UnclosedContainers(usize),
    #[error("Scalar encoding failed: {0}")]
    Scalar(String),
    #[error("Metrics collector '{metric}' failed: {reason}")]
    Collector { metric: &'static str, reason: String },
}

impl EncodeError {
    /// Create a collector failure for the given metric key
    pub fn collector<S: Into<String>>(metric: &'static str, reason: S) -> Self {
        Self::Collector {
            metric,
            reason: reason.into(),
        }
    }
}

/// Nested map/array encoder with explicit container framing
///
/// Every `begin_*` must be paired with an [`end_container`](Self::end_container)
/// in reverse order. `len` of `None` opens an indefinite-length container.
pub trait StructuredWriter {
    fn begin_map(&mut self, len: Option<usize>) -> Result<(), EncodeError>;

    fn begin_array(&mut self, len: Option<usize>) -> Result<(), EncodeError>;

    fn end_container(&mut self) -> Result<(), EncodeError>;

    fn write_text(&mut self, value: &str) -> Result<(), EncodeError>;

    fn write_uint(&mut self, value: u64) -> Result<(), EncodeError>;

    /// Number of currently open containers
    fn depth(&self) -> usize;

    /// Write a `key: text` map entry
    fn write_text_entry(&mut self, key: &str, value: &str) -> Result<(), EncodeError> {
        self.write_text(key)?;
        self.write_text(value)
    }

    /// Write a `key: uint` map entry
    fn write_uint_entry(&mut self, key: &str, value: u64) -> Result<(), EncodeError> {
        self.write_text(key)?;
        self.write_uint(value)
    }
}
