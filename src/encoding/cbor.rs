//! CBOR implementation of [`StructuredWriter`] over a fixed buffer
//!
//! Scalars are encoded with `serde_cbor`; container framing is written here so
//! that nesting can be opened and closed incrementally by independent callers.
//! Running out of buffer is an ordinary error, never a panic.

use super::{EncodeError, StructuredWriter};
use serde::Serialize;

const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const INDEFINITE_ARRAY: u8 = 0x9f;
const INDEFINITE_MAP: u8 = 0xbf;
const BREAK: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerKind {
    Map,
    Array,
}

#[derive(Debug)]
struct Frame {
    kind: ContainerKind,
    declared: Option<usize>,
    items: usize,
}

/// Streaming CBOR encoder writing into a caller-owned buffer
pub struct CborWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
    stack: Vec<Frame>,
}

impl<'a> CborWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            len: 0,
            stack: Vec::new(),
        }
    }

    /// Bytes encoded so far
    pub fn bytes_written(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Complete the document, returning its encoded length
    ///
    /// Fails if any container is still open.
    pub fn finish(self) -> Result<usize, EncodeError> {
        if !self.stack.is_empty() {
            return Err(EncodeError::UnclosedContainers(self.stack.len()));
        }
        Ok(self.len)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let available = self.buf.len() - self.len;
        if bytes.len() > available {
            return Err(EncodeError::InsufficientSpace {
                needed: bytes.len(),
                available,
            });
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    fn count_item(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            frame.items += 1;
        }
    }

    fn encode_scalar<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
        serde_cbor::to_vec(value).map_err(|e| EncodeError::Scalar(e.to_string()))
    }

    /// Container head: the unsigned-integer encoding of `len` re-tagged with
    /// the container's major type, or the one-byte indefinite marker.
    fn container_head(kind: ContainerKind, len: Option<usize>) -> Result<Vec<u8>, EncodeError> {
        match (kind, len) {
            (ContainerKind::Map, None) => Ok(vec![INDEFINITE_MAP]),
            (ContainerKind::Array, None) => Ok(vec![INDEFINITE_ARRAY]),
            (kind, Some(n)) => {
                let major = match kind {
                    ContainerKind::Map => MAJOR_MAP,
                    ContainerKind::Array => MAJOR_ARRAY,
                };
                let mut head = Self::encode_scalar(&(n as u64))?;
                head[0] |= major << 5;
                Ok(head)
            }
        }
    }

    fn begin(&mut self, kind: ContainerKind, len: Option<usize>) -> Result<(), EncodeError> {
        let head = Self::container_head(kind, len)?;
        self.put(&head)?;
        self.count_item();
        self.stack.push(Frame {
            kind,
            declared: len,
            items: 0,
        });
        Ok(())
    }

    fn scalar<T: Serialize>(&mut self, value: &T) -> Result<(), EncodeError> {
        let bytes = Self::encode_scalar(value)?;
        self.put(&bytes)?;
        self.count_item();
        Ok(())
    }
}

impl StructuredWriter for CborWriter<'_> {
    fn begin_map(&mut self, len: Option<usize>) -> Result<(), EncodeError> {
        self.begin(ContainerKind::Map, len)
    }

    fn begin_array(&mut self, len: Option<usize>) -> Result<(), EncodeError> {
        self.begin(ContainerKind::Array, len)
    }

    fn end_container(&mut self) -> Result<(), EncodeError> {
        let frame = self.stack.pop().ok_or(EncodeError::UnbalancedClose)?;

        match frame.declared {
            Some(declared) => {
                let expected = match frame.kind {
                    ContainerKind::Map => declared * 2,
                    ContainerKind::Array => declared,
                };
                if frame.items != expected {
                    return Err(EncodeError::LengthMismatch {
                        declared: expected,
                        written: frame.items,
                    });
                }
                Ok(())
            }
            None => {
                if frame.kind == ContainerKind::Map && frame.items % 2 != 0 {
                    return Err(EncodeError::OddMapEntries(frame.items));
                }
                self.put(&[BREAK])
            }
        }
    }

    fn write_text(&mut self, value: &str) -> Result<(), EncodeError> {
        self.scalar(&value)
    }

    fn write_uint(&mut self, value: u64) -> Result<(), EncodeError> {
        self.scalar(&value)
    }

    fn depth(&self) -> usize {
        self.stack.len()
    }
}
