//! Off-heap binary storage.
//!
//! Binary payloads above the inline limit live here, shared between heaps
//! behind an `Arc`. The bytes are immutable once constructed; sub-binaries
//! are windows `(offset, len)` into the same allocation, so a live window
//! keeps its parent's data alive through the shared reference count.

use core::fmt;

/// Immutable shared byte storage for reference-counted binaries.
#[derive(PartialEq, Eq, Hash)]
pub struct BinaryData {
    bytes: Box<[u8]>,
}

impl BinaryData {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes: bytes.into_boxed_slice() }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for BinaryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryData({} bytes)", self.len())
    }
}
