use std::fmt;
use std::ops::{Deref, Index, IndexMut};
use std::sync::Arc;

use bytes::Bytes;

/// Byte container with shared ownership of its backing storage and
/// copy-on-write mutation.
///
/// Cloning is cheap (a reference-count bump). The first mutating call on a
/// shared buffer copies the storage, so slices returned by [`data`] are only
/// valid until the next mutation.
///
/// [`data`]: CopyOnWriteBuffer::data
#[derive(Clone, Default)]
pub struct CopyOnWriteBuffer {
    data: Arc<Vec<u8>>,
}

impl CopyOnWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Arc::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            data: Arc::new(slice.to_vec()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the contents, copying the storage first if shared.
    pub fn data_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Replaces the contents with a copy of `slice`.
    pub fn assign(&mut self, slice: &[u8]) {
        let v = Arc::make_mut(&mut self.data);
        v.clear();
        v.extend_from_slice(slice);
    }

    pub fn append(&mut self, slice: &[u8]) {
        Arc::make_mut(&mut self.data).extend_from_slice(slice);
    }

    pub fn push(&mut self, byte: u8) {
        Arc::make_mut(&mut self.data).push(byte);
    }

    /// Grows capacity to at least `capacity`; never shrinks.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        let v = Arc::make_mut(&mut self.data);
        if capacity > v.capacity() {
            v.reserve(capacity - v.len());
        }
    }

    /// Resizes to `size`, zero-filling any new tail bytes.
    pub fn resize(&mut self, size: usize) {
        Arc::make_mut(&mut self.data).resize(size, 0);
    }

    pub fn truncate(&mut self, size: usize) {
        Arc::make_mut(&mut self.data).truncate(size);
    }

    pub fn clear(&mut self) {
        Arc::make_mut(&mut self.data).clear();
    }

    pub fn into_vec(self) -> Vec<u8> {
        match Arc::try_unwrap(self.data) {
            Ok(v) => v,
            Err(shared) => shared.as_ref().clone(),
        }
    }

    /// True when no other handle shares the backing storage.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }
}

impl Deref for CopyOnWriteBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Index<usize> for CopyOnWriteBuffer {
    type Output = u8;

    fn index(&self, index: usize) -> &u8 {
        &self.data[index]
    }
}

impl IndexMut<usize> for CopyOnWriteBuffer {
    fn index_mut(&mut self, index: usize) -> &mut u8 {
        &mut Arc::make_mut(&mut self.data)[index]
    }
}

impl PartialEq for CopyOnWriteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl Eq for CopyOnWriteBuffer {}

impl fmt::Debug for CopyOnWriteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CopyOnWriteBuffer(len={})", self.len())
    }
}

impl From<Vec<u8>> for CopyOnWriteBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self { data: Arc::new(v) }
    }
}

impl From<&[u8]> for CopyOnWriteBuffer {
    fn from(s: &[u8]) -> Self {
        Self::from_slice(s)
    }
}

impl AsRef<[u8]> for CopyOnWriteBuffer {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

impl From<Bytes> for CopyOnWriteBuffer {
    fn from(bytes: Bytes) -> Self {
        Self::from_slice(&bytes)
    }
}

impl From<CopyOnWriteBuffer> for Bytes {
    fn from(buffer: CopyOnWriteBuffer) -> Bytes {
        Bytes::from(buffer.into_vec())
    }
}
