use bytes::Bytes;

/// Owned message payload exchanged with the engine.
///
/// Payloads are always copied in and copied out; the engine never borrows
/// caller memory past the call that hands it over.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteBuffer {
    data: Bytes,
}

impl ByteBuffer {
    /// Copy `bytes` into a new buffer.
    pub fn copy_in(bytes: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(bytes),
        }
    }

    /// Copy the buffer contents out into a fresh `Vec`.
    pub fn copy_out(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self { data: Bytes::from(v) }
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(v: &[u8]) -> Self {
        Self::copy_in(v)
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq<[u8]> for ByteBuffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.data.as_ref() == other
    }
}

impl PartialEq<&[u8]> for ByteBuffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self.data.as_ref() == *other
    }
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("len", &self.data.len())
            .field("data", &String::from_utf8_lossy(&self.data[..self.data.len().min(32)]))
            .finish()
    }
}
