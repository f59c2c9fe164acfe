use core::fmt;
use std::sync::Arc;

use crate::error::RnsError;

/// Copy-on-write byte container. Clones share storage; any mutation first
/// obtains exclusive ownership, so concurrent readers of a shared handle
/// never observe a partial write.
#[derive(Clone, Default)]
pub struct Bytes {
    data: Arc<Vec<u8>>,
}

impl Bytes {
    pub fn new() -> Self {
        Self { data: Arc::new(Vec::new()) }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self { data: Arc::new(data.to_vec()) }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: Arc::new(data) }
    }

    pub fn from_hex(hex_string: &str) -> Result<Self, RnsError> {
        let decoded = hex::decode(hex_string).map_err(|_| RnsError::InvalidArgument)?;
        Ok(Self::from_vec(decoded))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// True when this handle shares storage with at least one other handle.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    pub fn append(&mut self, data: &[u8]) {
        Arc::make_mut(&mut self.data).extend_from_slice(data);
    }

    pub fn resize(&mut self, len: usize) {
        Arc::make_mut(&mut self.data).resize(len, 0);
    }

    /// Exclusive region of at least `n` contiguous bytes at the start of the
    /// buffer, growing it if needed. Detaches from shared storage first.
    pub fn writable(&mut self, n: usize) -> &mut [u8] {
        let storage = Arc::make_mut(&mut self.data);
        if storage.len() < n {
            storage.resize(n, 0);
        }
        &mut storage[..]
    }

    pub fn left(&self, n: usize) -> Bytes {
        let end = n.min(self.data.len());
        Self::from_slice(&self.data[..end])
    }

    pub fn mid(&self, offset: usize, len: usize) -> Bytes {
        let start = offset.min(self.data.len());
        let end = (offset + len).min(self.data.len());
        Self::from_slice(&self.data[start..end])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.data.as_slice())
    }
}

impl PartialEq for Bytes {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Bytes {}

impl From<&[u8]> for Bytes {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes[{}]({})", self.len(), self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::Bytes;

    #[test]
    fn shared_handle_is_unchanged_by_writable_mutation() {
        let mut original = Bytes::from_slice(b"\x01\x02\x03");
        let shared = original.clone();
        assert!(original.is_shared());

        original.writable(3)[0] = 0xff;

        assert_eq!(shared.as_slice(), b"\x01\x02\x03");
        assert_eq!(original.as_slice(), b"\xff\x02\x03");
        assert!(!original.is_shared());
    }

    #[test]
    fn shared_handle_is_unchanged_by_append() {
        let mut original = Bytes::from_slice(b"ab");
        let shared = original.clone();

        original.append(b"cd");

        assert_eq!(shared.as_slice(), b"ab");
        assert_eq!(original.as_slice(), b"abcd");
    }

    #[test]
    fn append_is_associative() {
        let mut split = Bytes::new();
        split.append(b"head");
        split.append(b"tail");

        let mut joined = Bytes::new();
        joined.append(b"headtail");

        assert_eq!(split, joined);
    }

    #[test]
    fn hex_roundtrip() {
        let original = Bytes::from_slice(&[0x00, 0x7f, 0xff, 0x10]);
        let restored = Bytes::from_hex(&original.to_hex()).expect("valid hex");
        assert_eq!(restored, original);
    }

    #[test]
    fn left_and_mid_views() {
        let bytes = Bytes::from_slice(b"abcdef");
        assert_eq!(bytes.left(3).as_slice(), b"abc");
        assert_eq!(bytes.mid(2, 3).as_slice(), b"cde");
        assert_eq!(bytes.mid(4, 10).as_slice(), b"ef");
        assert_eq!(bytes.left(10).as_slice(), b"abcdef");
    }

    #[test]
    fn writable_grows_buffer() {
        let mut bytes = Bytes::from_slice(b"ab");
        let region = bytes.writable(4);
        assert!(region.len() >= 4);
        region[3] = 0x7a;
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes.as_slice()[3], 0x7a);
    }
}
