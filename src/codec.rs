//! Versioned binary codec of wire frames and trace records.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::pid::ProcessId;
use crate::error::CodecError;

/// Version byte prepended to every encoded value.
pub const CODEC_VERSION: u8 = 1;

////////////////////////////////////////////////////////////////////////////////

/// Encodes values with `bincode` behind a version byte.
///
/// Process ids read back from traces may carry class tags renamed
/// by the substitution table.
#[derive(Clone, Debug, Default)]
pub struct Codec {
    substitutions: BTreeMap<String, String>,
}

impl Codec {
    /// Create codec with the given class substitutions.
    pub fn new(substitutions: BTreeMap<String, String>) -> Self {
        Self { substitutions }
    }

    /// Encoded size of the value including the version byte.
    pub fn encoded_size<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize, CodecError> {
        bincode::serialized_size(value)
            .map(|size| size as usize + 1)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Encodes value into the buffer, failing if the result exceeds `limit` bytes.
    pub fn encode_into<T: Serialize + ?Sized>(
        &self,
        value: &T,
        buffer: &mut Vec<u8>,
        limit: usize,
    ) -> Result<(), CodecError> {
        let size = self.encoded_size(value)?;
        if size > limit {
            return Err(CodecError::TooBig { size, limit });
        }
        buffer.clear();
        buffer.push(CODEC_VERSION);
        bincode::serialize_into(&mut *buffer, value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Encodes value into a new vector.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut buffer = Vec::new();
        self.encode_into(value, &mut buffer, usize::MAX)?;
        Ok(buffer)
    }

    /// Decodes value, checking the version byte.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match bytes.split_first() {
            None => Err(CodecError::Decode("empty input".to_owned())),
            Some((&CODEC_VERSION, rest)) => {
                bincode::deserialize(rest).map_err(|e| CodecError::Decode(e.to_string()))
            }
            Some((&version, _)) => Err(CodecError::Version(version)),
        }
    }

    /// Class tag after substitution.
    pub fn substitute_class<'a>(&'a self, class: &'a str) -> &'a str {
        self.substitutions
            .get(class)
            .map(String::as_str)
            .unwrap_or(class)
    }

    /// Process id with substituted class tag.
    pub fn substitute_pid(&self, pid: ProcessId) -> ProcessId {
        match self.substitutions.get(pid.class()) {
            Some(class) => pid.with_class(class),
            None => pid,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Pool of serialization buffers of fixed capacity.
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
    capacity: usize,
}

impl BufferPool {
    /// Create empty pool of buffers with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Capacity of each buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes buffer from the pool, allocating one if the pool is empty.
    /// The buffer returns to the pool when dropped.
    pub fn checkout(&self) -> PooledBuffer {
        let buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity));
        PooledBuffer {
            buffer,
            pool: self.free.clone(),
        }
    }

    /// Number of buffers waiting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Buffer checked out from [`BufferPool`].
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        self.pool.lock().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{BufferPool, Codec, CODEC_VERSION};
    use crate::common::command::{Body, Command, Content, Packet, WireFrame};
    use crate::common::pid::ProcessId;
    use crate::error::CodecError;

    fn frame() -> WireFrame {
        WireFrame {
            src: Some(ProcessId::create("Ping", "h", vec![1], "p", "n")),
            dst: None,
            content: Content::Process(Packet::new(Command::End, Body::End { code: 3 })),
        }
    }

    #[test]
    fn version_byte_is_checked() {
        let codec = Codec::default();
        let mut bytes = codec.encode(&frame()).unwrap();
        assert_eq!(bytes[0], CODEC_VERSION);
        assert_eq!(codec.decode::<WireFrame>(&bytes).unwrap(), frame());

        bytes[0] = CODEC_VERSION + 1;
        assert!(matches!(
            codec.decode::<WireFrame>(&bytes),
            Err(CodecError::Version(_))
        ));
        assert!(codec.decode::<WireFrame>(&[]).is_err());
    }

    #[test]
    fn size_limit() {
        let codec = Codec::default();
        let size = codec.encoded_size(&frame()).unwrap();
        let mut buffer = Vec::new();
        assert!(codec.encode_into(&frame(), &mut buffer, size).is_ok());
        assert_eq!(buffer.len(), size);
        assert!(matches!(
            codec.encode_into(&frame(), &mut buffer, size - 1),
            Err(CodecError::TooBig { .. })
        ));
    }

    #[test]
    fn class_substitution() {
        let mut substitutions = BTreeMap::new();
        substitutions.insert("Old".to_owned(), "New".to_owned());
        let codec = Codec::new(substitutions);

        let pid = ProcessId::create("Old", "h", vec![1], "p", "n");
        let substituted = codec.substitute_pid(pid.clone());
        assert_eq!(substituted.class(), "New");
        assert_eq!(substituted.uid(), pid.uid());
        assert_eq!(codec.substitute_class("Other"), "Other");
    }

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(64);
        {
            let mut buffer = pool.checkout();
            buffer.extend_from_slice(b"abc");
        }
        assert_eq!(pool.available(), 1);
        let buffer = pool.checkout();
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= 64);
        assert_eq!(pool.available(), 0);
    }
}
