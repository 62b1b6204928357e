use std::fmt;
use std::sync::Arc;

/// One candidate request payload.
///
/// The bytes are shared and never modified after construction, so cloning an
/// `Input` is cheap and a worker can keep its copy while the corpus keeps
/// another. Mutators always build a fresh `Input` from a scratch buffer.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Input {
    bytes: Arc<[u8]>,
}

impl Input {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Copies the payload into an owned buffer for mutation.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl From<Vec<u8>> for Input {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Input {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes)
    }
}

impl From<&str> for Input {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes())
    }
}

impl AsRef<[u8]> for Input {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Input({:?})", String::from_utf8_lossy(&self.bytes))
    }
}
