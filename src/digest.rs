//! 成品内容摘要（SHA3-256）。

use serde::Serialize;
use sha3::{Digest, Sha3_256};

/// 返回给客户端用于端到端校验的摘要与大小。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentDigest {
    pub sha3_256: String,
    pub size: u64,
}

/// 边写边算的摘要累加器。
#[derive(Default)]
pub struct ContentHasher {
    hasher: Sha3_256,
    size: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.size += bytes.len() as u64;
    }

    pub fn finish(self) -> ContentDigest {
        ContentDigest {
            sha3_256: hex::encode(self.hasher.finalize()),
            size: self.size,
        }
    }
}

#[cfg(test)]
pub(crate) fn sha3_hex(bytes: &[u8]) -> String {
    hex::encode(Sha3_256::digest(bytes))
}
