//! 内容哈希
//!
//! 缓存的唯一身份：对原始字节做 SHA-256，与文件名、上传时间无关

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display};

/// 原始内容的 SHA-256 摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// 计算原始字节的哈希
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// 日志用的短前缀
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| format!("非法哈希 {}: {}", value, e))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("哈希长度错误: {}", value))?;
        Ok(Self(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_bytes_same_hash() {
        let a = ContentHash::of(b"student answer page 1");
        let b = ContentHash::of(b"student answer page 1");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn test_single_byte_difference() {
        let a = ContentHash::of(b"page-1");
        let b = ContentHash::of(b"page-2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_roundtrip_rejects_garbage() {
        let hash = ContentHash::of(b"x");
        let parsed = ContentHash::try_from(hash.to_hex()).unwrap();
        assert_eq!(parsed, hash);
        assert!(ContentHash::try_from("abcd".to_string()).is_err());
        assert!(ContentHash::try_from("zz".repeat(32)).is_err());
    }
}
