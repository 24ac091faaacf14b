//! Message identifiers.
//!
//! MessageId は 64-bit の Snowflake 値を小文字 16 桁の hex にしたもの。
//! 固定長なので、バイト列の辞書順 = 生成順になる。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 16-byte message identifier.
///
/// # 特性
/// - 同じ generator からの ID は衝突しない
/// - 辞書順にソートすると生成順（ストアの走査順もこれに従う）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 16]);

const HEX: &[u8; 16] = b"0123456789abcdef";

impl MessageId {
    /// Encode a raw 64-bit snowflake value.
    pub fn from_u64(raw: u64) -> Self {
        let mut out = [0u8; 16];
        for (i, byte) in raw.to_be_bytes().iter().enumerate() {
            out[i * 2] = HEX[(byte >> 4) as usize];
            out[i * 2 + 1] = HEX[(byte & 0x0f) as usize];
        }
        Self(out)
    }

    /// Decode back into the snowflake value.
    pub fn as_u64(&self) -> u64 {
        // 構築時に hex であることが保証されている
        u64::from_str_radix(self.as_str(), 16).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// Parse a store key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidMessageId> {
        let s = std::str::from_utf8(bytes).map_err(|_| InvalidMessageId(format!("{bytes:?}")))?;
        s.parse()
    }
}

/// Returned when a string is not a 16-char lower-case hex id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message id: {0}")]
pub struct InvalidMessageId(pub String);

impl FromStr for MessageId {
    type Err = InvalidMessageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 16 || !bytes.iter().all(|b| HEX.contains(b)) {
            return Err(InvalidMessageId(s.to_string()));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding_is_fixed_width() {
        let id = MessageId::from_u64(0x1f);
        assert_eq!(id.as_str(), "000000000000001f");
        assert_eq!(id.as_u64(), 0x1f);
    }

    #[test]
    fn byte_order_matches_numeric_order() {
        let a = MessageId::from_u64(0x0fff);
        let b = MessageId::from_u64(0x1000);
        assert!(a.as_bytes() < b.as_bytes());
        assert!(a < b);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("xyz".parse::<MessageId>().is_err());
        assert!("000000000000001F".parse::<MessageId>().is_err());
        assert!("000000000000001f".parse::<MessageId>().is_ok());
    }

    #[test]
    fn serde_uses_plain_string() {
        let id = MessageId::from_u64(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"000000000000002a\"");
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
