//! Span 标识
//! Span identifiers
//!
//! 标识在导出记录中以小写十六进制字符串出现，并可从中解析回来
//! Identifiers appear as lowercase hex strings in exported records and parse
//! back from them

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 非全零的随机字节
/// Random bytes, never all zeros
fn random_bytes<const N: usize>() -> [u8; N] {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; N];
    while bytes.iter().all(|&b| b == 0) {
        rng.fill(&mut bytes[..]);
    }
    bytes
}

fn decode_hex<const N: usize>(kind: &str, raw: &str) -> Result<[u8; N], String> {
    if raw.len() != N * 2 {
        return Err(format!("{} must be {} hex characters, got {}", kind, N * 2, raw.len()));
    }
    let mut bytes = [0u8; N];
    hex::decode_to_slice(raw, &mut bytes).map_err(|e| format!("invalid {}: {}", kind, e))?;
    Ok(bytes)
}

macro_rules! hex_id {
    ($name:ident, $len:literal) => {
        impl $name {
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(raw: &str) -> Result<Self, String> {
                decode_hex::<$len>(stringify!($name), raw).map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::from_hex(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Trace ID - 16字节，同一根 Span 下的所有 Span 共享
/// Trace ID - 16 bytes, shared by every span under one root
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn new() -> Self {
        Self(random_bytes())
    }
}

hex_id!(TraceId, 16);

/// Span ID - 8字节
/// Span ID - 8 bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub fn new() -> Self {
        Self(random_bytes())
    }
}

hex_id!(SpanId, 8);

/// Span 引用 - 活动 Span 栈中的元素
/// Span reference - an entry of the active-span stack
///
/// 只携带标识，不持有 Span 本身；Span 由创建它的执行上下文独占
/// Carries identifiers only, never the Span itself; the Span stays owned by
/// the execution context that opened it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanRef {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanRef {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }

    /// 为子 Span 派生引用（同一 Trace，新 Span ID）
    /// Derive a reference for a child Span (same trace, fresh span id)
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::new(),
        }
    }

    /// 创建新的根引用
    /// Create a new root reference
    pub fn root() -> Self {
        Self {
            trace_id: TraceId::new(),
            span_id: SpanId::new(),
        }
    }
}

impl fmt::Display for SpanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trace_id, self.span_id)
    }
}
