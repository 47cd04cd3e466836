//! State capture filter.
//!
//! Turns arbitrary framework state into a bounded, serialized snapshot that
//! can be attached to a span. Capture never fails: oversized state becomes a
//! truncation marker and unserializable state becomes a fixed placeholder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default byte limit for a captured snapshot.
pub const DEFAULT_MAX_STATE_SIZE: usize = 10_000;

/// Mime type recorded next to every snapshot.
pub const JSON_MIME_TYPE: &str = "application/json";

/// Converts a structural state value into bytes.
///
/// Implementations must be deterministic: the same value always yields the
/// same bytes, since the byte length decides truncation.
pub trait StateSerializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, String>;
}

/// Compact JSON through `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl StateSerializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, String> {
        serde_json::to_vec(value).map_err(|e| e.to_string())
    }
}

/// Stands in for state whose serialized size exceeds the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationMarker {
    pub truncated: bool,
    pub original_size: usize,
    pub limit: usize,
}

/// Result of a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateSnapshot {
    /// Serialized state, at most `limit` bytes.
    Captured(String),
    /// State was larger than the limit; no partial payload is kept.
    Truncated { original_size: usize, limit: usize },
    /// State could not be serialized.
    Unserializable { type_name: &'static str },
}

impl StateSnapshot {
    pub fn is_captured(&self) -> bool {
        matches!(self, StateSnapshot::Captured(_))
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, StateSnapshot::Truncated { .. })
    }

    /// The string recorded on the span.
    pub fn to_json(&self) -> String {
        match self {
            StateSnapshot::Captured(json) => json.clone(),
            StateSnapshot::Truncated {
                original_size,
                limit,
            } => serde_json::json!({
                "truncated": true,
                "original_size": original_size,
                "limit": limit,
            })
            .to_string(),
            StateSnapshot::Unserializable { type_name } => serde_json::json!({
                "_error": "serialization_failed",
                "_type": type_name,
            })
            .to_string(),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        JSON_MIME_TYPE
    }
}

/// Capture `state` with the default JSON serializer.
pub fn capture<S>(state: &S, max_bytes: usize) -> StateSnapshot
where
    S: Serialize + ?Sized,
{
    capture_with(&JsonSerializer, state, max_bytes)
}

/// Capture `state` through a caller-supplied serializer.
pub fn capture_with<S>(
    serializer: &dyn StateSerializer,
    state: &S,
    max_bytes: usize,
) -> StateSnapshot
where
    S: Serialize + ?Sized,
{
    let type_name = std::any::type_name::<S>();
    let value = match serde_json::to_value(state) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(type_name, error = %e, "State is not serializable");
            return StateSnapshot::Unserializable { type_name };
        }
    };

    let bytes = match serializer.serialize(&value) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(type_name, error = %e, "State serializer failed");
            return StateSnapshot::Unserializable { type_name };
        }
    };

    if bytes.len() > max_bytes {
        return StateSnapshot::Truncated {
            original_size: bytes.len(),
            limit: max_bytes,
        };
    }

    match String::from_utf8(bytes) {
        Ok(json) => StateSnapshot::Captured(json),
        Err(_) => StateSnapshot::Unserializable { type_name },
    }
}
