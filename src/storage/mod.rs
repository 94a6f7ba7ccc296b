mod error;
pub mod memory_store;
pub mod sled_store;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::TimestampMs;

pub use self::error::StorageError;
pub use self::memory_store::MemoryOperationStore;
pub use self::sled_store::SledOperationStore;

/// Identifier of a pending operation. Allocated from a persisted counter, so
/// an id is never handed out twice by the same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(u64);

impl OperationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian key so that key order matches allocation order.
    pub(crate) fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub(crate) fn from_key(key: &[u8]) -> Result<Self, StorageError> {
        let bytes: [u8; 8] = key.try_into().map_err(|_| {
            StorageError::CorruptRecord(format!("operation key has {} bytes, expected 8", key.len()))
        })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

/// Opaque operation payload. The queue stores and hands back these bytes
/// without looking at them; only the handler for the operation's kind
/// knows how to read them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serialize `value` as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_vec(value).map(Self)
    }

    /// Read the payload back as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// Persisted record of an operation waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    /// Persisted kind tag, resolved to a typed kind at processing time.
    pub kind: String,
    pub payload: Payload,
    pub created_at: TimestampMs,
    pub attempts: u32,
    pub last_attempt: Option<TimestampMs>,
    pub error: Option<String>,
}

impl PendingOperation {
    pub fn new(id: OperationId, kind: impl Into<String>, payload: Payload, created_at: TimestampMs) -> Self {
        Self {
            id,
            kind: kind.into(),
            payload,
            created_at,
            attempts: 0,
            last_attempt: None,
            error: None,
        }
    }

    /// True once the entry has used up its retry budget.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Merge `patch` into this record. `attempts` never decreases.
    pub(crate) fn apply(&mut self, patch: &OperationPatch) {
        if let Some(attempts) = patch.attempts {
            if attempts >= self.attempts {
                self.attempts = attempts;
            } else {
                log::warn!(
                    "Ignoring attempt count {} for operation {}: already at {}",
                    attempts,
                    self.id,
                    self.attempts
                );
            }
        }
        if let Some(at) = patch.last_attempt {
            self.last_attempt = Some(at);
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
    }

    fn sort_key(&self) -> (TimestampMs, OperationId) {
        (self.created_at, self.id)
    }
}

/// Partial update of a pending operation. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationPatch {
    pub attempts: Option<u32>,
    pub last_attempt: Option<TimestampMs>,
    pub error: Option<String>,
}

impl OperationPatch {
    /// Patch recording one more failed attempt of `op`.
    pub fn failed_attempt(op: &PendingOperation, at: TimestampMs, error: impl Into<String>) -> Self {
        Self {
            attempts: Some(op.attempts.saturating_add(1)),
            last_attempt: Some(at),
            error: Some(error.into()),
        }
    }
}

/// Keyed storage of pending operations.
///
/// Every method is durable once it returns (for durable implementations),
/// and `update`/`remove` treat an unknown id as a no-op because the entry
/// may have been removed concurrently.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Persist a new entry with `attempts = 0` and return its fresh id.
    async fn enqueue(
        &self,
        kind: &str,
        payload: Payload,
        created_at: TimestampMs,
    ) -> Result<OperationId, StorageError>;

    /// Snapshot of every stored entry, ordered by `created_at` then `id`.
    async fn list_pending(&self) -> Result<Vec<PendingOperation>, StorageError>;

    async fn get(&self, id: OperationId) -> Result<Option<PendingOperation>, StorageError>;

    /// Number of stored entries, without decoding payloads.
    async fn count(&self) -> Result<usize, StorageError>;

    async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.count().await? == 0)
    }

    async fn update(&self, id: OperationId, patch: OperationPatch) -> Result<(), StorageError>;

    async fn remove(&self, id: OperationId) -> Result<(), StorageError>;

    /// Delete every entry. Id allocation is not reset.
    async fn clear(&self) -> Result<(), StorageError>;
}

pub(crate) fn sort_snapshot(ops: &mut [PendingOperation]) {
    ops.sort_by_key(PendingOperation::sort_key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_id_key_preserves_order_and_parses() {
        let a = OperationId::new(2);
        let b = OperationId::new(256);
        assert!(a.to_key() < b.to_key());
        assert_eq!(OperationId::from_key(&b.to_key()).unwrap(), b);
        assert!(OperationId::from_key(b"short").is_err());

        assert_eq!("256".parse::<OperationId>().unwrap(), b);
        assert_eq!(b.to_string(), "256");
    }

    #[test]
    fn payload_json_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Report {
            slope: String,
            danger: u8,
        }

        let report = Report {
            slope: "Piz Buin NE".into(),
            danger: 3,
        };
        let payload = Payload::json(&report).unwrap();
        assert_eq!(payload.decode::<Report>().unwrap(), report);
        assert!(payload.decode::<u32>().is_err());
    }

    #[test]
    fn apply_never_lowers_attempts() {
        let mut op = PendingOperation::new(OperationId::new(1), "add_report", Payload::from("x"), 10);
        op.apply(&OperationPatch {
            attempts: Some(2),
            last_attempt: Some(20),
            error: Some("timeout".into()),
        });
        assert_eq!(op.attempts, 2);

        op.apply(&OperationPatch {
            attempts: Some(1),
            ..Default::default()
        });
        assert_eq!(op.attempts, 2);
        assert_eq!(op.last_attempt, Some(20));
        assert_eq!(op.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn failed_attempt_patch_increments() {
        let mut op = PendingOperation::new(OperationId::new(7), "sync_favorites", Payload::from("{}"), 0);
        op.attempts = 1;
        let patch = OperationPatch::failed_attempt(&op, 99, "502 Bad Gateway");
        assert_eq!(patch.attempts, Some(2));
        assert_eq!(patch.last_attempt, Some(99));
        assert_eq!(patch.error.as_deref(), Some("502 Bad Gateway"));
    }

    #[test]
    fn snapshot_sorted_by_created_at_then_id() {
        let mut ops = vec![
            PendingOperation::new(OperationId::new(3), "a", Payload::from("3"), 5),
            PendingOperation::new(OperationId::new(1), "a", Payload::from("1"), 7),
            PendingOperation::new(OperationId::new(2), "a", Payload::from("2"), 5),
        ];
        sort_snapshot(&mut ops);
        let ids: Vec<u64> = ops.iter().map(|op| op.id.as_u64()).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
