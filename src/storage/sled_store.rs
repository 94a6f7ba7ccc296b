use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::Transactional;

use super::error::sled_err;
use super::{sort_snapshot, OperationId, OperationPatch, OperationStore, Payload, PendingOperation, StorageError};
use crate::common::TimestampMs;

type TxResult<T> = ConflictableTransactionResult<T, StorageError>;

/// Durable operation store backed by a dedicated sled tree.
///
/// Keys are the big-endian encoding of the operation id, values are the
/// bincode-encoded [`PendingOperation`]. A separate metadata tree holds the
/// id counter and the entry count. Ids keep growing even when the queue is
/// emptied or the process restarts. Every write touches the entries and the
/// metadata in one transaction and is flushed before the call returns.
#[derive(Clone)]
pub struct SledOperationStore {
    db: sled::Db,
    tree: sled::Tree,
    meta: sled::Tree,
    max_pending: Option<usize>,
}

impl SledOperationStore {
    const TREE_NAME: &'static str = "__pending_operations__";
    const META_TREE_NAME: &'static str = "__pending_operations_meta__";
    const META_NEXT_ID_KEY: &'static [u8] = b"__next_id__";
    const META_LEN_KEY: &'static [u8] = b"__len__";

    /// Open (or create) a sled database in `data_dir` and the store inside it.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = data_dir.as_ref();
        std::fs::create_dir_all(path)?;

        let db = sled::open(path).map_err(sled_err)?;
        log::info!("Pending operation store opened at {:?}", path);

        Self::new(&db)
    }

    /// Open the store inside an already opened sled database.
    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(Self::TREE_NAME).map_err(sled_err)?;
        let meta = db.open_tree(Self::META_TREE_NAME).map_err(sled_err)?;

        // Without a persisted counter (older layout, or lost metadata) seed it
        // from the highest stored key so existing ids are never reissued.
        if meta.get(Self::META_NEXT_ID_KEY).map_err(sled_err)?.is_none() {
            let last_id = match tree.last().map_err(sled_err)? {
                Some((key, _)) => OperationId::from_key(&key)?.as_u64(),
                None => 0,
            };
            meta.insert(Self::META_NEXT_ID_KEY, last_id.to_be_bytes().to_vec())
                .map_err(sled_err)?;
            if last_id > 0 {
                log::info!("Seeded operation id counter from existing entries at {}", last_id);
            }
        }

        // One full scan when the entry count was never recorded; afterwards
        // it is maintained by every write.
        if meta.get(Self::META_LEN_KEY).map_err(sled_err)?.is_none() {
            let len = tree.len() as u64;
            meta.insert(Self::META_LEN_KEY, len.to_be_bytes().to_vec())
                .map_err(sled_err)?;
        }

        Ok(Self {
            db: db.clone(),
            tree,
            meta,
            max_pending: None,
        })
    }

    /// Cap the number of stored entries; enqueue fails with
    /// [`StorageError::QuotaExceeded`] beyond it.
    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn max_pending(&self) -> Option<usize> {
        self.max_pending
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await.map_err(sled_err)?;
        Ok(())
    }
}

fn decode_counter(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn read_counter(meta: &TransactionalTree, key: &'static [u8]) -> TxResult<u64> {
    match meta.get(key)? {
        Some(bytes) => decode_counter(&bytes).ok_or_else(|| {
            ConflictableTransactionError::Abort(StorageError::CorruptRecord(format!(
                "unreadable counter {}",
                String::from_utf8_lossy(key)
            )))
        }),
        None => Ok(0),
    }
}

fn write_counter(meta: &TransactionalTree, key: &'static [u8], value: u64) -> TxResult<()> {
    meta.insert(key, value.to_be_bytes().to_vec())?;
    Ok(())
}

fn tx_err(e: TransactionError<StorageError>) -> StorageError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => sled_err(e),
    }
}

fn encode(op: &PendingOperation) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(op, bincode::config::standard())
        .map_err(|e| StorageError::CodecError(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<PendingOperation, StorageError> {
    let (op, _): (PendingOperation, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::CodecError(e.to_string()))?;
    Ok(op)
}

#[async_trait]
impl OperationStore for SledOperationStore {
    async fn enqueue(
        &self,
        kind: &str,
        payload: Payload,
        created_at: TimestampMs,
    ) -> Result<OperationId, StorageError> {
        let id = (&self.tree, &self.meta)
            .transaction(|(tree, meta)| {
                let len = read_counter(meta, Self::META_LEN_KEY)?;
                if let Some(limit) = self.max_pending {
                    if len >= limit as u64 {
                        return Err(ConflictableTransactionError::Abort(
                            StorageError::QuotaExceeded { limit },
                        ));
                    }
                }

                let id = OperationId::new(read_counter(meta, Self::META_NEXT_ID_KEY)?.wrapping_add(1));
                let op = PendingOperation::new(id, kind, payload.clone(), created_at);
                let bytes = encode(&op).map_err(ConflictableTransactionError::Abort)?;

                tree.insert(&id.to_key()[..], bytes)?;
                write_counter(meta, Self::META_NEXT_ID_KEY, id.as_u64())?;
                write_counter(meta, Self::META_LEN_KEY, len + 1)?;
                Ok(id)
            })
            .map_err(tx_err)?;
        self.flush().await?;

        log::debug!("Enqueued operation {} (kind '{}')", id, kind);
        Ok(id)
    }

    async fn list_pending(&self) -> Result<Vec<PendingOperation>, StorageError> {
        let mut ops = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item.map_err(sled_err)?;
            ops.push(decode(&value)?);
        }
        sort_snapshot(&mut ops);
        Ok(ops)
    }

    async fn get(&self, id: OperationId) -> Result<Option<PendingOperation>, StorageError> {
        match self.tree.get(id.to_key()).map_err(sled_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let len = match self.meta.get(Self::META_LEN_KEY).map_err(sled_err)? {
            Some(bytes) => decode_counter(&bytes)
                .ok_or_else(|| StorageError::CorruptRecord("unreadable entry count".into()))?,
            None => 0,
        };
        Ok(len as usize)
    }

    async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.tree.is_empty())
    }

    async fn update(&self, id: OperationId, patch: OperationPatch) -> Result<(), StorageError> {
        let key = id.to_key();

        // Read and write in one transaction so a concurrent remove is never
        // resurrected.
        let updated = self
            .tree
            .transaction(|tree| {
                let Some(current) = tree.get(&key[..])? else {
                    return Ok(false);
                };
                let mut op = decode(&current).map_err(ConflictableTransactionError::Abort)?;
                op.apply(&patch);
                let next = encode(&op).map_err(ConflictableTransactionError::Abort)?;
                tree.insert(&key[..], next)?;
                Ok(true)
            })
            .map_err(tx_err)?;

        if !updated {
            log::debug!("Update of operation {} skipped: no longer stored", id);
            return Ok(());
        }
        self.flush().await
    }

    async fn remove(&self, id: OperationId) -> Result<(), StorageError> {
        let key = id.to_key();
        let removed = (&self.tree, &self.meta)
            .transaction(|(tree, meta)| {
                if tree.remove(&key[..])?.is_none() {
                    return Ok(false);
                }
                let len = read_counter(meta, Self::META_LEN_KEY)?;
                write_counter(meta, Self::META_LEN_KEY, len.saturating_sub(1))?;
                Ok(true)
            })
            .map_err(tx_err)?;

        if removed {
            self.flush().await?;
            log::debug!("Removed operation {}", id);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let keys = self
            .tree
            .iter()
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(sled_err)?;

        let cleared = (&self.tree, &self.meta)
            .transaction(|(tree, meta)| {
                let mut removed = 0u64;
                for key in &keys {
                    if tree.remove(key.clone())?.is_some() {
                        removed += 1;
                    }
                }
                let len = read_counter(meta, Self::META_LEN_KEY)?;
                write_counter(meta, Self::META_LEN_KEY, len.saturating_sub(removed))?;
                Ok(removed)
            })
            .map_err(tx_err)?;
        self.flush().await?;

        log::info!("Cleared {} pending operations", cleared);
        Ok(())
    }
}
