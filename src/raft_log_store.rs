//! Persistent raft log storage (spec §4.B, the consensus library's own
//! durable state besides the [`crate::store::PolicyDatabase`] it drives).
//!
//! Distinct `sled::Tree`s from the policy data, in the same `sled::Db` so a
//! single `flush` covers both (spec I4 "durable before acknowledged").

use std::ops::RangeBounds;
use std::sync::Arc;

use async_trait::async_trait;
use openraft::storage::{IOFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{LogId, OptionalSend, StorageError, StorageIOError, Vote};

use crate::raft_types::TypeConfig;

const VOTE_KEY: &[u8] = b"vote";

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Shared handle to the two log-related trees; cloned cheaply into the
/// reader half so log reads can proceed concurrently with appends.
#[derive(Clone)]
pub struct RaftLogStore {
    entries: sled::Tree,
    meta: sled::Tree,
}

impl RaftLogStore {
    pub fn new(db: &sled::Db) -> Result<Self, sled::Error> {
        Ok(RaftLogStore {
            entries: db.open_tree("raft_log_entries")?,
            meta: db.open_tree("raft_log_meta")?,
        })
    }

    fn decode_entry(bytes: &[u8]) -> Result<openraft::Entry<TypeConfig>, StorageError<TypeConfig>> {
        bincode::deserialize(bytes)
            .map_err(|e| StorageIOError::read_logs(&*e).into())
    }
}

#[async_trait]
impl RaftLogReader<TypeConfig> for RaftLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + std::fmt::Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<openraft::Entry<TypeConfig>>, StorageError<TypeConfig>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(i) => *i,
            std::ops::Bound::Excluded(i) => i + 1,
            std::ops::Bound::Unbounded => 0,
        };

        let mut out = Vec::new();
        for kv in self.entries.range(index_key(start)..) {
            let (key, value) = kv.map_err(|e| StorageIOError::read_logs(&e))?;
            let index = u64::from_be_bytes(key.as_ref().try_into().unwrap());
            if !range.contains(&index) {
                if matches!(range.end_bound(), std::ops::Bound::Excluded(e) if index >= *e) {
                    break;
                }
                continue;
            }
            out.push(Self::decode_entry(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl RaftLogStorage<TypeConfig> for RaftLogStore {
    type LogReader = RaftLogStore;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<TypeConfig>> {
        let last = self
            .entries
            .last()
            .map_err(|e| StorageIOError::read_logs(&e))?
            .map(|(_, v)| Self::decode_entry(&v))
            .transpose()?
            .map(|e| e.log_id);

        let last_purged = self
            .meta
            .get(b"last_purged")
            .map_err(|e| StorageIOError::read(&e))?
            .map(|bytes| bincode::deserialize::<LogId<TypeConfig>>(&bytes))
            .transpose()
            .map_err(|e| StorageIOError::read(&*e))?;

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        let bytes = bincode::serialize(vote).map_err(|e| StorageIOError::write_vote(&*e))?;
        self.meta
            .insert(VOTE_KEY, bytes)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        self.meta.flush_async().await.map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<TypeConfig>>, StorageError<TypeConfig>> {
        match self.meta.get(VOTE_KEY).map_err(|e| StorageIOError::read_vote(&e))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| StorageIOError::read_vote(&*e))?,
            )),
            None => Ok(None),
        }
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: IOFlushed<TypeConfig>,
    ) -> Result<(), StorageError<TypeConfig>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
    {
        let mut batch = sled::Batch::default();
        for entry in entries {
            let bytes = bincode::serialize(&entry).map_err(|e| StorageIOError::write_logs(&*e))?;
            batch.insert(&index_key(entry.log_id.index), bytes);
        }
        self.entries
            .apply_batch(batch)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        self.entries
            .flush_async()
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;
        callback.io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        let mut batch = sled::Batch::default();
        for kv in self.entries.range(index_key(log_id.index)..) {
            let (key, _) = kv.map_err(|e| StorageIOError::write_logs(&e))?;
            batch.remove(key);
        }
        self.entries
            .apply_batch(batch)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<TypeConfig>) -> Result<(), StorageError<TypeConfig>> {
        let mut batch = sled::Batch::default();
        for kv in self.entries.range(..=index_key(log_id.index)) {
            let (key, _) = kv.map_err(|e| StorageIOError::write_logs(&e))?;
            batch.remove(key);
        }
        self.entries
            .apply_batch(batch)
            .map_err(|e| StorageIOError::write_logs(&e))?;

        let bytes = bincode::serialize(&log_id).map_err(|e| StorageIOError::write(&*e))?;
        self.meta
            .insert(b"last_purged", bytes)
            .map_err(|e| StorageIOError::write(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}

/// Owns the underlying `sled::Db` shared by the log store and the policy
/// database, so both are opened from (and flushed to) the same file.
pub fn open_shared_db(path: impl AsRef<std::path::Path>) -> Result<Arc<sled::Db>, sled::Error> {
    Ok(Arc::new(sled::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{EntryPayload, LeaderId};

    fn entry(index: u64, term: u64) -> openraft::Entry<TypeConfig> {
        openraft::Entry {
            log_id: LogId::new(LeaderId::new(term, "n1".to_string()), index),
            payload: EntryPayload::Blank,
        }
    }

    #[tokio::test]
    async fn append_then_read_back_range() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let mut store = RaftLogStore::new(&db).unwrap();

        let (tx, _rx) = tokio::sync::oneshot::channel();
        let callback = IOFlushed::new(tx);
        store
            .append(vec![entry(1, 1), entry(2, 1), entry(3, 1)], callback)
            .await
            .unwrap();

        let entries = store.try_get_log_entries(1..3).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_id.index, 1);
        assert_eq!(entries[1].log_id.index, 2);
    }

    #[tokio::test]
    async fn save_and_read_vote_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let mut store = RaftLogStore::new(&db).unwrap();

        assert!(store.read_vote().await.unwrap().is_none());
        let vote = Vote::new(3, "n1".to_string());
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }
}
