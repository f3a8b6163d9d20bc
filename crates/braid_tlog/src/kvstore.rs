//! Fjall-backed implementation of the `KvStore` collaborator.
//!
//! The transaction log spills per-tag data into this store; writes are
//! visible immediately and made durable by `commit`.

use std::ops::Bound;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use tracing::warn;

use braid_core::interfaces::{KvStore, StorageBytes};
use braid_core::types::KeyRange;

pub struct FjallKvStore {
    keyspace: Arc<Keyspace>,
    partition: fjall::PartitionHandle,
}

impl FjallKvStore {
    pub fn open(keyspace: Arc<Keyspace>, partition_name: &str) -> anyhow::Result<Self> {
        let partition = keyspace
            .open_partition(partition_name, PartitionCreateOptions::default())
            .context("open tlog kv partition")?;
        Ok(Self {
            keyspace,
            partition,
        })
    }

    pub fn open_at(path: impl AsRef<std::path::Path>, partition_name: &str) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path).open().context("open tlog keyspace")?;
        Self::open(Arc::new(keyspace), partition_name)
    }
}

#[async_trait]
impl KvStore for FjallKvStore {
    fn set(&self, key: Bytes, value: Bytes) {
        if let Err(err) = self.partition.insert(key.as_ref(), value.as_ref()) {
            warn!(error = ?err, "fjall kv write failed");
        }
    }

    fn clear(&self, range: KeyRange) {
        let bounds = (
            Bound::Included(range.begin.to_vec()),
            Bound::Excluded(range.end.to_vec()),
        );
        let mut doomed = Vec::new();
        for item in self.partition.range(bounds) {
            match item {
                Ok((key, _)) => doomed.push(key),
                Err(err) => {
                    warn!(error = ?err, "fjall kv range scan failed");
                    return;
                }
            }
        }
        for key in doomed {
            if let Err(err) = self.partition.remove(key) {
                warn!(error = ?err, "fjall kv clear failed");
            }
        }
    }

    fn read_value(&self, key: &[u8]) -> Option<Bytes> {
        match self.partition.get(key) {
            Ok(value) => value.map(|v| Bytes::copy_from_slice(&v)),
            Err(err) => {
                warn!(error = ?err, "fjall kv read failed");
                None
            }
        }
    }

    fn read_range(
        &self,
        range: KeyRange,
        limit: Option<usize>,
        byte_limit: Option<usize>,
    ) -> Vec<(Bytes, Bytes)> {
        let bounds = (
            Bound::Included(range.begin.to_vec()),
            Bound::Excluded(range.end.to_vec()),
        );
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for item in self.partition.range(bounds) {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(err) => {
                    warn!(error = ?err, "fjall kv range read failed");
                    break;
                }
            };
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
            bytes += key.len() + value.len();
            out.push((
                Bytes::copy_from_slice(&key),
                Bytes::copy_from_slice(&value),
            ));
            if let Some(byte_limit) = byte_limit {
                if bytes >= byte_limit {
                    break;
                }
            }
        }
        out
    }

    async fn commit(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncData)
            .context("fjall kv commit")
    }

    fn get_storage_bytes(&self) -> StorageBytes {
        let used = self.keyspace.disk_space() as i64;
        StorageBytes {
            total: i64::MAX,
            used,
            free: i64::MAX - used,
            available: i64::MAX - used,
        }
    }
}
