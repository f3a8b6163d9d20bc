//! Collaborator contracts and the messages that cross them.
//!
//! The commit pipeline core talks to the master, the resolvers, the log
//! system, the persistent key-value store and the disk queue only through
//! the traits defined here; production transports and test doubles plug in
//! behind them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mutation::Mutation;
use crate::timed_cache::MergeParts;
use crate::types::{KeyRange, SplitTransaction, Tag, TransactionPriority, Version};

/// One-shot reply slot that tolerates duplicate sends: the first reply wins
/// and later ones are dropped. Parts of a split transaction all carry the
/// same handle, and whichever proxy finishes first answers the client.
#[derive(Clone, Debug)]
pub struct ReplyHandle<T>(Arc<Mutex<Option<oneshot::Sender<T>>>>);

impl<T> ReplyHandle<T> {
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// A handle whose replies go nowhere, for fire-and-forget requests.
    pub fn disconnected() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Deliver the reply. Returns `true` if this call was the one that
    /// delivered it.
    pub fn send(&self, value: T) -> bool {
        let sender = self.0.lock().expect("reply handle poisoned").take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.0.lock().expect("reply handle poisoned").is_none()
    }
}

// ---------------------------------------------------------------------------
// Client -> commit proxy

pub const FLAG_FIRST_IN_BATCH: u8 = 0x01;
pub const FLAG_LOCK_AWARE: u8 = 0x02;

/// The transactional payload of a commit request.
#[derive(Clone, Debug, Default)]
pub struct CommitTransaction {
    pub read_conflict_ranges: Vec<KeyRange>,
    pub write_conflict_ranges: Vec<KeyRange>,
    pub mutations: Vec<Mutation>,
    pub read_snapshot: Version,
}

impl CommitTransaction {
    pub fn expected_size(&self) -> i64 {
        let mut size = 0i64;
        for m in &self.mutations {
            size += m.expected_size() as i64;
        }
        for r in self
            .read_conflict_ranges
            .iter()
            .chain(self.write_conflict_ranges.iter())
        {
            size += (r.begin.len() + r.end.len()) as i64;
        }
        size
    }

    /// Total mutation value bytes, the quantity balanced by the split
    /// planner.
    pub fn value_bytes(&self) -> i64 {
        self.mutations.iter().map(|m| m.param2().len() as i64).sum()
    }
}

/// Successful commit outcome (also used to report conflicting ranges when
/// the client asked for them).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitId {
    pub version: Version,
    pub batch_index: u16,
    pub metadata_version: Option<Bytes>,
    /// Indices into the client's original read conflict ranges that the
    /// resolvers reported as conflicting.
    pub conflicting_key_ranges: Option<Vec<usize>>,
}

pub type CommitReply = ReplyHandle<Result<CommitId>>;

#[derive(Clone, Debug)]
pub struct CommitTransactionRequest {
    pub transaction: CommitTransaction,
    pub flags: u8,
    pub split_transaction: Option<SplitTransaction>,
    pub report_conflicting_keys: bool,
    /// Estimated write cost, aggregated per throttle tag on commit.
    pub commit_cost_estimation: Option<CommitCostEstimation>,
    pub tag_set: Option<Vec<TransactionTag>>,
    pub reply: CommitReply,
}

impl CommitTransactionRequest {
    pub fn new(transaction: CommitTransaction) -> (Self, oneshot::Receiver<Result<CommitId>>) {
        let (reply, rx) = ReplyHandle::channel();
        (
            Self {
                transaction,
                flags: 0,
                split_transaction: None,
                report_conflicting_keys: false,
                commit_cost_estimation: None,
                tag_set: None,
                reply,
            },
            rx,
        )
    }

    pub fn first_in_batch(&self) -> bool {
        self.flags & FLAG_FIRST_IN_BATCH != 0
    }

    pub fn is_lock_aware(&self) -> bool {
        self.flags & FLAG_LOCK_AWARE != 0
    }

    pub fn bytes(&self) -> i64 {
        self.transaction.expected_size()
    }
}

/// Client-supplied throttle tag.
pub type TransactionTag = Bytes;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CommitCostEstimation {
    pub op_count: i64,
    pub write_costs: i64,
}

impl std::ops::AddAssign for CommitCostEstimation {
    fn add_assign(&mut self, rhs: Self) {
        self.op_count += rhs.op_count;
        self.write_costs += rhs.write_costs;
    }
}

/// Per-tag throttle limit forwarded to clients with GRV replies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientTagThrottleLimits {
    pub tps_rate: f64,
    /// Absolute expiration time in seconds.
    pub expiration: f64,
}

pub const GRV_FLAG_CAUSAL_READ_RISKY: u8 = 0x01;
pub const GRV_FLAG_USE_MIN_KNOWN_COMMITTED: u8 = 0x02;

#[derive(Clone, Debug)]
pub struct GetReadVersionRequest {
    pub priority: TransactionPriority,
    pub flags: u8,
    pub transaction_count: i64,
    pub tags: Vec<(TransactionTag, i64)>,
    pub reply: ReplyHandle<Result<GetReadVersionReply>>,
}

impl GetReadVersionRequest {
    pub fn new(
        priority: TransactionPriority,
        transaction_count: i64,
    ) -> (Self, oneshot::Receiver<Result<GetReadVersionReply>>) {
        let (reply, rx) = ReplyHandle::channel();
        (
            Self {
                priority,
                flags: 0,
                transaction_count,
                tags: Vec::new(),
                reply,
            },
            rx,
        )
    }

    pub fn causal_read_risky(&self) -> bool {
        self.flags & GRV_FLAG_CAUSAL_READ_RISKY != 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct GetReadVersionReply {
    pub version: Version,
    pub locked: bool,
    pub metadata_version: Option<Bytes>,
    pub recent_requests: u64,
    pub tag_throttle_info: HashMap<TransactionTag, ClientTagThrottleLimits>,
}

// ---------------------------------------------------------------------------
// Master

#[derive(Clone, Debug)]
pub struct ResolverMove {
    pub range: KeyRange,
    pub dest: usize,
}

#[derive(Clone, Debug)]
pub struct GetCommitVersionReply {
    pub version: Version,
    pub prev_version: Version,
    pub resolver_changes: Vec<ResolverMove>,
    pub resolver_changes_version: Version,
    pub request_num: u64,
}

/// The coordinated master, which issues commit versions. For all proxies
/// passing the same `split_id`, `get_commit_version` returns the identical
/// version.
#[async_trait]
pub trait Master: Send + Sync {
    async fn get_commit_version(
        &self,
        request_num: u64,
        most_recent_processed: u64,
        proxy_id: Uuid,
        split_id: Option<Uuid>,
    ) -> Result<GetCommitVersionReply>;

    async fn get_live_committed_version(&self) -> Result<GetReadVersionReply>;

    async fn report_live_committed_version(
        &self,
        version: Version,
        locked: bool,
        metadata_version: Option<Bytes>,
    ) -> Result<()>;

    /// Always fails: a coordinator change forces the proxy to restart.
    async fn change_coordinators(&self, new_value: Bytes) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Resolver

/// Per-transaction conflict outcome. The order matters: combining outcomes
/// from several resolvers takes the minimum, so `Conflict` dominates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConflictOutcome {
    Conflict,
    TooOld,
    Committed,
}

#[derive(Clone, Debug, Default)]
pub struct ResolveTransaction {
    pub read_snapshot: Version,
    pub read_conflict_ranges: Vec<KeyRange>,
    pub write_conflict_ranges: Vec<KeyRange>,
    /// Metadata mutations, mirrored only to resolver 0.
    pub mutations: Vec<Mutation>,
    pub report_conflicting_keys: bool,
}

#[derive(Clone, Debug)]
pub struct ResolveBatchRequest {
    pub prev_version: Version,
    pub version: Version,
    pub last_received_version: Version,
    pub transactions: Vec<ResolveTransaction>,
    /// Offsets of `transactions` entries that carry transaction-subsystem
    /// state mutations.
    pub txn_state_transactions: Vec<usize>,
    pub split_transaction: Option<SplitTransaction>,
}

#[derive(Clone, Debug)]
pub struct StateTransaction {
    pub committed: bool,
    pub mutations: Vec<Mutation>,
}

#[derive(Clone, Debug, Default)]
pub struct ResolveBatchReply {
    pub committed: Vec<ConflictOutcome>,
    /// `[version_index][txn_index]` state transactions from other proxies'
    /// recent batches; identical in shape across all resolvers.
    pub state_mutations: Vec<Vec<StateTransaction>>,
    /// Transaction index -> conflicting read-conflict-range indices, in the
    /// resolver's own numbering.
    pub conflicting_key_range_map: HashMap<usize, Vec<usize>>,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, req: ResolveBatchRequest) -> Result<ResolveBatchReply>;
}

// ---------------------------------------------------------------------------
// Log system

/// The replicated-log fan-out used by the proxy: pushes a commit blob to
/// every log of the current generation.
#[async_trait]
pub trait LogSystem: Send + Sync {
    /// Returns the version up to which transaction-state data may be
    /// popped.
    async fn push(
        &self,
        prev_version: Version,
        version: Version,
        known_committed_version: Version,
        min_known_committed_version: Version,
        messages: Bytes,
    ) -> Result<Version>;

    async fn pop(
        &self,
        version: Version,
        tag: Tag,
        durable_known_committed: Version,
        locality: i8,
    ) -> Result<()>;

    async fn pop_txs(&self, version: Version, locality: Option<i8>) -> Result<()>;

    /// Confirm the current log generation is still live (quorum check).
    async fn confirm_epoch_live(&self) -> Result<()>;

    /// Translate a pseudo-locality pop into the version to pop on the
    /// log-router locality.
    fn pop_pseudo_locality_tag(&self, tag: Tag, version: Version) -> Version;
}

// ---------------------------------------------------------------------------
// Key-value store

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageBytes {
    pub total: i64,
    pub used: i64,
    pub free: i64,
    pub available: i64,
}

/// Ordered key-value store used for TLog spill data and the proxy's
/// transaction-state mirror. Writes become visible immediately and durable
/// at `commit`.
#[async_trait]
pub trait KvStore: Send + Sync {
    fn set(&self, key: Bytes, value: Bytes);
    fn clear(&self, range: KeyRange);
    fn read_value(&self, key: &[u8]) -> Option<Bytes>;
    /// Range read in key order, stopping early at `limit` entries or once
    /// `byte_limit` cumulative key+value bytes have been returned.
    fn read_range(
        &self,
        range: KeyRange,
        limit: Option<usize>,
        byte_limit: Option<usize>,
    ) -> Vec<(Bytes, Bytes)>;
    async fn commit(&self) -> anyhow::Result<()>;
    /// Re-synchronize the store's log adapter after adopting state written
    /// by another proxy.
    fn resync_log(&self) {}
    fn get_storage_bytes(&self) -> StorageBytes;
}

/// In-memory `KvStore` over a BTreeMap; the txn-state mirror and unit
/// tests use it.
#[derive(Debug, Default)]
pub struct MemKvStore {
    inner: std::sync::RwLock<std::collections::BTreeMap<Bytes, Bytes>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    fn set(&self, key: Bytes, value: Bytes) {
        self.inner
            .write()
            .expect("mem kv poisoned")
            .insert(key, value);
    }

    fn clear(&self, range: KeyRange) {
        let mut map = self.inner.write().expect("mem kv poisoned");
        let doomed: Vec<Bytes> = map
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            map.remove(&key);
        }
    }

    fn read_value(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.read().expect("mem kv poisoned").get(key).cloned()
    }

    fn read_range(
        &self,
        range: KeyRange,
        limit: Option<usize>,
        byte_limit: Option<usize>,
    ) -> Vec<(Bytes, Bytes)> {
        let map = self.inner.read().expect("mem kv poisoned");
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for (k, v) in map.range(range.begin.clone()..range.end.clone()) {
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
            out.push((k.clone(), v.clone()));
            bytes += k.len() + v.len();
            if let Some(byte_limit) = byte_limit {
                if bytes >= byte_limit {
                    break;
                }
            }
        }
        out
    }

    async fn commit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_storage_bytes(&self) -> StorageBytes {
        let used = self
            .inner
            .read()
            .expect("mem kv poisoned")
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as i64)
            .sum();
        StorageBytes {
            total: i64::MAX,
            used,
            free: i64::MAX - used,
            available: i64::MAX - used,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction log surface

#[derive(Clone, Debug)]
pub struct TLogPeekRequest {
    pub begin: Version,
    pub tag: Tag,
    pub return_if_blocked: bool,
    pub only_spilled: bool,
    /// `(peek id, sequence number)` for order-preserving cursor streams.
    pub sequence: Option<(Uuid, u32)>,
}

impl TLogPeekRequest {
    pub fn new(begin: Version, tag: Tag) -> Self {
        Self {
            begin,
            tag,
            return_if_blocked: false,
            only_spilled: false,
            sequence: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TLogPeekReply {
    pub messages: Bytes,
    /// One past the last version served; the next peek should begin here.
    pub end: Version,
    pub popped: Option<Version>,
    pub max_known_version: Version,
    pub min_known_committed_version: Version,
    pub begin: Option<Version>,
    pub only_spilled: bool,
}

#[derive(Clone, Debug)]
pub struct TLogCommitRequest {
    pub prev_version: Version,
    pub version: Version,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub messages: Bytes,
    pub split_transaction: Option<SplitTransaction>,
    /// Message blobs of other split parts, appended by the merger.
    pub additional_messages: Vec<Bytes>,
}

impl TLogCommitRequest {
    pub fn new(prev_version: Version, version: Version, messages: Bytes) -> Self {
        Self {
            prev_version,
            version,
            known_committed_version: 0,
            min_known_committed_version: 0,
            messages,
            split_transaction: None,
            additional_messages: Vec::new(),
        }
    }
}

impl MergeParts for TLogCommitRequest {
    /// Parts of a split transaction must agree on the version pair; the
    /// master issued one version for the whole split.
    fn merge(&mut self, incoming: &Self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.prev_version == incoming.prev_version && self.version == incoming.version,
            "split part version mismatch: ({}, {}) vs ({}, {})",
            self.prev_version,
            self.version,
            incoming.prev_version,
            incoming.version
        );
        self.known_committed_version = self
            .known_committed_version
            .max(incoming.known_committed_version);
        self.min_known_committed_version = self
            .min_known_committed_version
            .max(incoming.min_known_committed_version);
        self.additional_messages.push(incoming.messages.clone());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TLogLockResult {
    pub end: Version,
    pub known_committed_version: Version,
}

#[derive(Clone, Copy, Debug)]
pub struct TLogQueuingMetricsReply {
    pub local_time: f64,
    pub instance_id: u64,
    pub bytes_input: i64,
    pub bytes_durable: i64,
    pub storage_bytes: StorageBytes,
    /// The log's committed version.
    pub version: Version,
}

/// The read surface a peek cursor needs from one TLog peer.
#[async_trait]
pub trait TLogPeekService: Send + Sync {
    async fn peek(&self, req: TLogPeekRequest) -> Result<TLogPeekReply>;
}

/// Combine outcomes from every resolver that saw a transaction.
pub fn combine_outcomes(outcomes: impl IntoIterator<Item = ConflictOutcome>) -> ConflictOutcome {
    outcomes
        .into_iter()
        .min()
        .unwrap_or(ConflictOutcome::Committed)
}

impl From<Error> for ConflictOutcome {
    fn from(err: Error) -> Self {
        match err {
            Error::TransactionTooOld => ConflictOutcome::TooOld,
            _ => ConflictOutcome::Conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_handle_first_send_wins() {
        let (handle, mut rx) = ReplyHandle::<u32>::channel();
        let other = handle.clone();
        assert!(handle.send(1));
        assert!(!other.send(2));
        assert!(handle.is_sent());
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn outcome_combination_prefers_conflict() {
        use ConflictOutcome::*;
        assert_eq!(combine_outcomes([Committed, Committed]), Committed);
        assert_eq!(combine_outcomes([Committed, TooOld]), TooOld);
        assert_eq!(combine_outcomes([TooOld, Conflict]), Conflict);
        assert_eq!(combine_outcomes([]), Committed);
    }

    #[test]
    fn split_merge_rejects_version_mismatch() {
        let mut a = TLogCommitRequest::new(1, 5, Bytes::from_static(b"a"));
        let b = TLogCommitRequest::new(1, 6, Bytes::from_static(b"b"));
        assert!(a.merge(&b).is_err());

        let mut c = TLogCommitRequest::new(1, 5, Bytes::from_static(b"c"));
        let mut d = TLogCommitRequest::new(1, 5, Bytes::from_static(b"d"));
        d.known_committed_version = 4;
        c.merge(&d).unwrap();
        assert_eq!(c.known_committed_version, 4);
        assert_eq!(c.additional_messages.len(), 1);
    }

    #[test]
    fn mem_kv_range_reads_respect_limits() {
        let kv = MemKvStore::new();
        for i in 0u8..10 {
            kv.set(Bytes::copy_from_slice(&[i]), Bytes::from(vec![0u8; 100]));
        }
        let all = kv.read_range(KeyRange::new(&[0u8][..], &[255u8][..]), None, None);
        assert_eq!(all.len(), 10);

        let limited = kv.read_range(KeyRange::new(&[0u8][..], &[255u8][..]), Some(3), None);
        assert_eq!(limited.len(), 3);

        let byte_limited =
            kv.read_range(KeyRange::new(&[0u8][..], &[255u8][..]), None, Some(250));
        assert_eq!(byte_limited.len(), 3);

        kv.clear(KeyRange::new(&[0u8][..], &[5u8][..]));
        let rest = kv.read_range(KeyRange::new(&[0u8][..], &[255u8][..]), None, None);
        assert_eq!(rest.len(), 5);
    }
}
