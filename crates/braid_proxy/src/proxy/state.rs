//! Shared state of one commit proxy.
//!
//! `ProxyCommitData` is created once per proxy and threaded through the
//! batcher, the pipeline and the GRV starter. Hot ordering points are
//! notified counters; range-indexed metadata lives behind plain mutexes
//! and is only touched from the ordered portions of the pipeline.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use uuid::Uuid;

use braid_core::interfaces::{
    CommitCostEstimation, KvStore, LogSystem, Master, MemKvStore, Resolver, ResolverMove,
    TransactionTag,
};
use braid_core::knobs::Knobs;
use braid_core::mutation::Mutation;
use braid_core::types::{
    backup_ranges_prefix, cache_ranges_prefix, key_servers_prefix, KeyRange, Tag, Version,
};
use braid_core::watch::{NotifiedTime, NotifiedVersion};

/// A mutation batch extracted from the txn-state mirror at commit time;
/// its messages ride the txs tag and must be acknowledged once logging is
/// arranged (or once another proxy is known to log them).
#[derive(Debug, Default)]
pub struct StoreCommit {
    pub mutations: Vec<Mutation>,
    acked: bool,
}

impl StoreCommit {
    pub fn acknowledge(&mut self) {
        self.acked = true;
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }
}

/// In-memory mirror of the transaction subsystem's system-key state, with
/// a log-adapter style commit message: every write since the previous
/// `commit_message` call is returned for txs-tag logging.
#[derive(Debug, Default)]
pub struct TxnStateStore {
    store: MemKvStore,
    pending: Mutex<Vec<Mutation>>,
}

impl TxnStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: Bytes, value: Bytes) {
        self.store.set(key.clone(), value.clone());
        self.pending
            .lock()
            .expect("txn state poisoned")
            .push(Mutation::Set { key, value });
    }

    pub fn clear(&self, range: KeyRange) {
        self.store.clear(range.clone());
        self.pending
            .lock()
            .expect("txn state poisoned")
            .push(Mutation::ClearRange {
                begin: range.begin,
                end: range.end,
            });
    }

    pub fn read_value(&self, key: &[u8]) -> Option<Bytes> {
        self.store.read_value(key)
    }

    pub fn read_range(&self, range: KeyRange) -> Vec<(Bytes, Bytes)> {
        self.store.read_range(range, None, None)
    }

    /// Drain the writes since the last extraction.
    pub fn commit_message(&self) -> StoreCommit {
        StoreCommit {
            mutations: std::mem::take(&mut *self.pending.lock().expect("txn state poisoned")),
            acked: false,
        }
    }

    /// Called after adopting state durably logged by another proxy.
    pub fn resync_log(&self) {
        self.pending.lock().expect("txn state poisoned").clear();
    }
}

/// Time-layered key range -> resolver assignment. Each slice holds its
/// assignment history newest-last; reads walk backwards to reach every
/// resolver that owned the slice within the transaction's window.
#[derive(Debug)]
pub struct KeyResolverMap {
    ranges: BTreeMap<Vec<u8>, VecDeque<(Version, usize)>>,
}

impl KeyResolverMap {
    pub fn new() -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert(Vec::new(), VecDeque::from([(0, 0)]));
        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Ensure a slice boundary exists at `key`.
    fn split_at(&mut self, key: &[u8]) {
        if self.ranges.contains_key(key) {
            return;
        }
        let history = self
            .ranges
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, h)| h.clone())
            .expect("map covers the empty prefix");
        self.ranges.insert(key.to_vec(), history);
    }

    /// Record that `range` moves to resolver `dest` as of `version`.
    pub fn apply_change(&mut self, change: &ResolverMove, version: Version) {
        self.split_at(&change.range.begin);
        self.split_at(&change.range.end);
        let begin = change.range.begin.to_vec();
        let end = change.range.end.to_vec();
        for (_, history) in self.ranges.range_mut(begin..end) {
            history.push_back((version, change.dest));
        }
    }

    pub fn apply_changes(&mut self, changes: &[ResolverMove], version: Version) {
        for change in changes {
            self.apply_change(change, version);
        }
    }

    /// Every resolver that owned any slice of `range` since
    /// `read_snapshot`.
    pub fn resolvers_for_read(&self, range: &KeyRange, read_snapshot: Version) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for history in self.intersecting(range) {
            for (version, dest) in history.iter().rev() {
                out.insert(*dest);
                if *version < read_snapshot {
                    break;
                }
            }
        }
        out
    }

    /// The current owner of each slice of `range`.
    pub fn resolvers_for_write(&self, range: &KeyRange) -> BTreeSet<usize> {
        self.intersecting(range)
            .map(|history| history.back().expect("non-empty history").1)
            .collect()
    }

    fn intersecting<'a>(
        &'a self,
        range: &KeyRange,
    ) -> impl Iterator<Item = &'a VecDeque<(Version, usize)>> {
        let first = self
            .ranges
            .range(..=range.begin.to_vec())
            .next_back()
            .map(|(k, _)| k.clone())
            .expect("map covers the empty prefix");
        let start = first.clone();
        let end = range.end.to_vec();
        self.ranges
            .range(first..)
            .take_while(move |entry| {
                entry.0.as_slice() == start.as_slice() || entry.0.as_slice() < end.as_slice()
            })
            .map(|(_, h)| h)
    }

    /// Drop history entries older than `oldest_version` and merge slices
    /// with identical histories.
    pub fn coalesce(&mut self, oldest_version: Version) {
        for history in self.ranges.values_mut() {
            while history.len() > 1 && history[1].0 < oldest_version {
                history.pop_front();
            }
            if let Some(front) = history.front_mut() {
                if front.0 < oldest_version {
                    front.0 = 0;
                }
            }
        }

        let keys: Vec<Vec<u8>> = self.ranges.keys().cloned().collect();
        let mut previous: Option<Vec<u8>> = None;
        for key in keys {
            if let Some(prev_key) = &previous {
                let equal = self.ranges.get(prev_key) == self.ranges.get(&key);
                if equal && !key.is_empty() {
                    self.ranges.remove(&key);
                    continue;
                }
            }
            previous = Some(key);
        }
    }
}

impl Default for KeyResolverMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Range-indexed shard metadata: destination tags, cache flags and backup
/// destinations, each applying from its begin key to the next boundary.
#[derive(Debug)]
pub struct KeyInfoMap {
    tags: BTreeMap<Vec<u8>, Vec<Tag>>,
    cached: BTreeMap<Vec<u8>, bool>,
    backup: BTreeMap<Vec<u8>, Vec<Bytes>>,
}

impl KeyInfoMap {
    pub fn new(default_tags: Vec<Tag>) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(Vec::new(), default_tags);
        let mut cached = BTreeMap::new();
        cached.insert(Vec::new(), false);
        let mut backup = BTreeMap::new();
        backup.insert(Vec::new(), Vec::new());
        Self {
            tags,
            cached,
            backup,
        }
    }

    pub fn tags_for_key(&self, key: &[u8]) -> Vec<Tag> {
        self.tags
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, t)| t.clone())
            .expect("map covers the empty prefix")
    }

    /// Shard boundaries intersecting `range`, with each slice's tags.
    pub fn intersecting_tags(&self, range: &KeyRange) -> Vec<(Vec<u8>, Vec<Tag>)> {
        let first = self
            .tags
            .range(..=range.begin.to_vec())
            .next_back()
            .map(|(k, _)| k.clone())
            .expect("map covers the empty prefix");
        let start = first.clone();
        let end = range.end.to_vec();
        self.tags
            .range(first..)
            .take_while(move |entry| {
                entry.0.as_slice() == start.as_slice() || entry.0.as_slice() < end.as_slice()
            })
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect()
    }

    pub fn set_shard_tags(&mut self, begin: &[u8], tags: Vec<Tag>) {
        self.tags.insert(begin.to_vec(), tags);
    }

    pub fn is_cached(&self, key: &[u8]) -> bool {
        self.cached
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, c)| *c)
            .unwrap_or(false)
    }

    pub fn range_touches_cache(&self, range: &KeyRange) -> bool {
        if self.is_cached(&range.begin) {
            return true;
        }
        self.cached
            .range(range.begin.to_vec()..range.end.to_vec())
            .any(|(_, c)| *c)
    }

    pub fn set_cached(&mut self, begin: &[u8], cached: bool) {
        self.cached.insert(begin.to_vec(), cached);
    }

    pub fn backup_destinations(&self, key: &[u8]) -> Vec<Bytes> {
        self.backup
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, d)| d.clone())
            .unwrap_or_default()
    }

    /// `(slice range, destinations)` for every backup slice overlapping
    /// `range`.
    pub fn intersecting_backup_ranges(&self, range: &KeyRange) -> Vec<(KeyRange, Vec<Bytes>)> {
        let first = self
            .backup
            .range(..=range.begin.to_vec())
            .next_back()
            .map(|(k, _)| k.clone())
            .expect("map covers the empty prefix");
        let mut out = Vec::new();
        let mut iter = self.backup.range(first..).peekable();
        while let Some((begin, dests)) = iter.next() {
            if begin.as_slice() >= range.end.as_ref() {
                break;
            }
            let end = iter
                .peek()
                .map(|entry| Bytes::copy_from_slice(entry.0))
                .unwrap_or_else(|| Bytes::from_static(b"\xff\xff\xff"));
            let slice = KeyRange::new(Bytes::copy_from_slice(begin), end);
            if slice.overlaps(range) && !dests.is_empty() {
                out.push((slice.intersect(range), dests.clone()));
            }
        }
        out
    }

    pub fn set_backup_destinations(&mut self, begin: &[u8], destinations: Vec<Bytes>) {
        self.backup.insert(begin.to_vec(), destinations);
    }

    pub fn has_backup_ranges(&self) -> bool {
        self.backup.values().any(|d| !d.is_empty())
    }
}

/// Encode a tag list for the key-servers system value.
pub fn encode_tag_value(tags: &[Tag]) -> Bytes {
    let mut out = Vec::with_capacity(2 + tags.len() * 3);
    out.extend_from_slice(&(tags.len() as u16).to_be_bytes());
    for tag in tags {
        tag.encode_to(&mut out);
    }
    Bytes::from(out)
}

pub fn decode_tag_value(value: &[u8]) -> anyhow::Result<Vec<Tag>> {
    let mut offset = 0;
    let count = braid_core::codec::read_u16(value, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(Tag::decode(value, &mut offset)?);
    }
    Ok(out)
}

/// Encode a backup destination list (length-prefixed names).
pub fn encode_backup_destinations(destinations: &[Bytes]) -> Bytes {
    let mut out = Vec::new();
    out.extend_from_slice(&(destinations.len() as u16).to_be_bytes());
    for dest in destinations {
        braid_core::codec::write_bytes(&mut out, dest);
    }
    Bytes::from(out)
}

pub fn decode_backup_destinations(value: &[u8]) -> anyhow::Result<Vec<Bytes>> {
    let mut offset = 0;
    let count = braid_core::codec::read_u16(value, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(Bytes::copy_from_slice(braid_core::codec::read_bytes(
            value,
            &mut offset,
        )?));
    }
    Ok(out)
}

#[derive(Debug, Default)]
pub struct ProxyStats {
    pub txn_request_in: AtomicU64,
    pub txn_request_out: AtomicU64,
    pub txn_request_errors: AtomicU64,
    pub txn_start_in: AtomicU64,
    pub txn_start_out: AtomicU64,
    pub txn_throttled: AtomicU64,
    pub txn_commit_in: AtomicU64,
    pub txn_commit_out: AtomicU64,
    pub txn_commit_errors: AtomicU64,
    pub txn_conflicts: AtomicU64,
    pub commit_batch_in: AtomicU64,
    pub commit_batch_out: AtomicU64,
    pub mutations: AtomicU64,
    pub mutation_bytes: AtomicU64,
    pub conflict_ranges: AtomicU64,
}

impl ProxyStats {
    pub fn recent_requests(&self) -> u64 {
        self.txn_request_in.load(Ordering::Relaxed)
    }
}

pub struct ProxyCommitData {
    pub id: Uuid,
    pub knobs: Arc<Knobs>,
    pub master: Arc<dyn Master>,
    pub resolvers: Vec<Arc<dyn Resolver>>,
    pub log_system: Arc<dyn LogSystem>,
    pub txn_state: TxnStateStore,
    pub num_proxies: usize,

    /// Highest version this proxy has processed through phase 3.
    pub version: AtomicI64,
    /// Highest version known fully committed (logged and reported).
    pub committed_version: NotifiedVersion,
    pub min_known_committed_version: AtomicI64,
    pub locked: AtomicBool,
    pub metadata_version: Mutex<Option<Bytes>>,

    pub latest_local_batch_resolving: NotifiedVersion,
    pub latest_local_batch_logging: NotifiedVersion,
    pub local_batch_number: AtomicI64,
    pub commit_version_request_number: AtomicU64,
    pub most_recent_processed_request_number: AtomicU64,

    pub key_resolvers: Mutex<KeyResolverMap>,
    pub key_info: Mutex<KeyInfoMap>,

    pub commit_batches_mem_bytes: AtomicI64,
    pub commit_batch_interval: Mutex<f64>,
    pub commit_compute_per_operation: Mutex<Vec<f64>>,
    pub last_coalesce_time: Mutex<f64>,

    pub txs_pop_versions: Mutex<VecDeque<(Version, Version)>>,
    pub last_txs_pop: AtomicI64,

    pub last_commit_latency: Mutex<f64>,
    pub last_commit_time: NotifiedTime,
    pub last_start_commit: Mutex<f64>,
    pub update_commit_requests: AtomicI64,

    pub transaction_tag_commit_cost: Mutex<HashMap<TransactionTag, CommitCostEstimation>>,

    /// Set once the first batch has populated the txn-state mirror.
    pub valid_state: AtomicBool,
    pub stats: ProxyStats,
}

impl ProxyCommitData {
    pub fn new(
        knobs: Arc<Knobs>,
        master: Arc<dyn Master>,
        resolvers: Vec<Arc<dyn Resolver>>,
        log_system: Arc<dyn LogSystem>,
        num_proxies: usize,
        default_tags: Vec<Tag>,
    ) -> Arc<Self> {
        assert!(!resolvers.is_empty());
        let commit_batch_interval = knobs.commit_batch_interval_min;
        let compute_buckets = knobs.proxy_compute_buckets;
        Arc::new(Self {
            id: Uuid::new_v4(),
            master,
            resolvers,
            log_system,
            txn_state: TxnStateStore::new(),
            num_proxies: num_proxies.max(1),
            version: AtomicI64::new(0),
            committed_version: NotifiedVersion::new(0),
            min_known_committed_version: AtomicI64::new(0),
            locked: AtomicBool::new(false),
            metadata_version: Mutex::new(None),
            latest_local_batch_resolving: NotifiedVersion::new(0),
            latest_local_batch_logging: NotifiedVersion::new(0),
            local_batch_number: AtomicI64::new(0),
            commit_version_request_number: AtomicU64::new(1),
            most_recent_processed_request_number: AtomicU64::new(0),
            key_resolvers: Mutex::new(KeyResolverMap::new()),
            key_info: Mutex::new(KeyInfoMap::new(default_tags)),
            commit_batches_mem_bytes: AtomicI64::new(0),
            commit_batch_interval: Mutex::new(commit_batch_interval),
            commit_compute_per_operation: Mutex::new(vec![
                knobs.min_proxy_compute;
                compute_buckets
            ]),
            last_coalesce_time: Mutex::new(0.0),
            txs_pop_versions: Mutex::new(VecDeque::new()),
            last_txs_pop: AtomicI64::new(0),
            last_commit_latency: Mutex::new(0.0),
            last_commit_time: NotifiedTime::new(0.0),
            last_start_commit: Mutex::new(0.0),
            update_commit_requests: AtomicI64::new(0),
            transaction_tag_commit_cost: Mutex::new(HashMap::new()),
            valid_state: AtomicBool::new(false),
            stats: ProxyStats::default(),
            knobs,
        })
    }

    /// Apply one transaction's metadata mutations to the state mirror and
    /// the derived range maps.
    pub fn apply_metadata_mutations(&self, mutations: &[Mutation]) {
        let key_servers = key_servers_prefix();
        let cache_ranges = cache_ranges_prefix();
        let backup_ranges = backup_ranges_prefix();

        for mutation in mutations {
            match mutation {
                Mutation::Set { key, value } => {
                    if key.is_empty() || key[0] != braid_core::types::SYSTEM_KEY_PREFIX {
                        continue;
                    }
                    self.txn_state.set(key.clone(), value.clone());

                    if let Some(shard_begin) = key.strip_prefix(key_servers.as_ref()) {
                        match decode_tag_value(value) {
                            Ok(tags) => {
                                self.key_info
                                    .lock()
                                    .expect("key info poisoned")
                                    .set_shard_tags(shard_begin, tags);
                            }
                            Err(err) => {
                                tracing::warn!(error = ?err, "malformed key servers value")
                            }
                        }
                    } else if let Some(range_begin) = key.strip_prefix(cache_ranges.as_ref()) {
                        self.key_info
                            .lock()
                            .expect("key info poisoned")
                            .set_cached(range_begin, !value.is_empty());
                    } else if let Some(range_begin) = key.strip_prefix(backup_ranges.as_ref()) {
                        match decode_backup_destinations(value) {
                            Ok(destinations) => {
                                self.key_info
                                    .lock()
                                    .expect("key info poisoned")
                                    .set_backup_destinations(range_begin, destinations);
                            }
                            Err(err) => {
                                tracing::warn!(error = ?err, "malformed backup ranges value")
                            }
                        }
                    }
                }
                Mutation::ClearRange { begin, end } => {
                    if begin.is_empty() || begin[0] != braid_core::types::SYSTEM_KEY_PREFIX {
                        continue;
                    }
                    self.txn_state
                        .clear(KeyRange::new(begin.clone(), end.clone()));
                }
                // Atomic ops never target the metadata keyspace.
                _ => {}
            }
        }
    }

    pub fn tags_for_key(&self, key: &[u8]) -> Vec<Tag> {
        self.key_info
            .lock()
            .expect("key info poisoned")
            .tags_for_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_resolver_history_walk() {
        let mut map = KeyResolverMap::new();
        map.apply_change(
            &ResolverMove {
                range: KeyRange::new(&b"b"[..], &b"d"[..]),
                dest: 1,
            },
            100,
        );
        map.apply_change(
            &ResolverMove {
                range: KeyRange::new(&b"c"[..], &b"e"[..]),
                dest: 2,
            },
            200,
        );

        // A read far in the past sees every historical owner.
        let all = map.resolvers_for_read(&KeyRange::new(&b"c"[..], &b"c2"[..]), 0);
        assert_eq!(all.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);

        // A recent read only needs the newest owner.
        let recent = map.resolvers_for_read(&KeyRange::new(&b"c"[..], &b"c2"[..]), 300);
        assert_eq!(recent.into_iter().collect::<Vec<_>>(), vec![2]);

        // Writes go to current owners only.
        let write = map.resolvers_for_write(&KeyRange::new(&b"a"[..], &b"f"[..]));
        assert_eq!(write.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn key_resolver_coalesce_drops_old_layers() {
        let mut map = KeyResolverMap::new();
        map.apply_change(
            &ResolverMove {
                range: KeyRange::new(&b"a"[..], &b"m"[..]),
                dest: 1,
            },
            100,
        );
        map.apply_change(
            &ResolverMove {
                range: KeyRange::new(&b"a"[..], &b"m"[..]),
                dest: 2,
            },
            200,
        );
        let before = map.len();
        map.coalesce(250);
        assert!(map.len() <= before);

        // After coalescing past both changes only the newest layer remains.
        let read = map.resolvers_for_read(&KeyRange::new(&b"b"[..], &b"c"[..]), 0);
        assert_eq!(read.into_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn key_info_shard_updates() {
        let mut info = KeyInfoMap::new(vec![Tag::new(0, 0)]);
        info.set_shard_tags(b"m", vec![Tag::new(0, 5)]);

        assert_eq!(info.tags_for_key(b"a"), vec![Tag::new(0, 0)]);
        assert_eq!(info.tags_for_key(b"z"), vec![Tag::new(0, 5)]);

        let slices = info.intersecting_tags(&KeyRange::new(&b"a"[..], &b"z"[..]));
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn txn_state_store_commit_messages() {
        let store = TxnStateStore::new();
        store.set(Bytes::from_static(b"\xff/a"), Bytes::from_static(b"1"));
        store.set(Bytes::from_static(b"\xff/b"), Bytes::from_static(b"2"));

        let commit = store.commit_message();
        assert_eq!(commit.mutations.len(), 2);
        assert!(!commit.is_acked());

        // Drained: the next commit message is empty.
        assert!(store.commit_message().mutations.is_empty());
        assert_eq!(store.read_value(b"\xff/a").unwrap().as_ref(), b"1");
    }

    #[test]
    fn metadata_apply_updates_key_info() {
        let data = test_proxy();
        let mut key = key_servers_prefix().to_vec();
        key.extend_from_slice(b"mm");
        data.apply_metadata_mutations(&[Mutation::Set {
            key: Bytes::from(key),
            value: encode_tag_value(&[Tag::new(0, 9)]),
        }]);

        assert_eq!(data.tags_for_key(b"zz"), vec![Tag::new(0, 9)]);
        assert_eq!(data.tags_for_key(b"aa"), vec![Tag::new(0, 7)]);
    }

    fn test_proxy() -> Arc<ProxyCommitData> {
        tests_support::test_proxy_with_resolvers(1)
    }
}
