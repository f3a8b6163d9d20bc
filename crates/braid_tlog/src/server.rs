//! The transaction log server: accepts ordered commit pushes, indexes them
//! by tag, drives disk-queue durability, serves pops and locks, and
//! assembles split-transaction parts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use braid_core::clock::now_seconds;
use braid_core::error::{Error, Result};
use braid_core::interfaces::{
    KvStore, LogSystem, TLogCommitRequest, TLogLockResult, TLogQueuingMetricsReply,
};
use braid_core::knobs::Knobs;
use braid_core::timed_cache::{PartMerger, TimedCache};
use braid_core::types::{Tag, Version};
use braid_core::watch::NotifiedVersion;

use crate::disk_queue::DiskQueue;
use crate::log_data::LogCore;
use crate::peek::PeekTrackers;
use crate::persist::{self, SpillType};
use crate::queue::{TLogQueue, TLogQueueEntry};

/// Identity of a log generation instance.
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub log_id: Uuid,
    pub locality: i8,
    pub log_router_tags: usize,
    pub txs_tags: usize,
    pub spill_type: SpillType,
    pub recovery_count: u64,
    /// Storage tags recruited onto this log; they start as
    /// unpopped-recovered until storage catches up.
    pub tags: Vec<Tag>,
    pub recovered_at: Version,
}

impl LogConfig {
    pub fn new(log_id: Uuid) -> Self {
        Self {
            log_id,
            locality: 0,
            log_router_tags: 0,
            txs_tags: 1,
            spill_type: SpillType::Reference,
            recovery_count: 0,
            tags: Vec::new(),
            recovered_at: 0,
        }
    }
}

type SplitResult = std::result::Result<Version, Error>;

pub(crate) struct IgnorePopState {
    pub active: bool,
    pub uid: Option<Uuid>,
    pub deadline: f64,
    pub deferred: BTreeMap<Tag, Version>,
}

pub struct TLogServer {
    pub(crate) knobs: Arc<Knobs>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) queue: TLogQueue,
    pub(crate) core: Mutex<LogCore>,
    log_id: Uuid,

    /// Latest accepted version; advanced at the end of each commit's
    /// critical section.
    pub version: NotifiedVersion,
    /// Latest version durably pushed to the disk queue.
    pub queue_committed_version: NotifiedVersion,
    pub(crate) queue_commit_begin: AtomicI64,
    pub(crate) queue_commit_end: NotifiedVersion,

    pub(crate) shared_bytes_input: AtomicI64,
    pub(crate) shared_bytes_durable: AtomicI64,
    pub(crate) disk_queue_commit_bytes: AtomicI64,
    pub(crate) large_disk_queue_commit: watch::Sender<bool>,

    pub(crate) stopped: watch::Sender<bool>,
    pub(crate) recovery_complete: watch::Sender<bool>,

    pub(crate) peek_memory_limiter: Arc<Semaphore>,
    pub(crate) concurrent_log_router_reads: Arc<Semaphore>,
    pub(crate) persistent_data_commit_lock: Mutex<()>,
    pub(crate) peek_trackers: Mutex<PeekTrackers>,

    pub(crate) ignore_pop: Mutex<IgnorePopState>,
    split_merger: Mutex<PartMerger<Uuid, TLogCommitRequest>>,
    split_responses: Mutex<TimedCache<Uuid, watch::Sender<Option<SplitResult>>>>,

    pub(crate) log_system: Mutex<Option<Arc<dyn LogSystem>>>,
    pub(crate) instance_id: u64,
}

impl TLogServer {
    fn build(
        knobs: Arc<Knobs>,
        kv: Arc<dyn KvStore>,
        disk: Arc<dyn DiskQueue>,
        core: LogCore,
        initial_version: Version,
    ) -> Arc<Self> {
        let split_window = Duration::from_secs_f64(knobs.split_transaction_history);
        Arc::new(Self {
            peek_memory_limiter: Arc::new(Semaphore::new(
                knobs.tlog_spill_reference_max_peek_memory_bytes as usize,
            )),
            concurrent_log_router_reads: Arc::new(Semaphore::new(
                knobs.concurrent_log_router_reads,
            )),
            peek_trackers: Mutex::new(PeekTrackers::new(knobs.clone())),
            split_merger: Mutex::new(PartMerger::new(split_window)),
            split_responses: Mutex::new(TimedCache::new(split_window)),
            version: NotifiedVersion::new(initial_version),
            queue_committed_version: NotifiedVersion::new(initial_version),
            queue_commit_begin: AtomicI64::new(0),
            queue_commit_end: NotifiedVersion::new(0),
            shared_bytes_input: AtomicI64::new(core.bytes_input),
            shared_bytes_durable: AtomicI64::new(core.bytes_durable),
            disk_queue_commit_bytes: AtomicI64::new(0),
            large_disk_queue_commit: watch::channel(false).0,
            stopped: watch::channel(false).0,
            recovery_complete: watch::channel(false).0,
            persistent_data_commit_lock: Mutex::new(()),
            ignore_pop: Mutex::new(IgnorePopState {
                active: false,
                uid: None,
                deadline: 0.0,
                deferred: BTreeMap::new(),
            }),
            log_system: Mutex::new(None),
            instance_id: rand_instance_id(),
            log_id: core.log_id,
            core: Mutex::new(core),
            kv,
            queue: TLogQueue::new(disk),
            knobs,
        })
    }

    /// Create a brand-new log generation, writing its identity keys.
    pub async fn create(
        knobs: Arc<Knobs>,
        kv: Arc<dyn KvStore>,
        disk: Arc<dyn DiskQueue>,
        config: LogConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let mut core = LogCore::new(
            config.log_id,
            config.locality,
            config.log_router_tags,
            config.txs_tags,
        );
        core.recovery_count = config.recovery_count;
        core.spill_type = config.spill_type;
        core.recovered_at = config.recovered_at;
        core.initialized = true;
        for tag in &config.tags {
            core.create_tag_data(*tag, 0, true, true, true);
            core.unpopped_recovered_tags += 1;
        }

        let server = Self::build(knobs, kv, disk, core, config.recovered_at);
        server.init_persistent_state().await?;
        Ok(server)
    }

    /// Restore a log generation from its kv store and disk queue.
    pub async fn restore(
        knobs: Arc<Knobs>,
        kv: Arc<dyn KvStore>,
        disk: Arc<dyn DiskQueue>,
        log_id: Uuid,
    ) -> anyhow::Result<Arc<Self>> {
        let format = kv
            .read_value(persist::PERSIST_FORMAT_KEY)
            .ok_or_else(|| anyhow::anyhow!("log store is uninitialized"))?;
        anyhow::ensure!(
            format.as_ref() == persist::PERSIST_FORMAT_VALUE,
            "unsupported log store format"
        );

        let read_version = |key: Bytes| -> anyhow::Result<Version> {
            let value = kv
                .read_value(&key)
                .ok_or_else(|| anyhow::anyhow!("missing persistent key"))?;
            persist::decode_version_value(&value)
        };

        let persistent_version = read_version(persist::persist_current_version_key(log_id))?;
        let known_committed = read_version(persist::persist_known_committed_key(log_id))?;
        let locality = persist::decode_i8_value(
            &kv.read_value(&persist::persist_locality_key(log_id))
                .ok_or_else(|| anyhow::anyhow!("missing locality"))?,
        )?;
        let log_router_tags = persist::decode_u64_value(
            &kv.read_value(&persist::persist_log_router_tags_key(log_id))
                .ok_or_else(|| anyhow::anyhow!("missing log router tags"))?,
        )? as usize;
        let txs_tags = persist::decode_u64_value(
            &kv.read_value(&persist::persist_txs_tags_key(log_id))
                .ok_or_else(|| anyhow::anyhow!("missing txs tags"))?,
        )? as usize;
        let recovery_count = persist::decode_u64_value(
            &kv.read_value(&persist::persist_recovery_count_key(log_id))
                .ok_or_else(|| anyhow::anyhow!("missing recovery count"))?,
        )?;
        let protocol = persist::decode_u64_value(
            &kv.read_value(&persist::persist_protocol_version_key(log_id))
                .ok_or_else(|| anyhow::anyhow!("missing protocol version"))?,
        )?;
        anyhow::ensure!(
            protocol == persist::PROTOCOL_VERSION,
            "unsupported protocol version {protocol:#x}"
        );
        let spill_type = SpillType::decode(
            &kv.read_value(&persist::persist_spill_type_key(log_id))
                .ok_or_else(|| anyhow::anyhow!("missing spill type"))?,
        )?;
        let recovery_location = kv
            .read_value(persist::PERSIST_RECOVERY_LOCATION_KEY)
            .map(|v| persist::decode_u64_value(&v))
            .transpose()?
            .unwrap_or(0);

        let mut core = LogCore::new(log_id, locality, log_router_tags, txs_tags);
        core.recovery_count = recovery_count;
        core.spill_type = spill_type;
        core.persistent_data_version = persistent_version;
        core.persistent_data_durable_version = persistent_version;
        core.known_committed_version = known_committed;
        core.durable_known_committed_version = known_committed;
        core.initialized = true;

        for (key, value) in kv.read_range(persist::persist_tag_popped_range(log_id), None, None) {
            let tag = persist::decode_tag_popped_key(log_id, &key)?;
            let popped = persist::decode_version_value(&value)?;
            let data = core.create_tag_data(tag, popped, false, false, false);
            data.persistent_popped = popped;
        }

        let server = Self::build(knobs, kv, disk, core, persistent_version);
        server.replay_queue(recovery_location).await?;
        Ok(server)
    }

    /// Replay committed queue entries above the spilled prefix back into
    /// memory. A torn tail is zero-filled by the framed reader.
    async fn replay_queue(&self, recovery_location: u64) -> anyhow::Result<()> {
        let finished = self.queue.initialize_recovery(recovery_location).await?;
        let mut recovered = 0usize;
        let mut last_version = None;

        if !finished {
            loop {
                let next = match self.queue.read_next().await {
                    Ok(next) => next,
                    Err(Error::EndOfStream) => break,
                    Err(err) => return Err(err.into()),
                };
                let mut core = self.core.lock().await;
                if next.entry.id != core.log_id {
                    continue;
                }
                core.version_location
                    .insert(next.entry.version, (next.start, next.end));
                core.known_committed_version = core
                    .known_committed_version
                    .max(next.entry.known_committed_version);
                core.durable_known_committed_version = core.known_committed_version;
                if next.entry.version > core.persistent_data_version {
                    let added = core.commit_messages(
                        next.entry.version,
                        &next.entry.messages,
                        &self.knobs,
                    )?;
                    self.shared_bytes_input.fetch_add(added, Ordering::Relaxed);
                }
                last_version = Some(next.entry.version);
                recovered += 1;
            }
        }

        if let Some(version) = last_version {
            self.version.set_at_least(version);
            self.queue_committed_version.set_at_least(version);
        }
        info!(
            recovered,
            version = self.version.get(),
            "restored log from disk queue"
        );
        Ok(())
    }

    async fn init_persistent_state(&self) -> anyhow::Result<()> {
        let _commit_lock = self.persistent_data_commit_lock.lock().await;
        let mut core = self.core.lock().await;
        let id = core.log_id;

        self.kv.set(
            Bytes::from_static(persist::PERSIST_FORMAT_KEY),
            Bytes::from_static(persist::PERSIST_FORMAT_VALUE),
        );
        self.kv.set(
            persist::persist_current_version_key(id),
            persist::encode_version_value(self.version.get()),
        );
        self.kv.set(
            persist::persist_known_committed_key(id),
            persist::encode_version_value(core.known_committed_version),
        );
        self.kv.set(
            persist::persist_locality_key(id),
            persist::encode_i8_value(core.locality),
        );
        self.kv.set(
            persist::persist_log_router_tags_key(id),
            persist::encode_u64_value(core.log_router_tags as u64),
        );
        self.kv.set(
            persist::persist_txs_tags_key(id),
            persist::encode_u64_value(core.txs_tags as u64),
        );
        self.kv.set(
            persist::persist_recovery_count_key(id),
            persist::encode_u64_value(core.recovery_count),
        );
        self.kv.set(
            persist::persist_protocol_version_key(id),
            persist::encode_u64_value(persist::PROTOCOL_VERSION),
        );
        self.kv
            .set(persist::persist_spill_type_key(id), core.spill_type.encode());

        for tag in core.all_tags() {
            self.update_persistent_popped(&mut core, tag);
        }

        self.kv.commit().await
    }

    pub fn log_id(&self) -> Uuid {
        self.log_id
    }

    pub async fn set_log_system(&self, log_system: Arc<dyn LogSystem>) {
        *self.log_system.lock().await = Some(log_system);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    // -----------------------------------------------------------------------
    // Commit path

    /// Append one commit. Replies with the durable known committed version
    /// once the entry is on disk.
    pub async fn commit(self: &Arc<Self>, req: TLogCommitRequest) -> Result<Version> {
        if req.split_transaction.is_some() {
            self.commit_split(req).await
        } else {
            self.commit_inner(req).await
        }
    }

    async fn commit_inner(self: &Arc<Self>, req: TLogCommitRequest) -> Result<Version> {
        {
            let mut core = self.core.lock().await;
            core.min_known_committed_version = core
                .min_known_committed_version
                .max(req.min_known_committed_version);
        }

        self.version.when_at_least(req.prev_version).await;

        // Backpressure: refuse to run unboundedly ahead of spilling.
        let mut last_warn = 0.0f64;
        while self.shared_bytes_input.load(Ordering::Relaxed)
            - self.shared_bytes_durable.load(Ordering::Relaxed)
            >= self.knobs.tlog_hard_limit_bytes
            && !self.is_stopped()
        {
            let now = now_seconds();
            if now - last_warn >= 1.0 {
                let core = self.core.lock().await;
                warn!(
                    version = self.version.get(),
                    persistent_data_version = core.persistent_data_version,
                    persistent_data_durable_version = core.persistent_data_durable_version,
                    "log falling behind spilling"
                );
                last_warn = now;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        if self.is_stopped() {
            return Err(Error::TlogStopped);
        }

        {
            let mut core = self.core.lock().await;
            // Relies on the critical section between this check and
            // version.set below: no other commit can interleave.
            if self.version.get() == req.prev_version {
                let added = core
                    .commit_messages(req.version, &req.messages, &self.knobs)
                    .map_err(|_| Error::Internal("malformed commit blob"))?;
                self.shared_bytes_input.fetch_add(added, Ordering::Relaxed);
                for blob in &req.additional_messages {
                    let added = core
                        .commit_messages(req.version, blob, &self.knobs)
                        .map_err(|_| Error::Internal("malformed commit blob"))?;
                    self.shared_bytes_input.fetch_add(added, Ordering::Relaxed);
                }
                core.known_committed_version = core
                    .known_committed_version
                    .max(req.known_committed_version);

                let entry = TLogQueueEntry {
                    id: core.log_id,
                    version: req.version,
                    known_committed_version: core.known_committed_version,
                    messages: concat_messages(&req),
                };
                let (start, end) = self.queue.push(&entry);
                core.version_location.insert(req.version, (start, end));

                let commit_bytes = self
                    .disk_queue_commit_bytes
                    .fetch_add(entry.expected_size() as i64, Ordering::Relaxed)
                    + entry.expected_size() as i64;
                if commit_bytes > self.knobs.max_queue_commit_bytes {
                    let _ = self.large_disk_queue_commit.send_replace(true);
                }

                // Wakes the queue-commit loop and any blocked peeks.
                self.version.set(req.version);
            }
        }

        // Reply only after all prior entries are durable too.
        let mut stopped_rx = self.stopped.subscribe();
        tokio::select! {
            _ = self.queue_committed_version.when_at_least(req.version) => {}
            _ = stopped_rx.wait_for(|s| *s) => {
                return Err(Error::TlogStopped);
            }
        }

        let core = self.core.lock().await;
        Ok(core.durable_known_committed_version)
    }

    /// Buffer one part of a split transaction; whoever delivers the final
    /// part runs the merged commit and fans the response out to all parts.
    async fn commit_split(self: &Arc<Self>, req: TLogCommitRequest) -> Result<Version> {
        let split = req
            .split_transaction
            .expect("commit_split requires a split marker");

        let mut response_rx = {
            let mut responses = self.split_responses.lock().await;
            match responses.get_mut(&split.id) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    responses.add(split.id, tx);
                    rx
                }
            }
        };

        let complete = {
            let mut merger = self.split_merger.lock().await;
            merger
                .insert(
                    split.id,
                    split.part_index as usize,
                    split.total_parts as usize,
                    &req,
                )
                .map_err(|_| Error::Internal("split part mismatch"))?
        };

        if complete {
            let merged = {
                let mut merger = self.split_merger.lock().await;
                merger.remove(&split.id)
            };
            if let Some(mut merged) = merged {
                merged.split_transaction = None;
                let result = self.commit_inner(merged).await;
                let mut responses = self.split_responses.lock().await;
                if let Some(tx) = responses.get_mut(&split.id) {
                    let _ = tx.send_replace(Some(result.clone()));
                }
                return result;
            }
        }

        // Wait for whichever task commits the merged request; an abandoned
        // split times out with the merger window.
        let window = Duration::from_secs_f64(self.knobs.split_transaction_history);
        let outcome = tokio::time::timeout(window, response_rx.wait_for(|r| r.is_some())).await;
        match outcome {
            Ok(Ok(value)) => value.clone().expect("checked is_some"),
            Ok(Err(_)) => Err(Error::BrokenPromise),
            Err(_) => Err(Error::Timeout),
        }
    }

    // -----------------------------------------------------------------------
    // Queue commit loop

    /// Drive disk-queue durability: every time `version` passes the last
    /// committed point, start a commit, keeping at most one in flight
    /// unless a large batch forces overlap.
    pub async fn commit_queue(self: Arc<Self>) {
        loop {
            let committed = self
                .queue_committed_version
                .get()
                .max({ self.core.lock().await.queue_committing_version });

            if self.is_stopped() && self.version.get() == committed {
                self.queue_committed_version
                    .when_at_least(self.version.get())
                    .await;
                return;
            }

            self.version.when_at_least(committed + 1).await;

            while self.queue_commit_begin.load(Ordering::Relaxed) != self.queue_commit_end.get()
                && !*self.large_disk_queue_commit.borrow()
            {
                let target = self.queue_commit_begin.load(Ordering::Relaxed);
                let mut large_rx = self.large_disk_queue_commit.subscribe();
                tokio::select! {
                    _ = self.queue_commit_end.when_at_least(target) => {}
                    _ = large_rx.wait_for(|l| *l) => {}
                }
            }

            // Claim the commit point before yielding so the next loop
            // iteration observes it.
            let version = self.version.get();
            let commit_number = self.queue_commit_begin.fetch_add(1, Ordering::Relaxed) + 1;
            let known_committed = {
                let mut core = self.core.lock().await;
                core.queue_committing_version = version;
                core.known_committed_version
            };
            tokio::spawn(
                self.clone()
                    .do_queue_commit(version, commit_number, known_committed),
            );
        }
    }

    pub(crate) async fn do_queue_commit(
        self: Arc<Self>,
        version: Version,
        commit_number: i64,
        known_committed: Version,
    ) {
        if let Err(err) = self.queue.commit().await {
            warn!(error = ?err, "disk queue commit failed");
            return;
        }
        self.disk_queue_commit_bytes.store(0, Ordering::Relaxed);
        let _ = self.large_disk_queue_commit.send_replace(false);

        // Commits complete in start order.
        self.queue_commit_end.when_at_least(commit_number - 1).await;

        if version > self.queue_committed_version.get() {
            let recovered = {
                let mut core = self.core.lock().await;
                core.durable_known_committed_version = known_committed;
                core.unpopped_recovered_tags == 0 && known_committed >= core.recovered_at
            };
            if recovered {
                let _ = self.recovery_complete.send_replace(true);
            }
            self.queue_committed_version.set(version);
        }
        self.queue_commit_end.set_at_least(commit_number);
    }

    // -----------------------------------------------------------------------
    // Pop

    pub async fn pop(self: &Arc<Self>, tag: Tag, to: Version) -> Result<()> {
        // Replay deferred pops once the disable window lapses.
        let replay = {
            let mut ignore = self.ignore_pop.lock().await;
            if ignore.active && now_seconds() > ignore.deadline {
                info!("re-enabling pops after disable window expired");
                ignore.active = false;
                ignore.uid = None;
                ignore.deadline = 0.0;
                Some(std::mem::take(&mut ignore.deferred))
            } else {
                None
            }
        };
        if let Some(deferred) = replay {
            for (tag, version) in deferred {
                self.pop_core(tag, version).await?;
            }
        }

        {
            let mut ignore = self.ignore_pop.lock().await;
            if ignore.active {
                let entry = ignore.deferred.entry(tag).or_insert(to);
                *entry = (*entry).max(to);
                return Ok(());
            }
        }

        self.pop_core(tag, to).await
    }

    pub(crate) async fn pop_core(self: &Arc<Self>, tag: Tag, to: Version) -> Result<()> {
        // A pop past the accepted frontier is clamped to it.
        let mut up_to = to.min(self.version.get());
        let mut tag = tag;

        if tag.is_pseudo_locality() {
            let log_system = self.log_system.lock().await.clone();
            match log_system {
                Some(log_system) => {
                    up_to = log_system.pop_pseudo_locality_tag(tag, up_to);
                    tag.locality = braid_core::types::TAG_LOCALITY_LOG_ROUTER;
                }
                None => {
                    warn!(tag = %tag, version = up_to, "pseudo-locality pop without log system");
                    return Ok(());
                }
            }
        }

        let mut core = self.core.lock().await;
        if core.get_tag_data(tag).is_none() {
            core.create_tag_data(tag, up_to, true, true, false);
            return Ok(());
        }

        let recovered_at = core.recovered_at;
        let durable = core.persistent_data_durable_version;
        let data = core.get_tag_data(tag).expect("checked above");
        if up_to <= data.popped {
            return Ok(());
        }
        data.popped = up_to;
        data.popped_recently = true;

        let mut finished_recovered_tag = false;
        if data.unpopped_recovered && up_to > recovered_at {
            data.unpopped_recovered = false;
            finished_recovered_tag = true;
        }
        if finished_recovered_tag {
            core.unpopped_recovered_tags -= 1;
            info!(
                tag = %tag,
                remaining = core.unpopped_recovered_tags,
                "storage caught up past the recovery point"
            );
            if core.unpopped_recovered_tags == 0
                && core.durable_known_committed_version >= core.recovered_at
            {
                let _ = self.recovery_complete.send_replace(true);
            }
        }

        if up_to > durable {
            let erased = core.erase_messages_before(tag, up_to, &self.knobs);
            self.shared_bytes_durable.fetch_add(erased, Ordering::Relaxed);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lock, metrics, pop control

    /// Stop accepting commits and report the final durable state; first
    /// step of recovery to a new generation.
    pub async fn lock(self: &Arc<Self>) -> Result<TLogLockResult> {
        let stop_version = self.version.get();
        {
            let mut core = self.core.lock().await;
            core.stopped = true;
        }
        let _ = self.stopped.send_replace(true);
        info!(version = stop_version, "log stopped for recovery");

        self.queue_committed_version.when_at_least(stop_version).await;

        let core = self.core.lock().await;
        Ok(TLogLockResult {
            end: stop_version,
            known_committed_version: core.known_committed_version,
        })
    }

    pub async fn get_queuing_metrics(&self) -> TLogQueuingMetricsReply {
        let core = self.core.lock().await;
        TLogQueuingMetricsReply {
            local_time: now_seconds(),
            instance_id: self.instance_id,
            bytes_input: self.shared_bytes_input.load(Ordering::Relaxed),
            bytes_durable: self.shared_bytes_durable.load(Ordering::Relaxed),
            storage_bytes: self.kv.get_storage_bytes(),
            version: core.durable_known_committed_version,
        }
    }

    pub async fn confirm_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Error::TlogStopped)
        } else {
            Ok(())
        }
    }

    /// Suspend pops (snapshot support). Fails while any window is already
    /// held, even by the same owner; the holder must enable first.
    pub async fn disable_pop(&self, uid: Uuid) -> Result<()> {
        let mut ignore = self.ignore_pop.lock().await;
        if let Some(owner) = ignore.uid {
            warn!(%owner, requested = %uid, "pop disable already held");
            return Err(Error::Internal("pop disable already held"));
        }
        ignore.active = true;
        ignore.uid = Some(uid);
        ignore.deadline = now_seconds() + self.knobs.tlog_ignore_pop_auto_enable_delay;
        Ok(())
    }

    /// Re-enable pops and replay everything deferred during the window.
    pub async fn enable_pop(self: &Arc<Self>, uid: Uuid) -> Result<()> {
        let deferred = {
            let mut ignore = self.ignore_pop.lock().await;
            match ignore.uid {
                Some(owner) if owner != uid => {
                    return Err(Error::Internal("pop disable held by another owner"));
                }
                _ => {}
            }
            ignore.active = false;
            ignore.uid = None;
            ignore.deadline = 0.0;
            std::mem::take(&mut ignore.deferred)
        };
        for (tag, version) in deferred {
            self.pop_core(tag, version).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Background tasks

    /// Spawn the durability and spill loops. Callers that drive the server
    /// manually (tests) can skip this and call the steps directly.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().commit_queue()),
            tokio::spawn(self.clone().update_storage_loop()),
            tokio::spawn(self.clone().cleanup_peek_trackers()),
        ]
    }
}

fn concat_messages(req: &TLogCommitRequest) -> Bytes {
    if req.additional_messages.is_empty() {
        return req.messages.clone();
    }
    let total = req.messages.len() + req.additional_messages.iter().map(|m| m.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&req.messages);
    for blob in &req.additional_messages {
        out.extend_from_slice(blob);
    }
    Bytes::from(out)
}

fn rand_instance_id() -> u64 {
    // Derived from a uuid so no extra dependency is needed here.
    let id = Uuid::new_v4();
    u64::from_be_bytes(id.as_bytes()[..8].try_into().expect("uuid is 16 bytes"))
}
