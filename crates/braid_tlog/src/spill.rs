//! Moving log data off the volatile heap.
//!
//! Spilling transfers per-tag messages below a chosen version into the
//! persistent kv store, either by value (txs family) or by reference
//! (normal tags, whose bytes stay in the disk queue). Only after the kv
//! commit is durable are the in-memory deques and shared blocks trimmed,
//! and only then can the disk queue's front be popped.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use braid_core::types::{DiskLoc, Tag, Version};

use crate::log_data::LogCore;
use crate::persist::{self, SpilledData};
use crate::server::TLogServer;

impl TLogServer {
    /// Persist a changed popped version and drop now-unreachable spilled
    /// data for `tag`.
    pub(crate) fn update_persistent_popped(&self, core: &mut LogCore, tag: Tag) {
        let log_id = core.log_id;
        let by_value = core.spill_by_value(tag);
        let persistent_data_version = core.persistent_data_version;

        let Some(data) = core.get_tag_data(tag) else {
            return;
        };
        if !data.popped_recently {
            return;
        }
        self.kv.set(
            persist::persist_tag_popped_key(log_id, tag),
            persist::encode_version_value(data.popped),
        );
        data.popped_recently = false;
        data.persistent_popped = data.popped;

        if data.nothing_persistent {
            return;
        }

        let popped = data.popped;
        if by_value {
            self.kv
                .clear(persist::persist_tag_messages_range(log_id, tag, 0, popped));
        } else {
            self.kv
                .clear(persist::persist_tag_message_refs_range(log_id, tag, 0, popped));
        }
        if popped > persistent_data_version {
            data.nothing_persistent = true;
        }
    }

    /// Refresh `popped_location` for a by-reference tag so disk-queue pops
    /// do not discard bytes its spilled references still point at.
    pub(crate) fn update_popped_location(&self, core: &mut LogCore, tag: Tag) {
        if core.spill_by_value(tag) {
            return;
        }
        let log_id = core.log_id;
        let persistent_data_version = core.persistent_data_version;

        let (persistent_popped, nothing_persistent) = {
            let Some(data) = core.get_tag_data(tag) else {
                return;
            };
            if data.version_for_popped_location >= data.persistent_popped {
                return;
            }
            data.version_for_popped_location = data.persistent_popped;
            (data.persistent_popped, data.nothing_persistent)
        };

        let mut nothing_persistent = nothing_persistent;
        if persistent_popped <= persistent_data_version {
            // Use the persisted popped version, not the newer in-memory
            // one: a pop received after the last spill must not free bytes
            // the spilled references still cover.
            let refs = self.kv.read_range(
                persist::persist_tag_message_refs_range(
                    log_id,
                    tag,
                    persistent_popped,
                    persistent_data_version + 1,
                ),
                Some(1),
                None,
            );
            if refs.is_empty() {
                nothing_persistent = true;
                if let Some(data) = core.get_tag_data(tag) {
                    data.nothing_persistent = true;
                }
            } else {
                match persist::decode_spilled_batch(&refs[0].1) {
                    Ok(batch) => {
                        for spilled in batch {
                            if spilled.version >= persistent_popped {
                                if let Some(data) = core.get_tag_data(tag) {
                                    data.popped_location = spilled.start;
                                    data.version_for_popped_location = spilled.version;
                                }
                                break;
                            }
                        }
                    }
                    Err(err) => warn!(error = ?err, tag = %tag, "corrupt spilled reference batch"),
                }
            }
        }

        if persistent_popped >= persistent_data_version || nothing_persistent {
            // Everything left for this tag is in memory.
            if let Some((&version, &(start, _))) =
                core.version_location.range(persistent_popped..).next()
            {
                if let Some(data) = core.get_tag_data(tag) {
                    data.popped_location = start;
                    data.version_for_popped_location = version;
                }
            }
        }
    }

    /// Compute the earliest disk-queue byte still needed by any tag and
    /// release everything before it.
    pub(crate) async fn pop_disk_queue(self: &Arc<Self>) {
        let mut core = self.core.lock().await;
        if !core.initialized {
            return;
        }

        for tag in core.all_tags() {
            self.update_popped_location(&mut core, tag);
        }

        let mut min_location: DiskLoc = 0;
        let mut min_version: Version = 0;
        if let Some((&version, &(start, _))) = core
            .version_location
            .range(core.persistent_data_version..)
            .next()
        {
            min_location = start;
            min_version = version;
        }

        let mut min_popped_tag_version = Version::MAX;
        let mut min_popped_tag = Tag::invalid();
        for tag in core.all_tags() {
            if core.spill_by_value(tag) {
                continue;
            }
            let Some(data) = core.get_tag_data(tag) else {
                continue;
            };
            if !data.nothing_persistent {
                min_location = min_location.min(data.popped_location);
                min_version = min_version.min(data.popped);
            }
            if (!data.nothing_persistent || !data.version_messages.is_empty())
                && data.popped < min_popped_tag_version
            {
                min_popped_tag_version = data.popped;
                min_popped_tag = tag;
            }
        }
        core.min_popped_tag_version = min_popped_tag_version;
        core.min_popped_tag = min_popped_tag;

        if self.queue_commit_end.get() > 0 {
            // Never pop past the last committed entry's start.
            let last_committed = self.queue_committed_version.get();
            let mut last_committed_location = min_location;
            if let Some((_, &(start, _))) = core.version_location.range(last_committed..).next() {
                last_committed_location = start;
            }
            self.queue.pop(min_location.min(last_committed_location));
            core.queue_popped_version = core.queue_popped_version.max(min_version);
        }
    }

    /// Spill everything at or below `new_version` into the kv store, then
    /// trim memory once the kv commit is durable.
    pub(crate) async fn update_persistent_data(
        self: &Arc<Self>,
        new_version: Version,
    ) -> anyhow::Result<()> {
        let knobs = self.knobs.clone();
        let mut core = self.core.lock().await;
        assert!(new_version <= self.version.get());
        assert!(new_version <= self.queue_committed_version.get());
        assert!(new_version > core.persistent_data_version);
        assert_eq!(
            core.persistent_data_version,
            core.persistent_data_durable_version
        );
        let log_id = core.log_id;

        for tag in core.all_tags() {
            // Drop messages the tag has already popped, then persist the
            // new popped mark before writing fresh spill data.
            let popped = core.get_tag_data(tag).expect("listed tag").popped;
            let erased = core.erase_messages_before(tag, popped, &knobs);
            self.shared_bytes_durable.fetch_add(erased, Ordering::Relaxed);
            self.update_persistent_popped(&mut core, tag);

            let by_value = core.spill_by_value(tag);
            let mut spill_batch: Vec<SpilledData> = Vec::new();
            let mut batch_first_location = DiskLoc::MAX;
            let mut batch_last_version = Version::MIN;

            // Collect the spill work without holding a borrow on the tag
            // data across kv writes.
            let versions: Vec<(Version, i64, Bytes)> = {
                let Some(data) = core.get_tag_data(tag) else {
                    continue;
                };
                let mut grouped: Vec<(Version, i64, Vec<u8>)> = Vec::new();
                for (version, record) in &data.version_messages {
                    if *version > new_version {
                        break;
                    }
                    match grouped.last_mut() {
                        Some((v, bytes, concat)) if *v == *version => {
                            *bytes += record.len() as i64;
                            concat.extend_from_slice(record);
                        }
                        _ => grouped.push((*version, record.len() as i64, record.to_vec())),
                    }
                }
                grouped
                    .into_iter()
                    .map(|(v, bytes, concat)| (v, bytes, Bytes::from(concat)))
                    .collect()
            };

            if versions.is_empty() {
                continue;
            }
            if let Some(data) = core.get_tag_data(tag) {
                data.nothing_persistent = false;
            }

            for (version, mutation_bytes, concat) in versions {
                if by_value {
                    self.kv.set(
                        persist::persist_tag_messages_key(log_id, tag, version),
                        concat,
                    );
                    continue;
                }

                let Some(&(start, end)) = core.version_location.get(&version) else {
                    warn!(version, tag = %tag, "spill reference without queue location");
                    continue;
                };
                spill_batch.push(SpilledData {
                    version,
                    start,
                    length: (end - start) as u32,
                    mutation_bytes: mutation_bytes as u32,
                });
                batch_first_location = batch_first_location.min(start);
                batch_last_version = batch_last_version.max(version);

                if spill_batch.len() * std::mem::size_of::<SpilledData>()
                    > knobs.tlog_spill_reference_max_bytes_per_batch as usize
                {
                    self.kv.set(
                        persist::persist_tag_message_refs_key(log_id, tag, batch_last_version),
                        persist::encode_spilled_batch(&spill_batch),
                    );
                    if let Some(data) = core.get_tag_data(tag) {
                        data.popped_location = data.popped_location.min(batch_first_location);
                    }
                    spill_batch.clear();
                    batch_first_location = DiskLoc::MAX;
                }
            }

            if !spill_batch.is_empty() {
                self.kv.set(
                    persist::persist_tag_message_refs_key(log_id, tag, batch_last_version),
                    persist::encode_spilled_batch(&spill_batch),
                );
                if let Some(data) = core.get_tag_data(tag) {
                    data.popped_location = data.popped_location.min(batch_first_location);
                }
            }
        }

        if let Some((_, &(start, _))) = core.version_location.range(new_version..).next() {
            self.kv.set(
                Bytes::from_static(persist::PERSIST_RECOVERY_LOCATION_KEY),
                persist::encode_u64_value(start),
            );
        }
        self.kv.set(
            persist::persist_current_version_key(log_id),
            persist::encode_version_value(new_version),
        );
        self.kv.set(
            persist::persist_known_committed_key(log_id),
            persist::encode_version_value(core.known_committed_version),
        );
        core.persistent_data_version = new_version;

        // The commit must not run under the core lock; commits and the
        // commit path otherwise deadlock on backpressure.
        drop(core);
        self.kv.commit().await?;

        let mut core = self.core.lock().await;
        core.persistent_data_durable_version = new_version;

        for tag in core.all_tags() {
            let erased = core.erase_messages_before(tag, new_version + 1, &knobs);
            self.shared_bytes_durable.fetch_add(erased, Ordering::Relaxed);
        }

        let stale: Vec<Version> = core
            .version_sizes
            .range(..core.persistent_data_durable_version)
            .map(|(&v, _)| v)
            .collect();
        for version in stale {
            core.version_sizes.remove(&version);
        }

        while let Some((version, block)) = core.message_blocks.front() {
            if *version > new_version {
                break;
            }
            let erased = (block.len() as f64 * knobs.tlog_message_block_overhead_factor) as i64;
            core.bytes_durable += erased;
            self.shared_bytes_durable.fetch_add(erased, Ordering::Relaxed);
            core.message_blocks.pop_front();
        }

        if core.bytes_durable > core.bytes_input {
            warn!(
                bytes_input = core.bytes_input,
                bytes_durable = core.bytes_durable,
                "durable bytes overran input accounting"
            );
            core.bytes_durable = core.bytes_input;
        }

        // Keep the last version at or before the spill point: its location
        // is the boundary the queue pop must not cross.
        if let Some(&keep_from) = core
            .version_location
            .range(..new_version)
            .next_back()
            .map(|(k, _)| k)
        {
            core.version_location = core.version_location.split_off(&keep_from);
        }

        Ok(())
    }

    /// One pass of the storage updater: pick a spill target and run it.
    /// The background loop calls this continuously; tests drive it
    /// directly.
    pub async fn update_storage_once(self: &Arc<Self>) {
        let knobs = self.knobs.clone();
        let idle = Duration::from_secs_f64(knobs.tlog_storage_min_update_interval);
        let byte_limit = knobs.reference_spill_update_storage_byte_limit;
        let stopped = self.is_stopped();

        let (next_version, total_size, spill) = {
            let core = self.core.lock().await;
            if !core.initialized {
                (0, 0, false)
            } else if stopped {
                // A stopped log spills everything so the generation can be
                // discarded from memory.
                if core.persistent_data_durable_version == self.version.get() {
                    (0, 0, false)
                } else {
                    let mut total = 0i64;
                    let mut next = self.version.get();
                    let mut iter = core.version_sizes.iter().peekable();
                    while let Some((_, &(normal, txs))) = iter.next() {
                        if total >= byte_limit {
                            break;
                        }
                        total += normal + txs;
                        next = iter.peek().map_or(self.version.get(), |entry| *entry.0);
                    }
                    (next, total, next > core.persistent_data_version)
                }
            } else {
                let mut total = 0i64;
                let mut next = self.version.get();
                let mut iter = core.version_sizes.iter().peekable();
                while let Some((_, &(normal, txs))) = iter.next() {
                    let over_target = core.bytes_input - core.bytes_durable - total
                        >= knobs.tlog_spill_threshold;
                    if total >= byte_limit || !(over_target || normal == 0) {
                        break;
                    }
                    total += normal + txs;
                    next = iter.peek().map_or(self.version.get(), |entry| *entry.0);
                }
                (next, total, next > core.persistent_data_version)
            }
        };

        if !spill {
            tokio::time::sleep(idle).await;
            return;
        }

        self.queue_committed_version.when_at_least(next_version).await;

        {
            let _commit_lock = self.persistent_data_commit_lock.lock().await;
            if let Err(err) = self.update_persistent_data(next_version).await {
                warn!(error = ?err, "spill failed");
                tokio::time::sleep(idle).await;
                return;
            }
            self.pop_disk_queue().await;
        }

        if total_size < byte_limit {
            tokio::time::sleep(idle).await;
        }
    }

    pub async fn update_storage_loop(self: Arc<Self>) {
        loop {
            self.update_storage_once().await;
        }
    }
}
