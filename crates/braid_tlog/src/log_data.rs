//! In-memory state of one log generation.
//!
//! Messages live in shared ref-counted blocks (`bytes::Bytes`); the per-tag
//! deques hold zero-copy slices into them, so a block is freed only when
//! the block list and every referencing deque have dropped it.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use uuid::Uuid;

use braid_core::knobs::Knobs;
use braid_core::message::{parse_commit_blob, PeekStreamWriter};
use braid_core::types::{
    DiskLoc, Tag, Version, TAG_LOCALITY_LOG_ROUTER, TAG_LOCALITY_SATELLITE, TAG_LOCALITY_SPECIAL,
    TAG_LOCALITY_TXS,
};

use crate::persist::SpillType;

/// Per-tag message index and popped-version tracking.
///
/// Popped contract: `popped` only grows, is persisted by spills as
/// `persistent_popped`, and messages below it are never served again
/// (peeks below it get a popped hint instead).
#[derive(Debug)]
pub struct TagData {
    pub tag: Tag,
    /// `(version, raw record)` in version order; records point into shared
    /// message blocks.
    pub version_messages: VecDeque<(Version, Bytes)>,
    /// Known to have no data in the persistent store.
    pub nothing_persistent: bool,
    /// `popped` changed since the last spill.
    pub popped_recently: bool,
    pub popped: Version,
    pub persistent_popped: Version,
    pub version_for_popped_location: Version,
    /// Earliest disk-queue location still referenced by this tag.
    pub popped_location: DiskLoc,
    pub unpopped_recovered: bool,
}

impl TagData {
    pub fn new(
        tag: Tag,
        popped: Version,
        nothing_persistent: bool,
        popped_recently: bool,
        unpopped_recovered: bool,
    ) -> Self {
        Self {
            tag,
            version_messages: VecDeque::new(),
            nothing_persistent,
            popped_recently,
            popped,
            persistent_popped: 0,
            version_for_popped_location: 0,
            popped_location: 0,
            unpopped_recovered,
        }
    }
}

/// Mutable core of a log generation. The server wraps it in a mutex;
/// version waits happen on notified counters outside.
pub struct LogCore {
    pub log_id: Uuid,
    pub locality: i8,
    pub log_router_tags: usize,
    pub txs_tags: usize,
    pub recovery_count: u64,
    pub spill_type: SpillType,

    pub stopped: bool,
    pub initialized: bool,

    /// Two-level dense index: `tag_data[tag.tag_data_index()][tag.id]`.
    pub tag_data: Vec<Vec<Option<TagData>>>,
    /// `(version, block)` for every commit, oldest first.
    pub message_blocks: VecDeque<(Version, Bytes)>,
    /// `[start, end)` on the disk queue for each pushed version.
    pub version_location: BTreeMap<Version, (DiskLoc, DiskLoc)>,
    /// `(normal bytes, txs bytes)` indexed per version.
    pub version_sizes: BTreeMap<Version, (i64, i64)>,

    pub persistent_data_version: Version,
    pub persistent_data_durable_version: Version,
    pub known_committed_version: Version,
    pub durable_known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub queue_popped_version: Version,
    pub min_popped_tag_version: Version,
    pub min_popped_tag: Tag,
    pub unpopped_recovered_tags: usize,
    pub recovered_at: Version,
    pub unrecovered_before: Version,
    pub queue_committing_version: Version,

    pub bytes_input: i64,
    pub bytes_durable: i64,
}

impl LogCore {
    pub fn new(log_id: Uuid, locality: i8, log_router_tags: usize, txs_tags: usize) -> Self {
        Self {
            log_id,
            locality,
            log_router_tags,
            txs_tags,
            recovery_count: 0,
            spill_type: SpillType::Reference,
            stopped: false,
            initialized: false,
            tag_data: Vec::new(),
            message_blocks: VecDeque::new(),
            version_location: BTreeMap::new(),
            version_sizes: BTreeMap::new(),
            persistent_data_version: 0,
            persistent_data_durable_version: 0,
            known_committed_version: 0,
            durable_known_committed_version: 0,
            min_known_committed_version: 0,
            queue_popped_version: 0,
            min_popped_tag_version: Version::MAX,
            min_popped_tag: Tag::invalid(),
            unpopped_recovered_tags: 0,
            recovered_at: 0,
            unrecovered_before: 1,
            queue_committing_version: 0,
            bytes_input: 0,
            bytes_durable: 0,
        }
    }

    pub fn get_tag_data(&mut self, tag: Tag) -> Option<&mut TagData> {
        let idx = tag.tag_data_index();
        self.tag_data
            .get_mut(idx)?
            .get_mut(tag.id as usize)?
            .as_mut()
    }

    pub fn create_tag_data(
        &mut self,
        tag: Tag,
        popped: Version,
        nothing_persistent: bool,
        popped_recently: bool,
        unpopped_recovered: bool,
    ) -> &mut TagData {
        let idx = tag.tag_data_index();
        if idx >= self.tag_data.len() {
            self.tag_data.resize_with(idx + 1, Vec::new);
        }
        let row = &mut self.tag_data[idx];
        if tag.id as usize >= row.len() {
            row.resize_with(tag.id as usize + 1, || None);
        }
        row[tag.id as usize] = Some(TagData::new(
            tag,
            popped,
            nothing_persistent,
            popped_recently,
            unpopped_recovered,
        ));
        row[tag.id as usize].as_mut().expect("just inserted")
    }

    pub fn all_tags(&self) -> Vec<Tag> {
        self.tag_data
            .iter()
            .flatten()
            .flatten()
            .map(|data| data.tag)
            .collect()
    }

    /// Whether messages for `tag` spill as copied values or as disk-queue
    /// references.
    pub fn spill_by_value(&self, tag: Tag) -> bool {
        match self.spill_type {
            SpillType::Value => true,
            SpillType::Reference => tag.locality == TAG_LOCALITY_TXS,
        }
    }

    /// The popped version a peek below the retained range should report.
    pub fn popped_version(&mut self, tag: Tag) -> Version {
        let recovered_at = self.recovered_at;
        match self.get_tag_data(tag) {
            Some(data) => data.popped,
            None if tag.locality == TAG_LOCALITY_TXS => 0,
            None => recovered_at,
        }
    }

    /// Fold an incoming tag onto the slot this log indexes it under, or
    /// reject it if this log's locality does not carry it.
    fn resolve_tag(&self, tag: Tag) -> Option<Tag> {
        let mut tag = tag;
        if self.locality == TAG_LOCALITY_SATELLITE {
            if !(tag.locality == TAG_LOCALITY_TXS || tag.locality == TAG_LOCALITY_LOG_ROUTER) {
                return None;
            }
        } else if !(self.locality == TAG_LOCALITY_SPECIAL
            || self.locality == tag.locality
            || tag.locality < 0)
        {
            return None;
        }

        if tag.locality == TAG_LOCALITY_LOG_ROUTER {
            if self.log_router_tags == 0 {
                return None;
            }
            tag.id = (tag.id as usize % self.log_router_tags) as u16;
        }
        if tag.locality == TAG_LOCALITY_TXS && self.txs_tags > 0 {
            tag.id = (tag.id as usize % self.txs_tags) as u16;
        }
        Some(tag)
    }

    /// Index one commit's messages: record the shared block and point each
    /// destination tag's deque at its records. Returns the bytes added for
    /// shared accounting.
    pub fn commit_messages(
        &mut self,
        version: Version,
        blob: &Bytes,
        knobs: &Knobs,
    ) -> anyhow::Result<i64> {
        if blob.is_empty() {
            self.version_sizes.entry(version).or_insert((0, 0));
            return Ok(0);
        }

        let records = parse_commit_blob(blob)?;
        let mut expected_bytes = 0i64;
        let mut txs_bytes = 0i64;
        let mut overhead = 0i64;

        for record in &records {
            if record.raw.len() as i64 > knobs.max_message_size {
                tracing::warn!(size = record.raw.len(), "large message");
            }
            for tag in &record.tags {
                let Some(tag) = self.resolve_tag(*tag) else {
                    continue;
                };
                if self.get_tag_data(tag).is_none() {
                    self.create_tag_data(tag, 0, true, true, false);
                }
                let entry_overhead = knobs.version_messages_entry_bytes_with_overhead;
                let data = self.get_tag_data(tag).expect("created above");
                if version >= data.popped {
                    data.version_messages.push_back((version, record.raw.clone()));
                    if tag.locality == TAG_LOCALITY_TXS {
                        txs_bytes += record.raw.len() as i64;
                    } else {
                        expected_bytes += record.raw.len() as i64;
                    }
                    overhead += entry_overhead;
                }
            }
        }

        let added = (blob.len() as f64 * knobs.tlog_message_block_overhead_factor) as i64 + overhead;
        self.message_blocks.push_back((version, blob.clone()));
        let sizes = self.version_sizes.entry(version).or_insert((0, 0));
        sizes.0 += expected_bytes;
        sizes.1 += txs_bytes;
        self.bytes_input += added;
        Ok(added)
    }

    /// Drop `tag`'s in-memory messages below `before`. Returns the bytes
    /// credited to the durable side.
    pub fn erase_messages_before(&mut self, tag: Tag, before: Version, knobs: &Knobs) -> i64 {
        let entry_overhead = knobs.version_messages_entry_bytes_with_overhead;
        let is_txs = tag.locality == TAG_LOCALITY_TXS;
        let mut erased_updates: Vec<(Version, i64)> = Vec::new();
        let mut messages_erased = 0i64;

        let Some(data) = self.get_tag_data(tag) else {
            return 0;
        };
        while let Some((version, record)) = data.version_messages.front() {
            if *version >= before {
                break;
            }
            erased_updates.push((*version, record.len() as i64));
            data.version_messages.pop_front();
            messages_erased += 1;
        }

        for (version, len) in erased_updates {
            if let Some(sizes) = self.version_sizes.get_mut(&version) {
                if is_txs {
                    sizes.1 -= len;
                } else {
                    sizes.0 -= len;
                }
            }
        }

        let bytes_erased = messages_erased * entry_overhead;
        self.bytes_durable += bytes_erased;
        bytes_erased
    }

    /// Stream messages for `tag` starting at `begin` out of memory, up to
    /// roughly `desired_bytes` at a version granularity. Returns the
    /// exclusive end version if the byte budget cut the stream short;
    /// `None` means everything in memory was served.
    pub fn peek_messages_from_memory(
        &mut self,
        tag: Tag,
        begin: Version,
        desired_bytes: i64,
        writer: &mut PeekStreamWriter,
    ) -> Option<Version> {
        let begin = begin.max(self.persistent_data_durable_version + 1);
        let data = self.get_tag_data(tag)?;

        let start = data
            .version_messages
            .partition_point(|(v, _)| *v < begin);
        let mut current_version = None;
        for (version, record) in data.version_messages.iter().skip(start) {
            if current_version != Some(*version) {
                if writer.byte_len() as i64 >= desired_bytes {
                    return Some(current_version.expect("bytes imply a version") + 1);
                }
                current_version = Some(*version);
            }
            writer.append(*version, record);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::message::{parse_peek_stream, LogPushData};
    use braid_core::mutation::Mutation;

    fn blob_for(tags: &[Tag], n: usize) -> Bytes {
        let mut push = LogPushData::new();
        for i in 0..n {
            push.add_tags(tags.iter().copied());
            push.add_typed_message(&Mutation::set(vec![b'k', i as u8], vec![b'v', i as u8]));
        }
        push.into_bytes()
    }

    fn core() -> LogCore {
        LogCore::new(Uuid::new_v4(), 0, 0, 1)
    }

    #[test]
    fn commit_indexes_by_tag() {
        let knobs = Knobs::default();
        let mut core = core();
        let tag_a = Tag::new(0, 1);
        let tag_b = Tag::new(0, 2);

        core.commit_messages(10, &blob_for(&[tag_a], 2), &knobs).unwrap();
        core.commit_messages(11, &blob_for(&[tag_b], 1), &knobs).unwrap();

        assert_eq!(core.get_tag_data(tag_a).unwrap().version_messages.len(), 2);
        assert_eq!(core.get_tag_data(tag_b).unwrap().version_messages.len(), 1);
        assert_eq!(core.message_blocks.len(), 2);
        assert!(core.bytes_input > 0);
    }

    #[test]
    fn wrong_locality_tags_are_skipped() {
        let knobs = Knobs::default();
        let mut core = LogCore::new(Uuid::new_v4(), 1, 0, 1);
        let other_dc = Tag::new(0, 1);
        core.commit_messages(5, &blob_for(&[other_dc], 1), &knobs).unwrap();
        assert!(core.get_tag_data(other_dc).is_none());
    }

    #[test]
    fn log_router_ids_fold() {
        let knobs = Knobs::default();
        let mut core = LogCore::new(Uuid::new_v4(), 0, 2, 1);
        let router_tag = Tag::new(TAG_LOCALITY_LOG_ROUTER, 5);
        core.commit_messages(5, &blob_for(&[router_tag], 1), &knobs).unwrap();
        assert!(core
            .get_tag_data(Tag::new(TAG_LOCALITY_LOG_ROUTER, 1))
            .unwrap()
            .version_messages
            .len()
            == 1);
    }

    #[test]
    fn memory_peek_respects_begin_and_order() {
        let knobs = Knobs::default();
        let mut core = core();
        let tag = Tag::new(0, 1);
        for v in [10, 11, 13] {
            core.commit_messages(v, &blob_for(&[tag], 1), &knobs).unwrap();
            core.version_location.insert(v, (0, 1));
        }

        let mut writer = PeekStreamWriter::new();
        let end = core.peek_messages_from_memory(tag, 11, i64::MAX, &mut writer);
        assert_eq!(end, None);
        let parsed = parse_peek_stream(&writer.into_bytes()).unwrap();
        assert_eq!(
            parsed.iter().map(|m| m.version).collect::<Vec<_>>(),
            vec![11, 13]
        );
    }

    #[test]
    fn erase_before_credits_durable_bytes() {
        let knobs = Knobs::default();
        let mut core = core();
        let tag = Tag::new(0, 1);
        core.commit_messages(10, &blob_for(&[tag], 3), &knobs).unwrap();
        core.commit_messages(12, &blob_for(&[tag], 1), &knobs).unwrap();

        let erased = core.erase_messages_before(tag, 12, &knobs);
        assert_eq!(
            erased,
            3 * knobs.version_messages_entry_bytes_with_overhead
        );
        assert_eq!(core.get_tag_data(tag).unwrap().version_messages.len(), 1);
        assert_eq!(core.version_sizes.get(&10).unwrap().0, 0);
    }
}
