//! Serving peeks: version-ordered, sequence-tracked reads of one tag's
//! messages, from memory and from spilled data.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use braid_core::clock::now_seconds;
use async_trait::async_trait;
use braid_core::error::{Error, Result};
use braid_core::interfaces::{TLogPeekReply, TLogPeekRequest, TLogPeekService};
use braid_core::knobs::Knobs;
use braid_core::message::{parse_messages_for_tag, PeekStreamWriter};
use braid_core::types::{Tag, Version, TAG_LOCALITY_LOG_ROUTER, TAG_LOCALITY_SATELLITE, TAG_LOCALITY_TXS};

use crate::persist;
use crate::queue::parse_queue_record;
use crate::server::TLogServer;

type SeqPayload = std::result::Result<(Version, bool), Error>;
type SeqSlot = watch::Sender<Option<SeqPayload>>;

struct PeekTrackerData {
    last_update: f64,
    sequences: BTreeMap<u32, SeqSlot>,
}

/// Per-caller bookkeeping that serializes a cursor's pipelined peeks: each
/// sequence number waits for its predecessor's `(end, only_spilled)`.
pub(crate) struct PeekTrackers {
    knobs: Arc<Knobs>,
    trackers: HashMap<Uuid, PeekTrackerData>,
}

impl PeekTrackers {
    pub(crate) fn new(knobs: Arc<Knobs>) -> Self {
        Self {
            knobs,
            trackers: HashMap::new(),
        }
    }

    /// Register sequence `seq` of peek stream `peek_id` and return the
    /// receiver that resolves when its predecessor finishes.
    fn begin_sequence(
        &mut self,
        peek_id: Uuid,
        seq: u32,
        begin: Version,
        only_spilled: bool,
    ) -> Result<watch::Receiver<Option<SeqPayload>>> {
        let window = self.knobs.parallel_get_more_requests as u32;
        if seq >= window && !self.trackers.contains_key(&peek_id) {
            return Err(Error::OperationObsolete);
        }

        let tracker = self
            .trackers
            .entry(peek_id)
            .or_insert_with(|| PeekTrackerData {
                last_update: now_seconds(),
                sequences: BTreeMap::new(),
            });

        if seq == 0 && !tracker.sequences.contains_key(&0) {
            let (tx, _) = watch::channel(Some(Ok((begin, only_spilled))));
            tracker.sequences.insert(0, tx);
        }

        // Sequences that fell out of the pipelining window are dead; the
        // cursor gave up on them.
        while let Some((&first, _)) = tracker.sequences.iter().next() {
            if (first as i64) > seq as i64 - window as i64 {
                break;
            }
            if let Some(slot) = tracker.sequences.remove(&first) {
                if slot.borrow().is_none() {
                    let _ = slot.send_replace(Some(Err(Error::OperationObsolete)));
                }
            }
        }
        if let Some((&first, _)) = tracker.sequences.iter().next() {
            if seq < first {
                return Err(Error::OperationObsolete);
            }
        }

        tracker.last_update = now_seconds();
        let slot = tracker
            .sequences
            .entry(seq)
            .or_insert_with(|| watch::channel(None).0);
        Ok(slot.subscribe())
    }

    /// Record the outcome of sequence `seq`, unblocking `seq + 1`.
    fn finish_sequence(
        &mut self,
        peek_id: Uuid,
        seq: u32,
        end: Version,
        only_spilled: bool,
    ) -> Result<()> {
        let Some(tracker) = self.trackers.get_mut(&peek_id) else {
            return Ok(());
        };
        tracker.last_update = now_seconds();

        if let Some((&first, _)) = tracker.sequences.iter().next() {
            if seq + 1 < first {
                return Err(Error::OperationObsolete);
            }
        }

        let slot = tracker
            .sequences
            .entry(seq + 1)
            .or_insert_with(|| watch::channel(None).0);
        let existing = slot.borrow().clone();
        match existing {
            // A retry of an already-served sequence must agree with what
            // the first attempt returned.
            Some(Ok((prev_end, _))) if prev_end != end => Err(Error::OperationObsolete),
            Some(_) => Ok(()),
            None => {
                let _ = slot.send_replace(Some(Ok((end, only_spilled))));
                Ok(())
            }
        }
    }

    fn cleanup(&mut self, expiration: f64) {
        let now = now_seconds();
        self.trackers.retain(|_, tracker| {
            if now - tracker.last_update <= expiration {
                return true;
            }
            for slot in tracker.sequences.values() {
                if slot.borrow().is_none() {
                    let _ = slot.send_replace(Some(Err(Error::Timeout)));
                }
            }
            false
        });
    }
}

impl TLogServer {
    /// Serve one peek request.
    pub async fn peek(&self, mut req: TLogPeekRequest) -> Result<TLogPeekReply> {
        // Fold txs ids onto the slots this log actually carries.
        {
            let core = self.core.lock().await;
            if req.tag.locality == TAG_LOCALITY_TXS
                && core.txs_tags > 0
                && req.tag.id as usize >= core.txs_tags
            {
                req.tag.id = (req.tag.id as usize % core.txs_tags) as u16;
            }
        }

        // Wait for our turn in the caller's sequence stream.
        if let Some((peek_id, seq)) = req.sequence {
            let mut rx = {
                let mut trackers = self.peek_trackers.lock().await;
                trackers.begin_sequence(peek_id, seq, req.begin, req.only_spilled)?
            };
            let payload = rx
                .wait_for(|slot| slot.is_some())
                .await
                .map_err(|_| Error::BrokenPromise)?
                .clone()
                .expect("checked is_some");
            let (prev_end, prev_spilled) = payload?;
            req.begin = req.begin.max(prev_end);
            req.only_spilled = prev_spilled;
        }

        if req.return_if_blocked && self.version.get() < req.begin {
            self.note_sequence(&req, req.begin, req.only_spilled).await;
            return Err(Error::EndOfStream);
        }

        if self.version.get() < req.begin {
            self.version.when_at_least(req.begin).await;
            tokio::time::sleep(Duration::from_secs_f64(self.knobs.tlog_peek_delay)).await;
        }

        // Log-router expansions are expensive; bound their concurrency.
        let _router_permit = {
            let locality = { self.core.lock().await.locality };
            if locality != TAG_LOCALITY_SATELLITE && req.tag.locality == TAG_LOCALITY_LOG_ROUTER {
                Some(
                    self.concurrent_log_router_reads
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::OperationCancelled)?,
                )
            } else {
                None
            }
        };

        let (popped, durable_version, by_value, log_router_tags, min_kcv) = {
            let mut core = self.core.lock().await;
            (
                core.popped_version(req.tag),
                core.persistent_data_durable_version,
                core.spill_by_value(req.tag),
                core.log_router_tags.max(1),
                core.min_known_committed_version,
            )
        };

        // Reading spilled data means the caller is far behind; don't let it
        // starve commit work.
        if req.begin <= durable_version && req.tag.locality != TAG_LOCALITY_TXS {
            tokio::task::yield_now().await;
        }

        if popped > req.begin {
            let reply = TLogPeekReply {
                messages: bytes::Bytes::new(),
                end: popped,
                popped: Some(popped),
                max_known_version: self.version.get(),
                min_known_committed_version: min_kcv,
                begin: req.sequence.map(|_| req.begin),
                only_spilled: false,
            };
            self.note_sequence(&req, reply.end, reply.only_spilled).await;
            return Ok(reply);
        }

        let mut writer = PeekStreamWriter::new();
        let mut end_version = self.version.get() + 1;
        let mut only_spilled = false;
        let desired = self.knobs.desired_total_bytes;

        if req.begin <= durable_version {
            // Grab the memory tail first: the durable frontier can advance
            // while we read from the kv store.
            let mut memory = PeekStreamWriter::new();
            let mut memory_cap = None;
            if !req.only_spilled {
                let mut core = self.core.lock().await;
                memory_cap =
                    core.peek_messages_from_memory(req.tag, req.begin, desired, &mut memory);
            } else {
                end_version = durable_version + 1;
            }

            if by_value {
                let spilled = self.kv.read_range(
                    persist::persist_tag_messages_range(
                        self.log_id(),
                        req.tag,
                        req.begin,
                        durable_version + 1,
                    ),
                    None,
                    Some(desired as usize),
                );
                let mut spilled_bytes = 0usize;
                let mut last_version = None;
                for (key, value) in &spilled {
                    let version = persist::decode_tag_key_version(key)
                        .map_err(|_| Error::Internal("corrupt spill key"))?;
                    writer.append(version, value);
                    spilled_bytes += value.len();
                    last_version = Some(version);
                }
                if spilled_bytes >= desired as usize {
                    end_version = last_version.expect("bytes imply a version") + 1;
                    only_spilled = true;
                } else if !req.only_spilled {
                    writer.append_stream(memory);
                    if let Some(cap) = memory_cap {
                        end_version = cap;
                    }
                }
            } else {
                let max_batches = self.knobs.tlog_spill_reference_max_batches_per_peek;
                let ref_batches = self.kv.read_range(
                    persist::persist_tag_message_refs_range(
                        self.log_id(),
                        req.tag,
                        req.begin,
                        durable_version + 1,
                    ),
                    Some(max_batches + 1),
                    None,
                );

                let mut locations = Vec::new();
                let mut commit_bytes = 0u64;
                let mut mutation_bytes = 0u64;
                let mut early_end = false;
                for (_, value) in ref_batches.iter().take(max_batches) {
                    let batch = persist::decode_spilled_batch(value)
                        .map_err(|_| Error::Internal("corrupt spill batch"))?;
                    for spilled in batch {
                        if mutation_bytes >= desired as u64 {
                            early_end = true;
                            break;
                        }
                        if spilled.version >= req.begin {
                            locations.push((spilled.start, spilled.start + spilled.length as u64));
                            commit_bytes += spilled.length as u64;
                            mutation_bytes += spilled.mutation_bytes as u64;
                        }
                    }
                    if early_end {
                        break;
                    }
                }
                let early_end = early_end || ref_batches.len() > max_batches;

                // Bound how much queue data peeks may hold in flight.
                let permits = commit_bytes
                    .min(self.knobs.tlog_spill_reference_max_peek_memory_bytes as u64)
                    as u32;
                let _memory_reservation = self
                    .peek_memory_limiter
                    .clone()
                    .acquire_many_owned(permits)
                    .await
                    .map_err(|_| Error::OperationCancelled)?;

                let mut last_ref_version = 0;
                for (start, end) in locations {
                    let raw = self
                        .queue
                        .disk_queue()
                        .read(start, end, true)
                        .await
                        .map_err(|_| Error::Internal("spilled queue read failed"))?;
                    let entry =
                        parse_queue_record(&raw).map_err(|_| Error::Internal("corrupt queue record"))?;
                    let records =
                        parse_messages_for_tag(&entry.messages, req.tag, log_router_tags)
                            .map_err(|_| Error::Internal("corrupt commit blob"))?;
                    for record in records {
                        writer.append(entry.version, &record);
                    }
                    last_ref_version = entry.version;
                }

                if early_end {
                    end_version = last_ref_version + 1;
                    only_spilled = true;
                } else if !req.only_spilled {
                    writer.append_stream(memory);
                    if let Some(cap) = memory_cap {
                        end_version = cap;
                    }
                }
            }
        } else if req.only_spilled {
            end_version = durable_version + 1;
        } else {
            let mut core = self.core.lock().await;
            if let Some(cap) =
                core.peek_messages_from_memory(req.tag, req.begin, desired, &mut writer)
            {
                end_version = cap;
            }
        }

        let reply = TLogPeekReply {
            messages: writer.into_bytes(),
            end: end_version,
            popped: None,
            max_known_version: self.version.get(),
            min_known_committed_version: min_kcv,
            begin: req.sequence.map(|_| req.begin),
            only_spilled,
        };

        if let Some((peek_id, seq)) = req.sequence {
            let mut trackers = self.peek_trackers.lock().await;
            trackers.finish_sequence(peek_id, seq, reply.end, reply.only_spilled)?;
        }
        Ok(reply)
    }

    /// Record a short-circuit reply's endpoint in the sequence stream so
    /// the next peek proceeds.
    async fn note_sequence(&self, req: &TLogPeekRequest, end: Version, only_spilled: bool) {
        if let Some((peek_id, seq)) = req.sequence {
            let mut trackers = self.peek_trackers.lock().await;
            if let Err(err) = trackers.finish_sequence(peek_id, seq, end, only_spilled) {
                warn!(error = %err, %peek_id, seq, "dropping stale peek sequence");
            }
        }
    }

    /// Expire idle peek trackers, failing their pending sequences.
    pub async fn cleanup_peek_trackers(self: Arc<Self>) {
        let expiration = self.knobs.peek_tracker_expiration_time;
        loop {
            tokio::time::sleep(Duration::from_secs_f64((expiration / 4.0).max(0.5))).await;
            let mut trackers = self.peek_trackers.lock().await;
            trackers.cleanup(expiration);
        }
    }

    /// The popped version a cursor would observe for `tag`.
    pub async fn popped_version(&self, tag: Tag) -> Version {
        let mut core = self.core.lock().await;
        core.popped_version(tag)
    }
}

#[async_trait]
impl TLogPeekService for TLogServer {
    async fn peek(&self, req: TLogPeekRequest) -> Result<TLogPeekReply> {
        TLogServer::peek(self, req).await
    }
}
