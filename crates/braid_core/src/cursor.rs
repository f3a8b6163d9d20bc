//! Pull-model peek cursors.
//!
//! Storage servers and log routers consume the transaction logs through
//! these cursors: a single-team cursor streams one tag from its log peers,
//! and merged cursors interleave several teams into one strictly
//! `(version, subsequence)`-ordered stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use uuid::Uuid;

use crate::error::Result;
use crate::interfaces::{TLogPeekRequest, TLogPeekService};
use crate::message::{parse_peek_stream, VersionedMutation};
use crate::types::{Subsequence, Tag, Version};

/// A single-consumer pull iterator over tagged log entries.
///
/// `get`/`next` operate on locally buffered entries; once the buffer is
/// exhausted, `remote_more_available` must be awaited to refill it.
#[async_trait]
pub trait PeekCursor: Send {
    fn has_remaining(&self) -> bool;
    /// The entry under the cursor. Panics if `has_remaining()` is false.
    fn get(&self) -> &VersionedMutation;
    fn next(&mut self);
    /// Pull more entries from the remote log. `false` means the remote had
    /// nothing further for this cursor.
    async fn remote_more_available(&mut self) -> Result<bool>;
}

/// Cursor over one storage team's tag, served by any of the configured
/// TLog peers.
pub struct TeamPeekCursor {
    tag: Tag,
    peers: Vec<Arc<dyn TLogPeekService>>,
    peek_id: Uuid,
    sequence: u32,
    begin_version: Version,
    last_version: Version,
    popped: Option<Version>,
    buffer: std::collections::VecDeque<VersionedMutation>,
}

impl TeamPeekCursor {
    pub fn new(begin: Version, tag: Tag, peers: Vec<Arc<dyn TLogPeekService>>) -> Self {
        assert!(!peers.is_empty());
        Self {
            tag,
            peers,
            peek_id: Uuid::new_v4(),
            sequence: 0,
            begin_version: begin,
            last_version: begin - 1,
            popped: None,
            buffer: std::collections::VecDeque::new(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn begin_version(&self) -> Version {
        self.begin_version
    }

    pub fn last_version(&self) -> Version {
        self.last_version
    }

    /// The popped version reported by the last refill, if the requested
    /// range had already been discarded.
    pub fn popped(&self) -> Option<Version> {
        self.popped
    }
}

#[async_trait]
impl PeekCursor for TeamPeekCursor {
    fn has_remaining(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn get(&self) -> &VersionedMutation {
        self.buffer.front().expect("cursor exhausted")
    }

    fn next(&mut self) {
        self.buffer.pop_front();
    }

    async fn remote_more_available(&mut self) -> Result<bool> {
        // TODO: load-balance across peers using reply latencies instead of
        // picking uniformly.
        let peer = {
            let idx = rand::thread_rng().gen_range(0..self.peers.len());
            self.peers[idx].clone()
        };

        let mut req = TLogPeekRequest::new(self.last_version + 1, self.tag);
        req.sequence = Some((self.peek_id, self.sequence));
        self.sequence += 1;

        let reply = match peer.peek(req).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, tag = %self.tag, "peek refill failed");
                return Ok(false);
            }
        };

        if let Some(popped) = reply.popped {
            self.popped = Some(self.popped.map_or(popped, |p| p.max(popped)));
        }

        let parsed = parse_peek_stream(&reply.messages)
            .map_err(|_| crate::error::Error::Internal("malformed peek stream"))?;
        self.last_version = self.last_version.max(reply.end - 1);
        self.buffer = parsed.into();
        Ok(!self.buffer.is_empty())
    }
}

/// K-way merge of child cursors, ordered by `(version, subsequence)`.
pub struct MergedPeekCursor<C: PeekCursor> {
    cursors: Vec<Option<C>>,
    heap: BinaryHeap<Reverse<(Version, Subsequence, usize)>>,
    active: usize,
}

impl<C: PeekCursor> Default for MergedPeekCursor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: PeekCursor> MergedPeekCursor<C> {
    pub fn new() -> Self {
        Self {
            cursors: Vec::new(),
            heap: BinaryHeap::new(),
            active: 0,
        }
    }

    pub fn active_cursors(&self) -> usize {
        self.active
    }

    /// Returns the slot index of the added cursor.
    pub fn add_cursor(&mut self, cursor: C) -> usize {
        let idx = self.cursors.len();
        if cursor.has_remaining() {
            let head = cursor.get();
            self.heap
                .push(Reverse((head.version, head.subsequence, idx)));
        }
        self.cursors.push(Some(cursor));
        self.active += 1;
        idx
    }

    fn remove_slot(&mut self, idx: usize) -> Option<C> {
        let cursor = self.cursors[idx].take();
        if cursor.is_some() {
            self.active -= 1;
        }
        cursor
    }

    fn rebuild_heap_without(&mut self, idx: usize) {
        let entries: Vec<_> = self.heap.drain().filter(|Reverse((_, _, i))| *i != idx).collect();
        self.heap.extend(entries);
    }
}

#[async_trait]
impl<C: PeekCursor> PeekCursor for MergedPeekCursor<C> {
    fn has_remaining(&self) -> bool {
        if self.active == 0 {
            return false;
        }
        // Any locally exhausted child forces a remote round first; until it
        // answers we cannot know the next entry in the total order.
        self.cursors
            .iter()
            .flatten()
            .all(|cursor| cursor.has_remaining())
    }

    fn get(&self) -> &VersionedMutation {
        let Reverse((_, _, idx)) = self.heap.peek().expect("merged cursor exhausted");
        self.cursors[*idx].as_ref().expect("stale heap entry").get()
    }

    fn next(&mut self) {
        let Reverse((_, _, idx)) = self.heap.pop().expect("merged cursor exhausted");
        let cursor = self.cursors[idx].as_mut().expect("stale heap entry");
        cursor.next();
        if cursor.has_remaining() {
            let head = cursor.get();
            self.heap
                .push(Reverse((head.version, head.subsequence, idx)));
        }
    }

    async fn remote_more_available(&mut self) -> Result<bool> {
        if self.active == 0 {
            return Ok(false);
        }

        // Refill every locally exhausted child in parallel.
        let mut indices = Vec::new();
        let mut refills = Vec::new();
        for (idx, slot) in self.cursors.iter_mut().enumerate() {
            if let Some(cursor) = slot {
                if !cursor.has_remaining() {
                    indices.push(idx);
                    refills.push(cursor.remote_more_available());
                }
            }
        }
        let results = join_all(refills).await;

        for (idx, result) in indices.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    let cursor = self.cursors[idx].as_ref().expect("refilled cursor");
                    let head = cursor.get();
                    self.heap
                        .push(Reverse((head.version, head.subsequence, idx)));
                }
                // Exhausted (or failed) children drop out of the merge.
                Ok(false) | Err(_) => {
                    self.remove_slot(idx);
                }
            }
        }

        Ok(self.active > 0)
    }
}

/// Merged cursor over team cursors that also maintains a tag -> cursor
/// mapping, so a team can be detached when its data movement completes.
pub struct MergedTeamPeekCursor {
    inner: MergedPeekCursor<TeamPeekCursor>,
    by_tag: HashMap<Tag, usize>,
}

impl Default for MergedTeamPeekCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl MergedTeamPeekCursor {
    pub fn new() -> Self {
        Self {
            inner: MergedPeekCursor::new(),
            by_tag: HashMap::new(),
        }
    }

    pub fn add_cursor(&mut self, cursor: TeamPeekCursor) {
        let tag = cursor.tag();
        let idx = self.inner.add_cursor(cursor);
        let previous = self.by_tag.insert(tag, idx);
        assert!(previous.is_none(), "duplicate team cursor for {tag}");
    }

    pub fn team_tags(&self) -> Vec<Tag> {
        self.by_tag.keys().copied().collect()
    }

    pub fn remove_cursor(&mut self, tag: Tag) -> Option<TeamPeekCursor> {
        let idx = self.by_tag.remove(&tag)?;
        self.inner.rebuild_heap_without(idx);
        self.inner.remove_slot(idx)
    }

    fn sync_tag_map(&mut self) {
        self.by_tag
            .retain(|_, idx| self.inner.cursors[*idx].is_some());
    }
}

#[async_trait]
impl PeekCursor for MergedTeamPeekCursor {
    fn has_remaining(&self) -> bool {
        self.inner.has_remaining()
    }

    fn get(&self) -> &VersionedMutation {
        self.inner.get()
    }

    fn next(&mut self) {
        self.inner.next()
    }

    async fn remote_more_available(&mut self) -> Result<bool> {
        let more = self.inner.remote_more_available().await?;
        self.sync_tag_map();
        Ok(more)
    }
}

/// Advance `cursor` to the smallest entry at or past
/// `(version, subsequence)`, driving remote refills as needed. A no-op if
/// the cursor is already past the target.
pub async fn advance_to<C: PeekCursor + ?Sized>(
    cursor: &mut C,
    version: Version,
    subsequence: Subsequence,
) -> Result<()> {
    loop {
        while cursor.has_remaining() {
            let at = cursor.get();
            if (at.version, at.subsequence) >= (version, subsequence) {
                return Ok(());
            }
            cursor.next();
        }
        if !cursor.remote_more_available().await? {
            // The target is still in the future.
            return Ok(());
        }
    }
}
