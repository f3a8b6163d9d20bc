//! Tagged-message codec shared by the commit proxy and the transaction log.
//!
//! A *commit blob* is the unit pushed by a proxy to the log system for one
//! commit version: a sequence of records, each
//!
//! ```text
//! u32 record_len || u16 tag_count || tag_count * (i8 locality, u16 id)
//!               || u16 subsequence || mutation bytes
//! ```
//!
//! with `record_len` counting everything after the length field. Peek
//! replies stream the same records, with a version header
//! (`u32 0xffffffff || u64 version`) preceding each version transition.

use bytes::Bytes;

use crate::codec::{read_u16, read_u32, read_u64};
use crate::mutation::Mutation;
use crate::types::{Subsequence, Tag, Version};

/// Sentinel length announcing a version header in a peek stream.
pub const VERSION_HEADER: u32 = u32::MAX;

/// One parsed record of a commit blob.
#[derive(Clone, Debug)]
pub struct TagsAndMessage {
    pub tags: Vec<Tag>,
    pub subsequence: Subsequence,
    /// The serialized mutation.
    pub message: Bytes,
    /// The whole record including the length prefix, for re-streaming.
    pub raw: Bytes,
}

impl TagsAndMessage {
    pub fn mutation(&self) -> anyhow::Result<Mutation> {
        let mut offset = 0;
        Mutation::decode(&self.message, &mut offset)
    }
}

/// Builder for the commit blob a proxy pushes to the log system.
///
/// Tags are staged with `add_tag`/`add_tags` and consumed by the next
/// `add_typed_message` call, which also assigns the message's subsequence.
#[derive(Debug, Default)]
pub struct LogPushData {
    buf: Vec<u8>,
    next_tags: Vec<Tag>,
    next_subsequence: Subsequence,
    messages: usize,
}

impl LogPushData {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            next_tags: Vec::new(),
            next_subsequence: 1,
            messages: 0,
        }
    }

    pub fn add_tag(&mut self, tag: Tag) {
        if !self.next_tags.contains(&tag) {
            self.next_tags.push(tag);
        }
    }

    pub fn add_tags<I: IntoIterator<Item = Tag>>(&mut self, tags: I) {
        for tag in tags {
            self.add_tag(tag);
        }
    }

    /// Serialize a mutation with the staged tags, assigning the next
    /// subsequence. Panics if no tags are staged, which would make the
    /// message unroutable.
    pub fn add_typed_message(&mut self, mutation: &Mutation) {
        assert!(
            !self.next_tags.is_empty(),
            "message added without destination tags"
        );
        let body_len = 2 + self.next_tags.len() * 3 + 2 + mutation.encoded_len();
        self.buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        self.buf
            .extend_from_slice(&(self.next_tags.len() as u16).to_be_bytes());
        for tag in &self.next_tags {
            tag.encode_to(&mut self.buf);
        }
        self.buf.extend_from_slice(&self.next_subsequence.to_be_bytes());
        mutation.encode_to(&mut self.buf);

        self.next_tags.clear();
        self.next_subsequence += 1;
        self.messages += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    pub fn message_count(&self) -> usize {
        self.messages
    }

    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

fn parse_record(blob: &Bytes, offset: &mut usize) -> anyhow::Result<TagsAndMessage> {
    let record_start = *offset;
    let record_len = read_u32(blob, offset)? as usize;
    let record_end = *offset + record_len;
    anyhow::ensure!(record_end <= blob.len(), "short commit blob record");

    let tag_count = read_u16(blob, offset)? as usize;
    let mut tags = Vec::with_capacity(tag_count);
    for _ in 0..tag_count {
        tags.push(Tag::decode(blob, offset)?);
    }
    let subsequence = read_u16(blob, offset)?;
    let message = blob.slice(*offset..record_end);
    let raw = blob.slice(record_start..record_end);
    *offset = record_end;

    Ok(TagsAndMessage {
        tags,
        subsequence,
        message,
        raw,
    })
}

/// Parse every record of a commit blob. Record payloads are zero-copy
/// slices of `blob`.
pub fn parse_commit_blob(blob: &Bytes) -> anyhow::Result<Vec<TagsAndMessage>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < blob.len() {
        out.push(parse_record(blob, &mut offset)?);
    }
    Ok(out)
}

/// Select the raw records of a commit blob that route to `tag`.
/// Log-router tags match modulo `log_router_tags`, since commits spanning a
/// generation change may carry more router tags than now exist.
pub fn parse_messages_for_tag(
    blob: &Bytes,
    tag: Tag,
    log_router_tags: usize,
) -> anyhow::Result<Vec<Bytes>> {
    let mut relevant = Vec::new();
    let mut offset = 0;
    while offset < blob.len() {
        let record = parse_record(blob, &mut offset)?;
        for t in &record.tags {
            let matches = *t == tag
                || (tag.locality == crate::types::TAG_LOCALITY_LOG_ROUTER
                    && t.locality == crate::types::TAG_LOCALITY_LOG_ROUTER
                    && log_router_tags > 0
                    && t.id as usize % log_router_tags == tag.id as usize);
            if matches {
                relevant.push(record.raw.clone());
                break;
            }
        }
    }
    Ok(relevant)
}

/// Writer for the message stream of a peek reply.
#[derive(Debug, Default)]
pub struct PeekStreamWriter {
    buf: Vec<u8>,
    current_version: Option<Version>,
}

impl PeekStreamWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one raw record under `version`, emitting a version header if
    /// the version changed.
    pub fn append(&mut self, version: Version, raw_record: &[u8]) {
        if self.current_version != Some(version) {
            self.buf.extend_from_slice(&VERSION_HEADER.to_be_bytes());
            self.buf.extend_from_slice(&(version as u64).to_be_bytes());
            self.current_version = Some(version);
        }
        self.buf.extend_from_slice(raw_record);
    }

    /// Splice an already-framed stream (e.g. the in-memory tail) after the
    /// spilled portion.
    pub fn append_stream(&mut self, other: PeekStreamWriter) {
        self.buf.extend_from_slice(&other.buf);
        if other.current_version.is_some() {
            self.current_version = other.current_version;
        }
    }

    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// One entry yielded by a peek stream: the total order position plus the
/// decoded mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedMutation {
    pub version: Version,
    pub subsequence: Subsequence,
    pub mutation: Mutation,
}

/// Decode a peek reply stream into `(version, subsequence, mutation)`
/// tuples, in stream order.
pub fn parse_peek_stream(stream: &Bytes) -> anyhow::Result<Vec<VersionedMutation>> {
    let mut out = Vec::new();
    let mut offset = 0;
    let mut version: Option<Version> = None;
    while offset < stream.len() {
        let mut peek_offset = offset;
        let len = read_u32(stream, &mut peek_offset)?;
        if len == VERSION_HEADER {
            version = Some(read_u64(stream, &mut peek_offset)? as Version);
            offset = peek_offset;
            continue;
        }
        let record = parse_record(stream, &mut offset)?;
        let version =
            version.ok_or_else(|| anyhow::anyhow!("peek stream record before version header"))?;
        out.push(VersionedMutation {
            version,
            subsequence: record.subsequence,
            mutation: record.mutation()?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TAG_LOCALITY_LOG_ROUTER, TXS_TAG};

    fn storage_tag(id: u16) -> Tag {
        Tag::new(0, id)
    }

    #[test]
    fn commit_blob_round_trip() {
        let mut push = LogPushData::new();
        push.add_tags([storage_tag(1), storage_tag(2)]);
        push.add_typed_message(&Mutation::set(&b"a"[..], &b"1"[..]));
        push.add_tag(TXS_TAG);
        push.add_typed_message(&Mutation::set(&b"\xff/x"[..], &b"2"[..]));

        let blob = push.into_bytes();
        let records = parse_commit_blob(&blob).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tags, vec![storage_tag(1), storage_tag(2)]);
        assert_eq!(records[0].subsequence, 1);
        assert_eq!(
            records[0].mutation().unwrap(),
            Mutation::set(&b"a"[..], &b"1"[..])
        );
        assert_eq!(records[1].tags, vec![TXS_TAG]);
        assert_eq!(records[1].subsequence, 2);
    }

    #[test]
    fn tag_filtering_with_router_fold() {
        let mut push = LogPushData::new();
        push.add_tag(Tag::new(TAG_LOCALITY_LOG_ROUTER, 5));
        push.add_typed_message(&Mutation::set(&b"r"[..], &b"1"[..]));
        push.add_tag(storage_tag(9));
        push.add_typed_message(&Mutation::set(&b"s"[..], &b"2"[..]));
        let blob = push.into_bytes();

        // 5 % 4 == 1, so the router record matches router tag id 1.
        let hits =
            parse_messages_for_tag(&blob, Tag::new(TAG_LOCALITY_LOG_ROUTER, 1), 4).unwrap();
        assert_eq!(hits.len(), 1);

        let misses = parse_messages_for_tag(&blob, storage_tag(8), 4).unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn peek_stream_round_trip() {
        let mut push = LogPushData::new();
        push.add_tag(storage_tag(3));
        push.add_typed_message(&Mutation::set(&b"k1"[..], &b"v1"[..]));
        push.add_tag(storage_tag(3));
        push.add_typed_message(&Mutation::set(&b"k2"[..], &b"v2"[..]));
        let blob = push.into_bytes();
        let records = parse_commit_blob(&blob).unwrap();

        let mut writer = PeekStreamWriter::new();
        for record in &records {
            writer.append(42, &record.raw);
        }
        // A second version transition.
        writer.append(43, &records[0].raw);

        let parsed = parse_peek_stream(&writer.into_bytes()).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(
            (parsed[0].version, parsed[0].subsequence),
            (42, 1)
        );
        assert_eq!(
            (parsed[1].version, parsed[1].subsequence),
            (42, 2)
        );
        assert_eq!(parsed[2].version, 43);
        assert_eq!(
            parsed[0].mutation,
            Mutation::set(&b"k1"[..], &b"v1"[..])
        );
    }
}
