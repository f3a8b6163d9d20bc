//! Persistent key namespace and value codecs for the TLog's kv store.
//!
//! Identity keys are written once at init; `version/<id>`,
//! `knownCommitted/<id>` and `recoveryLocation` advance with each spill
//! commit; `TagMsg/`, `TagMsgRef/` and `TagPop/` hold the spilled per-tag
//! data itself.

use bytes::Bytes;
use uuid::Uuid;

use braid_core::codec::{read_u32, read_u64};
use braid_core::types::{DiskLoc, KeyRange, Tag, Version};

/// Wire protocol version stamped into queue entries and spill records.
pub const PROTOCOL_VERSION: u64 = 0x0001_0000_0000_0001;

pub const PERSIST_FORMAT_KEY: &[u8] = b"Format";
pub const PERSIST_FORMAT_VALUE: &[u8] = b"braid/LogServer/3/0";
pub const PERSIST_RECOVERY_LOCATION_KEY: &[u8] = b"recoveryLocation";

const CURRENT_VERSION_PREFIX: &[u8] = b"version/";
const KNOWN_COMMITTED_PREFIX: &[u8] = b"knownCommitted/";
const LOCALITY_PREFIX: &[u8] = b"Locality/";
const LOG_ROUTER_TAGS_PREFIX: &[u8] = b"LogRouterTags/";
const TXS_TAGS_PREFIX: &[u8] = b"TxsTags/";
const RECOVERY_COUNT_PREFIX: &[u8] = b"DbRecoveryCount/";
const PROTOCOL_VERSION_PREFIX: &[u8] = b"ProtocolVersion/";
const SPILL_TYPE_PREFIX: &[u8] = b"TLogSpillType/";
const TAG_MESSAGES_PREFIX: &[u8] = b"TagMsg/";
const TAG_MESSAGE_REFS_PREFIX: &[u8] = b"TagMsgRef/";
const TAG_POPPED_PREFIX: &[u8] = b"TagPop/";

fn id_key(prefix: &[u8], id: Uuid) -> Bytes {
    let mut out = Vec::with_capacity(prefix.len() + 16);
    out.extend_from_slice(prefix);
    out.extend_from_slice(id.as_bytes());
    Bytes::from(out)
}

pub fn persist_current_version_key(id: Uuid) -> Bytes {
    id_key(CURRENT_VERSION_PREFIX, id)
}

pub fn persist_known_committed_key(id: Uuid) -> Bytes {
    id_key(KNOWN_COMMITTED_PREFIX, id)
}

pub fn persist_locality_key(id: Uuid) -> Bytes {
    id_key(LOCALITY_PREFIX, id)
}

pub fn persist_log_router_tags_key(id: Uuid) -> Bytes {
    id_key(LOG_ROUTER_TAGS_PREFIX, id)
}

pub fn persist_txs_tags_key(id: Uuid) -> Bytes {
    id_key(TXS_TAGS_PREFIX, id)
}

pub fn persist_recovery_count_key(id: Uuid) -> Bytes {
    id_key(RECOVERY_COUNT_PREFIX, id)
}

pub fn persist_protocol_version_key(id: Uuid) -> Bytes {
    id_key(PROTOCOL_VERSION_PREFIX, id)
}

pub fn persist_spill_type_key(id: Uuid) -> Bytes {
    id_key(SPILL_TYPE_PREFIX, id)
}

fn tag_version_key(prefix: &[u8], id: Uuid, tag: Tag, version: Version) -> Bytes {
    let mut out = Vec::with_capacity(prefix.len() + 16 + 3 + 8);
    out.extend_from_slice(prefix);
    out.extend_from_slice(id.as_bytes());
    tag.encode_to(&mut out);
    out.extend_from_slice(&(version as u64).to_be_bytes());
    Bytes::from(out)
}

/// `TagMsg/<id><tag><BE version>` -> concatenated message records
/// (spill-by-value).
pub fn persist_tag_messages_key(id: Uuid, tag: Tag, version: Version) -> Bytes {
    tag_version_key(TAG_MESSAGES_PREFIX, id, tag, version)
}

/// `TagMsgRef/<id><tag><BE version>` -> `SpilledData` batch
/// (spill-by-reference).
pub fn persist_tag_message_refs_key(id: Uuid, tag: Tag, version: Version) -> Bytes {
    tag_version_key(TAG_MESSAGE_REFS_PREFIX, id, tag, version)
}

pub fn persist_tag_messages_range(id: Uuid, tag: Tag, begin: Version, end: Version) -> KeyRange {
    KeyRange::new(
        persist_tag_messages_key(id, tag, begin),
        persist_tag_messages_key(id, tag, end),
    )
}

pub fn persist_tag_message_refs_range(
    id: Uuid,
    tag: Tag,
    begin: Version,
    end: Version,
) -> KeyRange {
    KeyRange::new(
        persist_tag_message_refs_key(id, tag, begin),
        persist_tag_message_refs_key(id, tag, end),
    )
}

pub fn persist_tag_popped_key(id: Uuid, tag: Tag) -> Bytes {
    let mut out = Vec::with_capacity(TAG_POPPED_PREFIX.len() + 16 + 3);
    out.extend_from_slice(TAG_POPPED_PREFIX);
    out.extend_from_slice(id.as_bytes());
    tag.encode_to(&mut out);
    Bytes::from(out)
}

/// All `TagPop/<id>` entries for one log.
pub fn persist_tag_popped_range(id: Uuid) -> KeyRange {
    let begin = id_key(TAG_POPPED_PREFIX, id);
    let mut end = begin.to_vec();
    *end.last_mut().expect("non-empty key") += 1;
    KeyRange::new(begin, end)
}

pub fn decode_tag_popped_key(id: Uuid, key: &[u8]) -> anyhow::Result<Tag> {
    let prefix_len = TAG_POPPED_PREFIX.len() + 16;
    anyhow::ensure!(
        key.len() == prefix_len + 3 && key[TAG_POPPED_PREFIX.len()..prefix_len] == id.as_bytes()[..],
        "malformed tag popped key"
    );
    let mut offset = prefix_len;
    Tag::decode(key, &mut offset)
}

/// Version suffix of a `TagMsg/` or `TagMsgRef/` key.
pub fn decode_tag_key_version(key: &[u8]) -> anyhow::Result<Version> {
    anyhow::ensure!(key.len() >= 8, "malformed tag message key");
    let mut offset = key.len() - 8;
    Ok(read_u64(key, &mut offset)? as Version)
}

pub fn encode_version_value(version: Version) -> Bytes {
    Bytes::copy_from_slice(&(version as u64).to_be_bytes())
}

pub fn decode_version_value(value: &[u8]) -> anyhow::Result<Version> {
    let mut offset = 0;
    Ok(read_u64(value, &mut offset)? as Version)
}

pub fn encode_u64_value(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

pub fn decode_u64_value(value: &[u8]) -> anyhow::Result<u64> {
    let mut offset = 0;
    read_u64(value, &mut offset)
}

pub fn encode_i8_value(value: i8) -> Bytes {
    Bytes::copy_from_slice(&[value as u8])
}

pub fn decode_i8_value(value: &[u8]) -> anyhow::Result<i8> {
    anyhow::ensure!(value.len() == 1, "malformed i8 value");
    Ok(value[0] as i8)
}

/// How a tag's messages move off the volatile heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillType {
    Value,
    Reference,
}

impl SpillType {
    pub fn encode(self) -> Bytes {
        match self {
            SpillType::Value => Bytes::from_static(&[1]),
            SpillType::Reference => Bytes::from_static(&[2]),
        }
    }

    pub fn decode(value: &[u8]) -> anyhow::Result<Self> {
        match value {
            [1] => Ok(SpillType::Value),
            [2] => Ok(SpillType::Reference),
            other => anyhow::bail!("unknown spill type {other:?}"),
        }
    }
}

/// One spilled-by-reference batch entry: where in the disk queue the
/// commit for `version` lives, and how many of its bytes are mutations
/// for the owning tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpilledData {
    pub version: Version,
    pub start: DiskLoc,
    pub length: u32,
    pub mutation_bytes: u32,
}

/// Encode a batch of spill references: `u32 count` then the fixed-width
/// entries, all big-endian.
pub fn encode_spilled_batch(batch: &[SpilledData]) -> Bytes {
    let mut out = Vec::with_capacity(4 + batch.len() * 24);
    out.extend_from_slice(&(batch.len() as u32).to_be_bytes());
    for item in batch {
        out.extend_from_slice(&(item.version as u64).to_be_bytes());
        out.extend_from_slice(&item.start.to_be_bytes());
        out.extend_from_slice(&item.length.to_be_bytes());
        out.extend_from_slice(&item.mutation_bytes.to_be_bytes());
    }
    Bytes::from(out)
}

pub fn decode_spilled_batch(value: &[u8]) -> anyhow::Result<Vec<SpilledData>> {
    let mut offset = 0;
    let count = read_u32(value, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let version = read_u64(value, &mut offset)? as Version;
        let start = read_u64(value, &mut offset)?;
        let length = read_u32(value, &mut offset)?;
        let mutation_bytes = read_u32(value, &mut offset)?;
        out.push(SpilledData {
            version,
            start,
            length,
            mutation_bytes,
        });
    }
    anyhow::ensure!(offset == value.len(), "trailing bytes in spilled batch");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_keys_sort_by_version() {
        let id = Uuid::new_v4();
        let tag = Tag::new(0, 7);
        let k1 = persist_tag_messages_key(id, tag, 5);
        let k2 = persist_tag_messages_key(id, tag, 1000);
        assert!(k1 < k2);
        assert_eq!(decode_tag_key_version(&k1).unwrap(), 5);
        assert_eq!(decode_tag_key_version(&k2).unwrap(), 1000);
    }

    #[test]
    fn popped_key_round_trip() {
        let id = Uuid::new_v4();
        let tag = Tag::new(-2, 3);
        let key = persist_tag_popped_key(id, tag);
        assert!(persist_tag_popped_range(id).contains(&key));
        assert_eq!(decode_tag_popped_key(id, &key).unwrap(), tag);
    }

    #[test]
    fn spilled_batch_round_trip() {
        let batch = vec![
            SpilledData {
                version: 10,
                start: 0,
                length: 100,
                mutation_bytes: 60,
            },
            SpilledData {
                version: 12,
                start: 100,
                length: 200,
                mutation_bytes: 150,
            },
        ];
        let encoded = encode_spilled_batch(&batch);
        assert_eq!(decode_spilled_batch(&encoded).unwrap(), batch);
        assert!(decode_spilled_batch(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn spill_type_round_trip() {
        for t in [SpillType::Value, SpillType::Reference] {
            assert_eq!(SpillType::decode(&t.encode()).unwrap(), t);
        }
    }
}
