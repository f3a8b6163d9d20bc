//! Shared primitive types for the braid commit pipeline.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the commit proxy, the transaction log and every collaborator
//! contract between them.

use bytes::Bytes;
use uuid::Uuid;

/// Commit version assigned by the master; totally orders the write history.
pub type Version = i64;

/// Sentinel for "no version".
pub const INVALID_VERSION: Version = -1;

/// Ordering of a mutation within a single commit version.
pub type Subsequence = u16;

/// Byte offset into a disk queue.
pub type DiskLoc = u64;

pub const INVALID_DISK_LOC: DiskLoc = u64::MAX;

/// Tag localities. Non-negative values are data-center localities of normal
/// storage tags; negative values select special routing families.
pub const TAG_LOCALITY_SPECIAL: i8 = -3;
pub const TAG_LOCALITY_SATELLITE: i8 = -4;
pub const TAG_LOCALITY_LOG_ROUTER: i8 = -2;
pub const TAG_LOCALITY_TXS: i8 = -5;
pub const TAG_LOCALITY_UPGRADED: i8 = -7;
pub const TAG_LOCALITY_INVALID: i8 = -100;

/// Pseudo-localities are translated to the log-router locality on pop.
pub const TAG_LOCALITY_LOG_ROUTER_MAPPED: i8 = -8;
pub const TAG_LOCALITY_BACKUP: i8 = -9;

/// Destination team identifier for a mutation: `(locality, id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub locality: i8,
    pub id: u16,
}

impl Tag {
    pub const fn new(locality: i8, id: u16) -> Self {
        Self { locality, id }
    }

    pub const fn invalid() -> Self {
        Self {
            locality: TAG_LOCALITY_INVALID,
            id: 0,
        }
    }

    /// Dense slot index for the per-locality tag-data table: non-negative
    /// localities map to even slots, negative localities to odd slots.
    pub fn tag_data_index(&self) -> usize {
        if self.locality >= 0 {
            2 * self.locality as usize
        } else {
            (1 - 2 * self.locality as isize) as usize
        }
    }

    pub fn is_pseudo_locality(&self) -> bool {
        self.locality == TAG_LOCALITY_LOG_ROUTER_MAPPED || self.locality == TAG_LOCALITY_BACKUP
    }

    /// 3-byte wire encoding: locality then big-endian id.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(self.locality as u8);
        out.extend_from_slice(&self.id.to_be_bytes());
    }

    pub fn decode(data: &[u8], offset: &mut usize) -> anyhow::Result<Self> {
        anyhow::ensure!(*offset + 3 <= data.len(), "short tag");
        let locality = data[*offset] as i8;
        let id = u16::from_be_bytes([data[*offset + 1], data[*offset + 2]]);
        *offset += 3;
        Ok(Self { locality, id })
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.locality, self.id)
    }
}

/// The transaction-subsystem state tag.
pub const TXS_TAG: Tag = Tag::new(TAG_LOCALITY_TXS, 0);

/// Tag of the storage cache followers.
pub const CACHE_TAG: Tag = Tag::new(TAG_LOCALITY_SPECIAL, 0);

/// Half-open key range `[begin, end)` over lexicographically ordered keys.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyRange {
    pub begin: Bytes,
    pub end: Bytes,
}

impl KeyRange {
    pub fn new(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The range covering exactly `key`.
    pub fn single_key(key: &[u8]) -> Self {
        let mut end = key.to_vec();
        end.push(0);
        Self {
            begin: Bytes::copy_from_slice(key),
            end: Bytes::from(end),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.begin.as_ref() <= key && key < self.end.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Intersection of two ranges; empty ranges are returned as-is.
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            begin: self.begin.clone().max(other.begin.clone()),
            end: self.end.clone().min(other.end.clone()),
        }
    }
}

/// Priority classes for read-version (GRV) requests, lowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionPriority {
    Batch,
    Default,
    Immediate,
}

/// Marker carried by each part of a transaction that was split across
/// multiple commit proxies. All parts share `id` and `total_parts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitTransaction {
    pub id: Uuid,
    pub total_parts: u16,
    pub part_index: u16,
}

impl SplitTransaction {
    pub fn new(id: Uuid, total_parts: u16, part_index: u16) -> Self {
        Self {
            id,
            total_parts,
            part_index,
        }
    }
}

/// First byte of the system keyspace.
pub const SYSTEM_KEY_PREFIX: u8 = 0xff;

pub fn system_keys_begin() -> Bytes {
    Bytes::from_static(b"\xff")
}

/// `[\xff\x02, \xff\x03)` holds system data that does not affect transaction
/// subsystem metadata.
pub fn non_metadata_system_keys() -> KeyRange {
    KeyRange::new(
        Bytes::from_static(b"\xff\x02"),
        Bytes::from_static(b"\xff\x03"),
    )
}

pub fn metadata_version_key() -> Bytes {
    Bytes::from_static(b"\xff/metadataVersion")
}

pub fn database_locked_key() -> Bytes {
    Bytes::from_static(b"\xff/dbLocked")
}

pub fn must_contain_system_mutations_key() -> Bytes {
    Bytes::from_static(b"\xff/mustContainSystemMutations")
}

pub fn coordinators_key() -> Bytes {
    Bytes::from_static(b"\xff/coordinators")
}

/// `\xff/keyServers/<key>` holds the tag set responsible for the shard
/// starting at `<key>`.
pub fn key_servers_prefix() -> Bytes {
    Bytes::from_static(b"\xff/keyServers/")
}

/// `\xff/cacheRanges/<key>` marks the shard starting at `<key>` as cached.
pub fn cache_ranges_prefix() -> Bytes {
    Bytes::from_static(b"\xff/cacheRanges/")
}

/// `\xff/backupRanges/<key>` holds the backup destination names for the
/// range starting at `<key>`.
pub fn backup_ranges_prefix() -> Bytes {
    Bytes::from_static(b"\xff/backupRanges/")
}

/// Is `key` in the metadata portion of the system keyspace?
pub fn is_metadata_key(key: &[u8]) -> bool {
    if key == metadata_version_key().as_ref() {
        return true;
    }
    let non_meta = non_metadata_system_keys();
    !key.is_empty()
        && key[0] == SYSTEM_KEY_PREFIX
        && !(key >= non_meta.begin.as_ref() && key < non_meta.end.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_range_basics() {
        let r = KeyRange::new(&b"b"[..], &b"d"[..]);
        assert!(r.contains(b"b"));
        assert!(r.contains(b"c"));
        assert!(!r.contains(b"d"));
        assert!(!r.contains(b"a"));

        let s = KeyRange::new(&b"c"[..], &b"e"[..]);
        assert!(r.overlaps(&s));
        let i = r.intersect(&s);
        assert_eq!(i.begin.as_ref(), b"c");
        assert_eq!(i.end.as_ref(), b"d");

        let t = KeyRange::new(&b"d"[..], &b"e"[..]);
        assert!(!r.overlaps(&t));
    }

    #[test]
    fn tag_round_trip() {
        let tag = Tag::new(TAG_LOCALITY_LOG_ROUTER, 513);
        let mut buf = Vec::new();
        tag.encode_to(&mut buf);
        let mut offset = 0;
        let back = Tag::decode(&buf, &mut offset).unwrap();
        assert_eq!(back, tag);
        assert_eq!(offset, 3);
    }

    #[test]
    fn metadata_key_classification() {
        assert!(is_metadata_key(b"\xff/keyServers/a"));
        assert!(is_metadata_key(&metadata_version_key()));
        assert!(!is_metadata_key(b"\xff\x02/blob/backup"));
        assert!(!is_metadata_key(b"normal-key"));
    }

    #[test]
    fn priority_ordering() {
        assert!(TransactionPriority::Immediate > TransactionPriority::Default);
        assert!(TransactionPriority::Default > TransactionPriority::Batch);
    }
}
