//! Framed durable queue of `TLogQueueEntry` records.
//!
//! Each record is `u32 payload_len || payload || u8 valid(=1)`; the payload
//! opens with the protocol version. On top of a disk queue that only
//! guarantees an atomic prefix of *bytes*, the valid flag plus zero-fill
//! recovery give an atomic prefix of *records*: a torn tail is padded with
//! zeros out to the record boundary, and zero-valid records are skipped on
//! every later recovery.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use braid_core::codec::{read_u64, write_bytes};
use braid_core::error::{Error, Result};
use braid_core::types::{DiskLoc, Version};

use crate::disk_queue::DiskQueue;
use crate::persist::PROTOCOL_VERSION;

/// Largest believable payload; anything bigger means corruption.
const MAX_PAYLOAD_BYTES: u32 = 100 << 20;

/// One committed version's worth of log content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TLogQueueEntry {
    pub id: Uuid,
    pub version: Version,
    pub known_committed_version: Version,
    pub messages: Bytes,
}

impl TLogQueueEntry {
    pub fn expected_size(&self) -> usize {
        self.messages.len()
    }
}

fn encode_payload(entry: &TLogQueueEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 8 + 16 + 4 + entry.messages.len());
    out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    out.extend_from_slice(&(entry.version as u64).to_be_bytes());
    out.extend_from_slice(&(entry.known_committed_version as u64).to_be_bytes());
    out.extend_from_slice(entry.id.as_bytes());
    write_bytes(&mut out, &entry.messages);
    out
}

fn decode_payload(payload: &[u8]) -> anyhow::Result<TLogQueueEntry> {
    let mut offset = 0;
    let protocol = read_u64(payload, &mut offset)?;
    anyhow::ensure!(
        protocol == PROTOCOL_VERSION,
        "unsupported queue entry protocol {protocol:#x}"
    );
    let version = read_u64(payload, &mut offset)? as Version;
    let known_committed_version = read_u64(payload, &mut offset)? as Version;
    anyhow::ensure!(offset + 16 <= payload.len(), "short queue entry id");
    let id = Uuid::from_slice(&payload[offset..offset + 16])?;
    offset += 16;
    let messages = Bytes::copy_from_slice(braid_core::codec::read_bytes(payload, &mut offset)?);
    anyhow::ensure!(offset == payload.len(), "trailing bytes in queue entry");
    Ok(TLogQueueEntry {
        id,
        version,
        known_committed_version,
        messages,
    })
}

/// Frame a payload into a full record. The length field is little-endian:
/// a torn size field then zero-extends to a small skip instead of an
/// enormous one.
fn frame_record(payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + payload.len() + 1);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.push(1);
    Bytes::from(out)
}

/// Parse one full record as stored on disk, e.g. from a spilled-reference
/// random read.
pub fn parse_queue_record(raw: &[u8]) -> anyhow::Result<TLogQueueEntry> {
    anyhow::ensure!(raw.len() >= 5, "short queue record");
    let payload_len = u32::from_le_bytes(raw[..4].try_into().expect("len checked")) as usize;
    anyhow::ensure!(raw.len() == 4 + payload_len + 1, "queue record length mismatch");
    anyhow::ensure!(raw[4 + payload_len] == 1, "queue record not marked valid");
    decode_payload(&raw[4..4 + payload_len])
}

/// An entry recovered from the queue along with its byte range.
#[derive(Clone, Debug)]
pub struct RecoveredEntry {
    pub entry: TLogQueueEntry,
    pub start: DiskLoc,
    pub end: DiskLoc,
}

pub struct TLogQueue {
    queue: Arc<dyn DiskQueue>,
}

impl TLogQueue {
    pub fn new(queue: Arc<dyn DiskQueue>) -> Self {
        Self { queue }
    }

    pub fn disk_queue(&self) -> &Arc<dyn DiskQueue> {
        &self.queue
    }

    /// Append an entry; returns its `[start, end)` byte range for the
    /// caller's version-location index. Durable after the next `commit`.
    pub fn push(&self, entry: &TLogQueueEntry) -> (DiskLoc, DiskLoc) {
        let record = frame_record(&encode_payload(entry));
        let start = self.queue.next_push_location();
        let end = self.queue.push(record);
        (start, end)
    }

    pub async fn commit(&self) -> anyhow::Result<()> {
        self.queue.commit().await
    }

    pub fn pop(&self, up_to: DiskLoc) {
        self.queue.pop(up_to);
    }

    pub async fn initialize_recovery(&self, min_location: DiskLoc) -> anyhow::Result<bool> {
        self.queue.initialize_recovery(min_location).await
    }

    /// Read the next valid entry during recovery. At a torn tail the
    /// remainder of the record is zero-filled (so later recoveries skip it
    /// as an invalid record) and `EndOfStream` is reported.
    pub async fn read_next(&self) -> Result<RecoveredEntry> {
        let mut zero_fill = 0usize;
        loop {
            let start = self.queue.next_read_location();
            let header = self
                .queue
                .read_next(4)
                .await
                .map_err(|_| Error::Internal("disk queue read failed"))?;
            if header.len() != 4 {
                if !header.is_empty() {
                    // Torn inside the size field: complete the field with
                    // zeros, then pad the payload the partial bytes imply.
                    let mut size = [0u8; 4];
                    size[..header.len()].copy_from_slice(&header);
                    let payload_len = u32::from_le_bytes(size) as usize;
                    zero_fill = (4 - header.len()) + payload_len + 1;
                }
                break;
            }

            let payload_len = u32::from_le_bytes(header[..4].try_into().expect("len checked"));
            if payload_len >= MAX_PAYLOAD_BYTES {
                return Err(Error::Internal("queue record too large"));
            }

            let body = self
                .queue
                .read_next(payload_len as usize + 1)
                .await
                .map_err(|_| Error::Internal("disk queue read failed"))?;
            if body.len() != payload_len as usize + 1 {
                // Torn inside the payload or valid flag.
                zero_fill = payload_len as usize + 1 - body.len();
                break;
            }

            match body[payload_len as usize] {
                0 => continue, // an old zero-filled record; skip it
                1 => {
                    let entry = decode_payload(&body[..payload_len as usize])
                        .map_err(|_| Error::Internal("corrupt queue entry"))?;
                    let end = self.queue.next_read_location();
                    return Ok(RecoveredEntry { entry, start, end });
                }
                _ => return Err(Error::Internal("corrupt queue record flag")),
            }
        }

        if zero_fill > 0 {
            tracing::warn!(bytes = zero_fill, "zero-filling torn disk queue tail");
            self.queue.push(Bytes::from(vec![0u8; zero_fill]));
        }
        Err(Error::EndOfStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_queue::MemDiskQueue;

    fn entry(id: Uuid, version: Version, messages: &[u8]) -> TLogQueueEntry {
        TLogQueueEntry {
            id,
            version,
            known_committed_version: version - 1,
            messages: Bytes::copy_from_slice(messages),
        }
    }

    #[tokio::test]
    async fn push_then_recover_all() {
        let disk = Arc::new(MemDiskQueue::new());
        let queue = TLogQueue::new(disk.clone());
        let id = Uuid::new_v4();

        let (s1, e1) = queue.push(&entry(id, 10, b"first"));
        let (s2, e2) = queue.push(&entry(id, 11, b"second"));
        assert!(s1 < e1 && e1 == s2 && s2 < e2);
        queue.commit().await.unwrap();

        assert!(!queue.initialize_recovery(0).await.unwrap());
        let r1 = queue.read_next().await.unwrap();
        assert_eq!(r1.entry.version, 10);
        assert_eq!((r1.start, r1.end), (s1, e1));
        let r2 = queue.read_next().await.unwrap();
        assert_eq!(r2.entry.version, 11);
        assert_eq!(queue.read_next().await.unwrap_err(), Error::EndOfStream);
    }

    #[tokio::test]
    async fn torn_tail_is_zero_filled_and_skipped() {
        let disk = Arc::new(MemDiskQueue::new());
        let queue = TLogQueue::new(disk.clone());
        let id = Uuid::new_v4();

        let (_, e1) = queue.push(&entry(id, 10, b"durable"));
        let (_, e2) = queue.push(&entry(id, 11, b"torn away"));
        queue.commit().await.unwrap();

        // Crash mid-record: only part of the second record survives.
        disk.truncate_to(e1 + (e2 - e1) / 2);

        assert!(!queue.initialize_recovery(0).await.unwrap());
        let r1 = queue.read_next().await.unwrap();
        assert_eq!(r1.entry.version, 10);
        assert_eq!(queue.read_next().await.unwrap_err(), Error::EndOfStream);

        // New pushes after the zero-fill recover cleanly, with the filled
        // record skipped.
        let (s3, _) = queue.push(&entry(id, 12, b"after crash"));
        queue.commit().await.unwrap();
        assert!(s3 > e1);

        assert!(!queue.initialize_recovery(0).await.unwrap());
        assert_eq!(queue.read_next().await.unwrap().entry.version, 10);
        assert_eq!(queue.read_next().await.unwrap().entry.version, 12);
        assert_eq!(queue.read_next().await.unwrap_err(), Error::EndOfStream);
    }

    #[tokio::test]
    async fn random_access_record_parse() {
        let disk = Arc::new(MemDiskQueue::new());
        let queue = TLogQueue::new(disk.clone());
        let id = Uuid::new_v4();

        let pushed = entry(id, 42, b"random access");
        let (start, end) = queue.push(&pushed);
        queue.commit().await.unwrap();

        let raw = disk.read(start, end, true).await.unwrap();
        let parsed = parse_queue_record(&raw).unwrap();
        assert_eq!(parsed, pushed);
    }
}
