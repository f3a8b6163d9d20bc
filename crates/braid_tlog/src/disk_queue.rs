//! Disk queue backends.
//!
//! A disk queue is an append-only byte stream addressed by absolute
//! locations that stay stable across front-trimming pops. It guarantees
//! only that a prefix of pushed *bytes* survives a crash; the framed queue
//! in `queue.rs` turns that into atomic-prefix *records*.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use crc32fast::Hasher;
use tracing::warn;

use braid_core::types::DiskLoc;

#[async_trait]
pub trait DiskQueue: Send + Sync {
    /// Append bytes; returns the location one past the last byte written.
    /// Data is volatile until `commit`.
    fn push(&self, data: Bytes) -> DiskLoc;

    fn next_push_location(&self) -> DiskLoc;
    fn next_read_location(&self) -> DiskLoc;

    /// Sequential recovery read of up to `bytes` from the read cursor; a
    /// short (or empty) result means the stream ended.
    async fn read_next(&self, bytes: usize) -> anyhow::Result<Bytes>;

    /// Random-access read of `[start, end)`.
    async fn read(&self, start: DiskLoc, end: DiskLoc, check_hashes: bool) -> anyhow::Result<Bytes>;

    /// Make all pushed bytes durable.
    async fn commit(&self) -> anyhow::Result<()>;

    /// Position the recovery cursor. Returns `true` if the queue holds no
    /// data at or past `min_location` (recovery is already finished).
    async fn initialize_recovery(&self, min_location: DiskLoc) -> anyhow::Result<bool>;

    /// Release storage for all bytes before `up_to`.
    fn pop(&self, up_to: DiskLoc);
}

// ---------------------------------------------------------------------------
// In-memory queue (tests, fault injection)

#[derive(Debug, Default)]
struct MemState {
    /// Absolute location of `buf[0]`.
    base: DiskLoc,
    buf: Vec<u8>,
    read_cursor: DiskLoc,
    durable_end: DiskLoc,
}

#[derive(Debug, Default)]
pub struct MemDiskQueue {
    state: Mutex<MemState>,
}

impl MemDiskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a crash: discard every byte at or past `end`, including
    /// uncommitted tail data. Tests use this to produce torn writes.
    pub fn truncate_to(&self, end: DiskLoc) {
        let mut state = self.state.lock().expect("mem queue poisoned");
        let keep = end.saturating_sub(state.base) as usize;
        let buf_len = state.buf.len();
        state.buf.truncate(keep.min(buf_len));
        state.durable_end = state.durable_end.min(end);
        state.read_cursor = state.read_cursor.min(end).max(state.base);
    }

    pub fn durable_end(&self) -> DiskLoc {
        self.state.lock().expect("mem queue poisoned").durable_end
    }
}

#[async_trait]
impl DiskQueue for MemDiskQueue {
    fn push(&self, data: Bytes) -> DiskLoc {
        let mut state = self.state.lock().expect("mem queue poisoned");
        state.buf.extend_from_slice(&data);
        state.base + state.buf.len() as DiskLoc
    }

    fn next_push_location(&self) -> DiskLoc {
        let state = self.state.lock().expect("mem queue poisoned");
        state.base + state.buf.len() as DiskLoc
    }

    fn next_read_location(&self) -> DiskLoc {
        self.state.lock().expect("mem queue poisoned").read_cursor
    }

    async fn read_next(&self, bytes: usize) -> anyhow::Result<Bytes> {
        let mut state = self.state.lock().expect("mem queue poisoned");
        let end = state.base + state.buf.len() as DiskLoc;
        let start = state.read_cursor.max(state.base);
        let take = bytes.min(end.saturating_sub(start) as usize);
        let from = (start - state.base) as usize;
        let out = Bytes::copy_from_slice(&state.buf[from..from + take]);
        state.read_cursor = start + take as DiskLoc;
        Ok(out)
    }

    async fn read(&self, start: DiskLoc, end: DiskLoc, _check_hashes: bool) -> anyhow::Result<Bytes> {
        let state = self.state.lock().expect("mem queue poisoned");
        anyhow::ensure!(start >= state.base, "read before popped location");
        let limit = state.base + state.buf.len() as DiskLoc;
        anyhow::ensure!(end <= limit, "read past queue end");
        let from = (start - state.base) as usize;
        let to = (end - state.base) as usize;
        Ok(Bytes::copy_from_slice(&state.buf[from..to]))
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("mem queue poisoned");
        state.durable_end = state.base + state.buf.len() as DiskLoc;
        Ok(())
    }

    async fn initialize_recovery(&self, min_location: DiskLoc) -> anyhow::Result<bool> {
        let mut state = self.state.lock().expect("mem queue poisoned");
        state.read_cursor = min_location.max(state.base);
        Ok(state.read_cursor >= state.base + state.buf.len() as DiskLoc)
    }

    fn pop(&self, up_to: DiskLoc) {
        let mut state = self.state.lock().expect("mem queue poisoned");
        if up_to <= state.base {
            return;
        }
        let end = state.base + state.buf.len() as DiskLoc;
        let cut = up_to.min(end);
        let drain_len = (cut - state.base) as usize;
        state.buf.drain(..drain_len);
        state.base = cut;
        state.read_cursor = state.read_cursor.max(cut);
    }
}

// ---------------------------------------------------------------------------
// File-backed queue

const FILE_MAGIC: u64 = 0x6272_6169_6471_7565; // "braidque"
const HEADER_LEN: u64 = 24;

/// Append-only file with a small header carrying the absolute location of
/// the first stored byte. `pop` trims the front by rewriting the file into
/// a temp and renaming it over the original.
pub struct FileDiskQueue {
    path: PathBuf,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    base: DiskLoc,
    len: DiskLoc,
    read_cursor: DiskLoc,
    pending_pop: Option<DiskLoc>,
    /// First append failure; sticky, reported by every later `commit`.
    write_error: Option<std::io::Error>,
}

fn encode_header(base: DiskLoc) -> [u8; HEADER_LEN as usize] {
    let mut out = [0u8; HEADER_LEN as usize];
    out[..8].copy_from_slice(&FILE_MAGIC.to_be_bytes());
    out[8..16].copy_from_slice(&base.to_be_bytes());
    let mut hasher = Hasher::new();
    hasher.update(&out[..16]);
    out[16..20].copy_from_slice(&hasher.finalize().to_be_bytes());
    out
}

fn decode_header(buf: &[u8]) -> anyhow::Result<DiskLoc> {
    anyhow::ensure!(buf.len() >= HEADER_LEN as usize, "short disk queue header");
    let magic = u64::from_be_bytes(buf[..8].try_into().expect("len checked"));
    anyhow::ensure!(magic == FILE_MAGIC, "bad disk queue magic");
    let mut hasher = Hasher::new();
    hasher.update(&buf[..16]);
    let crc = u32::from_be_bytes(buf[16..20].try_into().expect("len checked"));
    anyhow::ensure!(hasher.finalize() == crc, "disk queue header checksum mismatch");
    Ok(u64::from_be_bytes(buf[8..16].try_into().expect("len checked")))
}

impl FileDiskQueue {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create disk queue dir")?;
        }

        let exists = path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .context("open disk queue file")?;

        let base;
        let len;
        if exists {
            let mut header = vec![0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header).context("read disk queue header")?;
            base = decode_header(&header)?;
            len = fs::metadata(&path)?.len() - HEADER_LEN;
        } else {
            base = 0;
            len = 0;
            file.write_all(&encode_header(0)).context("write disk queue header")?;
            file.sync_data()?;
        }

        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            state: Mutex::new(FileState {
                file,
                base,
                len,
                read_cursor: base,
                pending_pop: None,
                write_error: None,
            }),
        })
    }

    /// Rewrite the file keeping only bytes at or past `up_to`. Runs inside
    /// `commit` so pops batch up with durability work.
    fn apply_pop(state: &mut FileState, path: &Path, up_to: DiskLoc) -> anyhow::Result<()> {
        let end = state.base + state.len;
        let cut = up_to.clamp(state.base, end);
        if cut == state.base {
            return Ok(());
        }

        let mut tail = vec![0u8; (end - cut) as usize];
        state
            .file
            .seek(SeekFrom::Start(HEADER_LEN + (cut - state.base)))?;
        state.file.read_exact(&mut tail)?;

        let tmp_path = path.with_extension("queue.tmp");
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)
            .context("open disk queue pop temp")?;
        tmp.write_all(&encode_header(cut))?;
        tmp.write_all(&tail)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, path).context("replace disk queue file")?;

        tmp.seek(SeekFrom::End(0))?;
        state.file = tmp;
        state.base = cut;
        state.len = end - cut;
        state.read_cursor = state.read_cursor.max(cut);
        Ok(())
    }
}

#[async_trait]
impl DiskQueue for FileDiskQueue {
    fn push(&self, data: Bytes) -> DiskLoc {
        let mut state = self.state.lock().expect("disk queue poisoned");
        // Keep handing out coherent locations after a failed append; the
        // data is only claimed durable by a commit, which will now fail.
        if state.write_error.is_none() {
            if let Err(err) = state.file.write_all(&data) {
                warn!(error = ?err, "disk queue append failed");
                state.write_error = Some(err);
            }
        }
        state.len += data.len() as DiskLoc;
        state.base + state.len
    }

    fn next_push_location(&self) -> DiskLoc {
        let state = self.state.lock().expect("disk queue poisoned");
        state.base + state.len
    }

    fn next_read_location(&self) -> DiskLoc {
        self.state.lock().expect("disk queue poisoned").read_cursor
    }

    async fn read_next(&self, bytes: usize) -> anyhow::Result<Bytes> {
        let mut state = self.state.lock().expect("disk queue poisoned");
        let end = state.base + state.len;
        let start = state.read_cursor.max(state.base);
        let take = bytes.min(end.saturating_sub(start) as usize);
        let mut buf = vec![0u8; take];
        let offset = HEADER_LEN + (start - state.base);
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut buf)?;
        state.file.seek(SeekFrom::End(0))?;
        state.read_cursor = start + take as DiskLoc;
        Ok(Bytes::from(buf))
    }

    async fn read(&self, start: DiskLoc, end: DiskLoc, _check_hashes: bool) -> anyhow::Result<Bytes> {
        let mut state = self.state.lock().expect("disk queue poisoned");
        anyhow::ensure!(start >= state.base, "read before popped location");
        anyhow::ensure!(end <= state.base + state.len, "read past queue end");
        let mut buf = vec![0u8; (end - start) as usize];
        let offset = HEADER_LEN + (start - state.base);
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut buf)?;
        state.file.seek(SeekFrom::End(0))?;
        Ok(Bytes::from(buf))
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("disk queue poisoned");
        if let Some(err) = &state.write_error {
            anyhow::bail!("disk queue append failed: {err}");
        }
        state.file.flush()?;
        state.file.sync_data().context("disk queue sync")?;
        if let Some(up_to) = state.pending_pop.take() {
            Self::apply_pop(&mut state, &self.path, up_to)?;
        }
        Ok(())
    }

    async fn initialize_recovery(&self, min_location: DiskLoc) -> anyhow::Result<bool> {
        let mut state = self.state.lock().expect("disk queue poisoned");
        state.read_cursor = min_location.max(state.base);
        Ok(state.read_cursor >= state.base + state.len)
    }

    fn pop(&self, up_to: DiskLoc) {
        let mut state = self.state.lock().expect("disk queue poisoned");
        let pending = state.pending_pop.map_or(up_to, |p| p.max(up_to));
        state.pending_pop = Some(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_queue_push_read_pop() {
        let q = MemDiskQueue::new();
        let end1 = q.push(Bytes::from_static(b"hello"));
        let end2 = q.push(Bytes::from_static(b"world"));
        assert_eq!(end1, 5);
        assert_eq!(end2, 10);
        q.commit().await.unwrap();

        assert_eq!(q.read(0, 5, true).await.unwrap().as_ref(), b"hello");
        assert_eq!(q.read(5, 10, true).await.unwrap().as_ref(), b"world");

        q.pop(5);
        assert!(q.read(0, 5, true).await.is_err());
        assert_eq!(q.read(5, 10, true).await.unwrap().as_ref(), b"world");
        assert_eq!(q.next_push_location(), 10);
    }

    #[tokio::test]
    async fn file_queue_survives_reopen_and_pop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");

        {
            let q = FileDiskQueue::open(&path).unwrap();
            q.push(Bytes::from_static(b"abcde"));
            q.push(Bytes::from_static(b"fghij"));
            q.commit().await.unwrap();
            q.pop(5);
            q.commit().await.unwrap();
        }

        let q = FileDiskQueue::open(&path).unwrap();
        assert_eq!(q.next_push_location(), 10);
        assert_eq!(q.read(5, 10, true).await.unwrap().as_ref(), b"fghij");
        assert!(q.read(0, 5, true).await.is_err());

        let end = q.push(Bytes::from_static(b"klmno"));
        assert_eq!(end, 15);
        q.commit().await.unwrap();
        assert_eq!(q.read(10, 15, true).await.unwrap().as_ref(), b"klmno");
    }

    #[tokio::test]
    async fn sequential_recovery_reads() {
        let q = MemDiskQueue::new();
        q.push(Bytes::from_static(b"0123456789"));
        q.commit().await.unwrap();

        let finished = q.initialize_recovery(0).await.unwrap();
        assert!(!finished);
        assert_eq!(q.read_next(4).await.unwrap().as_ref(), b"0123");
        assert_eq!(q.read_next(4).await.unwrap().as_ref(), b"4567");
        // Short read at the end of the stream.
        assert_eq!(q.read_next(4).await.unwrap().as_ref(), b"89");
        assert_eq!(q.read_next(4).await.unwrap().len(), 0);
    }
}
