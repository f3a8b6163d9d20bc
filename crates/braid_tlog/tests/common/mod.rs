//! Shared helpers for transaction log integration tests.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use braid_core::interfaces::{MemKvStore, TLogCommitRequest};
use braid_core::knobs::Knobs;
use braid_core::message::LogPushData;
use braid_core::mutation::Mutation;
use braid_core::types::Tag;
use braid_tlog::{LogConfig, MemDiskQueue, TLogServer};

pub struct TestLog {
    pub server: Arc<TLogServer>,
    pub kv: Arc<MemKvStore>,
    pub disk: Arc<MemDiskQueue>,
    pub log_id: Uuid,
}

pub fn test_knobs() -> Knobs {
    Knobs::default()
}

/// Build a fresh single-generation log over in-memory backends and start
/// its background loops.
pub async fn start_log(knobs: Knobs) -> TestLog {
    let log_id = Uuid::new_v4();
    let kv = Arc::new(MemKvStore::new());
    let disk = Arc::new(MemDiskQueue::new());
    let server = TLogServer::create(
        Arc::new(knobs),
        kv.clone(),
        disk.clone(),
        LogConfig::new(log_id),
    )
    .await
    .expect("create log");
    server.spawn_background();
    TestLog {
        server,
        kv,
        disk,
        log_id,
    }
}

/// A commit blob with `count` distinct sets, all routed to `tag`.
pub fn blob(tag: Tag, count: usize, payload_bytes: usize) -> Bytes {
    let mut push = LogPushData::new();
    for i in 0..count {
        push.add_tag(tag);
        push.add_typed_message(&Mutation::set(
            format!("key-{i}").into_bytes(),
            vec![b'v'; payload_bytes],
        ));
    }
    push.into_bytes()
}

pub fn commit_request(prev: i64, version: i64, messages: Bytes) -> TLogCommitRequest {
    let mut req = TLogCommitRequest::new(prev, version, messages);
    req.known_committed_version = prev;
    req.min_known_committed_version = prev;
    req
}
