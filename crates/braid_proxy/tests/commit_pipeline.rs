//! End-to-end commit pipeline behavior against scripted collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use braid_core::interfaces::{
    CommitTransaction, CommitTransactionRequest, ConflictOutcome, FLAG_FIRST_IN_BATCH,
};
use braid_core::knobs::Knobs;
use braid_core::message::parse_commit_blob;
use braid_core::mutation::Mutation;
use braid_core::types::{KeyRange, Tag, INVALID_VERSION, TXS_TAG};
use braid_proxy::proxy::{should_split, split_transaction, CommitProxy};

use common::{RecordingLogSystem, ScriptedMaster, ScriptedResolver};

fn team_tag() -> Tag {
    Tag::new(0, 1)
}

fn start_proxy(
    knobs: Knobs,
    master: &Arc<ScriptedMaster>,
    resolver: &Arc<ScriptedResolver>,
    log: &Arc<RecordingLogSystem>,
) -> CommitProxy {
    CommitProxy::start(
        Arc::new(knobs),
        master.clone(),
        vec![resolver.clone()],
        log.clone(),
        1,
        vec![team_tag()],
    )
}

fn simple_request(
    key: &[u8],
    value: &[u8],
) -> (
    CommitTransactionRequest,
    tokio::sync::oneshot::Receiver<braid_core::Result<braid_core::interfaces::CommitId>>,
) {
    CommitTransactionRequest::new(CommitTransaction {
        read_conflict_ranges: vec![KeyRange::single_key(key)],
        write_conflict_ranges: vec![KeyRange::single_key(key)],
        mutations: vec![Mutation::set(key.to_vec(), value.to_vec())],
        read_snapshot: 100,
    })
}

#[tokio::test]
async fn small_commit_round_trip() {
    let master = ScriptedMaster::new(100, 5);
    let resolver = ScriptedResolver::new();
    let log = RecordingLogSystem::new();
    let proxy = start_proxy(Knobs::default(), &master, &resolver, &log);

    let (request, reply) = simple_request(b"k", b"v");
    proxy.submit_commit(request).await.unwrap();

    let commit_id = reply.await.unwrap().unwrap();
    assert_eq!(commit_id.version, 105);
    assert_eq!(commit_id.batch_index, 0);
    assert!(commit_id.conflicting_key_ranges.is_none());

    // The push carried the mutation under the owning team's tag.
    let pushes = log.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].version, 105);
    assert_eq!(pushes[0].prev_version, 100);
    let records = parse_commit_blob(&pushes[0].messages).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tags, vec![team_tag()]);
    assert_eq!(
        records[0].mutation().unwrap(),
        Mutation::set(&b"k"[..], &b"v"[..])
    );

    // Commit was reported back to the master before the reply.
    assert_eq!(master.committed(), 105);
}

#[tokio::test]
async fn conflicts_surface_as_not_committed() {
    let master = ScriptedMaster::new(0, 5);
    let resolver = ScriptedResolver::new();
    let log = RecordingLogSystem::new();
    let proxy = start_proxy(Knobs::default(), &master, &resolver, &log);

    resolver.set_outcome(ConflictOutcome::Conflict);
    let (request, reply) = simple_request(b"k", b"v");
    proxy.submit_commit(request).await.unwrap();
    assert_eq!(
        reply.await.unwrap().unwrap_err(),
        braid_core::Error::NotCommitted
    );

    resolver.set_outcome(ConflictOutcome::TooOld);
    let (request, reply) = simple_request(b"k", b"v");
    proxy.submit_commit(request).await.unwrap();
    assert_eq!(
        reply.await.unwrap().unwrap_err(),
        braid_core::Error::TransactionTooOld
    );
}

#[tokio::test]
async fn reported_conflicts_map_back_to_client_ranges() {
    let master = ScriptedMaster::new(0, 5);
    let resolver = ScriptedResolver::new();
    let log = RecordingLogSystem::new();
    let proxy = start_proxy(Knobs::default(), &master, &resolver, &log);

    resolver.set_outcome(ConflictOutcome::Conflict);
    resolver.report_first_range.store(true, Ordering::SeqCst);

    let (mut request, reply) = simple_request(b"k", b"v");
    request.report_conflicting_keys = true;
    proxy.submit_commit(request).await.unwrap();

    let commit_id = reply.await.unwrap().unwrap();
    assert_eq!(commit_id.version, INVALID_VERSION);
    assert_eq!(commit_id.conflicting_key_ranges, Some(vec![0]));
}

#[tokio::test]
async fn split_parts_share_one_commit_version() {
    let knobs = {
        let mut knobs = Knobs::default();
        knobs.large_transaction_criteria = 100;
        knobs
    };
    let master = ScriptedMaster::new(772, 5);
    let log = RecordingLogSystem::new();

    let resolver_a = ScriptedResolver::new();
    let resolver_b = ScriptedResolver::new();
    let proxy_a = start_proxy(knobs.clone(), &master, &resolver_a, &log);
    let proxy_b = start_proxy(knobs.clone(), &master, &resolver_b, &log);

    let (request, reply) = CommitTransactionRequest::new(CommitTransaction {
        read_conflict_ranges: vec![KeyRange::new(&b"a"[..], &b"z"[..])],
        write_conflict_ranges: vec![KeyRange::new(&b"a"[..], &b"z"[..])],
        mutations: vec![
            Mutation::set(&b"k1"[..], vec![0u8; 200]),
            Mutation::set(&b"k2"[..], vec![0u8; 150]),
        ],
        read_snapshot: 700,
    });

    assert!(should_split(&request, 2, &knobs));
    let mut parts = split_transaction(&request, 2, &knobs);
    let part_b = parts.pop().unwrap();
    let part_a = parts.pop().unwrap();

    proxy_a.submit_commit(part_a).await.unwrap();
    proxy_b.submit_commit(part_b).await.unwrap();

    // Whichever proxy finishes first answers with the shared version.
    let commit_id = reply.await.unwrap().unwrap();
    assert_eq!(commit_id.version, 777);

    // Both proxies pushed under the same version.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let versions = log.recorded_versions();
        if versions.iter().filter(|v| **v == 777).count() == 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "pushes: {versions:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn mvcc_window_blocks_logging_order() {
    let knobs = {
        let mut knobs = Knobs::default();
        knobs.max_read_transaction_life_versions = 10;
        knobs.required_min_recovery_duration = 0.0;
        knobs
    };
    let master = ScriptedMaster::new(100, 100);
    let resolver = ScriptedResolver::new();
    let log = RecordingLogSystem::new();
    let proxy = start_proxy(knobs, &master, &resolver, &log);

    // First batch gets version 200; with nothing committed it must wait
    // for the MVCC window before pushing.
    let (first, first_reply) = simple_request(b"a", b"1");
    proxy.submit_commit(first).await.unwrap();
    let (mut second, second_reply) = simple_request(b"b", b"2");
    second.flags |= FLAG_FIRST_IN_BATCH;
    proxy.submit_commit(second).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Neither batch may push while the window is closed, so the second
    // batch cannot overtake the first.
    assert!(log.pushes.lock().unwrap().is_empty());

    master.set_committed(295);
    let first_id = first_reply.await.unwrap().unwrap();
    let second_id = second_reply.await.unwrap().unwrap();
    assert_eq!(first_id.version, 200);
    assert_eq!(second_id.version, 300);

    let mut versions = log.recorded_versions();
    versions.sort_unstable();
    assert_eq!(versions, vec![200, 300]);
}

#[tokio::test]
async fn metadata_mutations_update_routing_and_ride_the_txs_tag() {
    let master = ScriptedMaster::new(0, 5);
    let resolver = ScriptedResolver::new();
    let log = RecordingLogSystem::new();
    let proxy = start_proxy(Knobs::default(), &master, &resolver, &log);

    // Move shard [m, ...) to tag (0, 9) via a key-servers mutation.
    let mut shard_key = b"\xff/keyServers/".to_vec();
    shard_key.extend_from_slice(b"m");
    let (request, reply) = CommitTransactionRequest::new(CommitTransaction {
        read_conflict_ranges: vec![],
        write_conflict_ranges: vec![KeyRange::single_key(&shard_key)],
        mutations: vec![Mutation::Set {
            key: Bytes::from(shard_key),
            value: braid_proxy::proxy::encode_tag_value(&[Tag::new(0, 9)]),
        }],
        read_snapshot: 0,
    });
    proxy.submit_commit(request).await.unwrap();
    reply.await.unwrap().unwrap();

    {
        let pushes = log.pushes.lock().unwrap();
        let records = parse_commit_blob(&pushes[0].messages).unwrap();
        // The metadata mutation itself, plus its txs-tag copy from the
        // state store's commit message.
        assert!(records.iter().any(|r| r.tags.contains(&TXS_TAG)));
    }

    // A later write past the moved boundary routes to the new tag.
    let (request, reply) = simple_request(b"zz", b"1");
    proxy.submit_commit(request).await.unwrap();
    reply.await.unwrap().unwrap();

    let pushes = log.pushes.lock().unwrap();
    let records = parse_commit_blob(&pushes.last().unwrap().messages).unwrap();
    let tags: Vec<_> = records
        .iter()
        .filter(|r| r.mutation().unwrap() == Mutation::set(&b"zz"[..], &b"1"[..]))
        .flat_map(|r| r.tags.clone())
        .collect();
    assert_eq!(tags, vec![Tag::new(0, 9)]);
}

#[tokio::test]
async fn backup_ranges_produce_framed_backup_mutations() {
    let master = ScriptedMaster::new(0, 5);
    let resolver = ScriptedResolver::new();
    let log = RecordingLogSystem::new();
    let proxy = start_proxy(Knobs::default(), &master, &resolver, &log);

    // Configure a backup destination for all of the normal keyspace.
    let dest = Bytes::from_static(b"\xff\x02/blog/dest1/");
    let mut backup_key = b"\xff/backupRanges/".to_vec();
    backup_key.extend_from_slice(b"");
    let (request, reply) = CommitTransactionRequest::new(CommitTransaction {
        mutations: vec![Mutation::Set {
            key: Bytes::from(backup_key),
            value: braid_proxy::proxy::encode_backup_destinations(&[dest.clone()]),
        }],
        ..CommitTransaction::default()
    });
    proxy.submit_commit(request).await.unwrap();
    reply.await.unwrap().unwrap();

    let (request, reply) = simple_request(b"user", b"payload");
    proxy.submit_commit(request).await.unwrap();
    let commit_id = reply.await.unwrap().unwrap();

    let pushes = log.pushes.lock().unwrap();
    let records = parse_commit_blob(&pushes.last().unwrap().messages).unwrap();
    let backup_record = records
        .iter()
        .find_map(|r| match r.mutation().unwrap() {
            Mutation::Set { key, value } if key.starts_with(&dest) => Some((key, value)),
            _ => None,
        })
        .expect("backup mutation present");

    // Framing: dest || u8 version-hash || BE commit version || BE part.
    let (key, value) = backup_record;
    let tail = &key[dest.len()..];
    assert_eq!(tail.len(), 1 + 8 + 4);
    let version_be = u64::from_be_bytes(tail[1..9].try_into().unwrap());
    assert_eq!(version_be as i64, commit_id.version);
    assert_eq!(&tail[9..], &0u32.to_be_bytes());

    // The chunk payload decodes back to the original mutation.
    let mut offset = 0;
    let decoded = Mutation::decode(&value, &mut offset).unwrap();
    assert_eq!(decoded, Mutation::set(&b"user"[..], &b"payload"[..]));
}

#[tokio::test]
async fn locked_database_rejects_unaware_transactions() {
    let master = ScriptedMaster::new(0, 5);
    let resolver = ScriptedResolver::new();
    let log = RecordingLogSystem::new();
    let proxy = start_proxy(Knobs::default(), &master, &resolver, &log);

    // Lock the database through a metadata mutation.
    let (request, reply) = CommitTransactionRequest::new(CommitTransaction {
        mutations: vec![Mutation::set(&b"\xff/dbLocked"[..], &b"1"[..])],
        ..CommitTransaction::default()
    });
    proxy.submit_commit(request).await.unwrap();
    reply.await.unwrap().unwrap();

    let (request, reply) = simple_request(b"k", b"v");
    proxy.submit_commit(request).await.unwrap();
    assert_eq!(
        reply.await.unwrap().unwrap_err(),
        braid_core::Error::NotCommitted
    );

    // Lock-aware transactions still commit.
    let (mut request, reply) = simple_request(b"k", b"v");
    request.flags |= braid_core::interfaces::FLAG_LOCK_AWARE;
    proxy.submit_commit(request).await.unwrap();
    assert!(reply.await.unwrap().is_ok());
}
