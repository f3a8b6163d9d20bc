//! Commit, peek, pop and split-merge behavior of a running log.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use braid_core::cursor::{PeekCursor, TeamPeekCursor};
use braid_core::error::Error;
use braid_core::interfaces::{TLogPeekRequest, TLogPeekService};
use braid_core::message::parse_peek_stream;
use braid_core::mutation::Mutation;
use braid_core::types::{SplitTransaction, Tag};

use common::{blob, commit_request, start_log, test_knobs};

fn team_tag() -> Tag {
    Tag::new(0, 1)
}

#[tokio::test]
async fn commit_then_peek_round_trip() {
    let log = start_log(test_knobs()).await;

    let durable = log
        .server
        .commit(commit_request(0, 105, blob(team_tag(), 1, 8)))
        .await
        .unwrap();
    assert_eq!(durable, 0);

    let reply = log
        .server
        .peek(TLogPeekRequest::new(0, team_tag()))
        .await
        .unwrap();
    assert_eq!(reply.end, 106);
    assert_eq!(reply.popped, None);

    let entries = parse_peek_stream(&reply.messages).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!((entries[0].version, entries[0].subsequence), (105, 1));
    assert_eq!(
        entries[0].mutation,
        Mutation::set(&b"key-0"[..], &b"vvvvvvvv"[..])
    );
}

#[tokio::test]
async fn duplicate_commit_does_not_double_append() {
    let log = start_log(test_knobs()).await;
    let req = commit_request(0, 5, blob(team_tag(), 2, 4));

    log.server.commit(req.clone()).await.unwrap();
    // Same prev/version again: accepted as a duplicate, nothing re-indexed.
    log.server.commit(req).await.unwrap();

    let reply = log
        .server
        .peek(TLogPeekRequest::new(0, team_tag()))
        .await
        .unwrap();
    assert_eq!(parse_peek_stream(&reply.messages).unwrap().len(), 2);
}

#[tokio::test]
async fn commits_wait_for_prev_version() {
    let log = start_log(test_knobs()).await;

    let server = log.server.clone();
    let out_of_order =
        tokio::spawn(
            async move { server.commit(commit_request(10, 20, blob(team_tag(), 1, 4))).await },
        );
    tokio::task::yield_now().await;
    assert!(!out_of_order.is_finished());

    log.server
        .commit(commit_request(0, 10, blob(team_tag(), 1, 4)))
        .await
        .unwrap();
    out_of_order.await.unwrap().unwrap();

    let reply = log
        .server
        .peek(TLogPeekRequest::new(0, team_tag()))
        .await
        .unwrap();
    let versions: Vec<_> = parse_peek_stream(&reply.messages)
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(versions, vec![10, 20]);
}

#[tokio::test]
async fn pop_is_clamped_and_reported() {
    let log = start_log(test_knobs()).await;
    log.server
        .commit(commit_request(0, 105, blob(team_tag(), 1, 4)))
        .await
        .unwrap();

    // Popping far past the accepted frontier clamps to it.
    log.server.pop(team_tag(), 10_000).await.unwrap();
    assert_eq!(log.server.popped_version(team_tag()).await, 105);

    let reply = log
        .server
        .peek(TLogPeekRequest::new(0, team_tag()))
        .await
        .unwrap();
    assert_eq!(reply.popped, Some(105));
    assert_eq!(reply.end, 105);
    assert!(reply.messages.is_empty());
}

#[tokio::test]
async fn peek_return_if_blocked() {
    let log = start_log(test_knobs()).await;
    log.server
        .commit(commit_request(0, 5, blob(team_tag(), 1, 4)))
        .await
        .unwrap();

    let mut req = TLogPeekRequest::new(100, team_tag());
    req.return_if_blocked = true;
    assert_eq!(
        log.server.peek(req).await.unwrap_err(),
        Error::EndOfStream
    );
}

#[tokio::test]
async fn split_parts_merge_into_one_commit() {
    let log = start_log(test_knobs()).await;
    let split_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for part in 0..3u16 {
        let mut req = commit_request(0, 777, blob(Tag::new(0, part), 1, 4));
        req.split_transaction = Some(SplitTransaction::new(split_id, 3, part));
        let server = log.server.clone();
        handles.push(tokio::spawn(async move { server.commit(req).await }));
        tokio::task::yield_now().await;
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(log.server.version.get(), 777);

    // Every part's messages were indexed under the one commit version.
    for part in 0..3u16 {
        let reply = log
            .server
            .peek(TLogPeekRequest::new(0, Tag::new(0, part)))
            .await
            .unwrap();
        let entries = parse_peek_stream(&reply.messages).unwrap();
        assert_eq!(entries.len(), 1, "part {part}");
        assert_eq!(entries[0].version, 777);
    }
}

#[tokio::test]
async fn split_version_mismatch_is_rejected() {
    let log = start_log(test_knobs()).await;
    let split_id = Uuid::new_v4();

    let mut first = commit_request(0, 777, blob(team_tag(), 1, 4));
    first.split_transaction = Some(SplitTransaction::new(split_id, 2, 0));
    let server = log.server.clone();
    let waiter = tokio::spawn(async move { server.commit(first).await });
    tokio::task::yield_now().await;

    let mut second = commit_request(0, 778, blob(team_tag(), 1, 4));
    second.split_transaction = Some(SplitTransaction::new(split_id, 2, 1));
    assert_eq!(
        log.server.commit(second).await.unwrap_err(),
        Error::Internal("split part mismatch")
    );

    waiter.abort();
}

#[tokio::test]
async fn locked_log_rejects_commits() {
    let log = start_log(test_knobs()).await;
    log.server
        .commit(commit_request(0, 10, blob(team_tag(), 1, 4)))
        .await
        .unwrap();

    let lock = log.server.lock().await.unwrap();
    assert_eq!(lock.end, 10);

    assert_eq!(
        log.server
            .commit(commit_request(10, 11, blob(team_tag(), 1, 4)))
            .await
            .unwrap_err(),
        Error::TlogStopped
    );
}

#[tokio::test]
async fn empty_commit_advances_version_only() {
    let log = start_log(test_knobs()).await;
    log.server
        .commit(commit_request(0, 7, Bytes::new()))
        .await
        .unwrap();
    assert_eq!(log.server.version.get(), 7);

    let reply = log
        .server
        .peek(TLogPeekRequest::new(0, team_tag()))
        .await
        .unwrap();
    assert_eq!(reply.end, 8);
    assert!(parse_peek_stream(&reply.messages).unwrap().is_empty());
}

#[tokio::test]
async fn team_cursor_follows_the_log() {
    let log = start_log(test_knobs()).await;
    for (prev, version) in [(0, 10), (10, 11), (11, 15)] {
        log.server
            .commit(commit_request(prev, version, blob(team_tag(), 2, 4)))
            .await
            .unwrap();
    }

    let peer: Arc<dyn TLogPeekService> = log.server.clone();
    let mut cursor = TeamPeekCursor::new(0, team_tag(), vec![peer]);

    let mut seen = Vec::new();
    while cursor.remote_more_available().await.unwrap() {
        while cursor.has_remaining() {
            let m = cursor.get().clone();
            seen.push((m.version, m.subsequence));
            cursor.next();
        }
        if cursor.last_version() >= 15 {
            break;
        }
    }
    assert_eq!(seen, vec![(10, 1), (10, 2), (11, 1), (11, 2), (15, 1), (15, 2)]);
}

#[tokio::test]
async fn disabled_pops_are_deferred_until_reenabled() {
    let log = start_log(test_knobs()).await;
    log.server
        .commit(commit_request(0, 50, blob(team_tag(), 1, 4)))
        .await
        .unwrap();

    let owner = Uuid::new_v4();
    log.server.disable_pop(owner).await.unwrap();
    // The held window rejects any further disable, the holder included.
    assert!(log.server.disable_pop(Uuid::new_v4()).await.is_err());
    assert!(log.server.disable_pop(owner).await.is_err());

    log.server.pop(team_tag(), 30).await.unwrap();
    assert_eq!(log.server.popped_version(team_tag()).await, 0);

    log.server.enable_pop(owner).await.unwrap();
    assert_eq!(log.server.popped_version(team_tag()).await, 30);
}

#[tokio::test]
async fn queuing_metrics_report_durable_known_committed() {
    let log = start_log(test_knobs()).await;
    log.server
        .commit(commit_request(0, 3, blob(team_tag(), 4, 64)))
        .await
        .unwrap();
    // The second commit's known committed version (3) becomes durable
    // with its queue commit; version 5 itself is not yet known committed.
    log.server
        .commit(commit_request(3, 5, blob(team_tag(), 1, 16)))
        .await
        .unwrap();

    let metrics = log.server.get_queuing_metrics().await;
    assert!(metrics.bytes_input > 0);
    assert!(metrics.bytes_durable <= metrics.bytes_input);
    assert_eq!(metrics.version, 3);
}
