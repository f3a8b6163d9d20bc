//! Read-version admission and dispatch behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use braid_core::error::Error;
use braid_core::interfaces::{GetReadVersionRequest, GRV_FLAG_CAUSAL_READ_RISKY};
use braid_core::knobs::Knobs;
use braid_core::types::{Tag, TransactionPriority};
use braid_proxy::proxy::{CommitProxy, RateUpdate};

use common::{RecordingLogSystem, ScriptedMaster, ScriptedResolver};

fn start_proxy(knobs: Knobs, master: &Arc<ScriptedMaster>) -> CommitProxy {
    CommitProxy::start(
        Arc::new(knobs),
        master.clone(),
        vec![ScriptedResolver::new()],
        RecordingLogSystem::new(),
        1,
        vec![Tag::new(0, 1)],
    )
}

fn rates(normal: f64, batch: f64) -> RateUpdate {
    RateUpdate {
        transaction_rate: normal,
        batch_transaction_rate: batch,
        throttled_tags: None,
    }
}

#[tokio::test]
async fn grv_returns_the_live_committed_version() {
    let master = ScriptedMaster::new(0, 5);
    master.set_committed(42);
    let proxy = start_proxy(Knobs::default(), &master);
    proxy.update_rates(rates(1000.0, 1000.0)).await.unwrap();

    let (request, reply) = GetReadVersionRequest::new(TransactionPriority::Default, 1);
    proxy.submit_read_version(request).await.unwrap();

    let reply = reply.await.unwrap().unwrap();
    assert_eq!(reply.version, 42);
    assert!(!reply.locked);
}

#[tokio::test]
async fn causal_read_risky_skips_epoch_confirmation() {
    let master = ScriptedMaster::new(0, 5);
    master.set_committed(7);
    let mut knobs = Knobs::default();
    knobs.required_min_recovery_duration = 0.0;
    let proxy = start_proxy(knobs, &master);
    proxy.update_rates(rates(1000.0, 1000.0)).await.unwrap();

    let (mut request, reply) = GetReadVersionRequest::new(TransactionPriority::Default, 1);
    request.flags |= GRV_FLAG_CAUSAL_READ_RISKY;
    proxy.submit_read_version(request).await.unwrap();
    assert_eq!(reply.await.unwrap().unwrap().version, 7);
}

#[tokio::test]
async fn saturated_queue_gets_a_degraded_sentinel_reply() {
    let master = ScriptedMaster::new(0, 5);
    master.set_committed(99);
    let mut knobs = Knobs::default();
    knobs.start_transaction_max_queue_size = 0;
    let proxy = start_proxy(knobs, &master);

    let (request, reply) = GetReadVersionRequest::new(TransactionPriority::Default, 1);
    proxy.submit_read_version(request).await.unwrap();

    // Version 1 + locked keeps old clients retrying instead of erroring.
    let reply = reply.await.unwrap().unwrap();
    assert_eq!(reply.version, 1);
    assert!(reply.locked);
}

#[tokio::test]
async fn batch_priority_throttles_when_rate_is_floor() {
    let master = ScriptedMaster::new(0, 5);
    let proxy = start_proxy(Knobs::default(), &master);

    // No rate update yet: the batch rate is zero, below 1/num_proxies.
    let (request, reply) = GetReadVersionRequest::new(TransactionPriority::Batch, 1);
    proxy.submit_read_version(request).await.unwrap();
    assert_eq!(
        reply.await.unwrap().unwrap_err(),
        Error::BatchTransactionThrottled
    );
}

#[tokio::test]
async fn priorities_drain_system_first() {
    let master = ScriptedMaster::new(0, 5);
    master.set_committed(10);
    let proxy = start_proxy(Knobs::default(), &master);
    proxy.update_rates(rates(1000.0, 1000.0)).await.unwrap();
    // Let the starter absorb the rates before the batch request arrives,
    // or it would be rejected at the zero-rate floor.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut replies = Vec::new();
    for priority in [
        TransactionPriority::Batch,
        TransactionPriority::Default,
        TransactionPriority::Immediate,
    ] {
        let (request, reply) = GetReadVersionRequest::new(priority, 1);
        proxy.submit_read_version(request).await.unwrap();
        replies.push(reply);
    }

    // All three are served regardless of arrival order.
    for reply in replies {
        let reply = tokio::time::timeout(Duration::from_secs(5), reply)
            .await
            .expect("grv reply timed out")
            .unwrap()
            .unwrap();
        assert_eq!(reply.version, 10);
    }
}

#[tokio::test]
async fn throttled_tags_are_filtered_per_priority() {
    let master = ScriptedMaster::new(0, 5);
    master.set_committed(10);
    let proxy = start_proxy(Knobs::default(), &master);

    let tag = bytes::Bytes::from_static(b"hot-tag");
    let mut throttles = std::collections::HashMap::new();
    let mut default_throttles = std::collections::HashMap::new();
    default_throttles.insert(
        tag.clone(),
        braid_core::interfaces::ClientTagThrottleLimits {
            tps_rate: 50.0,
            expiration: braid_core::clock::now_seconds() + 60.0,
        },
    );
    throttles.insert(TransactionPriority::Default, default_throttles);
    proxy
        .update_rates(RateUpdate {
            transaction_rate: 1000.0,
            batch_transaction_rate: 1000.0,
            throttled_tags: Some(throttles),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (mut request, reply) = GetReadVersionRequest::new(TransactionPriority::Default, 1);
    request.tags = vec![(tag.clone(), 1)];
    proxy.submit_read_version(request).await.unwrap();
    let reply = reply.await.unwrap().unwrap();
    assert_eq!(reply.tag_throttle_info.len(), 1);
    assert!(reply.tag_throttle_info.contains_key(&tag));

    // The same tag at immediate priority carries no throttle.
    let (mut request, reply) = GetReadVersionRequest::new(TransactionPriority::Immediate, 1);
    request.tags = vec![(tag.clone(), 1)];
    proxy.submit_read_version(request).await.unwrap();
    let reply = reply.await.unwrap().unwrap();
    assert!(reply.tag_throttle_info.is_empty());
}
