//! Shaping incoming commit requests into version-ordered batches.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::warn;

use braid_core::clock::now_seconds;
use braid_core::error::Error;
use braid_core::interfaces::CommitTransactionRequest;

use super::state::ProxyCommitData;

/// A closed batch and the memory bytes it is accounted for.
pub type CommitBatch = (Vec<CommitTransactionRequest>, i64);

/// Collect commit requests into batches, bounded by the dynamic commit
/// interval, a count cap, and a byte budget. Split-transaction parts are
/// never grouped with anything. Returns when the input stream closes.
pub async fn commit_batcher(
    commit_data: Arc<ProxyCommitData>,
    mut requests: mpsc::Receiver<CommitTransactionRequest>,
    out: mpsc::Sender<CommitBatch>,
) {
    let knobs = commit_data.knobs.clone();
    let mut last_batch = 0.0f64;

    'outer: loop {
        let mut batch: Vec<CommitTransactionRequest> = Vec::new();
        let mut batch_bytes = 0i64;

        let mut deadline = if knobs.max_commit_batch_interval <= 0.0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs_f64(knobs.max_commit_batch_interval))
        };

        loop {
            if batch.len() >= knobs.commit_transaction_batch_count_max
                || batch_bytes >= knobs.commit_transaction_batch_bytes_max
            {
                break;
            }

            let request = tokio::select! {
                request = requests.recv() => request,
                _ = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => break,
            };
            let Some(request) = request else {
                // Input closed: flush what we have and stop.
                if !batch.is_empty() {
                    let _ = out.send((batch, batch_bytes)).await;
                }
                break 'outer;
            };

            let bytes = request.bytes();
            let accounted = commit_data
                .commit_batches_mem_bytes
                .load(Ordering::Relaxed);
            if accounted + bytes > knobs.proxy_commit_mem_bytes_limit {
                commit_data
                    .stats
                    .txn_commit_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    accounted,
                    bytes, "commit batch memory threshold exceeded"
                );
                request
                    .reply
                    .send(Err(Error::ProxyMemoryLimitExceeded));
                continue;
            }

            if bytes > knobs.packet_warning {
                warn!(size = bytes, "large transaction");
            }
            commit_data
                .stats
                .txn_commit_in
                .fetch_add(1, Ordering::Relaxed);

            if batch.is_empty() {
                // The first request of a batch re-arms the timer from the
                // dynamic interval, shortened when we have been idle.
                let interval = *commit_data
                    .commit_batch_interval
                    .lock()
                    .expect("batch interval poisoned");
                let since_last = now_seconds() - last_batch;
                let wait = if since_last > interval {
                    knobs.commit_batch_interval_from_idle
                } else {
                    interval - since_last
                };
                deadline = Some(Instant::now() + Duration::from_secs_f64(wait));
            }

            if (batch_bytes + bytes > knobs.transaction_size_limit || request.first_in_batch())
                && !batch.is_empty()
            {
                let _ = out.send((std::mem::take(&mut batch), batch_bytes)).await;
                last_batch = now_seconds();
                batch_bytes = 0;
                let interval = *commit_data
                    .commit_batch_interval
                    .lock()
                    .expect("batch interval poisoned");
                deadline = Some(Instant::now() + Duration::from_secs_f64(interval));
            }

            if request.split_transaction.is_some() {
                // A split part already implies a proxy-wide fanout; it is
                // committed alone so the master can give every part the
                // same version.
                commit_data
                    .commit_batches_mem_bytes
                    .fetch_add(bytes, Ordering::Relaxed);
                let _ = out.send((vec![request], bytes)).await;
                last_batch = now_seconds();
                batch.clear();
                batch_bytes = 0;
                let interval = *commit_data
                    .commit_batch_interval
                    .lock()
                    .expect("batch interval poisoned");
                deadline = Some(Instant::now() + Duration::from_secs_f64(interval));
            } else {
                commit_data
                    .commit_batches_mem_bytes
                    .fetch_add(bytes, Ordering::Relaxed);
                batch.push(request);
                batch_bytes += bytes;
            }
        }

        let _ = out.send((batch, batch_bytes)).await;
        last_batch = now_seconds();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::state::tests_support::test_proxy_with_resolvers;
    use braid_core::interfaces::{CommitTransaction, FLAG_FIRST_IN_BATCH};
    use braid_core::mutation::Mutation;
    use braid_core::types::SplitTransaction;
    use uuid::Uuid;

    fn request(value_bytes: usize) -> CommitTransactionRequest {
        CommitTransactionRequest::new(CommitTransaction {
            mutations: vec![Mutation::set(&b"k"[..], vec![0u8; value_bytes])],
            ..CommitTransaction::default()
        })
        .0
    }

    #[tokio::test]
    async fn batches_close_on_interval() {
        let data = test_proxy_with_resolvers(1);
        let (req_tx, req_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        tokio::spawn(commit_batcher(data.clone(), req_rx, out_tx));

        req_tx.send(request(10)).await.unwrap();
        req_tx.send(request(10)).await.unwrap();

        let (batch, bytes) = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(bytes > 0);
        assert_eq!(
            data.commit_batches_mem_bytes
                .load(std::sync::atomic::Ordering::Relaxed),
            bytes
        );
    }

    #[tokio::test]
    async fn first_in_batch_forces_a_boundary() {
        let data = test_proxy_with_resolvers(1);
        let (req_tx, req_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        tokio::spawn(commit_batcher(data, req_rx, out_tx));

        req_tx.send(request(10)).await.unwrap();
        let mut boundary = request(10);
        boundary.flags |= FLAG_FIRST_IN_BATCH;
        req_tx.send(boundary).await.unwrap();

        let (first, _) = out_rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        let (second, _) = out_rx.recv().await.unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn split_parts_ride_alone() {
        let data = test_proxy_with_resolvers(1);
        let (req_tx, req_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        tokio::spawn(commit_batcher(data, req_rx, out_tx));

        req_tx.send(request(10)).await.unwrap();
        let mut split = request(10);
        split.flags |= FLAG_FIRST_IN_BATCH;
        split.split_transaction = Some(SplitTransaction::new(Uuid::new_v4(), 3, 0));
        req_tx.send(split).await.unwrap();
        req_tx.send(request(10)).await.unwrap();

        let (first, _) = out_rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].split_transaction.is_none());

        let (second, _) = out_rx.recv().await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(second[0].split_transaction.is_some());

        let (third, _) = out_rx.recv().await.unwrap();
        assert_eq!(third.len(), 1);
        assert!(third[0].split_transaction.is_none());
    }

    #[tokio::test]
    async fn memory_limit_rejects_requests() {
        let data = test_proxy_with_resolvers(1);
        data.commit_batches_mem_bytes.store(
            data.knobs.proxy_commit_mem_bytes_limit,
            std::sync::atomic::Ordering::Relaxed,
        );
        let (req_tx, req_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        tokio::spawn(commit_batcher(data.clone(), req_rx, out_tx));

        let (req, mut reply_rx) = CommitTransactionRequest::new(CommitTransaction {
            mutations: vec![Mutation::set(&b"k"[..], &b"v"[..])],
            ..CommitTransaction::default()
        });
        req_tx.send(req).await.unwrap();

        // The request is rejected without ever forming a batch.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            reply_rx.try_recv().unwrap().unwrap_err(),
            Error::ProxyMemoryLimitExceeded
        );
        assert!(out_rx.try_recv().is_err());
    }
}
