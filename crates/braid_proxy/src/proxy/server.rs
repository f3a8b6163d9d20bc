//! Wiring of one commit proxy: request intake, the batcher, concurrent
//! batch pipelines, and the GRV starter.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use braid_core::error::{Error, Result};
use braid_core::interfaces::{
    CommitTransactionRequest, GetReadVersionRequest, LogSystem, Master, Resolver,
};
use braid_core::knobs::Knobs;
use braid_core::types::Tag;

use super::batcher::{commit_batcher, CommitBatch};
use super::grv::{last_commit_updater, transaction_starter, RateUpdate};
use super::pipeline::commit_batch;
use super::state::ProxyCommitData;

/// A running commit proxy. Requests go in through the channel handles;
/// dropping the proxy stops its workers.
pub struct CommitProxy {
    commit_data: Arc<ProxyCommitData>,
    commit_tx: mpsc::Sender<CommitTransactionRequest>,
    grv_tx: mpsc::Sender<GetReadVersionRequest>,
    rate_tx: mpsc::Sender<RateUpdate>,
    workers: Vec<JoinHandle<()>>,
}

impl CommitProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        knobs: Arc<Knobs>,
        master: Arc<dyn Master>,
        resolvers: Vec<Arc<dyn Resolver>>,
        log_system: Arc<dyn LogSystem>,
        num_proxies: usize,
        default_tags: Vec<Tag>,
    ) -> Self {
        let commit_data = ProxyCommitData::new(
            knobs,
            master,
            resolvers,
            log_system,
            num_proxies,
            default_tags,
        );

        let (commit_tx, commit_rx) = mpsc::channel(4096);
        let (batch_tx, batch_rx) = mpsc::channel::<CommitBatch>(64);
        let (grv_tx, grv_rx) = mpsc::channel(4096);
        let (rate_tx, rate_rx) = mpsc::channel(64);

        let workers = vec![
            tokio::spawn(commit_batcher(commit_data.clone(), commit_rx, batch_tx)),
            tokio::spawn(run_batches(commit_data.clone(), batch_rx)),
            tokio::spawn(transaction_starter(commit_data.clone(), grv_rx, rate_rx)),
            tokio::spawn(last_commit_updater(commit_data.clone())),
        ];
        info!(proxy = %commit_data.id, "commit proxy started");

        Self {
            commit_data,
            commit_tx,
            grv_tx,
            rate_tx,
            workers,
        }
    }

    pub fn commit_data(&self) -> &Arc<ProxyCommitData> {
        &self.commit_data
    }

    pub async fn submit_commit(&self, request: CommitTransactionRequest) -> Result<()> {
        self.commit_tx.send(request).await.map_err(Error::from)
    }

    pub async fn submit_read_version(&self, request: GetReadVersionRequest) -> Result<()> {
        self.grv_tx.send(request).await.map_err(Error::from)
    }

    /// Feed fresh ratekeeper limits into the GRV starter.
    pub async fn update_rates(&self, update: RateUpdate) -> Result<()> {
        self.rate_tx.send(update).await.map_err(Error::from)
    }
}

impl Drop for CommitProxy {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Spawn one pipeline per batch. Batches overlap freely; the phase-entry
/// counters inside the pipeline enforce the points that must serialize.
async fn run_batches(
    commit_data: Arc<ProxyCommitData>,
    mut batches: mpsc::Receiver<CommitBatch>,
) {
    while let Some((batch, mem_bytes)) = batches.recv().await {
        let commit_data = commit_data.clone();
        tokio::spawn(async move {
            if let Err(err) = commit_batch(commit_data.clone(), batch, mem_bytes).await {
                if err.is_recovery_fatal() {
                    error!(proxy = %commit_data.id, error = %err, "commit pipeline failed fatally");
                } else {
                    error!(proxy = %commit_data.id, error = %err, "commit batch failed");
                }
            }
        });
    }
}
