//! Commit proxy module wiring.
//!
//! `state` holds the proxy-wide shared data and range maps, `batcher`
//! shapes the request stream, `split` partitions oversized transactions,
//! `resolution` builds per-resolver requests, `pipeline` drives the
//! five-phase commit path, `grv` serves read versions, and `server` wires
//! the workers together.

mod batcher;
mod grv;
mod pipeline;
mod resolution;
mod server;
mod split;
mod state;

pub use batcher::{commit_batcher, CommitBatch};
pub use grv::{
    get_live_committed_version, last_commit_updater, transaction_starter, RateUpdate,
    TransactionRateInfo,
};
pub use pipeline::commit_batch;
pub use resolution::ResolutionRequestBuilder;
pub use server::CommitProxy;
pub use split::{should_split, split_transaction};
pub use state::{
    decode_backup_destinations, decode_tag_value, encode_backup_destinations, encode_tag_value,
    KeyInfoMap, KeyResolverMap, ProxyCommitData, ProxyStats, StoreCommit, TxnStateStore,
};
