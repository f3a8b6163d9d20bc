//! The five-phase commit batch pipeline.
//!
//! Phase 1 acquires a commit version (ordered), phase 2 fans out to the
//! resolvers, phase 3 applies metadata and builds the tagged log push
//! (ordered), phase 4 waits for the log system, and phase 5 answers the
//! clients. Batches overlap; only phase-1 and phase-3 entry serialize, on
//! the two notified batch counters.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::warn;

use braid_core::clock::now_seconds;
use braid_core::error::{Error, Result};
use braid_core::interfaces::{
    combine_outcomes, CommitId, CommitTransactionRequest, ConflictOutcome, ResolveBatchReply,
};
use braid_core::message::LogPushData;
use braid_core::mutation::Mutation;
use braid_core::types::{
    coordinators_key, database_locked_key, metadata_version_key, must_contain_system_mutations_key,
    non_metadata_system_keys, KeyRange, Version, CACHE_TAG, INVALID_VERSION, SYSTEM_KEY_PREFIX,
    TXS_TAG,
};

use super::grv;
use super::resolution::ResolutionRequestBuilder;
use super::state::{ProxyCommitData, StoreCommit};

pub struct CommitBatchContext {
    commit_data: Arc<ProxyCommitData>,
    trs: Vec<CommitTransactionRequest>,
    current_batch_mem_bytes: i64,
    mem_released: bool,

    start_time: f64,
    local_batch_number: i64,
    batch_operations: usize,
    batch_bytes: i64,
    latency_bucket: usize,

    commit_version: Version,
    prev_version: Version,

    to_commit: LogPushData,
    transaction_resolver_map: Vec<Vec<usize>>,
    tx_read_conflict_range_index_map: Vec<Vec<Vec<usize>>>,
    resolution: Vec<ResolveBatchReply>,
    release_handle: Option<JoinHandle<()>>,

    is_my_first_batch: bool,
    first_state_mutations: bool,
    old_coordinators: Option<Bytes>,
    store_commits: Vec<StoreCommit>,

    committed: Vec<ConflictOutcome>,
    locked: bool,
    locked_after: bool,
    metadata_version_after: Option<Bytes>,
    commit_count: usize,
    mutation_count: u64,
    mutation_bytes: u64,

    log_range_mutations: Vec<(Bytes, Vec<Mutation>)>,

    logging_handle: Option<JoinHandle<Result<Version>>>,
    commit_start_time: f64,
    pop_to: Version,

    compute_start: f64,
    compute_duration: f64,
}

/// Run one batch through all five phases. On a fatal error every
/// transaction still holding its reply gets the error, and the batch's
/// memory accounting is released.
pub async fn commit_batch(
    commit_data: Arc<ProxyCommitData>,
    trs: Vec<CommitTransactionRequest>,
    current_batch_mem_bytes: i64,
) -> Result<()> {
    let mut context = CommitBatchContext::new(commit_data, trs, current_batch_mem_bytes);
    let result = context.run().await;
    if let Err(err) = &result {
        context.fail_outstanding(err.clone());
    }
    context.release_memory();
    result
}

impl CommitBatchContext {
    fn new(
        commit_data: Arc<ProxyCommitData>,
        trs: Vec<CommitTransactionRequest>,
        current_batch_mem_bytes: i64,
    ) -> Self {
        let knobs = &commit_data.knobs;
        let mut batch_operations = 0usize;
        let mut batch_bytes = 0i64;
        for tr in &trs {
            batch_operations += tr.transaction.mutations.len();
            batch_bytes += tr.transaction.expected_size();
        }

        let mut latency_bucket = 0usize;
        if batch_operations != 0 {
            let per_op_limit = knobs.value_size_limit + knobs.key_size_limit;
            latency_bucket = (knobs.proxy_compute_buckets as i64 * batch_bytes
                / (batch_operations as i64 * per_op_limit))
                .min(knobs.proxy_compute_buckets as i64 - 1)
                .max(0) as usize;
        }
        assert!(knobs.max_read_transaction_life_versions <= knobs.max_versions_in_flight);

        let local_batch_number = commit_data.local_batch_number.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            trs,
            current_batch_mem_bytes,
            mem_released: false,
            start_time: now_seconds(),
            local_batch_number,
            batch_operations,
            batch_bytes,
            latency_bucket,
            commit_version: INVALID_VERSION,
            prev_version: INVALID_VERSION,
            to_commit: LogPushData::new(),
            transaction_resolver_map: Vec::new(),
            tx_read_conflict_range_index_map: Vec::new(),
            resolution: Vec::new(),
            release_handle: None,
            is_my_first_batch: false,
            first_state_mutations: false,
            old_coordinators: None,
            store_commits: Vec::new(),
            committed: Vec::new(),
            locked: false,
            locked_after: false,
            metadata_version_after: None,
            commit_count: 0,
            mutation_count: 0,
            mutation_bytes: 0,
            log_range_mutations: Vec::new(),
            logging_handle: None,
            commit_start_time: 0.0,
            pop_to: 0,
            compute_start: 0.0,
            compute_duration: 0.0,
            commit_data,
        }
    }

    async fn run(&mut self) -> Result<()> {
        self.commit_data
            .stats
            .commit_batch_in
            .fetch_add(1, Ordering::Relaxed);
        self.pre_resolution().await?;
        self.resolve().await?;
        self.post_resolution().await?;
        self.logging().await?;
        self.reply().await
    }

    fn fail_outstanding(&self, err: Error) {
        for tr in &self.trs {
            if !tr.reply.is_sent() {
                tr.reply.send(Err(err.clone()));
            }
        }
    }

    fn release_memory(&mut self) {
        if !self.mem_released {
            self.mem_released = true;
            self.commit_data
                .commit_batches_mem_bytes
                .fetch_sub(self.current_batch_mem_bytes, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------------
    // Phase 1

    async fn pre_resolution(&mut self) -> Result<()> {
        let commit_data = &self.commit_data;
        commit_data
            .latest_local_batch_resolving
            .when_at_least(self.local_batch_number - 1)
            .await;

        // Later batches may start resolving once this one's compute
        // estimate has elapsed; the release task enforces just that gap.
        let per_op = commit_data
            .commit_compute_per_operation
            .lock()
            .expect("compute table poisoned")[self.latency_bucket];
        let release_delay = (self.batch_operations as f64 * per_op)
            .min(commit_data.knobs.max_proxy_compute);
        {
            let commit_data = commit_data.clone();
            let number = self.local_batch_number;
            self.release_handle = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(release_delay)).await;
                commit_data.latest_local_batch_resolving.set_at_least(number);
            }));
        }

        let split_id = match self.trs.as_slice() {
            [only] => only.split_transaction.map(|s| s.id),
            _ => None,
        };

        let request_num = commit_data
            .commit_version_request_number
            .fetch_add(1, Ordering::SeqCst);
        let reply = commit_data
            .master
            .get_commit_version(
                request_num,
                commit_data
                    .most_recent_processed_request_number
                    .load(Ordering::SeqCst),
                commit_data.id,
                split_id,
            )
            .await?;

        commit_data
            .most_recent_processed_request_number
            .store(reply.request_num, Ordering::SeqCst);
        self.commit_version = reply.version;
        self.prev_version = reply.prev_version;

        if !reply.resolver_changes.is_empty() {
            commit_data
                .key_resolvers
                .lock()
                .expect("key resolvers poisoned")
                .apply_changes(&reply.resolver_changes, reply.resolver_changes_version);
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Phase 2

    async fn resolve(&mut self) -> Result<()> {
        let commit_data = self.commit_data.clone();
        let mut builder = ResolutionRequestBuilder::new(
            &commit_data,
            self.commit_version,
            self.prev_version,
            commit_data.version.load(Ordering::SeqCst),
        );

        if let [only] = self.trs.as_slice() {
            if let Some(split) = only.split_transaction {
                builder.set_split_transaction(split);
            }
        }

        let mut conflict_ranges = 0usize;
        for (index, tr) in self.trs.iter_mut().enumerate() {
            builder.add_transaction(tr, index as u16)?;
            conflict_ranges += tr.transaction.read_conflict_ranges.len()
                + tr.transaction.write_conflict_ranges.len();
        }
        commit_data
            .stats
            .conflict_ranges
            .fetch_add(conflict_ranges as u64, Ordering::Relaxed);

        for request in &builder.requests[1..] {
            assert_eq!(
                request.txn_state_transactions.len(),
                builder.requests[0].txn_state_transactions.len()
            );
        }

        self.transaction_resolver_map = std::mem::take(&mut builder.transaction_resolver_map);
        self.tx_read_conflict_range_index_map =
            std::mem::take(&mut builder.tx_read_conflict_range_index_map);
        let requests = std::mem::take(&mut builder.requests);
        drop(builder);

        let replies = futures_util::future::join_all(
            requests
                .into_iter()
                .zip(commit_data.resolvers.iter())
                .map(|(request, resolver)| resolver.resolve(request)),
        )
        .await;

        self.resolution = replies.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Phase 3

    async fn post_resolution(&mut self) -> Result<()> {
        let commit_data = self.commit_data.clone();
        commit_data
            .latest_local_batch_logging
            .when_at_least(self.local_batch_number - 1)
            .await;
        self.compute_start = now_seconds();

        self.is_my_first_batch = commit_data.version.load(Ordering::SeqCst) == 0;
        self.old_coordinators = commit_data.txn_state.read_value(&coordinators_key());

        self.assert_resolution_state_mutations_consistent();
        self.apply_metadata_effect();
        self.determine_committed();
        self.apply_metadata_to_committed_transactions().await?;
        self.assign_mutations_to_tags();
        self.add_backup_mutations();

        commit_data
            .stats
            .mutations
            .fetch_add(self.mutation_count, Ordering::Relaxed);
        commit_data
            .stats
            .mutation_bytes
            .fetch_add(self.mutation_bytes, Ordering::Relaxed);

        self.wait_for_mvcc_window().await;

        // Transaction-state writes from this batch ride the txs tag.
        if let Some(own_commit) = self.store_commits.last() {
            for mutation in own_commit.mutations.clone() {
                self.to_commit.add_tag(TXS_TAG);
                self.to_commit.add_typed_message(&mutation);
            }
        }

        self.commit_start_time = now_seconds();
        *commit_data
            .last_start_commit
            .lock()
            .expect("last start poisoned") = self.commit_start_time;

        let push = {
            let log_system = commit_data.log_system.clone();
            let prev_version = self.prev_version;
            let commit_version = self.commit_version;
            let committed = commit_data.committed_version.get();
            let min_kcv = commit_data
                .min_known_committed_version
                .load(Ordering::SeqCst);
            let messages = std::mem::take(&mut self.to_commit).into_bytes();
            tokio::spawn(async move {
                log_system
                    .push(prev_version, commit_version, committed, min_kcv, messages)
                    .await
            })
        };
        self.logging_handle = Some(push);

        commit_data
            .latest_local_batch_logging
            .set_at_least(self.local_batch_number);

        // Feed the compute estimate used to pace future batch releases.
        self.compute_duration += now_seconds() - self.compute_start;
        if self.compute_duration > commit_data.knobs.min_proxy_compute && self.batch_operations > 0
        {
            let per_op = self.compute_duration / self.batch_operations as f64;
            let mut table = commit_data
                .commit_compute_per_operation
                .lock()
                .expect("compute table poisoned");
            let current = table[self.latency_bucket];
            table[self.latency_bucket] = if per_op <= current {
                per_op
            } else {
                let growth = commit_data.knobs.proxy_compute_growth_rate;
                growth * per_op + (1.0 - growth) * current
            };
        }
        Ok(())
    }

    fn assert_resolution_state_mutations_consistent(&self) {
        for reply in &self.resolution[1..] {
            assert_eq!(
                reply.state_mutations.len(),
                self.resolution[0].state_mutations.len()
            );
            for (index, versions) in reply.state_mutations.iter().enumerate() {
                assert_eq!(
                    versions.len(),
                    self.resolution[0].state_mutations[index].len()
                );
            }
        }
    }

    /// Apply metadata committed by other proxies' recent batches. Their
    /// proxies durably log these, so the local commit messages are
    /// discarded.
    fn apply_metadata_effect(&mut self) {
        let mut initial_state = self.is_my_first_batch;
        self.first_state_mutations = self.is_my_first_batch;

        for version_index in 0..self.resolution[0].state_mutations.len() {
            for txn_index in 0..self.resolution[0].state_mutations[version_index].len() {
                let committed = self
                    .resolution
                    .iter()
                    .all(|reply| reply.state_mutations[version_index][txn_index].committed);
                let state_txn = &self.resolution[0].state_mutations[version_index][txn_index];
                if committed {
                    self.commit_data.apply_metadata_mutations(&state_txn.mutations);
                }
                if !state_txn.mutations.is_empty() && self.first_state_mutations {
                    assert!(committed);
                    self.first_state_mutations = false;
                }
            }

            self.store_commits
                .push(self.commit_data.txn_state.commit_message());

            if initial_state {
                initial_state = false;
                self.commit_data.txn_state.resync_log();
                for commit in &mut self.store_commits {
                    commit.acknowledge();
                }
                self.store_commits.clear();
            }
        }
    }

    /// A transaction commits only if every resolver it was sent to agreed.
    fn determine_committed(&mut self) {
        let mut next_tr = vec![0usize; self.resolution.len()];
        self.committed.clear();
        for resolvers in &self.transaction_resolver_map {
            let outcome = combine_outcomes(resolvers.iter().map(|&r| {
                let index = next_tr[r];
                next_tr[r] += 1;
                self.resolution[r].committed[index]
            }));
            self.committed.push(outcome);
        }
        for (r, reply) in self.resolution.iter().enumerate() {
            assert_eq!(next_tr[r], reply.committed.len());
        }

        self.locked = self
            .commit_data
            .txn_state
            .read_value(&database_locked_key())
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        let must_contain = self
            .commit_data
            .txn_state
            .read_value(&must_contain_system_mutations_key())
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if must_contain {
            let boundary = non_metadata_system_keys().end;
            for (t, tr) in self.trs.iter().enumerate() {
                if self.committed[t] != ConflictOutcome::Committed {
                    continue;
                }
                let found_system = tr.transaction.mutations.iter().any(|m| {
                    let key = if m.is_single_key() { m.param1() } else { m.param2() };
                    key.as_ref() >= boundary.as_ref()
                });
                if !found_system {
                    self.committed[t] = ConflictOutcome::Conflict;
                }
            }
        }
    }

    async fn apply_metadata_to_committed_transactions(&mut self) -> Result<()> {
        let commit_data = &self.commit_data;
        for (t, tr) in self.trs.iter().enumerate() {
            if self.committed[t] == ConflictOutcome::Committed
                && (!self.locked || tr.is_lock_aware())
            {
                self.commit_count += 1;
                commit_data.apply_metadata_mutations(&tr.transaction.mutations);
            }
            if self.first_state_mutations {
                assert_eq!(self.committed[t], ConflictOutcome::Committed);
                self.first_state_mutations = false;
            }
        }

        self.locked_after = commit_data
            .txn_state
            .read_value(&database_locked_key())
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        self.metadata_version_after = commit_data.txn_state.read_value(&metadata_version_key());

        self.store_commits
            .push(commit_data.txn_state.commit_message());
        commit_data
            .version
            .store(self.commit_version, Ordering::SeqCst);
        commit_data.valid_state.store(true, Ordering::SeqCst);
        assert!(self.commit_version > 0);

        if !self.is_my_first_batch {
            let coordinators = commit_data.txn_state.read_value(&coordinators_key());
            if coordinators != self.old_coordinators {
                let value = coordinators.unwrap_or_default();
                return match commit_data.master.change_coordinators(value).await {
                    // The master contract is that a coordinator change
                    // never succeeds quietly; the proxy must restart.
                    Ok(()) => Err(Error::Internal("change_coordinators returned")),
                    Err(_) => Err(Error::CoordinatorsChanged),
                };
            }
        }
        Ok(())
    }

    /// Tag every committed mutation with the storage teams that must apply
    /// it, and stage backup copies for backed-up ranges.
    fn assign_mutations_to_tags(&mut self) {
        let commit_data = self.commit_data.clone();
        let key_info = commit_data.key_info.lock().expect("key info poisoned");
        let has_backup = key_info.has_backup_ranges();
        let metadata_version = metadata_version_key();
        let mut backup: HashMap<Bytes, Vec<Mutation>> = HashMap::new();

        for (t, tr) in self.trs.iter().enumerate() {
            if !(self.committed[t] == ConflictOutcome::Committed
                && (!self.locked || tr.is_lock_aware()))
            {
                continue;
            }

            for mutation in &tr.transaction.mutations {
                self.mutation_count += 1;
                self.mutation_bytes += mutation.expected_size() as u64;

                if mutation.is_single_key() {
                    let key = mutation.param1();
                    self.to_commit.add_tags(key_info.tags_for_key(key));
                    if key_info.is_cached(key) {
                        self.to_commit.add_tag(CACHE_TAG);
                    }
                    self.to_commit.add_typed_message(mutation);
                } else {
                    let range = KeyRange::new(
                        mutation.param1().clone(),
                        mutation.param2().clone(),
                    );
                    let slices = key_info.intersecting_tags(&range);
                    if slices.len() == 1 {
                        // Fast path: the clear stays within one shard.
                        self.to_commit.add_tags(slices[0].1.iter().copied());
                    } else {
                        for (_, tags) in &slices {
                            self.to_commit.add_tags(tags.iter().copied());
                        }
                    }
                    if key_info.range_touches_cache(&range) {
                        self.to_commit.add_tag(CACHE_TAG);
                    }
                    self.to_commit.add_typed_message(mutation);
                }

                if !has_backup {
                    continue;
                }
                let key = mutation.param1();
                let in_backup_space = (!key.is_empty() && key[0] != SYSTEM_KEY_PREFIX)
                    || key.as_ref() == metadata_version.as_ref();
                if !in_backup_space {
                    continue;
                }

                if mutation.is_single_key() {
                    for dest in key_info.backup_destinations(key) {
                        push_backup(&mut backup, dest, mutation.clone());
                    }
                } else {
                    let range = KeyRange::new(
                        mutation.param1().clone(),
                        mutation.param2().clone(),
                    );
                    for (slice, dests) in key_info.intersecting_backup_ranges(&range) {
                        let sliced = Mutation::ClearRange {
                            begin: slice.begin.clone(),
                            end: slice.end.clone(),
                        };
                        for dest in dests {
                            push_backup(&mut backup, dest, sliced.clone());
                        }
                    }
                }
            }
        }
        drop(key_info);

        let mut ordered: Vec<(Bytes, Vec<Mutation>)> = backup.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        self.log_range_mutations = ordered;
    }

    /// Serialize staged backup mutations into framed backup keys, chunked
    /// and routed like any other mutation.
    fn add_backup_mutations(&mut self) {
        if self.log_range_mutations.is_empty() {
            return;
        }
        let knobs = &self.commit_data.knobs;
        let block_version = (self.commit_version / knobs.log_range_block_size) as u32;
        let version_hash =
            (braid_core::codec::hash_little(&block_version.to_le_bytes(), 0) & 0xff) as u8;

        let log_range_mutations = std::mem::take(&mut self.log_range_mutations);
        let key_info = self.commit_data.key_info.lock().expect("key info poisoned");
        for (destination, mutations) in &log_range_mutations {
            let mut value = Vec::new();
            for mutation in mutations {
                mutation.encode_to(&mut value);
            }

            for (part, chunk) in value.chunks(knobs.mutation_block_size).enumerate() {
                let mut key = Vec::with_capacity(destination.len() + 1 + 8 + 4);
                key.extend_from_slice(destination);
                key.push(version_hash);
                key.extend_from_slice(&(self.commit_version as u64).to_be_bytes());
                key.extend_from_slice(&(part as u32).to_be_bytes());
                let key = Bytes::from(key);

                self.to_commit.add_tags(key_info.tags_for_key(&key));
                self.to_commit.add_typed_message(&Mutation::Set {
                    key,
                    value: Bytes::copy_from_slice(chunk),
                });
            }
        }
    }

    /// Storage servers must never make versions durable that could still
    /// roll back; cap how far commits may run ahead of the fully
    /// committed frontier.
    async fn wait_for_mvcc_window(&mut self) {
        let commit_data = &self.commit_data;
        let target = self.commit_version - commit_data.knobs.max_read_transaction_life_versions;
        if commit_data.committed_version.get() >= target {
            return;
        }

        self.compute_duration += now_seconds() - self.compute_start;
        while commit_data.committed_version.get() < target {
            tokio::select! {
                _ = commit_data.committed_version.when_at_least(target) => {}
                reply = grv::get_live_committed_version(commit_data, true) => {
                    if let Ok(reply) = reply {
                        if reply.version > commit_data.committed_version.get() {
                            commit_data.locked.store(reply.locked, Ordering::SeqCst);
                            *commit_data
                                .metadata_version
                                .lock()
                                .expect("metadata version poisoned") = reply.metadata_version;
                            commit_data.committed_version.set_at_least(reply.version);
                        }
                    }
                    if commit_data.committed_version.get() < target {
                        tokio::time::sleep(Duration::from_secs_f64(
                            commit_data.knobs.proxy_spin_delay,
                        ))
                        .await;
                    }
                }
            }
        }
        self.compute_start = now_seconds();
    }

    // -------------------------------------------------------------------
    // Phase 4

    async fn logging(&mut self) -> Result<()> {
        let commit_data = &self.commit_data;
        let handle = self.logging_handle.take().expect("push started in phase 3");

        tokio::select! {
            joined = handle => {
                match joined {
                    Ok(Ok(pop_to)) => {
                        let previous = commit_data
                            .min_known_committed_version
                            .load(Ordering::SeqCst);
                        commit_data
                            .min_known_committed_version
                            .store(previous.max(pop_to), Ordering::SeqCst);
                        self.pop_to = pop_to;
                    }
                    Ok(Err(Error::BrokenPromise)) => return Err(Error::MasterTlogFailed),
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(Error::OperationCancelled),
                }
            }
            _ = commit_data
                .committed_version
                .when_at_least(self.commit_version + 1) => {}
        }

        *commit_data
            .last_commit_latency
            .lock()
            .expect("latency poisoned") = now_seconds() - self.commit_start_time;
        commit_data
            .last_commit_time
            .set_at_least(self.commit_start_time);

        if self.pop_to > 0 {
            {
                let mut history = commit_data
                    .txs_pop_versions
                    .lock()
                    .expect("txs pop poisoned");
                let newest = history
                    .back()
                    .map(|(_, pop)| *pop)
                    .unwrap_or_else(|| commit_data.last_txs_pop.load(Ordering::SeqCst));
                if self.pop_to > newest {
                    if history.len() >= commit_data.knobs.max_txs_pop_version_history {
                        warn!("discarding txs pop history");
                        history.pop_front();
                    }
                    history.push_back((self.commit_version, self.pop_to));
                }
            }
            let _ = commit_data.log_system.pop_txs(self.pop_to, None).await;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Phase 5

    async fn reply(&mut self) -> Result<()> {
        let commit_data = &self.commit_data;

        for commit in &mut self.store_commits {
            commit.acknowledge();
        }
        self.store_commits.clear();

        // Report before advancing: the master's committed version must
        // never trail what clients learn, or a GRV could run backwards.
        if self.commit_version > commit_data.committed_version.get() {
            commit_data
                .master
                .report_live_committed_version(
                    self.commit_version,
                    self.locked_after,
                    self.metadata_version_after.clone(),
                )
                .await?;
        }
        if self.commit_version > commit_data.committed_version.get() {
            commit_data
                .locked
                .store(self.locked_after, Ordering::SeqCst);
            *commit_data
                .metadata_version
                .lock()
                .expect("metadata version poisoned") = self.metadata_version_after.clone();
            commit_data.committed_version.set_at_least(self.commit_version);
        }

        let mut next_tr = vec![0usize; self.resolution.len()];
        for (t, tr) in self.trs.iter().enumerate() {
            if self.committed[t] == ConflictOutcome::Committed
                && (!self.locked || tr.is_lock_aware())
            {
                tr.reply.send(Ok(CommitId {
                    version: self.commit_version,
                    batch_index: t as u16,
                    metadata_version: self.metadata_version_after.clone(),
                    conflicting_key_ranges: None,
                }));

                if let (Some(cost), Some(tags)) = (&tr.commit_cost_estimation, &tr.tag_set) {
                    let mut totals = commit_data
                        .transaction_tag_commit_cost
                        .lock()
                        .expect("commit cost poisoned");
                    for tag in tags {
                        *totals.entry(tag.clone()).or_default() += *cost;
                    }
                }
            } else if self.committed[t] == ConflictOutcome::TooOld {
                tr.reply.send(Err(Error::TransactionTooOld));
            } else if tr.report_conflicting_keys {
                let mut conflicting = Vec::new();
                for &r in &self.transaction_resolver_map[t] {
                    if let Some(indices) =
                        self.resolution[r].conflicting_key_range_map.get(&next_tr[r])
                    {
                        for &resolver_index in indices {
                            conflicting.push(
                                self.tx_read_conflict_range_index_map[t][r][resolver_index],
                            );
                        }
                    }
                }
                if conflicting.is_empty() {
                    tr.reply.send(Err(Error::NotCommitted));
                } else {
                    tr.reply.send(Ok(CommitId {
                        version: INVALID_VERSION,
                        batch_index: t as u16,
                        metadata_version: None,
                        conflicting_key_ranges: Some(conflicting),
                    }));
                }
            } else {
                tr.reply.send(Err(Error::NotCommitted));
            }

            for &r in &self.transaction_resolver_map[t] {
                next_tr[r] += 1;
            }
        }

        let stats = &commit_data.stats;
        stats.commit_batch_out.fetch_add(1, Ordering::Relaxed);
        stats
            .txn_commit_out
            .fetch_add(self.trs.len() as u64, Ordering::Relaxed);
        stats
            .txn_conflicts
            .fetch_add((self.trs.len() - self.commit_count) as u64, Ordering::Relaxed);

        // Periodically drop resolver history no write can still need.
        let now = now_seconds();
        let should_coalesce = {
            let mut last = commit_data
                .last_coalesce_time
                .lock()
                .expect("coalesce time poisoned");
            if now - *last > commit_data.knobs.resolver_coalesce_time {
                *last = now;
                true
            } else {
                false
            }
        };
        if should_coalesce {
            let oldest =
                self.prev_version - commit_data.knobs.max_write_transaction_life_versions;
            commit_data
                .key_resolvers
                .lock()
                .expect("key resolvers poisoned")
                .coalesce(oldest);
        }

        // Commit interval chases a fraction of observed end-to-end latency.
        {
            let knobs = &commit_data.knobs;
            let target =
                (now - self.start_time) * knobs.commit_batch_interval_latency_fraction;
            let alpha = knobs.commit_batch_interval_smoother_alpha;
            let mut interval = commit_data
                .commit_batch_interval
                .lock()
                .expect("batch interval poisoned");
            *interval = (target * alpha + *interval * (1.0 - alpha)).clamp(
                knobs.commit_batch_interval_min,
                knobs.commit_batch_interval_max,
            );
        }

        self.release_memory();
        if let Some(release) = self.release_handle.take() {
            let _ = release.await;
        }
        Ok(())
    }
}

fn push_backup(backup: &mut HashMap<Bytes, Vec<Mutation>>, dest: Bytes, mutation: Mutation) {
    backup.entry(dest).or_default().push(mutation);
}
