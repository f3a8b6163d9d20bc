//! Building per-resolver conflict resolution requests.
//!
//! Each transaction's conflict ranges are mirrored only to the resolvers
//! whose key ranges they overlap (consulting the time-layered resolver
//! map), versionstamped mutations are patched before the resolvers see
//! them, and metadata mutations additionally ride along to resolver 0 as
//! transaction-state mutations.

use braid_core::error::Result;
use braid_core::interfaces::{
    CommitTransactionRequest, ResolveBatchRequest, ResolveTransaction,
};
use braid_core::mutation::{patch_versionstamp, Mutation};
use braid_core::types::{is_metadata_key, KeyRange, SplitTransaction, Version};

use super::state::ProxyCommitData;

pub struct ResolutionRequestBuilder<'a> {
    commit_data: &'a ProxyCommitData,
    version: Version,
    pub requests: Vec<ResolveBatchRequest>,
    /// For each transaction, the resolvers it was sent to.
    pub transaction_resolver_map: Vec<Vec<usize>>,
    /// `[txn][resolver] -> original read-conflict-range indices`, used to
    /// map reported conflicts back to the client's numbering.
    pub tx_read_conflict_range_index_map: Vec<Vec<Vec<usize>>>,
}

impl<'a> ResolutionRequestBuilder<'a> {
    pub fn new(
        commit_data: &'a ProxyCommitData,
        version: Version,
        prev_version: Version,
        last_received_version: Version,
    ) -> Self {
        let requests = (0..commit_data.resolvers.len())
            .map(|_| ResolveBatchRequest {
                prev_version,
                version,
                last_received_version,
                transactions: Vec::new(),
                txn_state_transactions: Vec::new(),
                split_transaction: None,
            })
            .collect();
        Self {
            commit_data,
            version,
            requests,
            transaction_resolver_map: Vec::new(),
            tx_read_conflict_range_index_map: Vec::new(),
        }
    }

    pub fn set_split_transaction(&mut self, split: SplitTransaction) {
        for request in &mut self.requests {
            request.split_transaction = Some(split);
        }
    }

    fn out_transaction(
        slots: &mut [Option<usize>],
        requests: &mut [ResolveBatchRequest],
        resolver: usize,
        read_snapshot: Version,
    ) -> usize {
        if let Some(index) = slots[resolver] {
            return index;
        }
        let request = &mut requests[resolver];
        request.transactions.push(ResolveTransaction {
            read_snapshot,
            ..ResolveTransaction::default()
        });
        let index = request.transactions.len() - 1;
        slots[resolver] = Some(index);
        index
    }

    /// Add one transaction, patching versionstamps in place.
    pub fn add_transaction(
        &mut self,
        tr: &mut CommitTransactionRequest,
        batch_index: u16,
    ) -> Result<()> {
        let num_resolvers = self.requests.len();
        let mut slots: Vec<Option<usize>> = vec![None; num_resolvers];
        let read_snapshot = tr.transaction.read_snapshot;

        // Versionstamp patching happens before resolution so the conflict
        // ranges the resolvers see already contain the final keys.
        let mut is_state_transaction = false;
        for i in 0..tr.transaction.mutations.len() {
            let original = tr.transaction.mutations[i].clone();
            let add_write_range = matches!(&original, Mutation::SetVersionstampedKey { .. });
            let patched = patch_versionstamp(&original, self.version, batch_index)
                .map_err(|_| braid_core::error::Error::Internal("bad versionstamp offset"))?;
            if add_write_range {
                tr.transaction
                    .write_conflict_ranges
                    .push(KeyRange::single_key(patched.param1()));
            }
            tr.transaction.mutations[i] = patched;

            let mutation = &tr.transaction.mutations[i];
            if is_metadata_key(mutation.param1()) {
                is_state_transaction = true;
                let index =
                    Self::out_transaction(&mut slots, &mut self.requests, 0, read_snapshot);
                self.requests[0].transactions[index]
                    .mutations
                    .push(mutation.clone());
            }
        }

        let mut conflict_index_map: Vec<Vec<usize>> = vec![Vec::new(); num_resolvers];
        {
            let key_resolvers = self
                .commit_data
                .key_resolvers
                .lock()
                .expect("key resolvers poisoned");

            for (range_index, range) in tr.transaction.read_conflict_ranges.iter().enumerate() {
                let resolvers = key_resolvers.resolvers_for_read(range, read_snapshot);
                assert!(!resolvers.is_empty());
                for resolver in resolvers {
                    let index = Self::out_transaction(
                        &mut slots,
                        &mut self.requests,
                        resolver,
                        read_snapshot,
                    );
                    self.requests[resolver].transactions[index]
                        .read_conflict_ranges
                        .push(range.clone());
                    conflict_index_map[resolver].push(range_index);
                }
            }

            for range in &tr.transaction.write_conflict_ranges {
                let resolvers = key_resolvers.resolvers_for_write(range);
                assert!(!resolvers.is_empty());
                for resolver in resolvers {
                    let index = Self::out_transaction(
                        &mut slots,
                        &mut self.requests,
                        resolver,
                        read_snapshot,
                    );
                    self.requests[resolver].transactions[index]
                        .write_conflict_ranges
                        .push(range.clone());
                }
            }
        }

        if is_state_transaction {
            // Every resolver tracks the state transaction so their
            // state-mutation streams stay aligned.
            for resolver in 0..num_resolvers {
                let index =
                    Self::out_transaction(&mut slots, &mut self.requests, resolver, read_snapshot);
                self.requests[resolver].txn_state_transactions.push(index);
            }
        }

        let mut resolvers_used = Vec::new();
        for (resolver, slot) in slots.iter().enumerate() {
            if let Some(index) = slot {
                resolvers_used.push(resolver);
                self.requests[resolver].transactions[*index].report_conflicting_keys =
                    tr.report_conflicting_keys;
            }
        }
        self.transaction_resolver_map.push(resolvers_used);
        self.tx_read_conflict_range_index_map.push(conflict_index_map);
        Ok(())
    }
}
