//! Scripted master / resolver / log-system collaborators for proxy
//! integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use braid_core::error::{Error, Result};
use braid_core::interfaces::{
    ConflictOutcome, GetCommitVersionReply, GetReadVersionReply, LogSystem, Master,
    ResolveBatchReply, ResolveBatchRequest, Resolver, ResolverMove,
};
use braid_core::types::{Tag, Version};

/// Master that allocates versions in fixed steps and honors the
/// shared-version contract for split transactions.
pub struct ScriptedMaster {
    step: i64,
    state: Mutex<MasterState>,
    committed: AtomicI64,
    locked: AtomicBool,
    pub resolver_changes: Mutex<Vec<(ResolverMove, Version)>>,
}

struct MasterState {
    last_version: Version,
    split_versions: HashMap<Uuid, (Version, Version)>,
}

impl ScriptedMaster {
    pub fn new(start: Version, step: i64) -> Arc<Self> {
        Arc::new(Self {
            step,
            state: Mutex::new(MasterState {
                last_version: start,
                split_versions: HashMap::new(),
            }),
            committed: AtomicI64::new(0),
            locked: AtomicBool::new(false),
            resolver_changes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_committed(&self, version: Version) {
        self.committed.fetch_max(version, Ordering::SeqCst);
    }

    pub fn committed(&self) -> Version {
        self.committed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Master for ScriptedMaster {
    async fn get_commit_version(
        &self,
        request_num: u64,
        _most_recent_processed: u64,
        _proxy_id: Uuid,
        split_id: Option<Uuid>,
    ) -> Result<GetCommitVersionReply> {
        let mut state = self.state.lock().expect("master poisoned");
        if let Some(split_id) = split_id {
            if let Some(&(version, prev_version)) = state.split_versions.get(&split_id) {
                return Ok(GetCommitVersionReply {
                    version,
                    prev_version,
                    resolver_changes: Vec::new(),
                    resolver_changes_version: 0,
                    request_num,
                });
            }
        }

        let prev_version = state.last_version;
        let version = prev_version + self.step;
        state.last_version = version;
        if let Some(split_id) = split_id {
            state.split_versions.insert(split_id, (version, prev_version));
        }

        let changes = std::mem::take(&mut *self.resolver_changes.lock().expect("changes poisoned"));
        let (resolver_changes, resolver_changes_version) = match changes.last() {
            Some((_, at)) => (changes.iter().map(|(c, _)| c.clone()).collect(), *at),
            None => (Vec::new(), 0),
        };

        Ok(GetCommitVersionReply {
            version,
            prev_version,
            resolver_changes,
            resolver_changes_version,
            request_num,
        })
    }

    async fn get_live_committed_version(&self) -> Result<GetReadVersionReply> {
        Ok(GetReadVersionReply {
            version: self.committed.load(Ordering::SeqCst),
            locked: self.locked.load(Ordering::SeqCst),
            ..GetReadVersionReply::default()
        })
    }

    async fn report_live_committed_version(
        &self,
        version: Version,
        locked: bool,
        _metadata_version: Option<Bytes>,
    ) -> Result<()> {
        self.committed.fetch_max(version, Ordering::SeqCst);
        self.locked.store(locked, Ordering::SeqCst);
        Ok(())
    }

    async fn change_coordinators(&self, _new_value: Bytes) -> Result<()> {
        Err(Error::CoordinatorsChanged)
    }
}

/// Resolver that commits everything unless told otherwise.
pub struct ScriptedResolver {
    /// Outcome applied to every transaction of subsequent batches.
    pub outcome: Mutex<ConflictOutcome>,
    /// When reporting conflicts, blame the first read conflict range.
    pub report_first_range: AtomicBool,
    pub seen_batches: Mutex<Vec<ResolveBatchRequest>>,
}

impl ScriptedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(ConflictOutcome::Committed),
            report_first_range: AtomicBool::new(false),
            seen_batches: Mutex::new(Vec::new()),
        })
    }

    pub fn set_outcome(&self, outcome: ConflictOutcome) {
        *self.outcome.lock().expect("resolver poisoned") = outcome;
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(&self, req: ResolveBatchRequest) -> Result<ResolveBatchReply> {
        let outcome = *self.outcome.lock().expect("resolver poisoned");
        let mut reply = ResolveBatchReply {
            committed: vec![outcome; req.transactions.len()],
            state_mutations: Vec::new(),
            conflicting_key_range_map: HashMap::new(),
        };
        if outcome == ConflictOutcome::Conflict && self.report_first_range.load(Ordering::SeqCst) {
            for (index, txn) in req.transactions.iter().enumerate() {
                if txn.report_conflicting_keys && !txn.read_conflict_ranges.is_empty() {
                    reply.conflicting_key_range_map.insert(index, vec![0]);
                }
            }
        }
        self.seen_batches.lock().expect("resolver poisoned").push(req);
        Ok(reply)
    }
}

#[derive(Clone, Debug)]
pub struct PushRecord {
    pub prev_version: Version,
    pub version: Version,
    pub messages: Bytes,
}

/// Log system that records pushes and acknowledges immediately.
pub struct RecordingLogSystem {
    pub pushes: Mutex<Vec<PushRecord>>,
    pub txs_pops: Mutex<Vec<Version>>,
}

impl RecordingLogSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pushes: Mutex::new(Vec::new()),
            txs_pops: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded_versions(&self) -> Vec<Version> {
        self.pushes
            .lock()
            .expect("log poisoned")
            .iter()
            .map(|p| p.version)
            .collect()
    }
}

#[async_trait]
impl LogSystem for RecordingLogSystem {
    async fn push(
        &self,
        prev_version: Version,
        version: Version,
        _known_committed_version: Version,
        _min_known_committed_version: Version,
        messages: Bytes,
    ) -> Result<Version> {
        self.pushes.lock().expect("log poisoned").push(PushRecord {
            prev_version,
            version,
            messages,
        });
        Ok(version)
    }

    async fn pop(&self, _: Version, _: Tag, _: Version, _: i8) -> Result<()> {
        Ok(())
    }

    async fn pop_txs(&self, version: Version, _: Option<i8>) -> Result<()> {
        self.txs_pops.lock().expect("log poisoned").push(version);
        Ok(())
    }

    async fn confirm_epoch_live(&self) -> Result<()> {
        Ok(())
    }

    fn pop_pseudo_locality_tag(&self, _: Tag, version: Version) -> Version {
        version
    }
}
