//! Read-version (GRV) admission and dispatch.
//!
//! Requests queue per priority; a dynamic timer drains them in strict
//! priority order under the windowed rate admission the ratekeeper feeds
//! us, and each drained group is answered from one live-committed-version
//! consultation of the master.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::warn;

use braid_core::clock::now_seconds;
use braid_core::error::{Error, Result};
use braid_core::interfaces::{
    ClientTagThrottleLimits, GetReadVersionReply, GetReadVersionRequest, TransactionTag,
    GRV_FLAG_USE_MIN_KNOWN_COMMITTED,
};
use braid_core::smoother::Smoother;
use braid_core::types::TransactionPriority;

use super::state::ProxyCommitData;

/// Windowed rate admission for one priority class.
pub struct TransactionRateInfo {
    rate: f64,
    limit: f64,
    budget: f64,
    disabled: bool,
    smooth_rate: Smoother,
    smooth_released: Smoother,
    window: f64,
    max_empty_queue_budget: f64,
    max_transactions_to_start: i64,
}

impl TransactionRateInfo {
    pub fn new(initial_rate: f64, knobs: &braid_core::knobs::Knobs) -> Self {
        Self {
            rate: initial_rate,
            limit: 0.0,
            budget: 0.0,
            disabled: true,
            smooth_rate: Smoother::new(knobs.start_transaction_rate_window),
            smooth_released: Smoother::new(knobs.start_transaction_rate_window),
            window: knobs.start_transaction_rate_window,
            max_empty_queue_budget: knobs.start_transaction_max_empty_queue_budget,
            max_transactions_to_start: knobs.start_transaction_max_transactions_to_start,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Recompute the window limit: the transactions we could have released
    /// over the window but did not. May go negative when we overdraw.
    pub fn reset(&mut self, now: f64) {
        let release_rate =
            self.smooth_rate.smooth_total(now) - self.smooth_released.smooth_rate(now);
        self.limit = self.window * release_rate;
    }

    pub fn can_start(&self, already_started: i64, count: i64) -> bool {
        (already_started + count) as f64
            <= (self.limit + self.budget).min(self.max_transactions_to_start as f64)
    }

    /// Fold this tick's releases into the budget, capping it when the
    /// queue drained so idle periods don't bank unbounded credit.
    pub fn update_budget(&mut self, started: i64, queue_empty: bool, elapsed: f64, now: f64) {
        self.budget =
            (self.budget + elapsed * (self.limit - started as f64) / self.window).max(0.0);
        if queue_empty {
            self.budget = self.budget.min(self.max_empty_queue_budget);
        }
        self.smooth_released.add_delta(started as f64, now);
    }

    pub fn disable(&mut self) {
        self.disabled = true;
        self.rate = 0.0;
        self.smooth_rate.reset(0.0);
    }

    pub fn set_rate(&mut self, rate: f64, now: f64) {
        assert!(rate.is_finite() && rate >= 0.0);
        self.rate = rate;
        if self.disabled {
            self.smooth_rate.reset(rate);
            self.disabled = false;
        } else {
            self.smooth_rate.set_total(rate, now);
        }
    }
}

/// Rate and throttle feed from the ratekeeper collaborator.
#[derive(Clone, Debug, Default)]
pub struct RateUpdate {
    pub transaction_rate: f64,
    pub batch_transaction_rate: f64,
    pub throttled_tags:
        Option<HashMap<TransactionPriority, HashMap<TransactionTag, ClientTagThrottleLimits>>>,
}

/// Ask the log system and master for a version that is both committed and
/// at least as new as anything reported committed when the request began.
pub async fn get_live_committed_version(
    commit_data: &Arc<ProxyCommitData>,
    causal_read_risky: bool,
) -> Result<GetReadVersionReply> {
    let knobs = &commit_data.knobs;
    let master_reply = {
        let master = commit_data.master.clone();
        tokio::spawn(async move { master.get_live_committed_version().await })
    };

    if !knobs.always_causal_read_risky && !causal_read_risky {
        update_last_commit(commit_data).await?;
    } else if knobs.required_min_recovery_duration > 0.0
        && now_seconds() - knobs.required_min_recovery_duration
            > commit_data.last_commit_time.get()
    {
        commit_data
            .last_commit_time
            .when_at_least(now_seconds() - knobs.required_min_recovery_duration)
            .await;
    }

    let mut reply = GetReadVersionReply {
        version: commit_data.committed_version.get(),
        locked: commit_data.locked.load(Ordering::Relaxed),
        metadata_version: commit_data
            .metadata_version
            .lock()
            .expect("metadata version poisoned")
            .clone(),
        recent_requests: commit_data.stats.recent_requests(),
        tag_throttle_info: HashMap::new(),
    };

    let from_master = master_reply.await.map_err(|_| Error::BrokenPromise)??;
    if from_master.version > reply.version {
        reply.version = from_master.version;
        reply.locked = from_master.locked;
        reply.metadata_version = from_master.metadata_version;
    }
    Ok(reply)
}

/// Confirm the current log epoch is live; used to make non-risky reads
/// causally safe and to keep the recovery-quiet window fresh.
pub async fn update_last_commit(commit_data: &Arc<ProxyCommitData>) -> Result<()> {
    let confirm_start = now_seconds();
    *commit_data
        .last_start_commit
        .lock()
        .expect("last start poisoned") = confirm_start;
    commit_data
        .update_commit_requests
        .fetch_add(1, Ordering::Relaxed);
    let result = commit_data.log_system.confirm_epoch_live().await;
    commit_data
        .update_commit_requests
        .fetch_sub(1, Ordering::Relaxed);
    result?;
    *commit_data
        .last_commit_latency
        .lock()
        .expect("latency poisoned") = now_seconds() - confirm_start;
    commit_data.last_commit_time.set_at_least(confirm_start);
    Ok(())
}

/// Periodically confirm the epoch so non-risky GRVs rarely have to wait.
pub async fn last_commit_updater(commit_data: Arc<ProxyCommitData>) {
    let knobs = commit_data.knobs.clone();
    loop {
        let latency = *commit_data
            .last_commit_latency
            .lock()
            .expect("latency poisoned");
        let interval = knobs
            .min_confirm_interval
            .max((knobs.required_min_recovery_duration - latency) / 2.0);
        let elapsed = now_seconds()
            - *commit_data
                .last_start_commit
                .lock()
                .expect("last start poisoned");
        if elapsed < interval {
            tokio::time::sleep(Duration::from_secs_f64(interval + 0.0001 - elapsed)).await;
        } else if commit_data.update_commit_requests.load(Ordering::Relaxed)
            < knobs.max_commit_updates as i64
        {
            if let Err(err) = update_last_commit(&commit_data).await {
                warn!(error = %err, "confirm epoch live failed");
                tokio::time::sleep(Duration::from_secs_f64(knobs.min_confirm_interval)).await;
            }
        } else {
            warn!("too many outstanding last-commit updates");
            *commit_data
                .last_start_commit
                .lock()
                .expect("last start poisoned") = now_seconds();
        }
    }
}

struct Queues {
    system: VecDeque<GetReadVersionRequest>,
    default: VecDeque<GetReadVersionRequest>,
    batch: VecDeque<GetReadVersionRequest>,
}

impl Queues {
    fn new() -> Self {
        Self {
            system: VecDeque::new(),
            default: VecDeque::new(),
            batch: VecDeque::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.system.is_empty() && self.default.is_empty() && self.batch.is_empty()
    }

    fn next_queue(&mut self) -> Option<&mut VecDeque<GetReadVersionRequest>> {
        if !self.system.is_empty() {
            Some(&mut self.system)
        } else if !self.default.is_empty() {
            Some(&mut self.default)
        } else if !self.batch.is_empty() {
            Some(&mut self.batch)
        } else {
            None
        }
    }
}

/// The transaction starter: queueing, admission, dispatch and dynamic
/// batching in one worker loop.
pub async fn transaction_starter(
    commit_data: Arc<ProxyCommitData>,
    mut requests: mpsc::Receiver<GetReadVersionRequest>,
    mut rates: mpsc::Receiver<RateUpdate>,
) {
    let knobs = commit_data.knobs.clone();
    let mut queues = Queues::new();
    let mut normal_rate = TransactionRateInfo::new(10.0, &knobs);
    let mut batch_rate = TransactionRateInfo::new(0.0, &knobs);
    let mut throttled_tags: HashMap<
        TransactionPriority,
        HashMap<TransactionTag, ClientTagThrottleLimits>,
    > = HashMap::new();

    let mut grv_batch_time = knobs.start_transaction_batch_interval_min;
    let mut last_grv_time = now_seconds();
    let mut timer: Option<Instant> = None;
    let (reply_time_tx, mut reply_times) = mpsc::channel::<f64>(128);

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { return };
                commit_data.stats.txn_request_in.fetch_add(1, Ordering::Relaxed);

                let backlog = commit_data.stats.txn_request_in.load(Ordering::Relaxed) as i64
                    - commit_data.stats.txn_request_out.load(Ordering::Relaxed) as i64;
                if backlog > knobs.start_transaction_max_queue_size {
                    // Saturated: a degraded sentinel reply keeps the client
                    // retrying instead of waiting forever.
                    commit_data.stats.txn_request_errors.fetch_add(1, Ordering::Relaxed);
                    commit_data.stats.txn_request_out.fetch_add(1, Ordering::Relaxed);
                    warn!("read version queue saturated");
                    request.reply.send(Ok(GetReadVersionReply {
                        version: 1,
                        locked: true,
                        ..GetReadVersionReply::default()
                    }));
                    continue;
                }

                if queues.is_empty() {
                    let wait = (grv_batch_time - (now_seconds() - last_grv_time)).max(0.0);
                    timer = Some(Instant::now() + Duration::from_secs_f64(wait));
                }

                commit_data.stats.txn_start_in.fetch_add(
                    request.transaction_count as u64, Ordering::Relaxed);
                match request.priority {
                    TransactionPriority::Immediate => queues.system.push_back(request),
                    TransactionPriority::Default => queues.default.push_back(request),
                    TransactionPriority::Batch => {
                        // Near-zero batch rate: reject instead of queueing
                        // work that would never be admitted.
                        if batch_rate.rate() <= 1.0 / commit_data.num_proxies as f64 {
                            commit_data.stats.txn_throttled.fetch_add(
                                request.transaction_count as u64, Ordering::Relaxed);
                            request.reply.send(Err(Error::BatchTransactionThrottled));
                        } else {
                            queues.batch.push_back(request);
                        }
                    }
                }
            }

            update = rates.recv() => {
                let Some(update) = update else { return };
                let now = now_seconds();
                normal_rate.set_rate(update.transaction_rate, now);
                batch_rate.set_rate(update.batch_transaction_rate, now);
                if let Some(tags) = update.throttled_tags {
                    throttled_tags = tags;
                }
            }

            Some(latency) = reply_times.recv() => {
                // Dynamic batching follows observed reply latency.
                let target = latency * knobs.start_transaction_batch_interval_latency_fraction;
                let alpha = knobs.start_transaction_batch_interval_smoother_alpha;
                grv_batch_time = (target * alpha + grv_batch_time * (1.0 - alpha)).clamp(
                    knobs.start_transaction_batch_interval_min,
                    knobs.start_transaction_batch_interval_max,
                );
            }

            _ = async {
                match timer {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                timer = None;
                let now = now_seconds();
                let mut elapsed = now - last_grv_time;
                last_grv_time = now;
                if elapsed == 0.0 {
                    elapsed = 1e-15;
                }

                normal_rate.reset(now);
                batch_rate.reset(now);

                // start[0]: normal, start[1]: causal-read-risky.
                let mut start: [Vec<GetReadVersionRequest>; 2] = [Vec::new(), Vec::new()];
                let mut transactions_started = [0i64; 2];
                let mut system_started = 0i64;
                let mut default_started = 0i64;
                let mut batch_started = 0i64;
                let mut requests_started = 0usize;

                while requests_started < knobs.start_transaction_max_requests_to_start {
                    let Some(queue) = queues.next_queue() else { break };
                    let request = queue.front().expect("non-empty queue");
                    let count = request.transaction_count;
                    let already = transactions_started[0] + transactions_started[1];

                    if request.priority < TransactionPriority::Default
                        && !batch_rate.can_start(already, count)
                    {
                        break;
                    }
                    if request.priority < TransactionPriority::Immediate
                        && !normal_rate.can_start(already, count)
                    {
                        break;
                    }

                    let request = queue.pop_front().expect("non-empty queue");
                    let risky = usize::from(request.causal_read_risky());
                    transactions_started[risky] += count;
                    match request.priority {
                        TransactionPriority::Immediate => system_started += count,
                        TransactionPriority::Default => default_started += count,
                        TransactionPriority::Batch => batch_started += count,
                    }
                    start[risky].push(request);
                    requests_started += 1;
                }

                if !queues.is_empty() {
                    timer = Some(Instant::now() + Duration::from_secs_f64(
                        knobs.start_transaction_batch_queue_check_interval));
                }

                commit_data.stats.txn_start_out.fetch_add(
                    (transactions_started[0] + transactions_started[1]) as u64,
                    Ordering::Relaxed);
                normal_rate.update_budget(
                    system_started + default_started,
                    queues.system.is_empty() && queues.default.is_empty(),
                    elapsed,
                    now,
                );
                batch_rate.update_budget(
                    system_started + default_started + batch_started,
                    queues.is_empty(),
                    elapsed,
                    now,
                );

                for (risky, group) in start.into_iter().enumerate() {
                    if group.is_empty() {
                        continue;
                    }
                    let commit_data = commit_data.clone();
                    let throttled = throttled_tags.clone();
                    let reply_time_tx = reply_time_tx.clone();
                    tokio::spawn(async move {
                        let started_at = now_seconds();
                        let reply =
                            get_live_committed_version(&commit_data, risky == 1).await;
                        if risky == 0 {
                            let _ = reply_time_tx.send(now_seconds() - started_at).await;
                        }
                        send_grv_replies(&commit_data, reply, group, &throttled);
                    });
                }
            }
        }
    }
}

fn send_grv_replies(
    commit_data: &Arc<ProxyCommitData>,
    reply: Result<GetReadVersionReply>,
    requests: Vec<GetReadVersionRequest>,
    throttled_tags: &HashMap<
        TransactionPriority,
        HashMap<TransactionTag, ClientTagThrottleLimits>,
    >,
) {
    let min_known_committed = commit_data
        .min_known_committed_version
        .load(Ordering::Relaxed);

    for request in requests {
        commit_data
            .stats
            .txn_request_out
            .fetch_add(1, Ordering::Relaxed);
        let base = match &reply {
            Ok(reply) => reply.clone(),
            Err(err) => {
                request.reply.send(Err(err.clone()));
                continue;
            }
        };

        let mut out = base;
        if request.flags & GRV_FLAG_USE_MIN_KNOWN_COMMITTED != 0 {
            // Only backup workers use this, and only rarely.
            out.version = min_known_committed;
        }

        out.tag_throttle_info.clear();
        if !request.tags.is_empty() {
            if let Some(priority_throttles) = throttled_tags.get(&request.priority) {
                for (tag, _) in &request.tags {
                    if let Some(limits) = priority_throttles.get(tag) {
                        if limits.expiration > now_seconds() {
                            out.tag_throttle_info.insert(tag.clone(), *limits);
                        }
                    }
                }
            }
        }

        request.reply.send(Ok(out));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knobs() -> braid_core::knobs::Knobs {
        braid_core::knobs::Knobs::default()
    }

    #[test]
    fn rate_info_budget_accumulates_and_caps() {
        let knobs = knobs();
        let mut info = TransactionRateInfo::new(0.0, &knobs);
        info.set_rate(100.0, 0.0);
        info.reset(10.0);
        assert!(info.limit > 0.0);

        // Unused limit accumulates budget over the window...
        info.update_budget(0, false, 1.0, 10.0);
        let banked = info.budget;
        assert!(banked > 0.0);

        // ...but an empty queue caps it.
        info.update_budget(0, true, 1.0, 11.0);
        assert!(info.budget <= knobs.start_transaction_max_empty_queue_budget);
    }

    #[test]
    fn can_start_honors_limit_and_cap() {
        let knobs = knobs();
        let mut info = TransactionRateInfo::new(0.0, &knobs);
        info.set_rate(5.0, 0.0);
        info.reset(100.0);

        assert!(info.can_start(0, 1));
        let limit = (info.limit + info.budget) as i64;
        assert!(!info.can_start(limit, 1));
    }

    #[test]
    fn disabled_rate_admits_nothing() {
        let knobs = knobs();
        let mut info = TransactionRateInfo::new(0.0, &knobs);
        info.set_rate(100.0, 0.0);
        info.disable();
        info.reset(10.0);
        assert!(!info.can_start(0, 1));
    }
}
