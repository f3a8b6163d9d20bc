//! Process-wide tunables.
//!
//! Every component receives a shared `Arc<Knobs>` at construction; nothing
//! reads configuration after startup. `Knobs::from_env` lets any field be
//! overridden through `BRAID_<FIELD_NAME>` environment variables.

use std::env;
use std::str::FromStr;
use std::sync::Arc;

/// Bit 0 of `transaction_split_mode`: splitting enabled at all.
pub const SPLIT_TRANSACTION_MASK: u32 = 0b1;
pub const ENABLE_SPLIT_TRANSACTION: u32 = 0b1;

/// Bits 1-2: how conflict ranges are distributed across the parts.
pub const CONFLICTS_MASK: u32 = 0b110;
pub const CONFLICTS_EVENLY_DISTRIBUTE: u32 = 0b000;
pub const CONFLICTS_TO_ONE_PROXY: u32 = 0b010;

#[derive(Clone, Debug)]
pub struct Knobs {
    // Commit proxy: splitting.
    pub transaction_split_mode: u32,
    pub large_transaction_criteria: i64,

    // Commit proxy: batching.
    pub transaction_size_limit: i64,
    pub key_size_limit: i64,
    pub value_size_limit: i64,
    pub commit_transaction_batch_count_max: usize,
    pub commit_transaction_batch_bytes_max: i64,
    pub commit_batch_interval_min: f64,
    pub commit_batch_interval_max: f64,
    pub commit_batch_interval_latency_fraction: f64,
    pub commit_batch_interval_smoother_alpha: f64,
    pub commit_batch_interval_from_idle: f64,
    pub max_commit_batch_interval: f64,
    pub proxy_commit_mem_bytes_limit: i64,
    pub packet_warning: i64,

    // Commit proxy: pipeline.
    pub proxy_spin_delay: f64,
    pub proxy_compute_buckets: usize,
    pub proxy_compute_growth_rate: f64,
    pub max_proxy_compute: f64,
    pub min_proxy_compute: f64,
    pub resolver_coalesce_time: f64,
    pub max_read_transaction_life_versions: i64,
    pub max_write_transaction_life_versions: i64,
    pub max_versions_in_flight: i64,
    pub max_txs_pop_version_history: usize,

    // GRV starter.
    pub start_transaction_rate_window: f64,
    pub start_transaction_max_empty_queue_budget: f64,
    pub start_transaction_max_transactions_to_start: i64,
    pub start_transaction_max_requests_to_start: usize,
    pub start_transaction_max_queue_size: i64,
    pub start_transaction_batch_interval_min: f64,
    pub start_transaction_batch_interval_max: f64,
    pub start_transaction_batch_interval_latency_fraction: f64,
    pub start_transaction_batch_interval_smoother_alpha: f64,
    pub start_transaction_batch_queue_check_interval: f64,
    pub required_min_recovery_duration: f64,
    pub always_causal_read_risky: bool,
    pub min_confirm_interval: f64,
    pub max_commit_updates: usize,

    // Transaction log.
    pub tlog_spill_threshold: i64,
    pub tlog_hard_limit_bytes: i64,
    pub tlog_message_block_bytes: i64,
    pub tlog_message_block_overhead_factor: f64,
    pub version_messages_entry_bytes_with_overhead: i64,
    pub max_message_size: i64,
    pub desired_total_bytes: i64,
    pub tlog_spill_reference_max_batches_per_peek: usize,
    pub tlog_spill_reference_max_bytes_per_batch: i64,
    pub tlog_spill_reference_max_peek_memory_bytes: i64,
    pub reference_spill_update_storage_byte_limit: i64,
    pub tlog_storage_min_update_interval: f64,
    pub max_queue_commit_bytes: i64,
    pub tlog_peek_delay: f64,
    pub tlog_ignore_pop_auto_enable_delay: f64,
    pub concurrent_log_router_reads: usize,
    pub peek_tracker_expiration_time: f64,
    pub split_transaction_history: f64,

    /// Maximum in-flight peek requests per cursor. The peek server's
    /// sequence window uses the same value; keeping it in one place keeps
    /// the two sides agreeing.
    pub parallel_get_more_requests: usize,

    // Backup framing.
    pub mutation_block_size: usize,
    pub log_range_block_size: i64,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            transaction_split_mode: ENABLE_SPLIT_TRANSACTION | CONFLICTS_TO_ONE_PROXY,
            large_transaction_criteria: 500_000,

            transaction_size_limit: 10_000_000,
            key_size_limit: 10_000,
            value_size_limit: 100_000,
            commit_transaction_batch_count_max: 32_768,
            commit_transaction_batch_bytes_max: 500_000,
            commit_batch_interval_min: 0.001,
            commit_batch_interval_max: 0.010,
            commit_batch_interval_latency_fraction: 0.1,
            commit_batch_interval_smoother_alpha: 0.1,
            commit_batch_interval_from_idle: 0.0005,
            max_commit_batch_interval: 0.5,
            proxy_commit_mem_bytes_limit: 2_000_000_000,
            packet_warning: 2 << 20,

            proxy_spin_delay: 0.01,
            proxy_compute_buckets: 20_000,
            proxy_compute_growth_rate: 0.01,
            max_proxy_compute: 2.0,
            min_proxy_compute: 0.001,
            resolver_coalesce_time: 1.0,
            max_read_transaction_life_versions: 5_000_000,
            max_write_transaction_life_versions: 5_000_000,
            max_versions_in_flight: 100_000_000,
            max_txs_pop_version_history: 100_000,

            start_transaction_rate_window: 2.0,
            start_transaction_max_empty_queue_budget: 10.0,
            start_transaction_max_transactions_to_start: 100_000,
            start_transaction_max_requests_to_start: 10_000,
            start_transaction_max_queue_size: 1_000_000,
            start_transaction_batch_interval_min: 0.0005,
            start_transaction_batch_interval_max: 0.005,
            start_transaction_batch_interval_latency_fraction: 0.5,
            start_transaction_batch_interval_smoother_alpha: 0.1,
            start_transaction_batch_queue_check_interval: 0.001,
            required_min_recovery_duration: 0.080,
            always_causal_read_risky: false,
            min_confirm_interval: 0.05,
            max_commit_updates: 2_000,

            tlog_spill_threshold: 1_500_000_000,
            tlog_hard_limit_bytes: 3_000_000_000,
            tlog_message_block_bytes: 10_000_000,
            tlog_message_block_overhead_factor: 1.1,
            version_messages_entry_bytes_with_overhead: 64,
            max_message_size: 10_000_000,
            desired_total_bytes: 150_000,
            tlog_spill_reference_max_batches_per_peek: 100,
            tlog_spill_reference_max_bytes_per_batch: 16_384,
            tlog_spill_reference_max_peek_memory_bytes: 32 << 20,
            reference_spill_update_storage_byte_limit: 20 << 20,
            tlog_storage_min_update_interval: 0.5,
            max_queue_commit_bytes: 16_000_000,
            tlog_peek_delay: 0.00005,
            tlog_ignore_pop_auto_enable_delay: 300.0,
            concurrent_log_router_reads: 5,
            peek_tracker_expiration_time: 600.0,
            split_transaction_history: 5.0,

            parallel_get_more_requests: 32,

            mutation_block_size: 10_000,
            log_range_block_size: 1 << 20,
        }
    }
}

fn read_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| T::from_str(&v).ok())
}

fn read_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        )
    })
}

macro_rules! env_overrides {
    ($knobs:ident, $($field:ident),* $(,)?) => {
        $(
            if let Some(v) = read_env(&format!("BRAID_{}", stringify!($field).to_ascii_uppercase())) {
                $knobs.$field = v;
            }
        )*
    };
}

impl Knobs {
    /// Defaults with `BRAID_*` environment overrides applied.
    pub fn from_env() -> Arc<Self> {
        let mut knobs = Self::default();
        env_overrides!(
            knobs,
            transaction_split_mode,
            large_transaction_criteria,
            transaction_size_limit,
            key_size_limit,
            value_size_limit,
            commit_transaction_batch_count_max,
            commit_transaction_batch_bytes_max,
            commit_batch_interval_min,
            commit_batch_interval_max,
            commit_batch_interval_latency_fraction,
            commit_batch_interval_smoother_alpha,
            commit_batch_interval_from_idle,
            max_commit_batch_interval,
            proxy_commit_mem_bytes_limit,
            packet_warning,
            proxy_spin_delay,
            proxy_compute_buckets,
            proxy_compute_growth_rate,
            max_proxy_compute,
            min_proxy_compute,
            resolver_coalesce_time,
            max_read_transaction_life_versions,
            max_write_transaction_life_versions,
            max_versions_in_flight,
            max_txs_pop_version_history,
            start_transaction_rate_window,
            start_transaction_max_empty_queue_budget,
            start_transaction_max_transactions_to_start,
            start_transaction_max_requests_to_start,
            start_transaction_max_queue_size,
            start_transaction_batch_interval_min,
            start_transaction_batch_interval_max,
            start_transaction_batch_interval_latency_fraction,
            start_transaction_batch_interval_smoother_alpha,
            start_transaction_batch_queue_check_interval,
            required_min_recovery_duration,
            min_confirm_interval,
            max_commit_updates,
            tlog_spill_threshold,
            tlog_hard_limit_bytes,
            tlog_message_block_bytes,
            tlog_message_block_overhead_factor,
            version_messages_entry_bytes_with_overhead,
            max_message_size,
            desired_total_bytes,
            tlog_spill_reference_max_batches_per_peek,
            tlog_spill_reference_max_bytes_per_batch,
            tlog_spill_reference_max_peek_memory_bytes,
            reference_spill_update_storage_byte_limit,
            tlog_storage_min_update_interval,
            max_queue_commit_bytes,
            tlog_peek_delay,
            tlog_ignore_pop_auto_enable_delay,
            concurrent_log_router_reads,
            peek_tracker_expiration_time,
            split_transaction_history,
            parallel_get_more_requests,
            mutation_block_size,
            log_range_block_size,
        );
        if let Some(v) = read_env_bool("BRAID_ALWAYS_CAUSAL_READ_RISKY") {
            knobs.always_causal_read_risky = v;
        }
        Arc::new(knobs)
    }

    pub fn split_enabled(&self) -> bool {
        self.transaction_split_mode & SPLIT_TRANSACTION_MASK == ENABLE_SPLIT_TRANSACTION
    }

    pub fn conflict_split_mode(&self) -> u32 {
        self.transaction_split_mode & CONFLICTS_MASK
    }
}
