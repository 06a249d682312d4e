use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{ColexError, Result};

/// Rows in one logical column block.
pub const ROWS_PER_BLOCK: usize = 8192;

/// Processor-wide tunables resolved by the bootstrap and injected into the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Default number of fair-scheduler worker threads.
    pub processor_threads: usize,
    /// Target weight charged per scheduled run of a batch job.
    pub weight_per_run: u32,
    /// Dispatcher byte cap before enqueuers block.
    pub max_send_queue_bytes: u64,
    /// Dispatcher message-count threshold for `size_too_big`.
    pub send_queue_msg_threshold: usize,
    /// Number of distinct consumer connections per query before load balancing starts.
    pub connections_per_consumer: usize,
    /// Base backoff for join-table inserters that made no progress in a pass.
    pub join_backoff_micros: u64,
    /// Per-executor memory budget for partial aggregation state.
    pub aggregation_mem_bytes: usize,
    /// Engine-level memory budget shared by all executors.
    pub engine_mem_budget_bytes: usize,
    /// Rows in one logical block.
    pub rows_per_block: usize,
    /// Address the worker binary listens on.
    pub listen_addr: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            processor_threads: 16,
            weight_per_run: 1,
            max_send_queue_bytes: 250 * 1024 * 1024,
            send_queue_msg_threshold: 100,
            connections_per_consumer: 1,
            join_backoff_micros: 500,
            aggregation_mem_bytes: 64 * 1024 * 1024,
            engine_mem_budget_bytes: 1024 * 1024 * 1024,
            rows_per_block: ROWS_PER_BLOCK,
            listen_addr: "0.0.0.0:8620".to_string(),
        }
    }
}

impl ProcessorConfig {
    /// Build a config from `COLEX_*` environment variables on top of defaults.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            processor_threads: env_usize_or_default("COLEX_PROCESSOR_THREADS", d.processor_threads)?,
            weight_per_run: env_u32_or_default("COLEX_WEIGHT_PER_RUN", d.weight_per_run)?,
            max_send_queue_bytes: env_u64_or_default(
                "COLEX_MAX_SEND_QUEUE_BYTES",
                d.max_send_queue_bytes,
            )?,
            send_queue_msg_threshold: env_usize_or_default(
                "COLEX_SEND_QUEUE_MSG_THRESHOLD",
                d.send_queue_msg_threshold,
            )?,
            connections_per_consumer: env_usize_or_default(
                "COLEX_CONNECTIONS_PER_CONSUMER",
                d.connections_per_consumer,
            )?,
            join_backoff_micros: env_u64_or_default(
                "COLEX_JOIN_BACKOFF_MICROS",
                d.join_backoff_micros,
            )?,
            aggregation_mem_bytes: env_usize_or_default(
                "COLEX_AGGREGATION_MEM_BYTES",
                d.aggregation_mem_bytes,
            )?,
            engine_mem_budget_bytes: env_usize_or_default(
                "COLEX_ENGINE_MEM_BUDGET_BYTES",
                d.engine_mem_budget_bytes,
            )?,
            rows_per_block: d.rows_per_block,
            listen_addr: env::var("COLEX_LISTEN_ADDR").unwrap_or(d.listen_addr),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.processor_threads == 0 {
            return Err(ColexError::InvalidConfig(
                "processor_threads must be at least 1".to_string(),
            ));
        }
        if self.connections_per_consumer == 0 {
            return Err(ColexError::InvalidConfig(
                "connections_per_consumer must be at least 1".to_string(),
            ));
        }
        if self.max_send_queue_bytes == 0 {
            return Err(ColexError::InvalidConfig(
                "max_send_queue_bytes must be positive".to_string(),
            ));
        }
        if self.rows_per_block == 0 || self.rows_per_block > u16::MAX as usize + 1 {
            return Err(ColexError::InvalidConfig(format!(
                "rows_per_block must be in 1..=65536, got {}",
                self.rows_per_block
            )));
        }
        Ok(())
    }

    /// Join-table bucket count: processor threads rounded up to a power of two.
    #[must_use]
    pub fn join_bucket_count(&self) -> usize {
        self.processor_threads.max(1).next_power_of_two()
    }
}

fn env_usize_or_default(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse::<usize>()
            .map_err(|e| ColexError::InvalidConfig(format!("{key}={v}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_u32_or_default(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u32>()
            .map_err(|e| ColexError::InvalidConfig(format!("{key}={v}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_u64_or_default(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|e| ColexError::InvalidConfig(format!("{key}={v}: {e}"))),
        Err(_) => Ok(default),
    }
}
