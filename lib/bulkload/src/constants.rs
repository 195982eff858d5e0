//! Centralized environment variable names and default values for loader tuning.

// Environment variable names
pub const ENV_KEEP_INTERMEDIATES: &str = "BULKLOAD_KEEP_INTERMEDIATES";
pub const ENV_RECORD_QUEUE_CAP: &str = "BULKLOAD_RECORD_QUEUE_CAP";
pub const ENV_POSTING_QUEUE_CAP: &str = "BULKLOAD_POSTING_QUEUE_CAP";
pub const ENV_RUN_QUEUE_CAP: &str = "BULKLOAD_RUN_QUEUE_CAP";
pub const ENV_BATCH_QUEUE_CAP: &str = "BULKLOAD_BATCH_QUEUE_CAP";
pub const ENV_SPILL_BYTES: &str = "BULKLOAD_SPILL_BYTES";
pub const ENV_PROGRESS_INTERVAL_MS: &str = "BULKLOAD_PROGRESS_INTERVAL_MS";

// Defaults
pub const DEFAULT_RECORD_QUEUE_CAP: usize = 1000;
pub const DEFAULT_POSTING_QUEUE_CAP: usize = 1000;
// Per run file; sized for read-ahead throughput only
pub const DEFAULT_RUN_QUEUE_CAP: usize = 1000;
// Each batch can hold a whole posting list, so keep the merge close behind the reducers
pub const DEFAULT_BATCH_QUEUE_CAP: usize = 3;
pub const DEFAULT_SPILL_BYTES: usize = 64 * 1024 * 1024; // 64 MiB
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 2_000;

/// Buffer used when writing run files and loader output.
pub const WRITE_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Prefix of the per-load directory created under the temp root.
pub const RUN_DIR_PREFIX: &str = "bulkload_tmp_posting_";
/// Output file names under the persistent-storage directory.
pub const POSTINGS_FILE: &str = "postings.jsonl";
pub const SCHEMA_FILE: &str = "schema.txt";
