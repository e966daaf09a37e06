//! Engine metrics and timers
//!
//! Recorded through the `metrics` facade. Nothing here installs an
//! exporter; whoever embeds the engine decides where metrics go.
//!
//! ## Metrics
//! - `shardline_lookup_total` - lookups served
//! - `shardline_lookup_miss_total` - lookups with no fragment in any table
//! - `shardline_lookup_duration_seconds` - lookup latency histogram
//! - `shardline_refresh_cycles_total{outcome}` - finished refresh cycles
//! - `shardline_refresh_failures_total` - cycles that failed or panicked
//! - `shardline_table_load_failures_total` - per-table load failures

use metrics::{counter, histogram};
use std::time::Instant;

/// Records lookup latency when dropped
pub struct LookupTimer {
    start: Instant,
}

impl Drop for LookupTimer {
    fn drop(&mut self) {
        histogram!(
            "shardline_lookup_duration_seconds",
            self.start.elapsed().as_secs_f64()
        );
    }
}

pub fn time_lookup() -> LookupTimer {
    counter!("shardline_lookup_total", 1);
    LookupTimer {
        start: Instant::now(),
    }
}

pub fn record_lookup_miss() {
    counter!("shardline_lookup_miss_total", 1);
}

pub fn record_cycle(outcome: &'static str) {
    counter!("shardline_refresh_cycles_total", 1, "outcome" => outcome);
}

pub fn record_cycle_failure() {
    counter!("shardline_refresh_failures_total", 1);
}

pub fn record_table_load_failure(table: &str) {
    counter!("shardline_table_load_failures_total", 1, "table" => table.to_string());
}
