use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

static TICK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A collision-resistant identifier for one main-loop tick, used to name
/// the diagnostics document it writes. A monotonic counter combined with
/// the tick's start timestamp, rather than a second-granularity sleep
/// between ticks, per the open question in spec.md §9.
pub fn next_tick_run_id() -> String {
    let seq = TICK_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:08x}", Utc::now().format("%Y%m%dT%H%M%S%.3f"), seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_even_within_the_same_instant() {
        let a = next_tick_run_id();
        let b = next_tick_run_id();
        assert_ne!(a, b);
    }
}
