use chrono::{DateTime, Utc};

/// Hours elapsed between `since` and now, floored at zero.
pub fn hours_since(since: DateTime<Utc>) -> f64 {
    let elapsed = Utc::now().signed_duration_since(since);
    (elapsed.num_milliseconds() as f64 / 3_600_000.0).max(0.0)
}

/// Linear 24-hour time decay: `max(0, 1 - (1 - decay24hr) * elapsedHours / 24)`.
/// Short-circuits to `1.0` when `decay24hr == 1` (spec §4.7.1).
pub fn time_decay(since: DateTime<Utc>, decay_24hr: f64) -> f64 {
    if decay_24hr >= 1.0 {
        return 1.0;
    }
    let elapsed_hours = hours_since(since);
    (1.0 - (1.0 - decay_24hr) * elapsed_hours / 24.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn decay_is_one_when_decay24hr_is_one() {
        let since = Utc::now() - Duration::hours(100);
        assert_eq!(time_decay(since, 1.0), 1.0);
    }

    #[test]
    fn decay_is_full_at_zero_elapsed() {
        let since = Utc::now();
        assert!((time_decay(since, 0.5) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn decay_never_goes_negative() {
        let since = Utc::now() - Duration::hours(1000);
        assert_eq!(time_decay(since, 0.0), 0.0);
    }
}
