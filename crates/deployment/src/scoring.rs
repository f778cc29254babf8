use chrono::{DateTime, Utc};
use forge_core_utils::{config::SchedulerConfig, time::time_decay};

use crate::candidate::{CandidateJob, TaskCandidate};

/// Testedness of `n` commits covered by one task (spec.md §4.7.1).
pub fn testedness(n: i64) -> f64 {
    if n < 0 {
        return -1.0;
    }
    match n {
        0 => 0.0,
        1 => 1.0,
        n => 1.0 + (n as f64 - 1.0) / n as f64,
    }
}

/// `TestednessIncrease(new, stole)` (spec.md §4.7.1): how much testing
/// confidence a candidate adds, accounting for commits it steals from a
/// prior task's blamelist.
pub fn testedness_increase(new: i64, stole: i64) -> f64 {
    if new <= 0 || stole < 0 {
        return -1.0;
    }
    if stole == 0 {
        return testedness(new) - (-new as f64);
    }
    if new == stole {
        return 0.0;
    }
    testedness(new) + testedness(stole - new) - testedness(stole)
}

/// `P = 1 − ∏ⱼ (1 − pⱼ)` (spec.md §4.7.1), with each job's priority
/// clamped to the configured default when unset or out of `(0, 1]`.
pub fn effective_priority(jobs: &[CandidateJob], config: &SchedulerConfig) -> f64 {
    let product: f64 = jobs
        .iter()
        .map(|job| {
            let p = job.priority;
            let p = if p > 0.0 && p <= 1.0 { p } else { config.default_job_priority };
            1.0 - p
        })
        .product();
    1.0 - product
}

fn hours_since_earliest_job_created(jobs: &[CandidateJob]) -> f64 {
    jobs.iter()
        .map(|job| job.created)
        .min()
        .map(forge_core_utils::time::hours_since)
        .unwrap_or(0.0)
}

/// `score = (TRY_JOB_BASE + hoursSinceEarliestJobCreated) × RETRY_MULT^attempt × P`.
pub fn score_try_job(candidate: &TaskCandidate, config: &SchedulerConfig) -> f64 {
    let p = effective_priority(&candidate.jobs, config);
    let age = hours_since_earliest_job_created(&candidate.jobs);
    (config.try_job_base + age) * config.retry_mult.powi(candidate.attempt as i32) * p
}

/// `score = (FORCE_RUN_BASE + hoursSinceEarliestJobCreated) × P`.
pub fn score_force_run(candidate: &TaskCandidate, config: &SchedulerConfig) -> f64 {
    let p = effective_priority(&candidate.jobs, config);
    let age = hours_since_earliest_job_created(&candidate.jobs);
    (config.force_run_base + age) * p
}

/// `score = TestednessIncrease(...) × TimeDecay(earliestCommit) × P`,
/// with the retry/bisect bonus added to the testedness term before the
/// decay/priority multiplications.
pub fn score_regular(
    candidate: &TaskCandidate,
    stole_from_len: i64,
    earliest_commit_time: DateTime<Utc>,
    config: &SchedulerConfig,
) -> f64 {
    let mut increase = testedness_increase(candidate.commits.len() as i64, stole_from_len);
    if candidate.stole_from_failed_or_mishap {
        increase += config.failure_or_mishap_bonus;
    }
    let decay = time_decay(earliest_commit_time, config.decay_24hr);
    let p = effective_priority(&candidate.jobs, config);
    increase * decay * p
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn testedness_matches_spec_table() {
        assert_eq!(testedness(-1), -1.0);
        assert_eq!(testedness(0), 0.0);
        assert_eq!(testedness(1), 1.0);
        assert!((testedness(2) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn testedness_increase_pure_retry_is_zero() {
        assert_eq!(testedness_increase(5, 5), 0.0);
    }

    #[test]
    fn testedness_increase_new_ground_subtracts_negative_testedness() {
        // spec invariant 4: testednessIncrease(n, 0) >= testednessIncrease(n, k) for 0<=k<=n
        let new_ground = testedness_increase(4, 0);
        let bisected = testedness_increase(4, 2);
        assert!(new_ground >= bisected);
    }

    #[test]
    fn scenario_s6_try_job_score_matches_spec_arithmetic() {
        let mut config = SchedulerConfig::default();
        config.try_job_base = 10.0;
        config.retry_mult = 0.75;

        let mut candidate = TaskCandidate::new("repo", "rev", "Presubmit", forge_core_executors::TaskSpec::default());
        candidate.attempt = 2;
        candidate.jobs = vec![CandidateJob {
            job_id: Uuid::nil(),
            priority: 1.0,
            created: Utc::now() - chrono::Duration::hours(3),
        }];

        let score = score_try_job(&candidate, &config);
        // (10 + 3) x 0.75^2 x 1 = 7.3125
        assert!((score - 7.3125).abs() < 1e-6);
    }

    #[test]
    fn effective_priority_defaults_out_of_range_priority() {
        let config = SchedulerConfig::default();
        let jobs = vec![CandidateJob { job_id: Uuid::nil(), priority: 0.0, created: Utc::now() }];
        let p = effective_priority(&jobs, &config);
        assert!((p - config.default_job_priority).abs() < 1e-9);
    }
}
