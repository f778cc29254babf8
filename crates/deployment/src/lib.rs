pub mod bot_matcher;
pub mod candidate;
pub mod deployment;
pub mod dispatcher;
pub mod pipeline;
pub mod scoring;

pub use bot_matcher::{match_bots_to_candidates, MatchedCandidate};
pub use candidate::{stole_from_failed_or_mishap, CandidateJob, TaskCandidate};
pub use deployment::{CandidateOutcome, CandidateReport, Deployment, TickReport};
pub use dispatcher::{dispatch_candidates, DispatchError, DispatchOutcome};
pub use pipeline::{filter_task_candidates, find_task_candidates_for_jobs, process_task_candidates, BlacklistRule, FilterReason};
