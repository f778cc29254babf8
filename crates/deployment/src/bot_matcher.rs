use std::collections::{HashMap, HashSet};

use forge_core_executors::BotInfo;
use forge_core_utils::config::SchedulerConfig;

use crate::candidate::TaskCandidate;

/// A candidate with the bot it was matched to, ready for the dispatcher.
#[derive(Debug, Clone)]
pub struct MatchedCandidate {
    pub candidate: TaskCandidate,
    pub bot_id: String,
}

/// `botsByDim["key:val"] -> set<bot id>` (spec.md §4.8).
fn index_bots_by_dim(bots: &[BotInfo]) -> HashMap<&str, HashSet<&str>> {
    let mut index: HashMap<&str, HashSet<&str>> = HashMap::new();
    for bot in bots {
        for dim in &bot.dimensions {
            index.entry(dim.as_str()).or_default().insert(bot.bot_id.as_str());
        }
    }
    index
}

/// Candidates matching none of their required dimensions against a free
/// bot, in priority order.
fn matching_bots<'a>(candidate: &TaskCandidate, by_dim: &HashMap<&str, HashSet<&'a str>>) -> HashSet<&'a str> {
    let mut dims = candidate.task_spec.dimensions.iter();
    let Some(first) = dims.next() else {
        return HashSet::new();
    };
    let mut matching = by_dim.get(first.as_str()).cloned().unwrap_or_default();
    for dim in dims {
        let bots_for_dim = by_dim.get(dim.as_str()).cloned().unwrap_or_default();
        matching.retain(|bot_id| bots_for_dim.contains(bot_id));
        if matching.is_empty() {
            break;
        }
    }
    matching
}

/// Greedily assigns free bots to scored candidates (spec.md §4.8):
/// candidates are walked in priority (Score descending) order, capped at
/// `SCHED_LIMIT_PER_TASK_SPEC` acceptances per task-spec this tick, each
/// claiming the lexicographically-smallest still-unclaimed matching bot.
/// Candidates with `Score <= 0` or no matching free bot are left behind.
pub fn match_bots_to_candidates(
    candidates: Vec<TaskCandidate>,
    bots: &[BotInfo],
    config: &SchedulerConfig,
) -> (Vec<MatchedCandidate>, Vec<TaskCandidate>) {
    let by_dim = index_bots_by_dim(bots);
    let mut claimed: HashSet<String> = HashSet::new();
    let mut accepted_per_spec: HashMap<&str, usize> = HashMap::new();
    let mut matched = Vec::new();
    let mut unmatched = Vec::new();

    let limit = config.sched_limit_per_task_spec();

    for candidate in candidates {
        if candidate.score <= 0.0 {
            unmatched.push(candidate);
            continue;
        }

        let spec_count = accepted_per_spec.entry(candidate.task_name.as_str()).or_insert(0);
        if *spec_count >= limit {
            unmatched.push(candidate);
            continue;
        }

        let matching = matching_bots(&candidate, &by_dim);
        let chosen = matching
            .into_iter()
            .filter(|bot_id| !claimed.contains(*bot_id))
            .min()
            .map(str::to_string);

        match chosen {
            Some(bot_id) => {
                claimed.insert(bot_id.clone());
                *spec_count += 1;
                matched.push(MatchedCandidate { candidate, bot_id });
            }
            None => unmatched.push(candidate),
        }
    }

    matched.sort_by(|a, b| b.candidate.score.partial_cmp(&a.candidate.score).unwrap_or(std::cmp::Ordering::Equal));
    (matched, unmatched)
}

#[cfg(test)]
mod tests {
    use forge_core_executors::TaskSpec;

    use super::*;

    fn candidate(name: &str, score: f64, dims: Vec<&str>) -> TaskCandidate {
        let mut spec = TaskSpec::default();
        spec.dimensions = dims.into_iter().map(str::to_string).collect();
        spec.name = name.to_string();
        let mut c = TaskCandidate::new("repo", "rev", name, spec);
        c.score = score;
        c
    }

    fn bot(id: &str, dims: Vec<&str>) -> BotInfo {
        BotInfo { bot_id: id.to_string(), dimensions: dims.into_iter().map(str::to_string).collect() }
    }

    #[test]
    fn scenario_s4_higher_score_candidate_claims_the_first_bot() {
        let bots = vec![bot("b1", vec!["os:linux"]), bot("b2", vec!["os:linux"])];
        let candidates = vec![candidate("Cx", 10.0, vec!["os:linux"]), candidate("Cy", 5.0, vec!["os:linux"])];
        let config = SchedulerConfig::default();

        let (matched, unmatched) = match_bots_to_candidates(candidates, &bots, &config);
        assert!(unmatched.is_empty());
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].candidate.task_name, "Cx");
        assert_eq!(matched[0].bot_id, "b1");
        assert_eq!(matched[1].candidate.task_name, "Cy");
        assert_eq!(matched[1].bot_id, "b2");
    }

    #[test]
    fn scenario_s5_only_one_free_bot_leaves_the_lower_score_candidate_unmatched() {
        let bots = vec![bot("b1", vec!["os:linux"])];
        let candidates = vec![candidate("Cx", 10.0, vec!["os:linux"]), candidate("Cy", 5.0, vec!["os:linux"])];
        let config = SchedulerConfig::default();

        let (matched, unmatched) = match_bots_to_candidates(candidates, &bots, &config);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].candidate.task_name, "Cx");
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].task_name, "Cy");
    }

    #[test]
    fn candidates_with_non_positive_score_are_never_matched() {
        let bots = vec![bot("b1", vec!["os:linux"])];
        let candidates = vec![candidate("Cx", 0.0, vec!["os:linux"])];
        let config = SchedulerConfig::default();

        let (matched, unmatched) = match_bots_to_candidates(candidates, &bots, &config);
        assert!(matched.is_empty());
        assert_eq!(unmatched.len(), 1);
    }

    #[test]
    fn per_task_spec_acceptance_cap_defers_excess_candidates() {
        let bots: Vec<BotInfo> = (0..4).map(|i| bot(&format!("b{i}"), vec!["os:linux"])).collect();
        let candidates: Vec<TaskCandidate> = (0..4).map(|i| candidate("Build", 10.0 - i as f64, vec!["os:linux"])).collect();
        let mut config = SchedulerConfig::default();
        config.max_txn_docs = 4; // sched_limit_per_task_spec() == 2

        let (matched, unmatched) = match_bots_to_candidates(candidates, &bots, &config);
        assert_eq!(matched.len(), 2);
        assert_eq!(unmatched.len(), 2);
    }
}
