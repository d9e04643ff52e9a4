//! Assignment scoring: an 11-factor, weighted, pure function that ranks
//! one candidate agent against one task. No I/O, no async — callable
//! directly from unit tests and from the broker's tick loop alike.

use serde::Serialize;
use taskbroker_db::models::OversightLevel;

use crate::config::ScoringWeights;

/// An agent's observed readiness, as reported by the runtime directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Ready,
    Sleeping,
    Busy,
    Other,
}

/// Everything the scoring engine needs to know about one candidate.
#[derive(Debug, Clone)]
pub struct CandidateContext {
    pub capabilities: Vec<String>,
    pub availability: Availability,
    pub active_tasks: i64,
    pub max_concurrent: i64,
    pub trust: Option<f32>,
    pub avg_cost_usd: Option<f64>,
    pub avg_duration_seconds: Option<f64>,
}

/// The subset of a task's scoring payload the engine reads. All fields
/// default to 0.5 when absent, per the factor definitions below.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskProfile {
    pub risk: Option<f32>,
    pub complexity: Option<f32>,
    pub verifiability: Option<f32>,
    pub reversibility: Option<f32>,
    pub uncertainty: Option<f32>,
    pub contextuality: Option<f32>,
    pub subjectivity: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Factor {
    pub name: &'static str,
    pub score: f32,
    pub weight: f32,
    pub weighted: f32,
    pub available: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringOutput {
    pub total_score: f32,
    pub eligible: bool,
    pub factors: Vec<Factor>,
}

fn breadth(capability_count: usize) -> f32 {
    (capability_count as f32 / 5.0).min(1.0)
}

fn capability_factor(candidate_caps: &[String], required: &[String]) -> (f32, bool, &'static str) {
    if required.is_empty() {
        return (1.0, true, "no required capabilities");
    }
    let have: std::collections::HashSet<String> = candidate_caps.iter().map(|c| c.to_lowercase()).collect();
    let covers = required.iter().all(|r| have.contains(&r.to_lowercase()));
    if covers {
        (1.0, true, "persona covers all required capabilities")
    } else {
        (0.0, true, "persona is missing a required capability")
    }
}

fn availability_factor(availability: Availability, active: i64, max_concurrent: i64) -> (f32, bool, &'static str) {
    match availability {
        Availability::Ready => (1.0, true, "ready"),
        Availability::Sleeping => (0.6, true, "sleeping"),
        Availability::Busy if active >= max_concurrent => (0.0, true, "at max concurrency"),
        Availability::Busy => {
            let score = (1.0 - active as f32 / max_concurrent.max(1) as f32).max(0.1);
            (score, true, "busy, below max concurrency")
        }
        Availability::Other => (0.0, true, "not available"),
    }
}

fn risk_fit_factor(trust: Option<f32>, risk: Option<f32>) -> (f32, bool, &'static str) {
    let available = trust.is_some() && risk.is_some();
    let trust = trust.unwrap_or(0.5).clamp(0.0, 1.0);
    let risk = risk.unwrap_or(0.5).clamp(0.0, 1.0);
    ((trust * (1.0 - 0.5 * risk)).clamp(0.0, 1.0), available, "trust discounted by task risk")
}

fn cost_efficiency_factor(avg_cost_usd: Option<f64>) -> (f32, bool, &'static str) {
    match avg_cost_usd {
        Some(cost) => ((1.0 - cost as f32).clamp(0.1, 1.0), true, "agent's average cost per task"),
        None => (0.5, false, "no cost history"),
    }
}

fn passthrough_factor(value: Option<f32>, reason: &'static str, missing: &'static str) -> (f32, bool, &'static str) {
    match value {
        Some(v) => (v.clamp(0.0, 1.0), true, reason),
        None => (0.5, false, missing),
    }
}

fn dimension_fit_factor(dimension: Option<f32>, breadth: f32, reason: &'static str, missing: &'static str) -> (f32, bool, &'static str) {
    match dimension {
        Some(d) => {
            let d = d.clamp(0.0, 1.0);
            ((1.0 - d * (1.0 - breadth)).clamp(0.0, 1.0), true, reason)
        }
        None => ((1.0 - 0.5 * (1.0 - breadth)).clamp(0.0, 1.0), false, missing),
    }
}

fn duration_fit_factor(avg_duration_seconds: Option<f64>) -> (f32, bool, &'static str) {
    match avg_duration_seconds {
        Some(seconds) => ((1.0 - (seconds / 300.0) as f32).clamp(0.1, 1.0), true, "agent's average task duration"),
        None => (0.5, false, "no duration history"),
    }
}

/// Score one candidate against one task. Ineligible candidates (no
/// required capability, or unavailable) get `total_score = 0` but every
/// factor is still computed and returned for diagnostics.
pub fn score(candidate: &CandidateContext, task: &TaskProfile, required_capabilities: &[String], weights: &ScoringWeights) -> ScoringOutput {
    let breadth = breadth(candidate.capabilities.len());

    let (capability_score, capability_avail, capability_reason) = capability_factor(&candidate.capabilities, required_capabilities);
    let (availability_score, availability_avail, availability_reason) =
        availability_factor(candidate.availability, candidate.active_tasks, candidate.max_concurrent);
    let (risk_fit_score, risk_fit_avail, risk_fit_reason) = risk_fit_factor(candidate.trust, task.risk);
    let (cost_score, cost_avail, cost_reason) = cost_efficiency_factor(candidate.avg_cost_usd);
    let (verifiability_score, verifiability_avail, verifiability_reason) =
        passthrough_factor(task.verifiability, "task verifiability", "task verifiability unavailable");
    let (reversibility_score, reversibility_avail, reversibility_reason) =
        passthrough_factor(task.reversibility, "task reversibility", "task reversibility unavailable");
    let (contextuality_score, contextuality_avail, contextuality_reason) =
        passthrough_factor(task.contextuality, "task contextuality", "task contextuality unavailable");
    let (subjectivity_score, subjectivity_avail, subjectivity_reason) =
        passthrough_factor(task.subjectivity, "task subjectivity", "task subjectivity unavailable");
    let (complexity_fit_score, complexity_fit_avail, complexity_fit_reason) =
        dimension_fit_factor(task.complexity, breadth, "complexity weighed against capability breadth", "task complexity unavailable");
    let (uncertainty_fit_score, uncertainty_fit_avail, uncertainty_fit_reason) =
        dimension_fit_factor(task.uncertainty, breadth, "uncertainty weighed against capability breadth", "task uncertainty unavailable");
    let (duration_fit_score, duration_fit_avail, duration_fit_reason) = duration_fit_factor(candidate.avg_duration_seconds);

    let factors = vec![
        Factor { name: "capability", score: capability_score, weight: weights.capability, weighted: capability_score * weights.capability, available: capability_avail, reason: capability_reason.to_owned() },
        Factor { name: "availability", score: availability_score, weight: weights.availability, weighted: availability_score * weights.availability, available: availability_avail, reason: availability_reason.to_owned() },
        Factor { name: "risk_fit", score: risk_fit_score, weight: weights.risk_fit, weighted: risk_fit_score * weights.risk_fit, available: risk_fit_avail, reason: risk_fit_reason.to_owned() },
        Factor { name: "cost_efficiency", score: cost_score, weight: weights.cost_efficiency, weighted: cost_score * weights.cost_efficiency, available: cost_avail, reason: cost_reason.to_owned() },
        Factor { name: "verifiability", score: verifiability_score, weight: weights.verifiability, weighted: verifiability_score * weights.verifiability, available: verifiability_avail, reason: verifiability_reason.to_owned() },
        Factor { name: "reversibility", score: reversibility_score, weight: weights.reversibility, weighted: reversibility_score * weights.reversibility, available: reversibility_avail, reason: reversibility_reason.to_owned() },
        Factor { name: "complexity_fit", score: complexity_fit_score, weight: weights.complexity_fit, weighted: complexity_fit_score * weights.complexity_fit, available: complexity_fit_avail, reason: complexity_fit_reason.to_owned() },
        Factor { name: "uncertainty_fit", score: uncertainty_fit_score, weight: weights.uncertainty_fit, weighted: uncertainty_fit_score * weights.uncertainty_fit, available: uncertainty_fit_avail, reason: uncertainty_fit_reason.to_owned() },
        Factor { name: "duration_fit", score: duration_fit_score, weight: weights.duration_fit, weighted: duration_fit_score * weights.duration_fit, available: duration_fit_avail, reason: duration_fit_reason.to_owned() },
        Factor { name: "contextuality", score: contextuality_score, weight: weights.contextuality, weighted: contextuality_score * weights.contextuality, available: contextuality_avail, reason: contextuality_reason.to_owned() },
        Factor { name: "subjectivity", score: subjectivity_score, weight: weights.subjectivity, weighted: subjectivity_score * weights.subjectivity, available: subjectivity_avail, reason: subjectivity_reason.to_owned() },
    ];

    let eligible = capability_score > 0.0 && availability_score > 0.0;
    let total_score = if eligible {
        factors.iter().map(|f| f.weighted).sum()
    } else {
        0.0
    };

    ScoringOutput { total_score, eligible, factors }
}

/// `complexity < 0.2 ∧ risk < 0.3 ∧ reversibility > 0.7`. Advisory only:
/// it doesn't change the assignment decision, just what gets recorded.
pub fn fast_path(task: &TaskProfile) -> bool {
    let complexity = task.complexity.unwrap_or(0.5);
    let risk = task.risk.unwrap_or(0.5);
    let reversibility = task.reversibility.unwrap_or(0.5);
    complexity < 0.2 && risk < 0.3 && reversibility > 0.7
}

/// Bucket of `0.35·risk + 0.25·(1−verifiability) + 0.25·(1−reversibility) + 0.15·(1−trust)`.
pub fn oversight_level(task: &TaskProfile, trust: Option<f32>) -> OversightLevel {
    let risk = task.risk.unwrap_or(0.5);
    let verifiability = task.verifiability.unwrap_or(0.5);
    let reversibility = task.reversibility.unwrap_or(0.5);
    let trust = trust.unwrap_or(0.5);

    let composite = 0.35 * risk + 0.25 * (1.0 - verifiability) + 0.25 * (1.0 - reversibility) + 0.15 * (1.0 - trust);
    match composite {
        c if c < 0.2 => OversightLevel::Autonomous,
        c if c < 0.4 => OversightLevel::Notify,
        c if c < 0.6 => OversightLevel::Review,
        c if c < 0.8 => OversightLevel::Approve,
        _ => OversightLevel::Supervise,
    }
}

/// A candidate's position on the four Pareto axes for a given task.
#[derive(Debug, Clone, Copy)]
pub struct ParetoPoint {
    pub speed: f32,
    pub cost: f32,
    pub quality: f32,
    pub risk: f32,
}

fn dominates(a: &ParetoPoint, b: &ParetoPoint) -> bool {
    let at_least_as_good = a.speed >= b.speed && a.cost >= b.cost && a.quality >= b.quality && a.risk <= b.risk;
    let strictly_better = a.speed > b.speed || a.cost > b.cost || a.quality > b.quality || a.risk < b.risk;
    at_least_as_good && strictly_better
}

/// Indices of the non-dominated points (the Pareto frontier).
pub fn pareto_frontier(points: &[ParetoPoint]) -> Vec<usize> {
    (0..points.len())
        .filter(|&i| !(0..points.len()).any(|j| j != i && dominates(&points[j], &points[i])))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_candidate() -> CandidateContext {
        CandidateContext {
            capabilities: vec!["rust".into(), "review".into()],
            availability: Availability::Ready,
            active_tasks: 0,
            max_concurrent: 3,
            trust: Some(0.8),
            avg_cost_usd: Some(0.10),
            avg_duration_seconds: Some(60.0),
        }
    }

    #[test]
    fn missing_capability_is_ineligible_with_zero_total() {
        let candidate = ready_candidate();
        let weights = ScoringWeights::default();
        let out = score(&candidate, &TaskProfile::default(), &["terraform".into()], &weights);
        assert!(!out.eligible);
        assert_eq!(out.total_score, 0.0);
        let capability = out.factors.iter().find(|f| f.name == "capability").unwrap();
        assert_eq!(capability.score, 0.0);
    }

    #[test]
    fn busy_at_max_concurrency_is_ineligible() {
        let mut candidate = ready_candidate();
        candidate.availability = Availability::Busy;
        candidate.active_tasks = 3;
        let weights = ScoringWeights::default();
        let out = score(&candidate, &TaskProfile::default(), &[], &weights);
        assert!(!out.eligible);
    }

    #[test]
    fn sleeping_candidate_is_eligible_but_scores_lower_than_ready() {
        let mut sleeping = ready_candidate();
        sleeping.availability = Availability::Sleeping;
        let ready = ready_candidate();
        let weights = ScoringWeights::default();
        let sleeping_out = score(&sleeping, &TaskProfile::default(), &[], &weights);
        let ready_out = score(&ready, &TaskProfile::default(), &[], &weights);
        assert!(sleeping_out.eligible);
        assert!(ready_out.total_score > sleeping_out.total_score);
    }

    #[test]
    fn empty_required_capabilities_are_always_satisfied() {
        let candidate = ready_candidate();
        let weights = ScoringWeights::default();
        let out = score(&candidate, &TaskProfile::default(), &[], &weights);
        assert!(out.eligible);
    }

    #[test]
    fn unavailable_task_fields_default_to_half_and_are_marked_unavailable() {
        let candidate = ready_candidate();
        let weights = ScoringWeights::default();
        let out = score(&candidate, &TaskProfile::default(), &[], &weights);
        let verifiability = out.factors.iter().find(|f| f.name == "verifiability").unwrap();
        assert_eq!(verifiability.score, 0.5);
        assert!(!verifiability.available);
    }

    #[test]
    fn default_task_profile_does_not_trigger_fast_path() {
        assert!(!fast_path(&TaskProfile::default()));
    }

    #[test]
    fn low_risk_reversible_task_triggers_fast_path() {
        let task = TaskProfile {
            complexity: Some(0.1),
            risk: Some(0.1),
            reversibility: Some(0.9),
            ..Default::default()
        };
        assert!(fast_path(&task));
    }

    #[test]
    fn oversight_bucket_boundaries() {
        let low = TaskProfile { risk: Some(0.0), verifiability: Some(1.0), reversibility: Some(1.0), ..Default::default() };
        assert_eq!(oversight_level(&low, Some(1.0)), OversightLevel::Autonomous);

        let high = TaskProfile { risk: Some(1.0), verifiability: Some(0.0), reversibility: Some(0.0), ..Default::default() };
        assert_eq!(oversight_level(&high, Some(0.0)), OversightLevel::Supervise);
    }

    #[test]
    fn pareto_frontier_excludes_strictly_dominated_points() {
        let points = [
            ParetoPoint { speed: 0.9, cost: 0.9, quality: 0.9, risk: 0.1 },
            ParetoPoint { speed: 0.5, cost: 0.5, quality: 0.5, risk: 0.5 },
            ParetoPoint { speed: 0.2, cost: 0.9, quality: 0.2, risk: 0.8 },
        ];
        let frontier = pareto_frontier(&points);
        assert!(frontier.contains(&0));
        assert!(!frontier.contains(&1));
    }
}
