//! Model-tier routing: picks an economy/standard/premium tier and a
//! recommended runtime for a task. Forced overrides (one-way doors, high
//! risk) take precedence over the learned scoring-engine route, which in
//! turn takes precedence over static cold-start rules.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use taskbroker_db::models::{ModelTier, Runtime, RoutingMethod};

/// A single cold-start rule. `labels`/`file_patterns` are AND-ed together
/// when non-empty; an empty vec means "don't constrain on this field".
/// `max_files` of 0 means no cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdStartRule {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub file_patterns: Vec<String>,
    #[serde(default)]
    pub max_files: u32,
    pub tier: ModelTier,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub tier: ModelTier,
    pub recommended_model: String,
    pub method: RoutingMethod,
    pub runtime: Runtime,
}

/// The subset of a task's fields the router needs. `complexity`, `risk`,
/// and `reversibility` double as the "is there learned data" signal: when
/// all three are `None` the router falls through to cold-start rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingInput<'a> {
    pub file_patterns: &'a [String],
    pub labels: &'a [String],
    pub one_way_door: bool,
    pub risk_score: Option<f32>,
    pub complexity_score: Option<f32>,
    pub reversibility_score: Option<f32>,
}

fn model_for_tier(tier: ModelTier) -> &'static str {
    match tier {
        ModelTier::Economy => "claude-haiku",
        ModelTier::Standard => "claude-sonnet",
        ModelTier::Premium => "claude-opus",
    }
}

fn runtime_for(tier: ModelTier, file_count: usize) -> Runtime {
    match tier {
        ModelTier::Economy => Runtime::Picoclaw,
        ModelTier::Standard if file_count <= 1 => Runtime::Picoclaw,
        ModelTier::Standard | ModelTier::Premium => Runtime::Openclaw,
    }
}

fn decision(tier: ModelTier, method: RoutingMethod, file_count: usize) -> RoutingDecision {
    RoutingDecision {
        tier,
        recommended_model: model_for_tier(tier).to_owned(),
        method,
        runtime: runtime_for(tier, file_count),
    }
}

fn rule_matches(rule: &ColdStartRule, input: &RoutingInput<'_>) -> bool {
    let label_ok = rule.labels.is_empty() || rule.labels.iter().any(|l| input.labels.contains(l));
    let patterns_ok = rule.file_patterns.is_empty()
        || input.file_patterns.iter().all(|fp| {
            rule.file_patterns
                .iter()
                .any(|glob_str| Pattern::new(glob_str).map(|pat| pat.matches(fp)).unwrap_or(false))
        });
    let count_ok = rule.max_files == 0 || input.file_patterns.len() as u32 <= rule.max_files;
    label_ok && patterns_ok && count_ok
}

fn cold_start_route(input: &RoutingInput<'_>, rules: &[ColdStartRule], default_tier: ModelTier) -> RoutingDecision {
    for rule in rules {
        if rule_matches(rule, input) {
            return decision(rule.tier, RoutingMethod::ColdStart, input.file_patterns.len());
        }
    }
    decision(default_tier, RoutingMethod::ColdStart, input.file_patterns.len())
}

fn learned_route(input: &RoutingInput<'_>) -> RoutingDecision {
    let complexity = input.complexity_score.unwrap_or(0.5);
    let risk = input.risk_score.unwrap_or(0.5);
    let reversibility = input.reversibility_score.unwrap_or(0.5);
    let score = 0.4 * complexity + 0.35 * risk + 0.25 * (1.0 - reversibility);
    let tier = if score < 0.3 {
        ModelTier::Economy
    } else if score < 0.6 {
        ModelTier::Standard
    } else {
        ModelTier::Premium
    };
    decision(tier, RoutingMethod::Learned, input.file_patterns.len())
}

/// Resolve a task's model tier per §4.5: forced overrides, then the
/// learned scoring-engine route when history is available, then
/// cold-start rules, then `default_tier`.
pub fn resolve_tier(
    input: &RoutingInput<'_>,
    routing_enabled: bool,
    rules: &[ColdStartRule],
    default_tier: ModelTier,
) -> RoutingDecision {
    if !routing_enabled {
        return decision(default_tier, RoutingMethod::ColdStart, input.file_patterns.len());
    }
    if input.one_way_door {
        return decision(ModelTier::Premium, RoutingMethod::ColdStart, input.file_patterns.len());
    }
    if input.risk_score.is_some_and(|r| r >= 0.8) {
        return decision(ModelTier::Premium, RoutingMethod::ColdStart, input.file_patterns.len());
    }
    let has_learned_data =
        input.complexity_score.is_some() || input.risk_score.is_some() || input.reversibility_score.is_some();
    if has_learned_data {
        return learned_route(input);
    }
    cold_start_route(input, rules, default_tier)
}
