//! Backlog prioritization: a 4-factor weighted score (business impact,
//! dependency readiness, urgency, cost efficiency) used to order `ready`
//! backlog items. Pure function, no I/O.

const WEIGHT_BUSINESS_IMPACT: f32 = 0.30;
const WEIGHT_DEPENDENCY_READINESS: f32 = 0.25;
const WEIGHT_URGENCY: f32 = 0.25;
const WEIGHT_COST_EFFICIENCY: f32 = 0.20;

/// Inputs are expected in `[0.0, 1.0]` where applicable. `estimated_tokens`
/// and `median_tokens` feed the cost-efficiency factor directly rather than
/// as a pre-normalized ratio, so the scorer can apply the spec's "missing
/// data defaults to 0.5" rule itself.
#[derive(Debug, Clone, Copy)]
pub struct BacklogScoringInput {
    pub impact: Option<f32>,
    pub urgency: Option<f32>,
    pub has_unresolved_blockers: bool,
    pub estimated_tokens: Option<f64>,
    pub median_tokens: Option<f64>,
}

fn cost_efficiency(estimated_tokens: Option<f64>, median_tokens: Option<f64>) -> f32 {
    match (estimated_tokens, median_tokens) {
        (Some(estimated), Some(median)) if median > 0.0 => {
            (1.0 - (estimated / median) as f32).clamp(0.0, 1.0)
        }
        _ => 0.5,
    }
}

/// Weighted sum of business impact, dependency readiness, urgency, and
/// cost efficiency.
pub fn score(input: &BacklogScoringInput) -> f32 {
    let business_impact = input.impact.unwrap_or(0.5).clamp(0.0, 1.0);
    let dependency_readiness = if input.has_unresolved_blockers { 0.0 } else { 1.0 };
    let urgency = input.urgency.unwrap_or(0.5).clamp(0.0, 1.0);
    let cost_efficiency = cost_efficiency(input.estimated_tokens, input.median_tokens);

    business_impact * WEIGHT_BUSINESS_IMPACT
        + dependency_readiness * WEIGHT_DEPENDENCY_READINESS
        + urgency * WEIGHT_URGENCY
        + cost_efficiency * WEIGHT_COST_EFFICIENCY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_blockers_zero_out_dependency_readiness() {
        let blocked = score(&BacklogScoringInput {
            impact: Some(0.9),
            urgency: Some(0.9),
            has_unresolved_blockers: true,
            estimated_tokens: None,
            median_tokens: None,
        });
        let unblocked = score(&BacklogScoringInput {
            impact: Some(0.9),
            urgency: Some(0.9),
            has_unresolved_blockers: false,
            estimated_tokens: None,
            median_tokens: None,
        });
        assert!(unblocked > blocked);
        assert!((unblocked - blocked - WEIGHT_DEPENDENCY_READINESS).abs() < 1e-6);
    }

    #[test]
    fn missing_impact_and_urgency_default_to_half() {
        let out = score(&BacklogScoringInput {
            impact: None,
            urgency: None,
            has_unresolved_blockers: false,
            estimated_tokens: None,
            median_tokens: None,
        });
        let expected = 0.5 * WEIGHT_BUSINESS_IMPACT + WEIGHT_DEPENDENCY_READINESS + 0.5 * WEIGHT_URGENCY + 0.5 * WEIGHT_COST_EFFICIENCY;
        assert!((out - expected).abs() < 1e-6);
    }

    #[test]
    fn zero_median_tokens_does_not_divide_by_zero() {
        let out = score(&BacklogScoringInput {
            impact: Some(0.5),
            urgency: Some(0.5),
            has_unresolved_blockers: false,
            estimated_tokens: Some(100.0),
            median_tokens: Some(0.0),
        });
        assert!(out.is_finite());
    }

    #[test]
    fn cheaper_than_median_scores_above_average() {
        let cheap = score(&BacklogScoringInput {
            impact: Some(0.5),
            urgency: Some(0.5),
            has_unresolved_blockers: false,
            estimated_tokens: Some(50.0),
            median_tokens: Some(200.0),
        });
        let expensive = score(&BacklogScoringInput {
            impact: Some(0.5),
            urgency: Some(0.5),
            has_unresolved_blockers: false,
            estimated_tokens: Some(400.0),
            median_tokens: Some(200.0),
        });
        assert!(cheap > expensive);
    }
}
