//! Stage engine: decides whether a backlog item's current stage can
//! advance, based on the satisfaction state of its gate criteria and each
//! criterion's policy.

use taskbroker_db::models::GatePolicy;

/// Whether one criterion is currently satisfied.
#[derive(Debug, Clone, Copy)]
pub struct CriterionState {
    pub policy: GatePolicy,
    pub satisfied: bool,
}

/// What the stage engine decided to do about a backlog item's stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    /// All criteria satisfied, move to the next stage.
    Advance,
    /// All criteria for the terminal stage satisfied, the item is done.
    Complete,
    /// At least one unsatisfied criterion requires a human decision.
    HumanRequired,
    /// Criteria remain unsatisfied but none require a human; wait.
    Hold,
}

/// Evaluate a stage's criteria and decide the next action.
///
/// `is_terminal_stage` distinguishes "advance to the next stage" from
/// "this was the last stage, mark the item done".
pub fn evaluate_stage(criteria: &[CriterionState], is_terminal_stage: bool) -> StageAction {
    let unsatisfied: Vec<&CriterionState> = criteria.iter().filter(|c| !c.satisfied).collect();

    if unsatisfied.is_empty() {
        return if is_terminal_stage {
            StageAction::Complete
        } else {
            StageAction::Advance
        };
    }

    let needs_human = unsatisfied
        .iter()
        .any(|c| matches!(c.policy, GatePolicy::HumanReview | GatePolicy::HumanApprove));

    if needs_human {
        StageAction::HumanRequired
    } else {
        StageAction::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_satisfied_advances() {
        let criteria = [CriterionState {
            policy: GatePolicy::Auto,
            satisfied: true,
        }];
        assert_eq!(evaluate_stage(&criteria, false), StageAction::Advance);
    }

    #[test]
    fn all_satisfied_on_terminal_stage_completes() {
        let criteria = [CriterionState {
            policy: GatePolicy::Auto,
            satisfied: true,
        }];
        assert_eq!(evaluate_stage(&criteria, true), StageAction::Complete);
    }

    #[test]
    fn unsatisfied_auto_criterion_holds() {
        let criteria = [CriterionState {
            policy: GatePolicy::Auto,
            satisfied: false,
        }];
        assert_eq!(evaluate_stage(&criteria, false), StageAction::Hold);
    }

    #[test]
    fn unsatisfied_human_review_requires_human() {
        let criteria = [
            CriterionState {
                policy: GatePolicy::Auto,
                satisfied: true,
            },
            CriterionState {
                policy: GatePolicy::HumanApprove,
                satisfied: false,
            },
        ];
        assert_eq!(evaluate_stage(&criteria, false), StageAction::HumanRequired);
    }

    #[test]
    fn no_criteria_advances() {
        assert_eq!(evaluate_stage(&[], false), StageAction::Advance);
    }
}
