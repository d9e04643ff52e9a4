use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::FromRow;
use uuid::Uuid;

/// An enum that failed to parse from its wire/storage representation.
#[derive(Debug, thiserror::Error)]
#[error("invalid {type_name}: {value:?}")]
pub struct ParseEnumError {
    type_name: &'static str,
    value: String,
}

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $repr:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[sqlx(type_name = "text")]
        #[sqlx(rename_all = "snake_case")]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $(Self::$variant => $repr),+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        type_name: stringify!($name),
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

wire_enum!(TaskStatus {
    Pending => "pending",
    Assigned => "assigned",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    TimedOut => "timed_out",
});

wire_enum!(OversightLevel {
    Autonomous => "autonomous",
    Notify => "notify",
    Review => "review",
    Approve => "approve",
    Supervise => "supervise",
});

wire_enum!(ModelTier {
    Economy => "economy",
    Standard => "standard",
    Premium => "premium",
});

wire_enum!(RoutingMethod {
    ColdStart => "cold_start",
    Learned => "learned",
});

wire_enum!(Runtime {
    Picoclaw => "picoclaw",
    Openclaw => "openclaw",
});

wire_enum!(TaskSource {
    Manual => "manual",
    Backlog => "backlog",
    Discovery => "discovery",
});

wire_enum!(ItemType {
    Epic => "epic",
    Feature => "feature",
    Story => "story",
    Chore => "chore",
    Bug => "bug",
});

wire_enum!(BacklogStatus {
    Backlog => "backlog",
    Ready => "ready",
    InDiscovery => "in_discovery",
    Planned => "planned",
    InProgress => "in_progress",
    Review => "review",
    Done => "done",
    Blocked => "blocked",
    Park => "park",
    Cancelled => "cancelled",
});

wire_enum!(ScoresSource {
    Manual => "manual",
    Discovery => "discovery",
});

wire_enum!(BacklogSource {
    Manual => "manual",
    Discovery => "discovery",
});

wire_enum!(GatePolicy {
    Auto => "auto",
    HumanReview => "human_review",
    HumanApprove => "human_approve",
});

/// A unit of work dispatched to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub owner: String,
    pub required_capabilities: Vec<String>,
    pub status: TaskStatus,
    pub assigned_agent: String,

    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    pub result: Option<Json>,
    pub error: Option<String>,

    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_eligible: bool,
    pub timeout_seconds: i32,

    pub priority: i16,
    pub source: TaskSource,
    pub parent_task_id: Option<Uuid>,
    pub metadata: Json,

    pub risk_score: Option<f32>,
    pub complexity_score: Option<f32>,
    pub verifiability_score: Option<f32>,
    pub reversibility_score: Option<f32>,
    pub uncertainty_score: Option<f32>,
    pub contextuality_score: Option<f32>,
    pub subjectivity_score: Option<f32>,
    pub cost_estimate_tokens: Option<i64>,
    pub cost_estimate_usd: Option<f64>,
    pub oversight_level: Option<OversightLevel>,
    pub fast_path: bool,
    pub scoring_factors: Option<Json>,
    pub scoring_version: i32,
    pub pareto_frontier: Option<Json>,

    pub labels: Vec<String>,
    pub file_patterns: Vec<String>,
    pub one_way_door: bool,
    pub model_tier: Option<ModelTier>,
    pub recommended_model: Option<String>,
    pub routing_method: Option<RoutingMethod>,
    pub runtime: Option<Runtime>,
}

/// An append-only record of something that happened to a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub event: String,
    pub agent_id: Option<String>,
    pub payload: Json,
    pub created_at: DateTime<Utc>,
}

/// A node in the discovery-fed backlog hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacklogItem {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub item_type: ItemType,
    pub status: BacklogStatus,
    pub domain: String,
    pub assigned_to: Option<String>,
    pub parent_id: Option<Uuid>,

    pub impact: Option<f32>,
    pub urgency: Option<f32>,
    pub estimated_tokens: Option<f64>,
    pub effort_estimate: Option<f64>,
    pub priority_score: Option<f32>,
    pub scores_source: ScoresSource,

    pub model_tier: Option<ModelTier>,
    pub labels: Vec<String>,
    pub one_way_door: bool,

    pub stage_template: Vec<String>,
    pub current_stage: Option<String>,
    pub stage_index: i32,

    pub discovery_assessment: Option<Json>,
    pub source: BacklogSource,
    pub task_id: Option<Uuid>,
    pub pr_url: Option<String>,
    pub branch_name: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Json,
}

/// A directed "depends on" edge between two backlog items. `blocked_id`
/// cannot advance while any edge pointing at it has `resolved_at = NULL`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacklogDependency {
    pub id: Uuid,
    pub blocked_id: Uuid,
    pub blocker_id: Uuid,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A single criterion that must be satisfied before a backlog item's
/// stage can advance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StageGateCriterion {
    pub id: Uuid,
    pub item_id: Uuid,
    pub stage: String,
    pub criterion: String,
    pub policy: GatePolicy,
    pub satisfied: bool,
    pub satisfied_at: Option<DateTime<Utc>>,
    pub satisfied_by: Option<String>,
    pub evidence: Option<String>,
    pub evidence_submitted_by: Option<String>,
    pub evidence_submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A recorded change of oversight level for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutonomyEvent {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub previous_level: Option<String>,
    pub new_level: String,
    pub reason: String,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The single row of broker-wide autonomy defaults. Per-tier autonomy
/// (§3.6) is scoped down to the economy tier here — see DESIGN.md — since
/// it's the only tier the stage engine currently auto-approves.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutonomyConfig {
    pub id: i16,
    pub default_oversight_level: OversightLevel,
    pub thresholds: Json,
    pub auto_approve_economy: bool,
    pub consecutive_approvals: i32,
    pub consecutive_corrections: i32,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

/// A completed task's outcome as attributed to the agent that ran it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentTaskHistory {
    pub id: Uuid,
    pub agent_slug: String,
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub success: bool,
}

/// A learned trust score for one agent in one category/severity bucket.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentTrust {
    pub agent_slug: String,
    pub category: String,
    pub severity: String,
    pub score: f32,
}

/// Admin-controlled per-agent dispatch override (the drain set).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DispatchOverride {
    pub agent_id: String,
    pub drained: bool,
    pub reason: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::TimedOut,
        ] {
            let text = s.to_string();
            assert_eq!(TaskStatus::from_str(&text).unwrap(), s);
        }
    }

    #[test]
    fn backlog_status_round_trips() {
        for s in [
            BacklogStatus::Backlog,
            BacklogStatus::Ready,
            BacklogStatus::InDiscovery,
            BacklogStatus::Planned,
            BacklogStatus::InProgress,
            BacklogStatus::Review,
            BacklogStatus::Done,
            BacklogStatus::Blocked,
            BacklogStatus::Park,
            BacklogStatus::Cancelled,
        ] {
            let text = s.to_string();
            assert_eq!(BacklogStatus::from_str(&text).unwrap(), s);
        }
    }

    #[test]
    fn unknown_variant_is_an_error() {
        assert!(TaskStatus::from_str("bogus").is_err());
    }
}
