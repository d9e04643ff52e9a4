use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    AutonomyConfig, BacklogDependency, BacklogItem, DispatchOverride, StageGateCriterion, Task, TaskEvent,
};
use crate::queries;
use crate::queries::backlog::NewBacklogItem;
use crate::queries::discovery::{DiscoveryOutcome, ScoreFn, TierFn};
use crate::queries::stats::BrokerStats;
use crate::queries::tasks::NewTask;

/// The persistence surface the broker and the HTTP admission layer depend
/// on. Abstracted behind a trait so that tests can swap in an in-memory
/// implementation without a running Postgres instance.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, new: &NewTask) -> Result<Task>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn next_pending_for_agent(&self, capabilities: &[String], limit: i64) -> Result<Vec<Task>>;
    /// Every pending task regardless of capability, for callers (the
    /// assignment tick, the task-listing endpoint) that do their own
    /// capability matching downstream.
    async fn list_pending(&self, limit: i64) -> Result<Vec<Task>>;
    async fn assign_task(&self, id: Uuid, agent_id: &str) -> Result<bool>;
    async fn mark_started(&self, id: Uuid, agent_id: &str) -> Result<bool>;
    async fn mark_completed(&self, id: Uuid, result: &Json) -> Result<bool>;
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool>;
    async fn find_timed_out(&self) -> Result<Vec<Task>>;
    async fn requeue_for_retry(&self, id: Uuid) -> Result<bool>;
    async fn mark_timed_out(&self, id: Uuid) -> Result<bool>;

    #[allow(clippy::too_many_arguments)]
    async fn set_scoring(
        &self,
        id: Uuid,
        oversight_level: &str,
        risk: f32,
        complexity: f32,
        verifiability: f32,
        reversibility: f32,
        uncertainty: f32,
        contextuality: f32,
        subjectivity: f32,
        cost_tokens: i64,
        cost_usd: f64,
        fast_path: bool,
        factors: &Json,
    ) -> Result<()>;
    async fn set_routing(
        &self,
        id: Uuid,
        model_tier: &str,
        recommended_model: &str,
        routing_method: &str,
        runtime: &str,
    ) -> Result<()>;

    async fn record_event(
        &self,
        task_id: Uuid,
        event: &str,
        agent_id: Option<&str>,
        payload: &Json,
    ) -> Result<()>;

    async fn history_for_task(&self, task_id: Uuid) -> Result<Vec<TaskEvent>>;

    /// An agent's currently assigned/in-progress task count, for the
    /// scoring engine's availability factor.
    async fn agent_active_task_count(&self, agent_slug: &str) -> Result<i64>;
    /// An agent's trust averaged across categories, or `None` with no history.
    async fn agent_trust_overall(&self, agent_slug: &str) -> Result<Option<f32>>;
    async fn agent_avg_cost_usd(&self, agent_slug: &str, sample: i64) -> Result<Option<f64>>;
    async fn agent_avg_duration_seconds(&self, agent_slug: &str, sample: i64) -> Result<Option<f64>>;
    #[allow(clippy::too_many_arguments)]
    async fn record_agent_history(
        &self,
        agent_slug: &str,
        task_id: Uuid,
        started_at: chrono::DateTime<chrono::Utc>,
        completed_at: chrono::DateTime<chrono::Utc>,
        duration_seconds: f64,
        tokens_used: i64,
        cost_usd: f64,
        success: bool,
    ) -> Result<()>;

    async fn create_backlog_item(&self, new: &NewBacklogItem) -> Result<BacklogItem>;
    async fn get_backlog_item(&self, id: Uuid) -> Result<Option<BacklogItem>>;
    async fn ready_backlog_items(&self, limit: i64) -> Result<Vec<BacklogItem>>;
    async fn set_backlog_status(&self, id: Uuid, status: &str) -> Result<bool>;
    async fn link_backlog_task(&self, id: Uuid, task_id: Uuid) -> Result<()>;
    async fn set_manual_scores(&self, id: Uuid, impact: f32, urgency: f32, priority_score: f32) -> Result<()>;
    async fn set_stage(
        &self,
        id: Uuid,
        stage_template: &[String],
        current_stage: Option<&str>,
        stage_index: i32,
    ) -> Result<BacklogItem>;
    async fn init_stages(&self, id: Uuid, template: &[String]) -> Result<BacklogItem>;
    async fn median_estimated_tokens(&self) -> Result<Option<f64>>;

    async fn add_dependency(&self, blocked_id: Uuid, blocker_id: Uuid) -> Result<()>;
    async fn dependencies_of(&self, blocked_id: Uuid) -> Result<Vec<BacklogDependency>>;
    async fn has_unresolved_blockers(&self, blocked_id: Uuid) -> Result<bool>;
    async fn resolve_all_for_blocker(&self, blocker_id: Uuid) -> Result<u64>;

    async fn apply_discovery_outcome(
        &self,
        outcome: &DiscoveryOutcome,
        score_fn: &ScoreFn,
        tier_fn: &TierFn,
    ) -> Result<(BacklogItem, Vec<Task>)>;

    async fn add_gate_criterion(
        &self,
        item_id: Uuid,
        stage: &str,
        criterion: &str,
        policy: &str,
    ) -> Result<StageGateCriterion>;
    async fn create_criteria_if_absent(
        &self,
        item_id: Uuid,
        stage: &str,
        criteria: &[(String, String)],
    ) -> Result<Vec<StageGateCriterion>>;
    async fn criteria_for_stage(&self, item_id: Uuid, stage: &str) -> Result<Vec<StageGateCriterion>>;
    async fn get_gate_criterion(&self, id: Uuid) -> Result<Option<StageGateCriterion>>;
    async fn satisfy_gate_criterion(&self, id: Uuid, satisfied_by: &str) -> Result<bool>;
    async fn satisfy_gate_criterion_by_name(
        &self,
        item_id: Uuid,
        stage: &str,
        name_fragment: &str,
        satisfied_by: &str,
    ) -> Result<bool>;
    async fn satisfy_all_gate_criteria(&self, item_id: Uuid, stage: &str, satisfied_by: &str) -> Result<u64>;
    async fn all_gate_criteria_met(&self, item_id: Uuid, stage: &str) -> Result<bool>;
    async fn submit_gate_evidence(&self, id: Uuid, evidence: &str, submitted_by: &str) -> Result<bool>;
    async fn reset_stage_to_active(&self, item_id: Uuid, stage: &str) -> Result<u64>;

    async fn autonomy_config(&self) -> Result<AutonomyConfig>;
    async fn set_default_oversight(&self, level: &str, actor: &str) -> Result<()>;
    async fn apply_autonomy_feedback(&self, approved: bool) -> Result<AutonomyConfig>;
    async fn set_drained(&self, agent_id: &str, reason: &str, actor: &str) -> Result<()>;
    async fn clear_drained(&self, agent_id: &str, actor: &str) -> Result<()>;
    async fn drained_agents(&self) -> Result<Vec<DispatchOverride>>;

    async fn stats(&self) -> Result<BrokerStats>;
}

const _: () = {
    fn assert_object_safe(_: &dyn Store) {}
};

/// The production `Store` implementation, backed by a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_task(&self, new: &NewTask) -> Result<Task> {
        queries::tasks::create_task(&self.pool, new).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        queries::tasks::get_task(&self.pool, id).await
    }

    async fn next_pending_for_agent(&self, capabilities: &[String], limit: i64) -> Result<Vec<Task>> {
        queries::tasks::next_pending_for_agent(&self.pool, capabilities, limit).await
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Task>> {
        queries::tasks::list_pending(&self.pool, limit).await
    }

    async fn assign_task(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        queries::tasks::assign_task(&self.pool, id, agent_id).await
    }

    async fn mark_started(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        queries::tasks::mark_started(&self.pool, id, agent_id).await
    }

    async fn mark_completed(&self, id: Uuid, result: &Json) -> Result<bool> {
        queries::tasks::mark_completed(&self.pool, id, result).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        queries::tasks::mark_failed(&self.pool, id, error).await
    }

    async fn find_timed_out(&self) -> Result<Vec<Task>> {
        queries::tasks::find_timed_out(&self.pool).await
    }

    async fn requeue_for_retry(&self, id: Uuid) -> Result<bool> {
        queries::tasks::requeue_for_retry(&self.pool, id).await
    }

    async fn mark_timed_out(&self, id: Uuid) -> Result<bool> {
        queries::tasks::mark_timed_out(&self.pool, id).await
    }

    async fn set_scoring(
        &self,
        id: Uuid,
        oversight_level: &str,
        risk: f32,
        complexity: f32,
        verifiability: f32,
        reversibility: f32,
        uncertainty: f32,
        contextuality: f32,
        subjectivity: f32,
        cost_tokens: i64,
        cost_usd: f64,
        fast_path: bool,
        factors: &Json,
    ) -> Result<()> {
        queries::tasks::set_scoring(
            &self.pool,
            id,
            oversight_level,
            risk,
            complexity,
            verifiability,
            reversibility,
            uncertainty,
            contextuality,
            subjectivity,
            cost_tokens,
            cost_usd,
            fast_path,
            factors,
        )
        .await
    }

    async fn set_routing(
        &self,
        id: Uuid,
        model_tier: &str,
        recommended_model: &str,
        routing_method: &str,
        runtime: &str,
    ) -> Result<()> {
        queries::tasks::set_routing(&self.pool, id, model_tier, recommended_model, routing_method, runtime).await
    }

    async fn record_event(
        &self,
        task_id: Uuid,
        event: &str,
        agent_id: Option<&str>,
        payload: &Json,
    ) -> Result<()> {
        queries::task_events::record_event(&self.pool, task_id, event, agent_id, payload).await?;
        Ok(())
    }

    async fn history_for_task(&self, task_id: Uuid) -> Result<Vec<TaskEvent>> {
        queries::task_events::history_for_task(&self.pool, task_id).await
    }

    async fn agent_active_task_count(&self, agent_slug: &str) -> Result<i64> {
        queries::tasks::active_count_for_agent(&self.pool, agent_slug).await
    }

    async fn agent_trust_overall(&self, agent_slug: &str) -> Result<Option<f32>> {
        queries::trust::overall_score(&self.pool, agent_slug).await
    }

    async fn agent_avg_cost_usd(&self, agent_slug: &str, sample: i64) -> Result<Option<f64>> {
        queries::agent_history::avg_cost_usd(&self.pool, agent_slug, sample).await
    }

    async fn agent_avg_duration_seconds(&self, agent_slug: &str, sample: i64) -> Result<Option<f64>> {
        queries::agent_history::median_duration_seconds(&self.pool, agent_slug, sample).await
    }

    async fn record_agent_history(
        &self,
        agent_slug: &str,
        task_id: Uuid,
        started_at: chrono::DateTime<chrono::Utc>,
        completed_at: chrono::DateTime<chrono::Utc>,
        duration_seconds: f64,
        tokens_used: i64,
        cost_usd: f64,
        success: bool,
    ) -> Result<()> {
        queries::agent_history::record_history(
            &self.pool,
            agent_slug,
            task_id,
            started_at,
            completed_at,
            duration_seconds,
            tokens_used,
            cost_usd,
            success,
        )
        .await?;
        Ok(())
    }

    async fn create_backlog_item(&self, new: &NewBacklogItem) -> Result<BacklogItem> {
        queries::backlog::create_item(&self.pool, new).await
    }

    async fn get_backlog_item(&self, id: Uuid) -> Result<Option<BacklogItem>> {
        queries::backlog::get_item(&self.pool, id).await
    }

    async fn ready_backlog_items(&self, limit: i64) -> Result<Vec<BacklogItem>> {
        queries::backlog::ready_items(&self.pool, limit).await
    }

    async fn set_backlog_status(&self, id: Uuid, status: &str) -> Result<bool> {
        queries::backlog::set_status(&self.pool, id, status).await
    }

    async fn link_backlog_task(&self, id: Uuid, task_id: Uuid) -> Result<()> {
        queries::backlog::link_task(&self.pool, id, task_id).await
    }

    async fn set_manual_scores(&self, id: Uuid, impact: f32, urgency: f32, priority_score: f32) -> Result<()> {
        queries::backlog::set_manual_scores(&self.pool, id, impact, urgency, priority_score).await
    }

    async fn set_stage(
        &self,
        id: Uuid,
        stage_template: &[String],
        current_stage: Option<&str>,
        stage_index: i32,
    ) -> Result<BacklogItem> {
        queries::backlog::set_stage(&self.pool, id, stage_template, current_stage, stage_index).await
    }

    async fn init_stages(&self, id: Uuid, template: &[String]) -> Result<BacklogItem> {
        queries::stage_gates::init_stages(&self.pool, id, template).await
    }

    async fn median_estimated_tokens(&self) -> Result<Option<f64>> {
        queries::backlog::median_estimated_tokens(&self.pool).await
    }

    async fn add_dependency(&self, blocked_id: Uuid, blocker_id: Uuid) -> Result<()> {
        queries::dependencies::add_dependency(&self.pool, blocked_id, blocker_id).await?;
        Ok(())
    }

    async fn dependencies_of(&self, blocked_id: Uuid) -> Result<Vec<BacklogDependency>> {
        queries::dependencies::dependencies_of(&self.pool, blocked_id).await
    }

    async fn has_unresolved_blockers(&self, blocked_id: Uuid) -> Result<bool> {
        queries::dependencies::has_unresolved_blockers(&self.pool, blocked_id).await
    }

    async fn resolve_all_for_blocker(&self, blocker_id: Uuid) -> Result<u64> {
        queries::dependencies::resolve_all_for_blocker(&self.pool, blocker_id).await
    }

    async fn apply_discovery_outcome(
        &self,
        outcome: &DiscoveryOutcome,
        score_fn: &ScoreFn,
        tier_fn: &TierFn,
    ) -> Result<(BacklogItem, Vec<Task>)> {
        queries::discovery::apply_discovery_outcome(&self.pool, outcome, score_fn, tier_fn).await
    }

    async fn add_gate_criterion(
        &self,
        item_id: Uuid,
        stage: &str,
        criterion: &str,
        policy: &str,
    ) -> Result<StageGateCriterion> {
        queries::stage_gates::add_criterion(&self.pool, item_id, stage, criterion, policy).await
    }

    async fn create_criteria_if_absent(
        &self,
        item_id: Uuid,
        stage: &str,
        criteria: &[(String, String)],
    ) -> Result<Vec<StageGateCriterion>> {
        queries::stage_gates::create_criteria_if_absent(&self.pool, item_id, stage, criteria).await
    }

    async fn criteria_for_stage(&self, item_id: Uuid, stage: &str) -> Result<Vec<StageGateCriterion>> {
        queries::stage_gates::criteria_for_stage(&self.pool, item_id, stage).await
    }

    async fn get_gate_criterion(&self, id: Uuid) -> Result<Option<StageGateCriterion>> {
        queries::stage_gates::get_criterion(&self.pool, id).await
    }

    async fn satisfy_gate_criterion(&self, id: Uuid, satisfied_by: &str) -> Result<bool> {
        queries::stage_gates::satisfy_criterion(&self.pool, id, satisfied_by).await
    }

    async fn satisfy_gate_criterion_by_name(
        &self,
        item_id: Uuid,
        stage: &str,
        name_fragment: &str,
        satisfied_by: &str,
    ) -> Result<bool> {
        queries::stage_gates::satisfy_by_name(&self.pool, item_id, stage, name_fragment, satisfied_by).await
    }

    async fn satisfy_all_gate_criteria(&self, item_id: Uuid, stage: &str, satisfied_by: &str) -> Result<u64> {
        queries::stage_gates::satisfy_all(&self.pool, item_id, stage, satisfied_by).await
    }

    async fn all_gate_criteria_met(&self, item_id: Uuid, stage: &str) -> Result<bool> {
        queries::stage_gates::all_criteria_met(&self.pool, item_id, stage).await
    }

    async fn submit_gate_evidence(&self, id: Uuid, evidence: &str, submitted_by: &str) -> Result<bool> {
        queries::stage_gates::submit_evidence(&self.pool, id, evidence, submitted_by).await
    }

    async fn reset_stage_to_active(&self, item_id: Uuid, stage: &str) -> Result<u64> {
        queries::stage_gates::reset_stage_to_active(&self.pool, item_id, stage).await
    }

    async fn autonomy_config(&self) -> Result<AutonomyConfig> {
        queries::autonomy::get_config(&self.pool).await
    }

    async fn set_default_oversight(&self, level: &str, actor: &str) -> Result<()> {
        queries::autonomy::set_default_oversight(&self.pool, level, actor).await
    }

    async fn apply_autonomy_feedback(&self, approved: bool) -> Result<AutonomyConfig> {
        queries::autonomy::apply_autonomy_feedback(&self.pool, approved).await
    }

    async fn set_drained(&self, agent_id: &str, reason: &str, actor: &str) -> Result<()> {
        queries::autonomy::set_drained(&self.pool, agent_id, reason, actor).await
    }

    async fn clear_drained(&self, agent_id: &str, actor: &str) -> Result<()> {
        queries::autonomy::clear_drained(&self.pool, agent_id, actor).await
    }

    async fn drained_agents(&self) -> Result<Vec<DispatchOverride>> {
        queries::autonomy::drained_agents(&self.pool).await
    }

    async fn stats(&self) -> Result<BrokerStats> {
        queries::stats::summarize(&self.pool).await
    }
}
