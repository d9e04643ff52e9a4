use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::models::{
    AgentTaskHistory, AutonomyConfig, BacklogDependency, BacklogItem, BacklogStatus, DispatchOverride,
    GatePolicy, OversightLevel, StageGateCriterion, Task, TaskEvent, TaskStatus,
};
use crate::queries::backlog::NewBacklogItem;
use crate::queries::discovery::{DiscoveryOutcome, ScoreFn, TierFn};
use crate::queries::stats::BrokerStats;
use crate::queries::tasks::NewTask;
use crate::store::Store;

/// An in-memory `Store` for unit tests that need broker logic exercised
/// without a running Postgres instance. Not used in production.
pub struct MemStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    events: Mutex<Vec<TaskEvent>>,
    backlog: Mutex<HashMap<Uuid, BacklogItem>>,
    deps: Mutex<Vec<BacklogDependency>>,
    gate_criteria: Mutex<HashMap<Uuid, StageGateCriterion>>,
    autonomy: Mutex<AutonomyConfig>,
    drained: Mutex<HashMap<String, DispatchOverride>>,
    agent_history: Mutex<Vec<AgentTaskHistory>>,
    trust: Mutex<HashMap<(String, String, String), f32>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            backlog: Mutex::new(HashMap::new()),
            deps: Mutex::new(Vec::new()),
            gate_criteria: Mutex::new(HashMap::new()),
            autonomy: Mutex::new(AutonomyConfig {
                id: 1,
                default_oversight_level: OversightLevel::Notify,
                thresholds: Json::Object(Default::default()),
                auto_approve_economy: false,
                consecutive_approvals: 0,
                consecutive_corrections: 0,
                updated_at: Utc::now(),
                updated_by: None,
            }),
            drained: Mutex::new(HashMap::new()),
            agent_history: Mutex::new(Vec::new()),
            trust: Mutex::new(HashMap::new()),
        }
    }
}

fn blank_task(new: &NewTask) -> Task {
    let now = Utc::now();
    Task {
        id: Uuid::new_v4(),
        title: new.title.clone(),
        description: new.description.clone(),
        owner: new.owner.clone(),
        required_capabilities: new.required_capabilities.clone(),
        status: TaskStatus::Pending,
        assigned_agent: String::new(),
        created_at: now,
        assigned_at: None,
        started_at: None,
        completed_at: None,
        updated_at: now,
        result: None,
        error: None,
        retry_count: 0,
        max_retries: new.max_retries,
        retry_eligible: true,
        timeout_seconds: new.timeout_seconds,
        priority: new.priority,
        source: new.source.parse().unwrap_or(crate::models::TaskSource::Manual),
        parent_task_id: new.parent_task_id,
        metadata: new.metadata.clone(),
        risk_score: None,
        complexity_score: None,
        verifiability_score: None,
        reversibility_score: None,
        uncertainty_score: None,
        contextuality_score: None,
        subjectivity_score: None,
        cost_estimate_tokens: None,
        cost_estimate_usd: None,
        oversight_level: None,
        fast_path: false,
        scoring_factors: None,
        scoring_version: 2,
        pareto_frontier: None,
        labels: new.labels.clone(),
        file_patterns: new.file_patterns.clone(),
        one_way_door: new.one_way_door,
        model_tier: None,
        recommended_model: None,
        routing_method: None,
        runtime: None,
    }
}

fn blank_backlog_item(new: &NewBacklogItem) -> Result<BacklogItem> {
    let now = Utc::now();
    let item_type = new
        .item_type
        .parse()
        .with_context(|| format!("invalid item_type {:?}", new.item_type))?;
    Ok(BacklogItem {
        id: Uuid::new_v4(),
        title: new.title.clone(),
        description: new.description.clone(),
        item_type,
        status: BacklogStatus::Backlog,
        domain: new.domain.clone(),
        assigned_to: new.assigned_to.clone(),
        parent_id: new.parent_id,
        impact: None,
        urgency: None,
        estimated_tokens: None,
        effort_estimate: None,
        priority_score: None,
        scores_source: crate::models::ScoresSource::Manual,
        model_tier: None,
        labels: new.labels.clone(),
        one_way_door: new.one_way_door,
        stage_template: Vec::new(),
        current_stage: None,
        stage_index: 0,
        discovery_assessment: None,
        source: crate::models::BacklogSource::Manual,
        task_id: None,
        pr_url: None,
        branch_name: None,
        created_at: now,
        updated_at: now,
        metadata: new.metadata.clone(),
    })
}

#[async_trait]
impl Store for MemStore {
    async fn create_task(&self, new: &NewTask) -> Result<Task> {
        let task = blank_task(new);
        self.tasks.lock().unwrap().insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn next_pending_for_agent(&self, capabilities: &[String], limit: i64) -> Result<Vec<Task>> {
        let mut matches: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.required_capabilities.iter().all(|c| capabilities.contains(c))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Task>> {
        let mut matches: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn assign_task(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Assigned;
                task.assigned_agent = agent_id.to_owned();
                task.assigned_at = Some(Utc::now());
                task.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_started(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            if task.status == TaskStatus::Assigned && task.assigned_agent == agent_id {
                task.status = TaskStatus::InProgress;
                task.started_at = Some(Utc::now());
                task.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_completed(&self, id: Uuid, result: &Json) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Completed;
                task.result = Some(result.clone());
                task.completed_at = Some(Utc::now());
                task.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            if matches!(task.status, TaskStatus::InProgress | TaskStatus::Assigned) {
                task.status = TaskStatus::Failed;
                task.error = Some(error.to_owned());
                task.retry_count += 1;
                task.completed_at = Some(Utc::now());
                task.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn find_timed_out(&self) -> Result<Vec<Task>> {
        let now = Utc::now();
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
                    && t.started_at
                        .or(t.assigned_at)
                        .map(|started| (now - started).num_seconds() > i64::from(t.timeout_seconds))
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn requeue_for_retry(&self, id: Uuid) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            if task.retry_eligible
                && task.retry_count < task.max_retries
                && matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress)
            {
                task.status = TaskStatus::Pending;
                task.assigned_agent.clear();
                task.assigned_at = None;
                task.started_at = None;
                task.error = None;
                task.retry_count += 1;
                task.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn mark_timed_out(&self, id: Uuid) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            if matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                task.status = TaskStatus::TimedOut;
                task.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

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
    ) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            task.oversight_level = oversight_level.parse().ok();
            task.risk_score = Some(risk);
            task.complexity_score = Some(complexity);
            task.verifiability_score = Some(verifiability);
            task.reversibility_score = Some(reversibility);
            task.uncertainty_score = Some(uncertainty);
            task.contextuality_score = Some(contextuality);
            task.subjectivity_score = Some(subjectivity);
            task.cost_estimate_tokens = Some(cost_tokens);
            task.cost_estimate_usd = Some(cost_usd);
            task.fast_path = fast_path;
            task.scoring_factors = Some(factors.clone());
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_routing(
        &self,
        id: Uuid,
        model_tier: &str,
        recommended_model: &str,
        routing_method: &str,
        runtime: &str,
    ) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(&id) {
            task.model_tier = model_tier.parse().ok();
            task.recommended_model = Some(recommended_model.to_owned());
            task.routing_method = routing_method.parse().ok();
            task.runtime = runtime.parse().ok();
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_event(
        &self,
        task_id: Uuid,
        event: &str,
        agent_id: Option<&str>,
        payload: &Json,
    ) -> Result<()> {
        self.events.lock().unwrap().push(TaskEvent {
            id: Uuid::new_v4(),
            task_id,
            event: event.to_owned(),
            agent_id: agent_id.map(str::to_owned),
            payload: payload.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn history_for_task(&self, task_id: Uuid) -> Result<Vec<TaskEvent>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn agent_active_task_count(&self, agent_slug: &str) -> Result<i64> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| {
                t.assigned_agent == agent_slug
                    && matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
            })
            .count() as i64)
    }

    async fn agent_trust_overall(&self, agent_slug: &str) -> Result<Option<f32>> {
        let trust = self.trust.lock().unwrap();
        let scores: Vec<f32> = trust
            .iter()
            .filter(|((slug, _, _), _)| slug == agent_slug)
            .map(|(_, score)| *score)
            .collect();
        if scores.is_empty() {
            return Ok(None);
        }
        Ok(Some(scores.iter().sum::<f32>() / scores.len() as f32))
    }

    async fn agent_avg_cost_usd(&self, agent_slug: &str, sample: i64) -> Result<Option<f64>> {
        let history = self.agent_history.lock().unwrap();
        let mut recent: Vec<&AgentTaskHistory> =
            history.iter().filter(|h| h.agent_slug == agent_slug).collect();
        recent.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        recent.truncate(sample.max(0) as usize);
        if recent.is_empty() {
            return Ok(None);
        }
        Ok(Some(recent.iter().map(|h| h.cost_usd).sum::<f64>() / recent.len() as f64))
    }

    async fn agent_avg_duration_seconds(&self, agent_slug: &str, sample: i64) -> Result<Option<f64>> {
        let history = self.agent_history.lock().unwrap();
        let mut recent: Vec<&AgentTaskHistory> =
            history.iter().filter(|h| h.agent_slug == agent_slug).collect();
        recent.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        recent.truncate(sample.max(0) as usize);
        if recent.is_empty() {
            return Ok(None);
        }
        let mut durations: Vec<f64> = recent.iter().map(|h| h.duration_seconds).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Ok(Some(durations[durations.len() / 2]))
    }

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
    ) -> Result<()> {
        self.agent_history.lock().unwrap().push(AgentTaskHistory {
            id: Uuid::new_v4(),
            agent_slug: agent_slug.to_owned(),
            task_id,
            started_at,
            completed_at,
            duration_seconds,
            tokens_used,
            cost_usd,
            success,
        });
        Ok(())
    }

    async fn create_backlog_item(&self, new: &NewBacklogItem) -> Result<BacklogItem> {
        let item = blank_backlog_item(new)?;
        self.backlog.lock().unwrap().insert(item.id, item.clone());
        Ok(item)
    }

    async fn get_backlog_item(&self, id: Uuid) -> Result<Option<BacklogItem>> {
        Ok(self.backlog.lock().unwrap().get(&id).cloned())
    }

    async fn ready_backlog_items(&self, limit: i64) -> Result<Vec<BacklogItem>> {
        let deps = self.deps.lock().unwrap();
        let backlog = self.backlog.lock().unwrap();
        let mut items: Vec<BacklogItem> = backlog
            .values()
            .filter(|item| {
                item.status == BacklogStatus::Ready
                    && !deps
                        .iter()
                        .any(|d| d.blocked_id == item.id && d.resolved_at.is_none())
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.priority_score
                .unwrap_or(f32::MIN)
                .partial_cmp(&a.priority_score.unwrap_or(f32::MIN))
                .unwrap()
        });
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn set_backlog_status(&self, id: Uuid, status: &str) -> Result<bool> {
        let mut backlog = self.backlog.lock().unwrap();
        if let Some(item) = backlog.get_mut(&id) {
            item.status = BacklogStatus::from_str(status)?;
            item.updated_at = Utc::now();
            return Ok(true);
        }
        Ok(false)
    }

    async fn link_backlog_task(&self, id: Uuid, task_id: Uuid) -> Result<()> {
        if let Some(item) = self.backlog.lock().unwrap().get_mut(&id) {
            item.task_id = Some(task_id);
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_manual_scores(&self, id: Uuid, impact: f32, urgency: f32, priority_score: f32) -> Result<()> {
        if let Some(item) = self.backlog.lock().unwrap().get_mut(&id) {
            item.scores_source = crate::models::ScoresSource::Manual;
            item.impact = Some(impact);
            item.urgency = Some(urgency);
            item.priority_score = Some(priority_score);
            item.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_stage(
        &self,
        id: Uuid,
        stage_template: &[String],
        current_stage: Option<&str>,
        stage_index: i32,
    ) -> Result<BacklogItem> {
        let mut backlog = self.backlog.lock().unwrap();
        let item = backlog
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("backlog item {id} not found"))?;
        item.stage_template = stage_template.to_vec();
        item.current_stage = current_stage.map(str::to_owned);
        item.stage_index = stage_index;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn init_stages(&self, id: Uuid, template: &[String]) -> Result<BacklogItem> {
        self.set_stage(id, template, template.first().map(String::as_str), 0).await
    }

    async fn median_estimated_tokens(&self) -> Result<Option<f64>> {
        let mut values: Vec<f64> = self
            .backlog
            .lock()
            .unwrap()
            .values()
            .filter_map(|item| item.estimated_tokens)
            .filter(|v| *v > 0.0)
            .collect();
        if values.is_empty() {
            return Ok(None);
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Ok(Some(values[values.len() / 2]))
    }

    async fn add_dependency(&self, blocked_id: Uuid, blocker_id: Uuid) -> Result<()> {
        if blocked_id == blocker_id {
            anyhow::bail!("dependency {blocked_id} -> {blocker_id} would create a cycle");
        }
        let mut stack = vec![blocker_id];
        let mut visited = std::collections::HashSet::new();
        let deps = self.deps.lock().unwrap();
        while let Some(current) = stack.pop() {
            if current == blocked_id {
                anyhow::bail!("dependency {blocked_id} -> {blocker_id} would create a cycle");
            }
            if !visited.insert(current) {
                continue;
            }
            stack.extend(deps.iter().filter(|d| d.blocked_id == current).map(|d| d.blocker_id));
        }
        drop(deps);
        self.deps.lock().unwrap().push(BacklogDependency {
            id: Uuid::new_v4(),
            blocked_id,
            blocker_id,
            resolved_at: None,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn dependencies_of(&self, blocked_id: Uuid) -> Result<Vec<BacklogDependency>> {
        Ok(self
            .deps
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.blocked_id == blocked_id)
            .cloned()
            .collect())
    }

    async fn has_unresolved_blockers(&self, blocked_id: Uuid) -> Result<bool> {
        Ok(self
            .deps
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.blocked_id == blocked_id && d.resolved_at.is_none()))
    }

    async fn resolve_all_for_blocker(&self, blocker_id: Uuid) -> Result<u64> {
        let mut deps = self.deps.lock().unwrap();
        let mut resolved = 0u64;
        for dep in deps.iter_mut() {
            if dep.blocker_id == blocker_id && dep.resolved_at.is_none() {
                dep.resolved_at = Some(Utc::now());
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    async fn apply_discovery_outcome(
        &self,
        outcome: &DiscoveryOutcome,
        score_fn: &ScoreFn,
        tier_fn: &TierFn,
    ) -> Result<(BacklogItem, Vec<Task>)> {
        let has_unresolved_blockers = self.has_unresolved_blockers(outcome.item_id).await?;
        let median_tokens = self.median_estimated_tokens().await?;
        let priority_score = score_fn(
            outcome.impact,
            outcome.urgency,
            has_unresolved_blockers,
            outcome.estimated_tokens,
            median_tokens,
        );

        let updated = {
            let mut backlog = self.backlog.lock().unwrap();
            let item = backlog
                .get_mut(&outcome.item_id)
                .ok_or_else(|| anyhow::anyhow!("backlog item {} not found", outcome.item_id))?;
            if item.status != BacklogStatus::InDiscovery {
                anyhow::bail!("backlog item {} is not in discovery (status is {})", item.id, item.status);
            }
            item.scores_source = crate::models::ScoresSource::Discovery;
            item.discovery_assessment = Some(outcome.assessment.clone());
            item.impact = Some(outcome.impact);
            item.urgency = Some(outcome.urgency);
            item.estimated_tokens = Some(outcome.estimated_tokens);
            item.effort_estimate = Some(outcome.effort_estimate);
            item.priority_score = Some(priority_score);
            item.status = BacklogStatus::Planned;
            item.updated_at = Utc::now();
            item.clone()
        };

        let mut created = Vec::with_capacity(outcome.subtasks.len());
        for new_task in &outcome.subtasks {
            let (model_tier, recommended_model, routing_method, runtime) = tier_fn(new_task);
            let mut task = blank_task(new_task);
            task.source = crate::models::TaskSource::Discovery;
            task.model_tier = model_tier.parse().ok();
            task.recommended_model = Some(recommended_model);
            task.routing_method = routing_method.parse().ok();
            task.runtime = runtime.parse().ok();
            self.tasks.lock().unwrap().insert(task.id, task.clone());
            created.push(task);
        }

        Ok((updated, created))
    }

    async fn add_gate_criterion(
        &self,
        item_id: Uuid,
        stage: &str,
        criterion: &str,
        policy: &str,
    ) -> Result<StageGateCriterion> {
        let parsed_policy: GatePolicy = policy.parse().map_err(|e: crate::models::ParseEnumError| anyhow::anyhow!(e))?;
        let row = StageGateCriterion {
            id: Uuid::new_v4(),
            item_id,
            stage: stage.to_owned(),
            criterion: criterion.to_owned(),
            policy: parsed_policy,
            satisfied: false,
            satisfied_at: None,
            satisfied_by: None,
            evidence: None,
            evidence_submitted_by: None,
            evidence_submitted_at: None,
            created_at: Utc::now(),
        };
        self.gate_criteria.lock().unwrap().insert(row.id, row.clone());
        Ok(row)
    }

    async fn create_criteria_if_absent(
        &self,
        item_id: Uuid,
        stage: &str,
        criteria: &[(String, String)],
    ) -> Result<Vec<StageGateCriterion>> {
        let mut created = Vec::with_capacity(criteria.len());
        for (criterion, policy) in criteria {
            let existing = self
                .gate_criteria
                .lock()
                .unwrap()
                .values()
                .find(|c| c.item_id == item_id && c.stage == stage && c.criterion == *criterion)
                .cloned();
            match existing {
                Some(row) => created.push(row),
                None => created.push(self.add_gate_criterion(item_id, stage, criterion, policy).await?),
            }
        }
        Ok(created)
    }

    async fn criteria_for_stage(&self, item_id: Uuid, stage: &str) -> Result<Vec<StageGateCriterion>> {
        Ok(self
            .gate_criteria
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.item_id == item_id && c.stage == stage)
            .cloned()
            .collect())
    }

    async fn get_gate_criterion(&self, id: Uuid) -> Result<Option<StageGateCriterion>> {
        Ok(self.gate_criteria.lock().unwrap().get(&id).cloned())
    }

    async fn satisfy_gate_criterion(&self, id: Uuid, satisfied_by: &str) -> Result<bool> {
        let mut criteria = self.gate_criteria.lock().unwrap();
        if let Some(criterion) = criteria.get_mut(&id) {
            if !criterion.satisfied {
                criterion.satisfied = true;
                criterion.satisfied_at = Some(Utc::now());
                criterion.satisfied_by = Some(satisfied_by.to_owned());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn satisfy_gate_criterion_by_name(
        &self,
        item_id: Uuid,
        stage: &str,
        name_fragment: &str,
        satisfied_by: &str,
    ) -> Result<bool> {
        let mut criteria = self.gate_criteria.lock().unwrap();
        let target = criteria
            .values()
            .find(|c| c.item_id == item_id && c.stage == stage && !c.satisfied && c.criterion.contains(name_fragment))
            .map(|c| c.id);
        match target {
            Some(id) => {
                let criterion = criteria.get_mut(&id).unwrap();
                criterion.satisfied = true;
                criterion.satisfied_at = Some(Utc::now());
                criterion.satisfied_by = Some(satisfied_by.to_owned());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn satisfy_all_gate_criteria(&self, item_id: Uuid, stage: &str, satisfied_by: &str) -> Result<u64> {
        let mut criteria = self.gate_criteria.lock().unwrap();
        let mut count = 0u64;
        for criterion in criteria.values_mut() {
            if criterion.item_id == item_id && criterion.stage == stage && !criterion.satisfied {
                criterion.satisfied = true;
                criterion.satisfied_at = Some(Utc::now());
                criterion.satisfied_by = Some(satisfied_by.to_owned());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn all_gate_criteria_met(&self, item_id: Uuid, stage: &str) -> Result<bool> {
        let criteria = self.criteria_for_stage(item_id, stage).await?;
        Ok(!criteria.is_empty() && criteria.iter().all(|c| c.satisfied))
    }

    async fn submit_gate_evidence(&self, id: Uuid, evidence: &str, submitted_by: &str) -> Result<bool> {
        let mut criteria = self.gate_criteria.lock().unwrap();
        if let Some(criterion) = criteria.get_mut(&id) {
            criterion.evidence = Some(evidence.to_owned());
            criterion.evidence_submitted_by = Some(submitted_by.to_owned());
            criterion.evidence_submitted_at = Some(Utc::now());
            return Ok(true);
        }
        Ok(false)
    }

    async fn reset_stage_to_active(&self, item_id: Uuid, stage: &str) -> Result<u64> {
        let mut criteria = self.gate_criteria.lock().unwrap();
        let mut count = 0u64;
        for criterion in criteria.values_mut() {
            if criterion.item_id == item_id && criterion.stage == stage {
                criterion.satisfied = false;
                criterion.satisfied_at = None;
                criterion.satisfied_by = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn autonomy_config(&self) -> Result<AutonomyConfig> {
        Ok(self.autonomy.lock().unwrap().clone())
    }

    async fn set_default_oversight(&self, level: &str, actor: &str) -> Result<()> {
        let mut config = self.autonomy.lock().unwrap();
        config.default_oversight_level = level.parse().map_err(|e: crate::models::ParseEnumError| anyhow::anyhow!(e))?;
        config.updated_at = Utc::now();
        config.updated_by = Some(actor.to_owned());
        Ok(())
    }

    async fn apply_autonomy_feedback(&self, approved: bool) -> Result<AutonomyConfig> {
        let mut config = self.autonomy.lock().unwrap();
        if approved {
            config.consecutive_approvals += 1;
            config.consecutive_corrections = 0;
            config.auto_approve_economy = config.consecutive_approvals >= 20;
        } else {
            config.consecutive_corrections += 1;
            config.consecutive_approvals = 0;
            config.auto_approve_economy = false;
        }
        config.updated_at = Utc::now();
        Ok(config.clone())
    }

    async fn set_drained(&self, agent_id: &str, reason: &str, actor: &str) -> Result<()> {
        self.drained.lock().unwrap().insert(
            agent_id.to_owned(),
            DispatchOverride {
                agent_id: agent_id.to_owned(),
                drained: true,
                reason: reason.to_owned(),
                updated_at: Utc::now(),
                updated_by: Some(actor.to_owned()),
            },
        );
        Ok(())
    }

    async fn clear_drained(&self, agent_id: &str, _actor: &str) -> Result<()> {
        self.drained.lock().unwrap().remove(agent_id);
        Ok(())
    }

    async fn drained_agents(&self) -> Result<Vec<DispatchOverride>> {
        Ok(self.drained.lock().unwrap().values().cloned().collect())
    }

    async fn stats(&self) -> Result<BrokerStats> {
        let mut tasks_by_status: HashMap<String, i64> = HashMap::new();
        for task in self.tasks.lock().unwrap().values() {
            *tasks_by_status.entry(task.status.to_string()).or_default() += 1;
        }
        let mut backlog_by_status: HashMap<String, i64> = HashMap::new();
        for item in self.backlog.lock().unwrap().values() {
            *backlog_by_status.entry(item.status.to_string()).or_default() += 1;
        }
        Ok(BrokerStats {
            tasks_by_status: tasks_by_status.into_iter().collect(),
            backlog_by_status: backlog_by_status.into_iter().collect(),
            drained_agent_count: self.drained.lock().unwrap().len() as i64,
        })
    }
}
