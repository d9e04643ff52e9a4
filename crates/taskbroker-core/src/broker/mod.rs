//! The dispatch loop: on each tick, scores pending tasks against available
//! agents using the assignment scoring engine and assigns the best-fit
//! winner. A second loop sweeps for timed-out assignments. Both loops stop
//! cleanly on cancellation, giving in-flight assignment work a fixed
//! deadline to drain before the process exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use taskbroker_db::models::TaskStatus;
use taskbroker_db::Store;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ScoringWeights;
use crate::eventbus::{EventBus, Message};
use crate::scoring::{self, Availability, CandidateContext, TaskProfile};

/// A candidate agent the broker may assign work to, already resolved from
/// the persona/device/runtime directories by the caller's `AgentSource`.
#[derive(Debug, Clone)]
pub struct AgentCandidate {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub availability: Availability,
    pub active_tasks: i64,
    pub max_concurrent: i64,
    pub trust: Option<f32>,
    pub avg_cost_usd: Option<f64>,
    pub avg_duration_seconds: Option<f64>,
}

/// Supplies the broker with the set of agents currently eligible for
/// assignment (already filtered for liveness by the caller).
#[async_trait::async_trait]
pub trait AgentSource: Send + Sync {
    async fn candidates(&self) -> Result<Vec<AgentCandidate>>;
}

/// Tuning knobs the broker needs from `BrokerConfig` without depending on
/// the whole struct (keeps the broker crate-internal and unit-testable).
#[derive(Debug, Clone)]
pub struct BrokerTuning {
    pub weights: ScoringWeights,
    pub owner_filter_enabled: bool,
    pub assignment_batch_size: i64,
}

impl Default for BrokerTuning {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            owner_filter_enabled: true,
            assignment_batch_size: 10,
        }
    }
}

/// Runs the tick and timeout loops until cancelled, then waits up to
/// `drain_deadline` for in-flight work before returning.
pub struct Broker<S: Store, A: AgentSource, E: EventBus> {
    store: Arc<S>,
    agents: Arc<A>,
    bus: Arc<E>,
    tuning: BrokerTuning,
    tick_interval: Duration,
    timeout_check_interval: Duration,
    drain_deadline: Duration,
}

impl<S: Store + 'static, A: AgentSource + 'static, E: EventBus + 'static> Broker<S, A, E> {
    pub fn new(
        store: Arc<S>,
        agents: Arc<A>,
        bus: Arc<E>,
        tick_interval: Duration,
        timeout_check_interval: Duration,
        drain_deadline: Duration,
    ) -> Self {
        Self::with_tuning(store, agents, bus, tick_interval, timeout_check_interval, drain_deadline, BrokerTuning::default())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_tuning(
        store: Arc<S>,
        agents: Arc<A>,
        bus: Arc<E>,
        tick_interval: Duration,
        timeout_check_interval: Duration,
        drain_deadline: Duration,
        tuning: BrokerTuning,
    ) -> Self {
        Self {
            store,
            agents,
            bus,
            tuning,
            tick_interval,
            timeout_check_interval,
            drain_deadline,
        }
    }

    /// Run until `cancel` fires, then give in-flight assignment work up
    /// to `drain_deadline` before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        use tokio_stream::StreamExt;

        let mut tick_timer = tokio::time::interval(self.tick_interval);
        let mut timeout_timer = tokio::time::interval(self.timeout_check_interval);

        let mut events = tokio_stream::wrappers::BroadcastStream::new(
            self.bus
                .subscribe("task.>")
                .await
                .context("failed to subscribe to task events")?,
        );
        let mut agent_events = tokio_stream::wrappers::BroadcastStream::new(
            self.bus
                .subscribe("agent.*.stopped")
                .await
                .context("failed to subscribe to agent lifecycle events")?,
        );

        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "assignment tick failed");
                    }
                }
                _ = timeout_timer.tick() => {
                    if let Err(e) = self.sweep_timeouts().await {
                        error!(error = %e, "timeout sweep failed");
                    }
                }
                Some(msg) = events.next() => {
                    if let Ok(msg) = msg {
                        if let Err(e) = self.handle_task_event(&msg).await {
                            warn!(subject = %msg.subject, error = %e, "failed to handle task event");
                        }
                    }
                }
                Some(msg) = agent_events.next() => {
                    if let Ok(msg) = msg {
                        if let Err(e) = self.handle_agent_stopped(&msg).await {
                            warn!(subject = %msg.subject, error = %e, "failed to handle agent lifecycle event");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("shutdown requested, draining in-flight work");
                    break;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.drain_deadline;
        match tokio::time::timeout_at(deadline, self.tick()).await {
            Ok(Ok(())) => info!("drained cleanly"),
            Ok(Err(e)) => warn!(error = %e, "error during drain tick"),
            Err(_) => warn!("drain deadline exceeded, forcing shutdown"),
        }

        Ok(())
    }

    /// Subject-grammar dispatch for everything under `task.>`, per §4.2.4.
    async fn handle_task_event(&self, msg: &Message) -> Result<()> {
        let parts: Vec<&str> = msg.subject.split('.').collect();
        let event = match parts.as_slice() {
            ["task", "request"] => {
                // An external caller is asking for an immediate
                // assignment pass rather than waiting for the next tick.
                return self.tick().await;
            }
            ["task", _id, event] => *event,
            _ => return Ok(()),
        };

        let task_id = match msg.payload.get("task_id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
            Some(id) => id,
            None => return Ok(()),
        };

        match event {
            "completed" => {
                let result = msg.payload.get("result").cloned().unwrap_or(json!({}));
                if self.store.mark_completed(task_id, &result).await? {
                    self.store.record_event(task_id, "completed", None, &result).await.ok();
                    self.record_completion_history(task_id, true).await;
                }
            }
            "failed" => {
                let error = msg.payload.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error").to_owned();
                if self.store.mark_failed(task_id, &error).await? {
                    self.store
                        .record_event(task_id, "failed", None, &json!({"error": error}))
                        .await
                        .ok();
                    self.record_completion_history(task_id, false).await;
                }
            }
            "started" => {
                let agent_id = msg.payload.get("agent_id").and_then(|v| v.as_str()).unwrap_or_default();
                if self.store.mark_started(task_id, agent_id).await? {
                    self.store
                        .record_event(task_id, "started", Some(agent_id), &json!({}))
                        .await
                        .ok();
                }
            }
            "progress" => {
                self.store.record_event(task_id, "progress", None, &msg.payload).await.ok();
            }
            _ => {}
        }
        Ok(())
    }

    /// Persist a completed/failed task's duration and cost against the
    /// agent that ran it, for the scoring engine's cost/duration factors.
    async fn record_completion_history(&self, task_id: uuid::Uuid, success: bool) {
        let Ok(Some(task)) = self.store.get_task(task_id).await else { return };
        let (Some(started_at), Some(completed_at)) = (task.started_at, task.completed_at) else { return };
        if task.assigned_agent.is_empty() {
            return;
        }
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let cost_usd = task.cost_estimate_usd.unwrap_or(0.0);
        let tokens_used = task.cost_estimate_tokens.unwrap_or(0);
        self.store
            .record_agent_history(
                &task.assigned_agent,
                task_id,
                started_at,
                completed_at,
                duration_seconds,
                tokens_used,
                cost_usd,
                success,
            )
            .await
            .ok();
    }

    /// An agent process stopped: nothing to transition directly (the
    /// timeout sweep will reclaim anything it was holding), but worth a
    /// record on the agent's current work for the audit trail.
    async fn handle_agent_stopped(&self, msg: &Message) -> Result<()> {
        let parts: Vec<&str> = msg.subject.split('.').collect();
        let agent_id = match parts.as_slice() {
            ["agent", id, "stopped"] => *id,
            _ => return Ok(()),
        };
        warn!(agent_id, "agent runtime reported stopped");
        Ok(())
    }

    /// One assignment pass per §4.2.2: enumerate eligible candidates,
    /// fetch pending tasks, score every eligible candidate against each
    /// task, and assign to the highest-scoring winner. Tasks with no
    /// eligible candidate publish an `unmatched` event instead.
    pub async fn tick(&self) -> Result<()> {
        let drained: std::collections::HashSet<String> =
            self.store.drained_agents().await?.into_iter().map(|d| d.agent_id).collect();

        let candidates: Vec<AgentCandidate> = self
            .agents
            .candidates()
            .await
            .context("failed to list agent candidates")?
            .into_iter()
            .filter(|c| !drained.contains(&c.agent_id))
            .collect();

        if candidates.is_empty() {
            return Ok(());
        }

        let pending = self
            .store
            .list_pending(self.tuning.assignment_batch_size)
            .await
            .context("failed to list pending tasks")?;

        // Tracks tasks this tick has already handed to each agent, so a
        // single pass doesn't overcommit one agent past its concurrency.
        let mut assigned_this_tick: HashMap<String, i64> = HashMap::new();

        for task in pending {
            let task_profile = TaskProfile {
                risk: task.risk_score,
                complexity: task.complexity_score,
                verifiability: task.verifiability_score,
                reversibility: task.reversibility_score,
                uncertainty: task.uncertainty_score,
                contextuality: task.contextuality_score,
                subjectivity: task.subjectivity_score,
            };

            let mut best: Option<(&AgentCandidate, scoring::ScoringOutput)> = None;
            for candidate in &candidates {
                // An owner pins a task to one specific agent (self-assignment,
                // e.g. a follow-up on work the same agent already started).
                // An empty owner leaves every candidate in play.
                if self.tuning.owner_filter_enabled && !task.owner.is_empty() && candidate.agent_id != task.owner {
                    continue;
                }
                let extra = assigned_this_tick.get(&candidate.agent_id).copied().unwrap_or(0);
                let ctx = CandidateContext {
                    capabilities: candidate.capabilities.clone(),
                    availability: candidate.availability,
                    active_tasks: candidate.active_tasks + extra,
                    max_concurrent: candidate.max_concurrent,
                    trust: candidate.trust,
                    avg_cost_usd: candidate.avg_cost_usd,
                    avg_duration_seconds: candidate.avg_duration_seconds,
                };
                let output = scoring::score(&ctx, &task_profile, &task.required_capabilities, &self.tuning.weights);
                if !output.eligible {
                    continue;
                }
                if best.as_ref().map(|(_, b)| output.total_score > b.total_score).unwrap_or(true) {
                    best = Some((candidate, output));
                }
            }

            let Some((winner, output)) = best else {
                self.bus
                    .publish(&format!("task.{}.unmatched", task.id), &json!({"task_id": task.id}))
                    .await
                    .ok();
                continue;
            };

            let oversight = scoring::oversight_level(&task_profile, winner.trust);
            let fast_path = scoring::fast_path(&task_profile);
            let factors = serde_json::to_value(&output.factors).unwrap_or(json!([]));
            self.store
                .set_scoring(
                    task.id,
                    &oversight.to_string(),
                    task_profile.risk.unwrap_or(0.5),
                    task_profile.complexity.unwrap_or(0.5),
                    task_profile.verifiability.unwrap_or(0.5),
                    task_profile.reversibility.unwrap_or(0.5),
                    task_profile.uncertainty.unwrap_or(0.5),
                    task_profile.contextuality.unwrap_or(0.5),
                    task_profile.subjectivity.unwrap_or(0.5),
                    task.cost_estimate_tokens.unwrap_or(0),
                    task.cost_estimate_usd.unwrap_or(0.0),
                    fast_path,
                    &factors,
                )
                .await
                .ok();

            match self.store.assign_task(task.id, &winner.agent_id).await {
                Ok(true) => {
                    *assigned_this_tick.entry(winner.agent_id.clone()).or_default() += 1;
                    self.store
                        .record_event(
                            task.id,
                            "assigned",
                            Some(&winner.agent_id),
                            &json!({"agent_id": winner.agent_id, "score": output.total_score}),
                        )
                        .await
                        .ok();
                    self.bus
                        .publish(
                            &format!("task.{}.assigned", task.id),
                            &json!({"task_id": task.id, "agent_id": winner.agent_id}),
                        )
                        .await
                        .ok();
                    if winner.availability == Availability::Sleeping {
                        self.bus
                            .publish(&format!("agent.{}.wake", winner.agent_id), &json!({"task_id": task.id}))
                            .await
                            .ok();
                    }
                }
                Ok(false) => {
                    // Lost the race to another tick/agent; move on.
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to assign task"),
            }
        }

        Ok(())
    }

    /// Move assigned/in-progress tasks whose deadline has passed to
    /// `timed_out`, or back to `pending` if still retry-eligible.
    pub async fn sweep_timeouts(&self) -> Result<()> {
        let timed_out = self
            .store
            .find_timed_out()
            .await
            .context("failed to list timed-out tasks")?;

        for task in timed_out {
            let requeued = self
                .store
                .requeue_for_retry(task.id)
                .await
                .with_context(|| format!("failed to requeue task {}", task.id))?;

            if requeued {
                self.store
                    .record_event(task.id, "requeued_after_timeout", None, &json!({}))
                    .await
                    .ok();
                self.bus
                    .publish(&format!("task.{}.requeued", task.id), &json!({"task_id": task.id}))
                    .await
                    .ok();
                continue;
            }

            self.store
                .mark_timed_out(task.id)
                .await
                .with_context(|| format!("failed to mark task {} timed out", task.id))?;
            self.store
                .record_event(task.id, "timed_out", None, &json!({}))
                .await
                .ok();
            self.bus
                .publish(&format!("task.{}.timed_out", task.id), &json!({"task_id": task.id}))
                .await
                .ok();
        }

        Ok(())
    }
}

/// True if `status` is one the broker should stop tracking further work
/// against (used by HTTP handlers deciding whether a retry request makes
/// sense).
pub fn is_dispatchable(status: TaskStatus) -> bool {
    matches!(status, TaskStatus::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskbroker_db::queries::tasks::NewTask;
    use taskbroker_db::MemStore;

    struct FixedAgents(Vec<AgentCandidate>);

    #[async_trait::async_trait]
    impl AgentSource for FixedAgents {
        async fn candidates(&self) -> Result<Vec<AgentCandidate>> {
            Ok(self.0.clone())
        }
    }

    fn ready_agent(agent_id: &str) -> AgentCandidate {
        AgentCandidate {
            agent_id: agent_id.to_owned(),
            capabilities: vec![],
            availability: Availability::Ready,
            active_tasks: 0,
            max_concurrent: 3,
            trust: Some(0.8),
            avg_cost_usd: Some(0.1),
            avg_duration_seconds: Some(60.0),
        }
    }

    fn sample_task() -> NewTask {
        NewTask {
            title: "write tests".into(),
            description: String::new(),
            owner: String::new(),
            required_capabilities: vec![],
            priority: 5,
            source: "manual".into(),
            parent_task_id: None,
            max_retries: 3,
            timeout_seconds: 300,
            labels: vec![],
            file_patterns: vec![],
            one_way_door: false,
            metadata: json!({}),
        }
    }

    fn test_broker(
        store: Arc<MemStore>,
        agents: Arc<FixedAgents>,
    ) -> Broker<MemStore, FixedAgents, crate::eventbus::InMemoryEventBus> {
        let bus = Arc::new(crate::eventbus::InMemoryEventBus::new());
        Broker::new(store, agents, bus, Duration::from_millis(10), Duration::from_millis(10), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn tick_assigns_pending_task_to_available_agent() {
        let store = Arc::new(MemStore::default());
        let task = store.create_task(&sample_task()).await.unwrap();
        let agents = Arc::new(FixedAgents(vec![ready_agent("agent-1")]));

        let broker = test_broker(store.clone(), agents);
        broker.tick().await.unwrap();

        let updated = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::Assigned);
        assert_eq!(updated.assigned_agent, "agent-1");
    }

    #[tokio::test]
    async fn drained_agent_is_skipped() {
        let store = Arc::new(MemStore::default());
        store.create_task(&sample_task()).await.unwrap();
        let agents = Arc::new(FixedAgents(vec![ready_agent("agent-1")]));

        let broker = test_broker(store.clone(), agents);
        store.set_drained("agent-1", "maintenance", "op").await.unwrap();
        broker.tick().await.unwrap();

        let stats = store.stats().await.unwrap();
        let pending = stats
            .tasks_by_status
            .iter()
            .find(|(s, _)| s == "pending")
            .map(|(_, c)| *c)
            .unwrap_or(0);
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn owner_filter_skips_agent_other_than_the_pinned_owner() {
        let store = Arc::new(MemStore::default());
        let mut new_task = sample_task();
        new_task.owner = "agent-2".into();
        store.create_task(&new_task).await.unwrap();
        let agents = Arc::new(FixedAgents(vec![ready_agent("agent-1")]));

        let broker = test_broker(store.clone(), agents);
        broker.tick().await.unwrap();

        let stats = store.stats().await.unwrap();
        let pending = stats
            .tasks_by_status
            .iter()
            .find(|(s, _)| s == "pending")
            .map(|(_, c)| *c)
            .unwrap_or(0);
        assert_eq!(pending, 1, "task pinned to agent-2 must not go to agent-1");
    }

    #[tokio::test]
    async fn missing_capability_leaves_task_unmatched_and_pending() {
        let store = Arc::new(MemStore::default());
        let mut new_task = sample_task();
        new_task.required_capabilities = vec!["terraform".into()];
        store.create_task(&new_task).await.unwrap();
        let agents = Arc::new(FixedAgents(vec![ready_agent("agent-1")]));

        let broker = test_broker(store.clone(), agents);
        broker.tick().await.unwrap();

        let stats = store.stats().await.unwrap();
        let pending = stats
            .tasks_by_status
            .iter()
            .find(|(s, _)| s == "pending")
            .map(|(_, c)| *c)
            .unwrap_or(0);
        assert_eq!(pending, 1);
    }
}
