//! Task registry
//!
//! Single source of truth for task lifecycle state. Reads are concurrent;
//! every write to a task happens under that task's map entry lock, which makes
//! `Active -> Executing` a compare-and-swap: of any number of racing callers
//! exactly one wins, the rest get a [`Conflict`].
//!
//! The registry persists to a JSON file. On open, tasks caught mid-execution
//! are demoted back to `Active` and their in-flight fire is forgotten.
//!
//! Other processes (the CLI) may edit the file while an engine holds it open.
//! Every flush first diffs the file against the snapshot this registry last
//! read or wrote and replays the differences as ordinary registry operations:
//! new tasks, cancel, pause, resume, trigger and filter edits. Engine-owned
//! fields (execution state, history, seen tokens) are never taken from disk.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::events::EngineEvent;
use super::types::{
    ExecutionResult, SniperFilter, TaskId, TaskKind, TaskLimits, TaskSpec, TaskState, Tolerance,
    WatchTask,
};

const SNAPSHOT_VERSION: u32 = 1;

/// Why a fire could not claim a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Task is already executing another fire
    Busy,
    /// Task is paused, pending or terminal
    NotActive(TaskState),
    /// Sniper already fired on this token
    AlreadySeen,
    /// Unknown task id
    Missing,
}

impl Conflict {
    pub fn into_error(self, task_id: TaskId) -> Error {
        let reason = match self {
            Conflict::Busy => "already executing".to_string(),
            Conflict::NotActive(state) => format!("task is {}", state),
            Conflict::AlreadySeen => "token already sniped".to_string(),
            Conflict::Missing => "task not found".to_string(),
        };
        Error::RegistryConflict {
            task_id: task_id.to_string(),
            reason,
        }
    }
}

/// What `complete_execution` did with a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Result recorded and the task moved to the given state
    Applied(TaskState),
    /// Task was cancelled while executing; result recorded, state untouched
    Cancelled,
}

#[derive(Serialize, Deserialize)]
struct RegistrySnapshot {
    version: u32,
    tasks: Vec<WatchTask>,
}

/// Authoritative store of watch tasks
pub struct TaskRegistry {
    tasks: DashMap<TaskId, WatchTask>,
    events: broadcast::Sender<EngineEvent>,
    limits: TaskLimits,
    persistence_path: Option<PathBuf>,
    dirty: AtomicBool,
    /// File contents as of the last read or write; held across each flush
    synced: Mutex<HashMap<TaskId, WatchTask>>,
}

impl TaskRegistry {
    /// Create a registry with no backing file
    pub fn in_memory(limits: TaskLimits, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            tasks: DashMap::new(),
            events,
            limits,
            persistence_path: None,
            dirty: AtomicBool::new(false),
            synced: Mutex::new(HashMap::new()),
        }
    }

    /// Open a durable registry, loading and reconciling any saved tasks
    pub async fn open<P: AsRef<Path>>(
        path: P,
        limits: TaskLimits,
        event_capacity: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut registry = Self::in_memory(limits, event_capacity);

        if let Some(snapshot) = read_snapshot(&path).await? {
            *registry.synced.get_mut() = snapshot
                .tasks
                .iter()
                .map(|t| (t.id, t.clone()))
                .collect();

            let mut recovered = 0usize;
            for mut task in snapshot.tasks {
                if registry.reconcile(&mut task) {
                    recovered += 1;
                }
                registry.tasks.insert(task.id, task);
            }

            info!(
                "Loaded {} tasks from {} ({} recovered)",
                registry.tasks.len(),
                path.display(),
                recovered
            );
            if recovered > 0 {
                registry.dirty.store(true, Ordering::Release);
            }
        } else {
            info!("No registry file at {}, starting empty", path.display());
        }

        registry.persistence_path = Some(path);
        Ok(registry)
    }

    /// Restart recovery. Returns true if the task state changed.
    fn reconcile(&self, task: &mut WatchTask) -> bool {
        match task.state {
            TaskState::Executing | TaskState::Satisfied | TaskState::Failed => {
                warn!(
                    task_id = %task.id,
                    state = %task.state,
                    "Task was mid-execution at shutdown, demoting to active"
                );
                task.state = TaskState::Active;
                true
            }
            TaskState::Pending => {
                task.state = match task.validate(&self.limits) {
                    Ok(()) => TaskState::Active,
                    Err(e) => {
                        warn!(task_id = %task.id, "Pending task failed validation: {}", e);
                        TaskState::Terminated
                    }
                };
                true
            }
            _ => false,
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Publish an event; no subscribers is fine
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn emit_transition(&self, task: &WatchTask, from: TaskState) {
        debug!(task_id = %task.id, "{} -> {}", from, task.state);
        self.emit(EngineEvent::TaskStateChanged {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            from,
            to: task.state,
        });
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn limits(&self) -> &TaskLimits {
        &self.limits
    }

    /// Validate and register a new task, activating it
    pub fn create(
        &self,
        owner_id: impl Into<String>,
        spec: TaskSpec,
        tolerance: Tolerance,
    ) -> Result<WatchTask> {
        self.register(WatchTask::new(owner_id, spec, tolerance))
    }

    /// Register a prebuilt task. Invalid tasks never become Active.
    pub fn register(&self, mut task: WatchTask) -> Result<WatchTask> {
        if task.state != TaskState::Pending {
            return Err(Error::InvalidTask(format!(
                "new task must be pending, got {}",
                task.state
            )));
        }
        task.validate(&self.limits)?;

        if self.tasks.contains_key(&task.id) {
            return Err(Error::InvalidTask(format!("duplicate task id {}", task.id)));
        }

        self.emit(EngineEvent::TaskCreated {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            kind: task.kind(),
        });

        task.state = TaskState::Active;
        self.emit_transition(&task, TaskState::Pending);

        info!(
            task_id = %task.id,
            owner = %task.owner_id,
            kind = %task.kind(),
            "Task created"
        );

        self.tasks.insert(task.id, task.clone());
        self.mark_dirty();
        Ok(task)
    }

    pub fn get(&self, id: &TaskId) -> Option<WatchTask> {
        self.tasks.get(id).map(|t| t.value().clone())
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(|t| t.state)
    }

    /// True if the task is cancelled or no longer exists
    pub fn is_cancelled(&self, id: &TaskId) -> bool {
        self.state(id)
            .map(|s| s == TaskState::Cancelled)
            .unwrap_or(true)
    }

    /// All tasks of an owner, oldest first
    pub fn list_by_owner(&self, owner_id: &str) -> Vec<WatchTask> {
        let mut tasks: Vec<WatchTask> = self
            .tasks
            .iter()
            .filter(|t| t.owner_id == owner_id)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Active tasks of a kind, oldest first
    pub fn list_active(&self, kind: TaskKind) -> Vec<WatchTask> {
        let mut tasks: Vec<WatchTask> = self
            .tasks
            .iter()
            .filter(|t| t.is_active() && t.kind() == kind)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Tasks of a kind in any state, oldest first
    pub fn list_by_kind(&self, kind: TaskKind) -> Vec<WatchTask> {
        let mut tasks: Vec<WatchTask> = self
            .tasks
            .iter()
            .filter(|t| t.kind() == kind)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn list_all(&self) -> Vec<WatchTask> {
        let mut tasks: Vec<WatchTask> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Record an evaluation pass
    pub fn touch(&self, id: &TaskId, at: DateTime<Utc>) {
        if let Some(mut task) = self.tasks.get_mut(id) {
            task.last_evaluated_at = Some(at);
        }
    }

    /// Move a task between two states, failing if it is not in `from`
    fn transition(&self, id: &TaskId, from: TaskState, to: TaskState) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let task = entry.value_mut();

        if task.state != from || !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                task_id: id.to_string(),
                from: task.state.to_string(),
                to: to.to_string(),
            });
        }

        task.state = to;
        self.emit_transition(task, from);
        self.mark_dirty();
        Ok(())
    }

    pub fn pause(&self, id: &TaskId) -> Result<()> {
        self.transition(id, TaskState::Active, TaskState::Paused)?;
        info!(task_id = %id, "Task paused");
        Ok(())
    }

    pub fn resume(&self, id: &TaskId) -> Result<()> {
        self.transition(id, TaskState::Paused, TaskState::Active)?;
        info!(task_id = %id, "Task resumed");
        Ok(())
    }

    /// Cancel a task from any non-terminal state
    pub fn cancel(&self, id: &TaskId) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let task = entry.value_mut();

        if task.state.is_terminal() {
            return Err(Error::InvalidTransition {
                task_id: id.to_string(),
                from: task.state.to_string(),
                to: TaskState::Cancelled.to_string(),
            });
        }

        let from = task.state;
        task.state = TaskState::Cancelled;
        if let TaskSpec::Sniper(sniper) = &mut task.spec {
            sniper.seen_tokens.clear();
        }
        self.emit_transition(task, from);
        self.mark_dirty();

        info!(task_id = %id, owner = %task.owner_id, "Task cancelled (was {})", from);
        Ok(())
    }

    /// Cancel every non-terminal task of an owner
    pub fn cancel_all(&self, owner_id: &str) -> usize {
        let ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.owner_id == owner_id && !t.state.is_terminal())
            .map(|t| t.id)
            .collect();

        ids.iter().filter(|id| self.cancel(id).is_ok()).count()
    }

    /// Change a limit order's trigger. Only allowed while Active.
    pub fn update_trigger_value(&self, id: &TaskId, trigger_value: f64) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let task = entry.value_mut();

        if task.state != TaskState::Active {
            return Err(Error::InvalidTask(format!(
                "trigger can only change while active, task is {}",
                task.state
            )));
        }

        let mut spec = task.spec.clone();
        match &mut spec {
            TaskSpec::LimitOrder(order) => order.trigger_value = trigger_value,
            _ => {
                return Err(Error::InvalidTask(format!(
                    "{} task has no trigger value",
                    task.kind()
                )))
            }
        }
        spec.validate(&self.limits)?;
        task.spec = spec;
        self.mark_dirty();

        info!(task_id = %id, trigger_value, "Trigger value updated");
        Ok(())
    }

    /// Change a sniper's pool filter. Only allowed while Active.
    pub fn update_sniper_filter(&self, id: &TaskId, filter: SniperFilter) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let task = entry.value_mut();

        if task.state != TaskState::Active {
            return Err(Error::InvalidTask(format!(
                "filter can only change while active, task is {}",
                task.state
            )));
        }

        filter.validate()?;
        match &mut task.spec {
            TaskSpec::Sniper(sniper) => sniper.filter = filter,
            _ => {
                return Err(Error::InvalidTask(format!(
                    "{} task has no pool filter",
                    task.kind()
                )))
            }
        }
        self.mark_dirty();

        info!(task_id = %id, "Sniper filter updated");
        Ok(())
    }

    /// Compare-and-swap `Active -> Executing`.
    ///
    /// For snipers, `claim_token` is added to the task's seen set in the same
    /// step, so a token can only ever win one fire per task.
    pub fn try_begin_execution(
        &self,
        id: &TaskId,
        claim_token: Option<&str>,
    ) -> std::result::Result<WatchTask, Conflict> {
        let mut entry = self.tasks.get_mut(id).ok_or(Conflict::Missing)?;
        let task = entry.value_mut();

        match task.state {
            TaskState::Active | TaskState::Executing => {}
            other => return Err(Conflict::NotActive(other)),
        }

        if let (Some(token), TaskSpec::Sniper(sniper)) = (claim_token, &task.spec) {
            if sniper.seen_tokens.contains(token) {
                return Err(Conflict::AlreadySeen);
            }
        }

        if task.state == TaskState::Executing {
            return Err(Conflict::Busy);
        }

        if let (Some(token), TaskSpec::Sniper(sniper)) = (claim_token, &mut task.spec) {
            sniper.seen_tokens.insert(token.to_string());
        }

        task.state = TaskState::Executing;
        self.emit_transition(task, TaskState::Active);
        self.mark_dirty();
        Ok(task.clone())
    }

    /// Return an Executing task to Active when its fire could not be handed off
    pub fn abort_execution(&self, id: &TaskId) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let task = entry.value_mut();

        if task.state == TaskState::Executing {
            task.state = TaskState::Active;
            self.emit_transition(task, TaskState::Executing);
            self.mark_dirty();
        }
        Ok(())
    }

    /// Record an execution result and move the task out of Executing.
    ///
    /// `next` must be Active or Terminated. The task passes through Satisfied
    /// or Failed on the way.
    pub fn complete_execution(
        &self,
        id: &TaskId,
        result: ExecutionResult,
        next: TaskState,
    ) -> Result<Completion> {
        let mut entry = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let task = entry.value_mut();

        if task.state == TaskState::Cancelled {
            task.record(result.clone());
            self.emit(EngineEvent::ExecutionCompleted { result });
            self.mark_dirty();
            return Ok(Completion::Cancelled);
        }

        let outcome = if result.success {
            TaskState::Satisfied
        } else {
            TaskState::Failed
        };

        if task.state != TaskState::Executing || !outcome.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: id.to_string(),
                from: task.state.to_string(),
                to: next.to_string(),
            });
        }

        task.state = outcome;
        self.emit_transition(task, TaskState::Executing);

        task.record(result.clone());
        self.emit(EngineEvent::ExecutionCompleted { result });

        task.state = next;
        self.emit_transition(task, outcome);
        self.mark_dirty();

        Ok(Completion::Applied(next))
    }

    /// Write the registry to disk if anything changed
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        let mut synced = self.synced.lock().await;
        match read_snapshot(path).await {
            Ok(Some(disk)) => self.merge_external(&synced, disk.tasks),
            Ok(None) => {}
            Err(e) => warn!("Could not read {} before saving: {}", path.display(), e),
        }

        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let snapshot = RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            tasks: self.list_all(),
        };

        if let Err(e) = write_snapshot(path, &snapshot).await {
            self.mark_dirty();
            return Err(e);
        }

        debug!("Saved {} tasks to {}", snapshot.tasks.len(), path.display());
        *synced = snapshot.tasks.into_iter().map(|t| (t.id, t)).collect();
        Ok(())
    }

    /// Replay edits another process wrote to the file since `synced`
    fn merge_external(&self, synced: &HashMap<TaskId, WatchTask>, disk: Vec<WatchTask>) {
        let mut changed = false;
        let mut applied = 0usize;

        for theirs in disk {
            match synced.get(&theirs.id) {
                Some(base) if *base == theirs => {}
                Some(base) => {
                    changed = true;
                    applied += self.apply_external_edit(base, &theirs);
                }
                None if !self.tasks.contains_key(&theirs.id) => {
                    changed = true;
                    applied += 1;
                    self.adopt(theirs);
                }
                None => {}
            }
        }

        // Rewrite so the file reflects this registry again
        if changed {
            self.mark_dirty();
        }
        if applied > 0 {
            info!("Merged {} task edits made outside the engine", applied);
        }
    }

    /// Returns the number of edits applied
    fn apply_external_edit(&self, base: &WatchTask, theirs: &WatchTask) -> usize {
        let id = theirs.id;
        let mut outcomes = Vec::new();

        // Spec edits first: they require Active
        match (&base.spec, &theirs.spec) {
            (TaskSpec::LimitOrder(old), TaskSpec::LimitOrder(new))
                if old.trigger_value != new.trigger_value =>
            {
                outcomes.push(self.update_trigger_value(&id, new.trigger_value));
            }
            (TaskSpec::Sniper(old), TaskSpec::Sniper(new)) if old.filter != new.filter => {
                outcomes.push(self.update_sniper_filter(&id, new.filter));
            }
            _ => {}
        }

        if base.state != theirs.state {
            match (base.state, theirs.state) {
                (_, TaskState::Cancelled) => outcomes.push(self.cancel(&id)),
                (TaskState::Paused, TaskState::Active) => outcomes.push(self.resume(&id)),
                (_, TaskState::Paused) => outcomes.push(self.pause(&id)),
                _ => {}
            }
        }

        outcomes
            .into_iter()
            .filter(|outcome| match outcome {
                Ok(()) => true,
                Err(e) => {
                    warn!(task_id = %id, "External edit not applied: {}", e);
                    false
                }
            })
            .count()
    }

    /// Take in a task another process added to the file
    fn adopt(&self, mut task: WatchTask) {
        self.reconcile(&mut task);
        self.emit(EngineEvent::TaskCreated {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            kind: task.kind(),
        });
        if task.state != TaskState::Pending {
            self.emit_transition(&task, TaskState::Pending);
        }

        info!(
            task_id = %task.id,
            owner = %task.owner_id,
            kind = %task.kind(),
            "Task added outside the engine"
        );
        self.tasks.insert(task.id, task);
    }

    /// Final flush at shutdown
    pub async fn close(&self) -> Result<()> {
        self.flush().await?;
        info!("Task registry closed ({} tasks)", self.tasks.len());
        Ok(())
    }

    /// Flush periodically until cancelled, then flush once more
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.flush().await {
                            warn!("Registry flush failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            if let Err(e) = registry.flush().await {
                warn!("Final registry flush failed: {}", e);
            }
        })
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<RegistrySnapshot>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Persistence(e.to_string())),
    };
    let snapshot: RegistrySnapshot = serde_json::from_str(&data)
        .map_err(|e| Error::Deserialization(format!("{}: {}", path.display(), e)))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::Persistence(format!(
            "unsupported registry version {} in {}",
            snapshot.version,
            path.display()
        )));
    }
    Ok(Some(snapshot))
}

async fn write_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    let data = serde_json::to_string_pretty(snapshot)
        .map_err(|e| Error::Persistence(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Persistence(e.to_string()))?;
        }
    }

    // Write then rename so a crash never leaves a truncated file
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Persistence(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::task::types::{
        LimitOrderTask, OrderSide, SizingRule, SniperTask, TriggerMetric, CopyTradeTask,
    };
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    const TOKEN: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    fn registry() -> TaskRegistry {
        TaskRegistry::in_memory(TaskLimits::default(), 64)
    }

    fn sniper_spec() -> TaskSpec {
        TaskSpec::Sniper(SniperTask {
            filter: SniperFilter {
                min_liquidity: 5.0,
                max_buy_tax: 10.0,
                max_sell_tax: 10.0,
            },
            buy_amount: 0.1,
            auto_sell: None,
            seen_tokens: HashSet::new(),
        })
    }

    fn limit_spec() -> TaskSpec {
        TaskSpec::LimitOrder(LimitOrderTask {
            token: TOKEN.to_string(),
            side: OrderSide::Sell,
            metric: TriggerMetric::Price,
            trigger_value: 100.0,
            amount: 5_000.0,
            rearm: false,
        })
    }

    fn result_for(task: &WatchTask, success: bool) -> ExecutionResult {
        ExecutionResult {
            task_id: task.id,
            owner_id: task.owner_id.clone(),
            success,
            tx_signature: success.then(|| "sig".to_string()),
            amount_in: 0.1,
            amount_out: success.then_some(1_000.0),
            error_kind: (!success).then_some(ErrorKind::QuoteRejected),
            error_message: None,
            latency_ms: 5,
            attempts: 1,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_activates_and_emits() {
        let registry = registry();
        let mut events = registry.subscribe();

        let task = registry
            .create("user-1", sniper_spec(), Tolerance::default())
            .unwrap();
        assert_eq!(task.state, TaskState::Active);

        assert!(matches!(events.recv().await.unwrap(), EngineEvent::TaskCreated { .. }));
        match events.recv().await.unwrap() {
            EngineEvent::TaskStateChanged { from, to, .. } => {
                assert_eq!(from, TaskState::Pending);
                assert_eq!(to, TaskState::Active);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_invalid_task_never_stored() {
        let registry = registry();
        let spec = TaskSpec::CopyTrade(CopyTradeTask {
            source_wallet: "bogus".to_string(),
            follow_buy: true,
            follow_sell: true,
            sizing: SizingRule::Fixed { amount: 0.1 },
            auto_sell: None,
        });

        let err = registry.create("user-1", spec, Tolerance::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_begin_has_single_winner() {
        let registry = Arc::new(registry());
        let task = registry
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                let id = task.id;
                tokio::spawn(async move { registry.try_begin_execution(&id, None).is_ok() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.state(&task.id), Some(TaskState::Executing));
    }

    #[test]
    fn test_sniper_token_claimed_once() {
        let registry = registry();
        let task = registry
            .create("user-1", sniper_spec(), Tolerance::default())
            .unwrap();

        let claimed = registry.try_begin_execution(&task.id, Some(TOKEN)).unwrap();
        assert_eq!(
            registry.try_begin_execution(&task.id, Some(TOKEN)).unwrap_err(),
            Conflict::AlreadySeen
        );

        registry
            .complete_execution(&task.id, result_for(&claimed, true), TaskState::Active)
            .unwrap();
        assert_eq!(
            registry.try_begin_execution(&task.id, Some(TOKEN)).unwrap_err(),
            Conflict::AlreadySeen
        );

        let stored = registry.get(&task.id).unwrap();
        assert_eq!(stored.stats.successful_snipes, 1);
        assert_eq!(stored.state, TaskState::Active);
    }

    #[test]
    fn test_busy_vs_not_active() {
        let registry = registry();
        let task = registry
            .create("user-1", sniper_spec(), Tolerance::default())
            .unwrap();

        registry.try_begin_execution(&task.id, Some(TOKEN)).unwrap();
        assert_eq!(
            registry.try_begin_execution(&task.id, Some("other-token")).unwrap_err(),
            Conflict::Busy
        );

        registry.cancel(&task.id).unwrap();
        assert_eq!(
            registry.try_begin_execution(&task.id, Some("other-token")).unwrap_err(),
            Conflict::NotActive(TaskState::Cancelled)
        );
    }

    #[test]
    fn test_cancel_during_execution_keeps_cancelled() {
        let registry = registry();
        let task = registry
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();

        let running = registry.try_begin_execution(&task.id, None).unwrap();
        registry.cancel(&task.id).unwrap();

        let completion = registry
            .complete_execution(&task.id, result_for(&running, true), TaskState::Terminated)
            .unwrap();
        assert_eq!(completion, Completion::Cancelled);

        let stored = registry.get(&task.id).unwrap();
        assert_eq!(stored.state, TaskState::Cancelled);
        assert_eq!(stored.history.len(), 1);
    }

    #[test]
    fn test_failed_execution_returns_to_active() {
        let registry = registry();
        let task = registry
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();

        let running = registry.try_begin_execution(&task.id, None).unwrap();
        registry
            .complete_execution(&task.id, result_for(&running, false), TaskState::Active)
            .unwrap();

        let stored = registry.get(&task.id).unwrap();
        assert_eq!(stored.state, TaskState::Active);
        assert_eq!(stored.stats.failures, 1);
    }

    #[test]
    fn test_trigger_update_only_while_active() {
        let registry = registry();
        let task = registry
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();

        assert_ok!(registry.update_trigger_value(&task.id, 120.0));
        assert_ok!(registry.pause(&task.id));
        assert_err!(registry.update_trigger_value(&task.id, 130.0));
        assert_ok!(registry.resume(&task.id));

        match registry.get(&task.id).unwrap().spec {
            TaskSpec::LimitOrder(order) => assert_eq!(order.trigger_value, 120.0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_paused_task_cannot_fire() {
        let registry = registry();
        let task = registry
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();

        registry.pause(&task.id).unwrap();
        assert_eq!(
            registry.try_begin_execution(&task.id, None).unwrap_err(),
            Conflict::NotActive(TaskState::Paused)
        );
    }

    #[tokio::test]
    async fn test_executing_task_recovered_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let task_id = {
            let registry = TaskRegistry::open(&path, TaskLimits::default(), 16)
                .await
                .unwrap();
            let task = registry
                .create("user-1", limit_spec(), Tolerance::default())
                .unwrap();
            registry.try_begin_execution(&task.id, None).unwrap();
            registry.flush().await.unwrap();
            task.id
        };

        let reopened = TaskRegistry::open(&path, TaskLimits::default(), 16)
            .await
            .unwrap();
        assert_eq!(reopened.state(&task_id), Some(TaskState::Active));
        assert!(reopened.try_begin_execution(&task_id, None).is_ok());
    }

    #[tokio::test]
    async fn test_flush_skips_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.json");

        let registry = TaskRegistry::open(&path, TaskLimits::default(), 16)
            .await
            .unwrap();
        registry.flush().await.unwrap();
        assert!(!path.exists());

        registry
            .create("user-1", sniper_spec(), Tolerance::default())
            .unwrap();
        registry.close().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_cancel_from_cli_survives_engine_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let engine = TaskRegistry::open(&path, TaskLimits::default(), 16)
            .await
            .unwrap();
        let a = engine
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();
        let b = engine
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();
        engine.try_begin_execution(&b.id, None).unwrap();
        engine.flush().await.unwrap();

        // The CLI demotes b on open; that must not leak back into the engine
        let cli = TaskRegistry::open(&path, TaskLimits::default(), 16)
            .await
            .unwrap();
        assert_ok!(cli.cancel(&a.id));
        cli.close().await.unwrap();

        engine.flush().await.unwrap();
        assert_eq!(engine.state(&a.id), Some(TaskState::Cancelled));
        assert_eq!(engine.state(&b.id), Some(TaskState::Executing));
        assert_eq!(
            engine.try_begin_execution(&a.id, None).unwrap_err(),
            Conflict::NotActive(TaskState::Cancelled)
        );

        let reopened = TaskRegistry::open(&path, TaskLimits::default(), 16)
            .await
            .unwrap();
        assert_eq!(reopened.state(&a.id), Some(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_tasks_added_and_edited_by_cli_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let engine = TaskRegistry::open(&path, TaskLimits::default(), 16)
            .await
            .unwrap();
        let order = engine
            .create("user-1", limit_spec(), Tolerance::default())
            .unwrap();
        let snipe = engine
            .create("user-1", sniper_spec(), Tolerance::default())
            .unwrap();
        engine.flush().await.unwrap();
        let mut events = engine.subscribe();

        let cli = TaskRegistry::open(&path, TaskLimits::default(), 16)
            .await
            .unwrap();
        let added = cli
            .create("user-2", sniper_spec(), Tolerance::default())
            .unwrap();
        assert_ok!(cli.update_trigger_value(&order.id, 150.0));
        assert_ok!(cli.pause(&snipe.id));
        cli.close().await.unwrap();

        engine.flush().await.unwrap();
        assert_eq!(engine.state(&added.id), Some(TaskState::Active));
        assert_eq!(engine.state(&snipe.id), Some(TaskState::Paused));
        match engine.get(&order.id).unwrap().spec {
            TaskSpec::LimitOrder(o) => assert_eq!(o.trigger_value, 150.0),
            _ => unreachable!(),
        }

        let mut created = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::TaskCreated { task_id, .. } = event {
                created.push(task_id);
            }
        }
        assert_eq!(created, vec![added.id]);

        // A later flush with nothing new applies nothing twice
        engine.flush().await.unwrap();
        assert_eq!(engine.len(), 3);
        assert_eq!(engine.state(&snipe.id), Some(TaskState::Paused));
    }

    #[test]
    fn test_cancel_all_for_owner() {
        let registry = registry();
        registry.create("user-1", sniper_spec(), Tolerance::default()).unwrap();
        registry.create("user-1", limit_spec(), Tolerance::default()).unwrap();
        registry.create("user-2", limit_spec(), Tolerance::default()).unwrap();

        assert_eq!(registry.cancel_all("user-1"), 2);
        assert_eq!(registry.list_active(TaskKind::LimitOrder).len(), 1);
    }
}
