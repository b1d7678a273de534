//! Orchestrator — classifies inbound items per project and dispatches runs.

use std::sync::Arc;
use std::time::Duration;

use agentdesk_core::{Error, Result};
use agentdesk_store::{ProjectRegistry, RunMode, RunState, StateStore};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::decision::{classify, lease_expired, RunDecision};
use crate::locks::ProjectLocks;
use crate::notify::{topics, Notifier};
use crate::task::{RunContext, RunTask};
use crate::types::{now_millis, Dispatch, RunInput};

/// Lease applied when none is configured.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

const BUSY_MESSAGE: &str = "previous run has not completed";

/// Serializes dispatch decisions per project and runs tasks in the background.
///
/// Cheap to clone; clones share locks, store and task.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StateStore>,
    projects: Arc<dyn ProjectRegistry>,
    task: Arc<dyn RunTask>,
    notifier: Arc<dyn Notifier>,
    locks: Arc<ProjectLocks>,
    lease_ttl: Duration,
}

/// Renew a running task's lease a few times per TTL.
fn heartbeat_interval(lease_ttl: Duration) -> Duration {
    (lease_ttl / 3).max(Duration::from_millis(10))
}

/// Any failure talking to the store surfaces as `StoreUnavailable`.
fn unavailable(e: Error) -> Error {
    match e {
        Error::StoreUnavailable(_) => e,
        other => Error::StoreUnavailable(other.to_string()),
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        projects: Arc<dyn ProjectRegistry>,
        task: Arc<dyn RunTask>,
        notifier: Arc<dyn Notifier>,
        lease_ttl: Duration,
    ) -> Self {
        info!("Orchestrator initialized: lease_ttl={}s", lease_ttl.as_secs());
        Self {
            inner: Arc::new(Inner {
                store,
                projects,
                task,
                notifier,
                locks: Arc::new(ProjectLocks::new()),
                lease_ttl,
            }),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.inner.lease_ttl
    }

    /// Submit an inbound item.
    ///
    /// Classifies it against the project's run state and, unless the project
    /// is busy, marks it active and dispatches the run task in the background.
    /// Returns as soon as the run is dispatched. Must be called from within a
    /// Tokio runtime.
    pub fn submit(&self, input: RunInput) -> Result<Dispatch> {
        let inner = &self.inner;
        let project_id = input.project_id.clone();

        let handle = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no async runtime for dispatch: {}", e)))?;

        let dispatch = inner.locks.with_lock(&project_id, || -> Result<Option<Dispatch>> {
            // Checked under the lock so a concurrent delete cannot leave an
            // orphaned active state behind.
            if !inner.projects.project_exists(&project_id).map_err(unavailable)? {
                return Err(Error::UnknownProject(project_id.clone()));
            }
            let context_available = inner.task.has_context(&project_id);
            let current = inner.store.get(&project_id).map_err(unavailable)?;
            let now = now_millis();
            let decision = classify(current.as_ref(), now, inner.lease_ttl, context_available);
            debug!("Classified submit for {}: {:?}", project_id, decision);

            let mode = match decision {
                RunDecision::Busy => return Ok(None),
                RunDecision::Fresh => RunMode::Fresh,
                RunDecision::Continue => RunMode::Continue,
            };

            let run_id = uuid::Uuid::new_v4().to_string();
            let mut next = current.unwrap_or_else(|| RunState::new(project_id.as_str()));
            next.is_active = true;
            next.is_completed = false;
            next.run_id = Some(run_id.clone());
            next.mode = Some(mode);
            next.heartbeat_at = Some(now);
            next.last_error = None;
            next.updated_at = now;
            inner.store.put(&next).map_err(unavailable)?;

            Ok(Some(Dispatch { run_id, mode }))
        })?;

        let dispatch = match dispatch {
            Some(d) => d,
            None => {
                warn!("Refusing submit for {}: {}", project_id, BUSY_MESSAGE);
                self.notify(
                    topics::WARNING,
                    serde_json::json!({
                        "type": "warning",
                        "project": project_id,
                        "message": BUSY_MESSAGE,
                    }),
                );
                return Err(Error::RunRefused(project_id));
            }
        };

        info!(
            "Dispatching {} run {} for {}",
            dispatch.mode, dispatch.run_id, project_id
        );
        self.notify(
            topics::STATE_CHANGED,
            serde_json::json!({
                "project": project_id,
                "status": "active",
                "mode": dispatch.mode,
                "run_id": dispatch.run_id,
            }),
        );

        self.spawn_run(&handle, input, &dispatch);
        Ok(dispatch)
    }

    fn spawn_run(&self, handle: &Handle, input: RunInput, dispatch: &Dispatch) {
        let inner = &self.inner;
        let project_id = input.project_id.clone();
        let run_id = dispatch.run_id.clone();
        let mode = dispatch.mode;
        let ctx = Arc::new(RunContext::new(
            project_id.clone(),
            run_id.clone(),
            inner.store.clone(),
            inner.locks.clone(),
            inner.notifier.clone(),
        ));
        let run_ctx = ctx.clone();
        let task = inner.task.clone();
        let renew_every = heartbeat_interval(inner.lease_ttl);
        let orchestrator = self.clone();

        handle.spawn(async move {
            let mut running = tokio::task::spawn_blocking(move || match mode {
                RunMode::Fresh => task.start_fresh(&input, &run_ctx),
                RunMode::Continue => task.continue_prior(&input, &run_ctx),
            });

            // The lease is held for as long as the task is executing; only a
            // hung or dead process lets it lapse.
            let mut renew = tokio::time::interval(renew_every);
            renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
            renew.tick().await;
            let joined = loop {
                tokio::select! {
                    joined = &mut running => break joined,
                    _ = renew.tick() => match ctx.heartbeat() {
                        Ok(true) => {}
                        Ok(false) => debug!("Run {} no longer owns {}", run_id, project_id),
                        Err(e) => warn!("Heartbeat for run {} failed: {}", run_id, e),
                    },
                }
            };

            let outcome = match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("Run {} for {} failed: {}", run_id, project_id, e);
                    Err(e.to_string())
                }
                Err(e) => {
                    error!("Run {} for {} aborted: {}", run_id, project_id, e);
                    Err(format!("run task aborted: {}", e))
                }
            };

            if let Err(e) = orchestrator.finish(&project_id, &run_id, outcome) {
                // The lease will expire and the reaper will release the project.
                error!(
                    "Failed to record completion of run {} for {}: {}",
                    run_id, project_id, e
                );
            }
        });
    }

    /// Record the end of a run. Ignored if the run has been superseded.
    pub(crate) fn finish(
        &self,
        project_id: &str,
        run_id: &str,
        outcome: std::result::Result<(), String>,
    ) -> Result<bool> {
        let inner = &self.inner;
        let completed = outcome.is_ok();

        let recorded = inner.locks.with_lock(project_id, || -> Result<bool> {
            let mut state = match inner.store.get(project_id)? {
                Some(s) if s.is_active && s.is_run(run_id) => s,
                _ => return Ok(false),
            };
            state.is_active = false;
            state.is_completed = completed;
            state.last_error = outcome.err();
            state.updated_at = now_millis();
            inner.store.put(&state)?;
            Ok(true)
        })?;

        if !recorded {
            warn!(
                "Run {} for {} finished after being superseded; ignoring",
                run_id, project_id
            );
            return Ok(false);
        }

        info!(
            "Run {} for {} {}",
            run_id,
            project_id,
            if completed { "completed" } else { "failed" }
        );
        self.notify(
            topics::STATE_CHANGED,
            serde_json::json!({
                "project": project_id,
                "status": if completed { "completed" } else { "failed" },
                "run_id": run_id,
            }),
        );
        Ok(true)
    }

    /// Release active runs whose lease has expired.
    pub fn reap_stale(&self) -> Result<Vec<String>> {
        self.interrupt_active("lease expired", true)
    }

    /// Release every persisted active run. Only meaningful at startup, before
    /// any run has been dispatched by this process.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        self.interrupt_active("interrupted by restart", false)
    }

    fn interrupt_active(&self, reason: &str, only_expired: bool) -> Result<Vec<String>> {
        let inner = &self.inner;
        let candidates = inner.store.list_active().map_err(unavailable)?;
        let mut released = Vec::new();

        for candidate in candidates {
            let project_id = candidate.project_id;
            let interrupted = inner.locks.with_lock(&project_id, || -> Result<Option<String>> {
                let now = now_millis();
                let mut state = match inner.store.get(&project_id)? {
                    Some(s) if s.is_active => s,
                    _ => return Ok(None),
                };
                if only_expired && !lease_expired(&state, now, inner.lease_ttl) {
                    return Ok(None);
                }
                state.is_active = false;
                state.is_completed = false;
                state.last_error = Some(reason.to_string());
                state.updated_at = now;
                inner.store.put(&state)?;
                Ok(Some(state.run_id.unwrap_or_default()))
            });

            match interrupted {
                Ok(Some(run_id)) => {
                    warn!("Released run {} for {}: {}", run_id, project_id, reason);
                    self.notify(
                        topics::STATE_CHANGED,
                        serde_json::json!({
                            "project": project_id,
                            "status": "interrupted",
                            "run_id": run_id,
                            "reason": reason,
                        }),
                    );
                    released.push(project_id);
                }
                Ok(None) => {}
                Err(e) => return Err(unavailable(e)),
            }
        }

        Ok(released)
    }

    /// Remove a project's run state; its next submit starts fresh.
    pub fn clear_state(&self, project_id: &str) -> Result<bool> {
        self.inner
            .locks
            .with_lock(project_id, || self.inner.store.delete(project_id))
            .map_err(unavailable)
    }

    /// Delete a project along with its run state and messages.
    pub fn delete_project(&self, project_id: &str) -> Result<bool> {
        let inner = &self.inner;
        inner
            .locks
            .with_lock(project_id, || -> Result<bool> {
                inner.store.delete(project_id)?;
                inner.projects.delete_project(project_id)
            })
            .map_err(unavailable)
    }

    pub fn state(&self, project_id: &str) -> Result<Option<RunState>> {
        self.inner.store.get(project_id).map_err(unavailable)
    }

    pub fn is_active(&self, project_id: &str) -> Result<bool> {
        Ok(self.state(project_id)?.map(|s| s.is_active).unwrap_or(false))
    }

    pub fn token_usage(&self, project_id: &str) -> Result<u64> {
        self.inner
            .store
            .latest_token_usage(project_id)
            .map_err(unavailable)
    }

    /// Acknowledge a newly connected subscriber.
    pub fn connected(&self) {
        self.notify(
            topics::CONNECTION_ACK,
            serde_json::json!({ "data": "Server Connected" }),
        );
    }

    fn notify(&self, topic: &str, payload: serde_json::Value) {
        match self.inner.notifier.publish(topic, payload) {
            Ok(reached) => debug!("Published {} to {} subscribers", topic, reached),
            Err(e) => warn!("Failed to publish {}: {}", topic, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{EventBus, Notification};
    use agentdesk_store::SqliteStore;
    use parking_lot::{Condvar, Mutex};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                cv: Condvar::new(),
            })
        }

        fn wait(&self) {
            let mut open = self.open.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
        }

        fn open(&self) {
            *self.open.lock() = true;
            self.cv.notify_all();
        }
    }

    #[derive(Default)]
    struct RecordingTask {
        calls: Mutex<Vec<(RunMode, String, String)>>,
        gate: Option<Arc<Gate>>,
        fail: bool,
        panic: bool,
        no_context: bool,
        tokens: u64,
    }

    impl RecordingTask {
        fn gated(gate: &Arc<Gate>) -> Self {
            Self {
                gate: Some(gate.clone()),
                ..Default::default()
            }
        }

        fn run(&self, mode: RunMode, input: &RunInput, ctx: &RunContext) -> Result<()> {
            self.calls
                .lock()
                .push((mode, input.text.clone(), input.project_id.clone()));
            if let Some(gate) = &self.gate {
                gate.wait();
            }
            if self.tokens > 0 {
                ctx.add_token_usage(self.tokens)?;
            }
            if self.panic {
                panic!("agent crashed");
            }
            if self.fail {
                return Err(Error::Internal("model offline".into()));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<(RunMode, String, String)> {
            self.calls.lock().clone()
        }
    }

    impl RunTask for RecordingTask {
        fn start_fresh(&self, input: &RunInput, ctx: &RunContext) -> Result<()> {
            self.run(RunMode::Fresh, input, ctx)
        }

        fn continue_prior(&self, input: &RunInput, ctx: &RunContext) -> Result<()> {
            self.run(RunMode::Continue, input, ctx)
        }

        fn has_context(&self, _project_id: &str) -> bool {
            !self.no_context
        }
    }

    struct FailingStore;

    impl StateStore for FailingStore {
        fn get(&self, _project_id: &str) -> Result<Option<RunState>> {
            Err(Error::StoreUnavailable("disk detached".into()))
        }
        fn put(&self, _state: &RunState) -> Result<()> {
            Err(Error::StoreUnavailable("disk detached".into()))
        }
        fn delete(&self, _project_id: &str) -> Result<bool> {
            Err(Error::StoreUnavailable("disk detached".into()))
        }
        fn list_active(&self) -> Result<Vec<RunState>> {
            Err(Error::StoreUnavailable("disk detached".into()))
        }
    }

    /// Registry that pauses inside `project_exists` until released.
    struct PausingRegistry {
        inner: Arc<SqliteStore>,
        checked: Arc<Gate>,
        release: Arc<Gate>,
    }

    impl ProjectRegistry for PausingRegistry {
        fn create_project(&self, name: &str) -> Result<agentdesk_store::Project> {
            self.inner.create_project(name)
        }
        fn project_exists(&self, name: &str) -> Result<bool> {
            let exists = self.inner.project_exists(name);
            self.checked.open();
            self.release.wait();
            exists
        }
        fn list_projects(&self) -> Result<Vec<agentdesk_store::Project>> {
            self.inner.list_projects()
        }
        fn delete_project(&self, name: &str) -> Result<bool> {
            self.inner.delete_project(name)
        }
        fn add_message(
            &self,
            project: &str,
            from_agent: bool,
            text: &str,
        ) -> Result<agentdesk_store::Message> {
            self.inner.add_message(project, from_agent, text)
        }
        fn get_messages(&self, project: &str) -> Result<Vec<agentdesk_store::Message>> {
            self.inner.get_messages(project)
        }
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn publish(&self, _topic: &str, _payload: serde_json::Value) -> Result<usize> {
            Err(Error::Notification("socket closed".into()))
        }
    }

    struct Fixture {
        orch: Orchestrator,
        store: Arc<SqliteStore>,
        bus: EventBus,
        task: Arc<RecordingTask>,
        _dir: TempDir,
    }

    fn fixture(task: RecordingTask) -> Fixture {
        fixture_with_ttl(task, DEFAULT_LEASE_TTL)
    }

    fn fixture_with_ttl(task: RecordingTask, ttl: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        store.create_project("proj1").unwrap();
        let bus = EventBus::new();
        let task = Arc::new(task);
        let orch = Orchestrator::new(
            store.clone(),
            store.clone(),
            task.clone(),
            Arc::new(bus.clone()),
            ttl,
        );
        Fixture {
            orch,
            store,
            bus,
            task,
            _dir: dir,
        }
    }

    fn state(active: bool, completed: bool) -> RunState {
        let now = now_millis();
        RunState {
            is_active: active,
            is_completed: completed,
            run_id: Some("previous".into()),
            heartbeat_at: Some(now),
            updated_at: now,
            ..RunState::new("proj1")
        }
    }

    async fn wait_for_status(
        rx: &mut broadcast::Receiver<Notification>,
        status: &str,
    ) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let n = rx.recv().await.unwrap();
                if n.topic == topics::STATE_CHANGED && n.payload["status"] == status {
                    return n;
                }
            }
        })
        .await
        .expect("timed out waiting for state change")
    }

    async fn wait_until_idle(store: &SqliteStore, project: &str) -> RunState {
        for _ in 0..500 {
            if let Some(s) = store.get(project).unwrap() {
                if !s.is_active {
                    return s;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run for {} never finished", project);
    }

    #[tokio::test]
    async fn test_first_submit_starts_fresh() {
        let gate = Gate::new();
        let f = fixture(RecordingTask::gated(&gate));
        let mut rx = f.bus.subscribe();

        let dispatch = f.orch.submit(RunInput::new("hello", "proj1")).unwrap();
        assert_eq!(dispatch.mode, RunMode::Fresh);

        let during = f.store.get("proj1").unwrap().unwrap();
        assert!(during.is_active);
        assert!(!during.is_completed);
        assert!(during.is_run(&dispatch.run_id));

        gate.open();
        wait_for_status(&mut rx, "completed").await;

        let after = f.store.get("proj1").unwrap().unwrap();
        assert!(!after.is_active);
        assert!(after.is_completed);
        assert_eq!(
            f.task.calls(),
            vec![(RunMode::Fresh, "hello".to_string(), "proj1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_completed_project_continues() {
        let gate = Gate::new();
        let f = fixture(RecordingTask::gated(&gate));
        f.store.put(&state(false, true)).unwrap();
        let mut rx = f.bus.subscribe();

        let dispatch = f.orch.submit(RunInput::new("more", "proj1")).unwrap();
        assert_eq!(dispatch.mode, RunMode::Continue);

        let during = f.store.get("proj1").unwrap().unwrap();
        assert!(during.is_active);
        assert!(!during.is_completed);

        gate.open();
        wait_for_status(&mut rx, "completed").await;
        assert_eq!(
            f.task.calls(),
            vec![(RunMode::Continue, "more".to_string(), "proj1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_busy_project_is_refused_with_warning() {
        let f = fixture(RecordingTask::default());
        let busy = state(true, false);
        f.store.put(&busy).unwrap();
        let mut rx = f.bus.subscribe();

        let err = f.orch.submit(RunInput::new("again", "proj1")).unwrap_err();
        assert!(matches!(err, Error::RunRefused(ref p) if p == "proj1"));
        assert!(err.is_retryable());

        let warning = rx.try_recv().unwrap();
        assert_eq!(warning.topic, topics::WARNING);
        assert_eq!(warning.payload["message"], BUSY_MESSAGE);

        assert!(f.task.calls().is_empty());
        assert_eq!(f.store.get("proj1").unwrap(), Some(busy));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_dispatch_once() {
        let gate = Gate::new();
        let f = fixture(RecordingTask::gated(&gate));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let orch = f.orch.clone();
                tokio::spawn(async move { orch.submit(RunInput::new(format!("msg {}", i), "proj1")) })
            })
            .collect();

        let mut dispatched = 0;
        let mut refused = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => dispatched += 1,
                Err(Error::RunRefused(_)) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(dispatched, 1);
        assert_eq!(refused, 15);

        gate.open();
        wait_until_idle(&f.store, "proj1").await;
        assert_eq!(f.task.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cleared_state_starts_fresh() {
        let f = fixture(RecordingTask::default());
        f.store.put(&state(false, true)).unwrap();

        assert!(f.orch.clear_state("proj1").unwrap());
        assert!(f.store.get("proj1").unwrap().is_none());

        let mut rx = f.bus.subscribe();
        let dispatch = f.orch.submit(RunInput::new("hello", "proj1")).unwrap();
        assert_eq!(dispatch.mode, RunMode::Fresh);
        wait_for_status(&mut rx, "completed").await;
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let f = fixture(RecordingTask::default());
        let err = f.orch.submit(RunInput::new("hi", "ghost")).unwrap_err();
        assert!(matches!(err, Error::UnknownProject(ref p) if p == "ghost"));
        assert!(f.store.get("ghost").unwrap().is_none());
        assert!(f.task.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_is_resumable() {
        let f = fixture(RecordingTask {
            fail: true,
            ..Default::default()
        });
        let mut rx = f.bus.subscribe();

        f.orch.submit(RunInput::new("first", "proj1")).unwrap();
        wait_for_status(&mut rx, "failed").await;

        let after = f.store.get("proj1").unwrap().unwrap();
        assert!(!after.is_active);
        assert!(!after.is_completed);
        assert!(after.last_error.as_deref().unwrap().contains("model offline"));

        let retry = f.orch.submit(RunInput::new("second", "proj1")).unwrap();
        assert_eq!(retry.mode, RunMode::Continue);
        wait_for_status(&mut rx, "failed").await;
    }

    #[tokio::test]
    async fn test_failed_run_without_context_restarts_fresh() {
        let f = fixture(RecordingTask {
            fail: true,
            no_context: true,
            ..Default::default()
        });
        let mut rx = f.bus.subscribe();

        f.orch.submit(RunInput::new("first", "proj1")).unwrap();
        wait_for_status(&mut rx, "failed").await;

        let retry = f.orch.submit(RunInput::new("second", "proj1")).unwrap();
        assert_eq!(retry.mode, RunMode::Fresh);
        wait_for_status(&mut rx, "failed").await;
    }

    #[tokio::test]
    async fn test_panicking_task_releases_project() {
        let f = fixture(RecordingTask {
            panic: true,
            ..Default::default()
        });
        let mut rx = f.bus.subscribe();

        f.orch.submit(RunInput::new("boom", "proj1")).unwrap();
        wait_for_status(&mut rx, "failed").await;

        let after = f.store.get("proj1").unwrap().unwrap();
        assert!(!after.is_active);
        assert!(after.last_error.as_deref().unwrap().contains("aborted"));
    }

    #[tokio::test]
    async fn test_store_unavailable_dispatches_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(SqliteStore::open(dir.path()).unwrap());
        registry.create_project("proj1").unwrap();
        let task = Arc::new(RecordingTask::default());
        let orch = Orchestrator::new(
            Arc::new(FailingStore),
            registry,
            task.clone(),
            Arc::new(EventBus::new()),
            DEFAULT_LEASE_TTL,
        );

        let err = orch.submit(RunInput::new("hello", "proj1")).unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(task.calls().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        store.create_project("proj1").unwrap();
        let task = Arc::new(RecordingTask::default());
        let orch = Orchestrator::new(
            store.clone(),
            store.clone(),
            task.clone(),
            Arc::new(FailingNotifier),
            DEFAULT_LEASE_TTL,
        );

        orch.submit(RunInput::new("hello", "proj1")).unwrap();
        let after = wait_until_idle(&store, "proj1").await;
        assert!(after.is_completed);

        let err = {
            store.put(&state(true, false)).unwrap();
            orch.submit(RunInput::new("again", "proj1")).unwrap_err()
        };
        assert!(matches!(err, Error::RunRefused(_)));
        assert_eq!(task.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_resumed() {
        let f = fixture_with_ttl(RecordingTask::default(), Duration::from_secs(1));
        let mut stale = state(true, false);
        stale.heartbeat_at = Some(now_millis() - 10_000);
        f.store.put(&stale).unwrap();
        let mut rx = f.bus.subscribe();

        let dispatch = f.orch.submit(RunInput::new("resume", "proj1")).unwrap();
        assert_eq!(dispatch.mode, RunMode::Continue);
        assert_ne!(dispatch.run_id, "previous");
        wait_for_status(&mut rx, "completed").await;
    }

    #[tokio::test]
    async fn test_reap_stale_releases_only_expired() {
        let f = fixture_with_ttl(RecordingTask::default(), Duration::from_secs(1));
        f.store.create_project("proj2").unwrap();

        let mut stale = state(true, false);
        stale.heartbeat_at = Some(now_millis() - 10_000);
        f.store.put(&stale).unwrap();
        f.store
            .put(&RunState {
                project_id: "proj2".into(),
                ..state(true, false)
            })
            .unwrap();

        let released = f.orch.reap_stale().unwrap();
        assert_eq!(released, vec!["proj1".to_string()]);

        let reaped = f.store.get("proj1").unwrap().unwrap();
        assert!(!reaped.is_active);
        assert!(!reaped.is_completed);
        assert_eq!(reaped.last_error.as_deref(), Some("lease expired"));
        assert!(f.store.get("proj2").unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_recover_interrupted_releases_all_active() {
        let f = fixture(RecordingTask::default());
        f.store.put(&state(true, false)).unwrap();

        let released = f.orch.recover_interrupted().unwrap();
        assert_eq!(released, vec!["proj1".to_string()]);
        assert!(!f.orch.is_active("proj1").unwrap());

        let dispatch = f.orch.submit(RunInput::new("resume", "proj1")).unwrap();
        assert_eq!(dispatch.mode, RunMode::Continue);
    }

    #[tokio::test]
    async fn test_late_completion_of_superseded_run_is_ignored() {
        let f = fixture(RecordingTask::default());
        let current = RunState {
            run_id: Some("current".into()),
            ..state(true, false)
        };
        f.store.put(&current).unwrap();

        assert!(!f.orch.finish("proj1", "stale-run", Ok(())).unwrap());
        assert_eq!(f.store.get("proj1").unwrap(), Some(current));

        assert!(f.orch.finish("proj1", "current", Ok(())).unwrap());
        assert!(f.store.get("proj1").unwrap().unwrap().is_completed);
    }

    #[tokio::test]
    async fn test_token_usage_accumulates_across_runs() {
        let f = fixture(RecordingTask {
            tokens: 10,
            ..Default::default()
        });
        let mut rx = f.bus.subscribe();

        f.orch.submit(RunInput::new("one", "proj1")).unwrap();
        wait_for_status(&mut rx, "completed").await;
        f.orch.submit(RunInput::new("two", "proj1")).unwrap();
        wait_for_status(&mut rx, "completed").await;

        assert_eq!(f.orch.token_usage("proj1").unwrap(), 20);
    }

    #[tokio::test]
    async fn test_context_updates_dropped_after_supersede() {
        let f = fixture(RecordingTask::default());
        f.store.put(&state(true, false)).unwrap();

        let ctx = RunContext::new(
            "proj1".into(),
            "old-run".into(),
            f.store.clone(),
            Arc::new(ProjectLocks::new()),
            Arc::new(f.bus.clone()),
        );
        assert!(!ctx.add_token_usage(5).unwrap());
        assert_eq!(f.orch.token_usage("proj1").unwrap(), 0);

        let owner = RunContext::new(
            "proj1".into(),
            "previous".into(),
            f.store.clone(),
            Arc::new(ProjectLocks::new()),
            Arc::new(f.bus.clone()),
        );
        assert!(owner.add_token_usage(5).unwrap());
        assert!(owner
            .set_terminal_session(serde_json::json!({"output": "ok"}))
            .unwrap());
        let s = f.store.get("proj1").unwrap().unwrap();
        assert_eq!(s.token_usage, 5);
        assert_eq!(s.terminal_session, Some(serde_json::json!({"output": "ok"})));
    }

    #[tokio::test]
    async fn test_long_run_keeps_its_lease() {
        let gate = Gate::new();
        let f = fixture_with_ttl(RecordingTask::gated(&gate), Duration::from_millis(600));
        let mut rx = f.bus.subscribe();

        let first = f.orch.submit(RunInput::new("slow", "proj1")).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let err = f.orch.submit(RunInput::new("impatient", "proj1")).unwrap_err();
        assert!(matches!(err, Error::RunRefused(_)));
        assert!(f.orch.reap_stale().unwrap().is_empty());
        assert!(f.store.get("proj1").unwrap().unwrap().is_run(&first.run_id));

        gate.open();
        let done = wait_for_status(&mut rx, "completed").await;
        assert_eq!(done.payload["run_id"], first.run_id.as_str());
        assert!(f.store.get("proj1").unwrap().unwrap().is_completed);
        assert_eq!(f.task.calls().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_during_submit_leaves_no_orphan_state() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        store.create_project("proj1").unwrap();
        let checked = Gate::new();
        let release = Gate::new();
        let registry = Arc::new(PausingRegistry {
            inner: store.clone(),
            checked: checked.clone(),
            release: release.clone(),
        });
        let orch = Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(RecordingTask::default()),
            Arc::new(EventBus::new()),
            DEFAULT_LEASE_TTL,
        );

        let submit = {
            let orch = orch.clone();
            tokio::task::spawn_blocking(move || orch.submit(RunInput::new("hi", "proj1")))
        };
        let waiter = checked.clone();
        tokio::task::spawn_blocking(move || waiter.wait()).await.unwrap();

        let delete = {
            let orch = orch.clone();
            tokio::task::spawn_blocking(move || orch.delete_project("proj1"))
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.open();

        submit.await.unwrap().unwrap();
        assert!(delete.await.unwrap().unwrap());
        assert!(!store.project_exists("proj1").unwrap());
        assert!(store.get("proj1").unwrap().is_none());
    }

    #[test]
    fn test_heartbeat_interval() {
        assert_eq!(heartbeat_interval(Duration::from_secs(300)), Duration::from_secs(100));
        assert_eq!(heartbeat_interval(Duration::ZERO), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_delete_project_removes_everything() {
        let f = fixture(RecordingTask::default());
        f.store.put(&state(false, true)).unwrap();

        assert!(f.orch.delete_project("proj1").unwrap());
        assert!(f.orch.state("proj1").unwrap().is_none());

        let err = f.orch.submit(RunInput::new("hi", "proj1")).unwrap_err();
        assert!(matches!(err, Error::UnknownProject(_)));
    }

    #[test]
    fn test_submit_outside_runtime_fails_cleanly() {
        let f = fixture(RecordingTask::default());
        let err = f.orch.submit(RunInput::new("hi", "proj1")).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(f.store.get("proj1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connected_publishes_ack() {
        let f = fixture(RecordingTask::default());
        let mut rx = f.bus.subscribe();
        f.orch.connected();
        let ack = rx.try_recv().unwrap();
        assert_eq!(ack.topic, topics::CONNECTION_ACK);
        assert_eq!(ack.payload["data"], "Server Connected");
    }
}
