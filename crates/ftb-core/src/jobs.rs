//! Recurring background jobs and the registry that owns them.
//!
//! A job calls its step, sleeps for the interval, and repeats until cancelled.
//! Step errors are recorded and swallowed; only a fatal invariant violation (or a
//! panic inside the step) ends the loop early, as `Crashed`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    activity::ActivityLog,
    domain::{JobKind, Subject},
    errors::Error,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Cancelled,
    Crashed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Cancelled | JobState::Crashed)
    }
}

/// What one iteration did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Work was done; recorded as activity.
    Completed(String),
    /// Nothing to do this time (quota denied, no new content).
    Skipped(String),
}

#[derive(Clone, Debug)]
pub struct StepContext {
    pub subject: Subject,
    pub kind: JobKind,
    /// 1-based iteration number.
    pub iteration: u64,
}

/// Unit of work run once per iteration.
#[async_trait]
pub trait JobStep: Send + Sync + 'static {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome>;
}

#[derive(Debug)]
struct JobShared {
    state: Mutex<JobState>,
    iterations: AtomicU64,
    failures: AtomicU64,
}

impl JobShared {
    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A running (or finished) recurring job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    pub subject: Subject,
    pub kind: JobKind,
    pub interval: Duration,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// Completed iterations (successful, skipped or failed).
    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::SeqCst)
    }

    /// Iterations whose step returned an error.
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The loop itself. Owned by the spawned task.
pub struct RecurringJob {
    handle: JobHandle,
    step: Arc<dyn JobStep>,
    log: ActivityLog,
}

impl RecurringJob {
    pub fn new(
        subject: Subject,
        kind: JobKind,
        interval: Duration,
        step: Arc<dyn JobStep>,
        log: ActivityLog,
        cancel: CancellationToken,
    ) -> Self {
        let handle = JobHandle {
            subject,
            kind,
            interval,
            started_at: Utc::now(),
            cancel,
            shared: Arc::new(JobShared {
                state: Mutex::new(JobState::Created),
                iterations: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        };
        Self { handle, step, log }
    }

    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> JobState {
        let h = &self.handle;
        h.shared.set_state(JobState::Running);
        info!(
            subject = %h.subject,
            kind = %h.kind,
            interval_s = h.interval.as_secs(),
            "job started"
        );

        let mut iteration = 0u64;
        let final_state = loop {
            if h.cancel.is_cancelled() {
                break JobState::Cancelled;
            }

            iteration += 1;
            let ctx = StepContext {
                subject: h.subject.clone(),
                kind: h.kind,
                iteration,
            };

            if let Err(fatal) = self.run_iteration(ctx).await {
                self.log
                    .fatal(&h.subject, &fatal, Some(h.kind.as_str()))
                    .await;
                break JobState::Crashed;
            }
            h.shared.iterations.fetch_add(1, Ordering::SeqCst);

            tokio::select! {
                _ = h.cancel.cancelled() => break JobState::Cancelled,
                _ = sleep(h.interval) => {}
            }
        };

        h.shared.set_state(final_state);
        info!(subject = %h.subject, kind = %h.kind, state = ?final_state, "job stopped");
        final_state
    }

    /// Run one step in its own task so a panic is contained.
    /// Returns `Err(message)` only for conditions that crash the job.
    async fn run_iteration(&self, ctx: StepContext) -> std::result::Result<(), String> {
        let step = self.step.clone();
        let task_ctx = ctx.clone();
        let joined = tokio::spawn(async move { step.run(&task_ctx).await }).await;

        let subject = &ctx.subject;
        match joined {
            Ok(Ok(StepOutcome::Completed(msg))) => {
                self.log.activity(subject, ctx.kind.as_str(), &msg).await;
                Ok(())
            }
            Ok(Ok(StepOutcome::Skipped(reason))) => {
                debug!(
                    subject = %subject,
                    kind = %ctx.kind,
                    iteration = ctx.iteration,
                    "skipped: {reason}"
                );
                Ok(())
            }
            Ok(Err(e)) if e.is_fatal() => Err(e.to_string()),
            Ok(Err(e)) => {
                self.handle.shared.failures.fetch_add(1, Ordering::SeqCst);
                let context = format!("{} iteration {}", ctx.kind, ctx.iteration);
                self.log.error(subject, &e, Some(&context)).await;
                Ok(())
            }
            Err(join) if join.is_panic() => Err(format!("job step panicked: {join}")),
            Err(join) => Err(format!("job step aborted: {join}")),
        }
    }
}

struct JobEntry {
    handle: JobHandle,
    task: JoinHandle<JobState>,
}

impl JobEntry {
    fn is_stopping(&self) -> bool {
        self.handle.is_cancelled()
    }

    async fn drain(self) {
        if let Err(e) = self.task.await {
            warn!(
                subject = %self.handle.subject,
                kind = %self.handle.kind,
                "job task ended abnormally: {e}"
            );
        }
    }
}

/// At most one live job per (subject, kind).
pub struct JobRegistry {
    log: ActivityLog,
    root: CancellationToken,
    jobs: tokio::sync::Mutex<HashMap<(Subject, JobKind), JobEntry>>,
}

impl JobRegistry {
    pub fn new(log: ActivityLog) -> Self {
        Self {
            log,
            root: CancellationToken::new(),
            jobs: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(
        &self,
        subject: Subject,
        kind: JobKind,
        interval: Duration,
        step: Arc<dyn JobStep>,
    ) -> Result<JobHandle> {
        if self.root.is_cancelled() {
            return Err(Error::RegistryClosed);
        }

        let mut jobs = self.jobs.lock().await;
        let key = (subject.clone(), kind);
        if let Some(existing) = jobs.get(&key) {
            if !existing.is_stopping() && !existing.task.is_finished() {
                return Err(Error::AlreadyRunning { subject, kind });
            }
        }
        // A stopped job may still be finishing its last step.
        if let Some(previous) = jobs.remove(&key) {
            previous.drain().await;
        }

        let job = RecurringJob::new(
            subject,
            kind,
            interval,
            step,
            self.log.clone(),
            self.root.child_token(),
        );
        let handle = job.handle();
        let task = tokio::spawn(job.run());
        jobs.insert(
            key,
            JobEntry {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    /// Signal the job to stop and return its handle. An in-flight step finishes;
    /// a pending sleep is cut short. The entry stays registered until its task
    /// ends, so a restart or `shutdown` waits for it.
    pub async fn stop(&self, subject: &Subject, kind: JobKind) -> Result<JobHandle> {
        let mut jobs = self.jobs.lock().await;
        let key = (subject.clone(), kind);
        match jobs.get(&key) {
            Some(entry) if !entry.is_stopping() && !entry.task.is_finished() => {
                entry.handle.cancel();
                Ok(entry.handle.clone())
            }
            _ => Err(Error::JobNotFound {
                subject: subject.clone(),
                kind,
            }),
        }
    }

    /// Snapshot of registered jobs that were not stopped, ordered by subject then kind.
    pub async fn list(&self) -> Vec<JobHandle> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<JobHandle> = jobs
            .values()
            .filter(|e| !e.is_stopping())
            .map(|e| e.handle.clone())
            .collect();
        out.sort_by(|a, b| (&a.subject, a.kind).cmp(&(&b.subject, b.kind)));
        out
    }

    /// Cancel every job and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let entries: Vec<JobEntry> = {
            let mut jobs = self.jobs.lock().await;
            jobs.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::FailureKind,
        ports::Collection,
        store::memory::MemoryStore,
    };
    use tokio::time::Instant;

    /// Records the (paused-clock) instant of every call; fails or panics on chosen iterations.
    #[derive(Default)]
    struct ScriptedStep {
        calls: Mutex<Vec<(u64, Instant)>>,
        fail_on: Vec<u64>,
        fatal_on: Option<u64>,
        panic_on: Option<u64>,
        busy_for: Duration,
    }

    impl ScriptedStep {
        fn calls(&self) -> Vec<(u64, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    /// Counts how many runs of this step overlap, across every job sharing it.
    #[derive(Default)]
    struct ExclusiveStep {
        active: AtomicU64,
        peak: AtomicU64,
        finished_at: Mutex<Vec<Instant>>,
        started_at: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl JobStep for ExclusiveStep {
        async fn run(&self, _ctx: &StepContext) -> Result<StepOutcome> {
            self.started_at.lock().unwrap().push(Instant::now());
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);
            sleep(Duration::from_secs(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.finished_at.lock().unwrap().push(Instant::now());
            Ok(StepOutcome::Completed("done".to_string()))
        }
    }

    #[async_trait]
    impl JobStep for ScriptedStep {
        async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push((ctx.iteration, Instant::now()));
            if !self.busy_for.is_zero() {
                sleep(self.busy_for).await;
            }
            if self.panic_on == Some(ctx.iteration) {
                panic!("bug in step");
            }
            if self.fatal_on == Some(ctx.iteration) {
                return Err(Error::FatalInvariant("broken invariant".to_string()));
            }
            if self.fail_on.contains(&ctx.iteration) {
                return Err(Error::permanent(FailureKind::Malformed, "bad completion"));
            }
            Ok(StepOutcome::Completed(format!("iteration {}", ctx.iteration)))
        }
    }

    fn setup() -> (Arc<MemoryStore>, JobRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = JobRegistry::new(ActivityLog::new(store.clone()));
        (store, registry)
    }

    async fn wait_for_state(handle: &JobHandle, state: JobState) {
        for _ in 0..1000 {
            if handle.state() == state {
                return;
            }
            tokio::task::yield_now().await;
            sleep(Duration::from_millis(1)).await;
        }
        panic!("job never reached {state:?}, is {:?}", handle.state());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_iteration_is_logged_and_loop_continues() {
        let (store, registry) = setup();
        let step = Arc::new(ScriptedStep {
            fail_on: vec![2],
            ..Default::default()
        });
        let interval = Duration::from_secs(60);
        let handle = registry
            .start(Subject::new("rust"), JobKind::CommentLoop, interval, step.clone())
            .await
            .unwrap();

        sleep(Duration::from_secs(150)).await;

        let calls = step.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, 3);
        assert_eq!(calls[2].1 - calls[1].1, interval);
        assert_eq!(handle.state(), JobState::Running);
        assert_eq!(handle.failures(), 1);

        let errors = store.documents(Collection::Errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["kind"], "permanent_request");
        assert_eq!(store.documents(Collection::Activity).len(), 2);

        registry.shutdown().await;
        assert_eq!(handle.state(), JobState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_is_rejected_until_stopped() {
        let (_store, registry) = setup();
        let subject = Subject::new("rust");
        let interval = Duration::from_secs(1200);

        let idle = || Arc::new(ScriptedStep::default());

        let first = registry
            .start(subject.clone(), JobKind::CommentLoop, interval, idle())
            .await
            .unwrap();
        let err = registry
            .start(subject.clone(), JobKind::CommentLoop, interval, idle())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
        assert_eq!(registry.list().await.len(), 1);

        // a different kind for the same subject is a different job
        registry
            .start(subject.clone(), JobKind::PublishLoop, interval, idle())
            .await
            .unwrap();
        assert_eq!(registry.list().await.len(), 2);

        let stopped = registry.stop(&subject, JobKind::CommentLoop).await.unwrap();
        assert!(stopped.is_cancelled());
        wait_for_state(&first, JobState::Cancelled).await;
        assert!(matches!(
            registry.stop(&subject, JobKind::CommentLoop).await.unwrap_err(),
            Error::JobNotFound { .. }
        ));

        registry
            .start(subject.clone(), JobKind::CommentLoop, interval, idle())
            .await
            .unwrap();
        let kinds: Vec<JobKind> = registry.list().await.iter().map(|h| h.kind).collect();
        assert_eq!(kinds, vec![JobKind::CommentLoop, JobKind::PublishLoop]);
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let (_store, registry) = setup();
        let step = Arc::new(ScriptedStep::default());
        let handle = registry
            .start(
                Subject::new("news"),
                JobKind::PublishLoop,
                Duration::from_secs(3600),
                step.clone(),
            )
            .await
            .unwrap();

        sleep(Duration::from_secs(1)).await;
        let before = Instant::now();
        registry.shutdown().await;
        assert!(Instant::now() - before < Duration::from_secs(1));
        assert_eq!(handle.state(), JobState::Cancelled);
        assert_eq!(step.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_step_finishes_before_cancel() {
        let (store, registry) = setup();
        let step = Arc::new(ScriptedStep {
            busy_for: Duration::from_secs(5),
            ..Default::default()
        });
        let handle = registry
            .start(
                Subject::new("news"),
                JobKind::CommentLoop,
                Duration::from_secs(60),
                step.clone(),
            )
            .await
            .unwrap();

        sleep(Duration::from_secs(1)).await;
        registry.shutdown().await;
        assert_eq!(handle.state(), JobState::Cancelled);
        assert_eq!(handle.iterations(), 1);
        assert_eq!(store.documents(Collection::Activity).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_crashes_job_and_allows_restart() {
        let (store, registry) = setup();
        let subject = Subject::new("rust");
        let step = Arc::new(ScriptedStep {
            fatal_on: Some(2),
            ..Default::default()
        });
        let interval = Duration::from_secs(10);
        let handle = registry
            .start(subject.clone(), JobKind::CommentLoop, interval, step.clone())
            .await
            .unwrap();

        sleep(Duration::from_secs(100)).await;
        assert_eq!(handle.state(), JobState::Crashed);
        assert_eq!(step.calls().len(), 2);

        let errors = store.documents(Collection::Errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["kind"], "fatal");

        // a crashed job does not block a fresh start
        let fresh = Arc::new(ScriptedStep::default());
        registry
            .start(subject, JobKind::CommentLoop, interval, fresh)
            .await
            .unwrap();
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_step_crashes_only_its_job() {
        let (store, registry) = setup();
        let panicking = Arc::new(ScriptedStep {
            panic_on: Some(1),
            ..Default::default()
        });
        let healthy = Arc::new(ScriptedStep::default());
        let interval = Duration::from_secs(10);
        let bad = registry
            .start(Subject::new("a"), JobKind::CommentLoop, interval, panicking)
            .await
            .unwrap();
        let good = registry
            .start(Subject::new("b"), JobKind::CommentLoop, interval, healthy.clone())
            .await
            .unwrap();

        sleep(Duration::from_secs(25)).await;
        assert_eq!(bad.state(), JobState::Crashed);
        assert_eq!(good.state(), JobState::Running);
        assert_eq!(healthy.calls().len(), 3);
        let fatal = store
            .documents(Collection::Errors)
            .into_iter()
            .filter(|e| e["kind"] == "fatal")
            .count();
        assert_eq!(fatal, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn start_after_shutdown_is_refused() {
        let (_store, registry) = setup();
        registry.shutdown().await;
        let err = registry
            .start(
                Subject::new("x"),
                JobKind::Maintenance,
                Duration::from_secs(1),
                Arc::new(ScriptedStep::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryClosed));
        assert!(!err.is_fatal());
        assert_eq!(err.label(), "registry_closed");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_waits_for_in_flight_step() {
        let (_store, registry) = setup();
        let subject = Subject::new("rust");
        let interval = Duration::from_secs(600);
        let step = Arc::new(ExclusiveStep::default());

        let old = registry
            .start(subject.clone(), JobKind::CommentLoop, interval, step.clone())
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;

        let stopped = registry.stop(&subject, JobKind::CommentLoop).await.unwrap();
        assert!(stopped.is_cancelled());
        assert!(registry.list().await.is_empty());
        // stopping twice is not a second stop
        assert!(matches!(
            registry.stop(&subject, JobKind::CommentLoop).await.unwrap_err(),
            Error::JobNotFound { .. }
        ));

        let new = registry
            .start(subject.clone(), JobKind::CommentLoop, interval, step.clone())
            .await
            .unwrap();
        assert_eq!(old.state(), JobState::Cancelled);
        assert_eq!(old.iterations(), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(new.state(), JobState::Running);
        registry.shutdown().await;

        assert_eq!(step.peak.load(Ordering::SeqCst), 1);
        let finished = step.finished_at.lock().unwrap().clone();
        let started = step.started_at.lock().unwrap().clone();
        assert_eq!(started.len(), 2);
        assert!(started[1] >= finished[0]);
        assert_eq!(new.state(), JobState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_a_stopped_job() {
        let (store, registry) = setup();
        let subject = Subject::new("news");
        let step = Arc::new(ExclusiveStep::default());
        let handle = registry
            .start(subject.clone(), JobKind::PublishLoop, Duration::from_secs(600), step)
            .await
            .unwrap();

        sleep(Duration::from_secs(1)).await;
        registry.stop(&subject, JobKind::PublishLoop).await.unwrap();
        registry.shutdown().await;

        assert_eq!(handle.state(), JobState::Cancelled);
        assert_eq!(handle.iterations(), 1);
        assert_eq!(store.documents(Collection::Activity).len(), 1);
    }
}
