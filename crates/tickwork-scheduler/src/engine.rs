use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tickwork_core::config::SchedulerSection;

use crate::{
    clock::{Clock, SystemClock},
    error::{Result, SchedulerError},
    schedule,
    store::JobStore,
    types::{Job, JobStatus, Millis, Recurrence},
};

/// Tick loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Polling cadence; also the scheduling resolution.
    pub tick_interval: Duration,
    /// Deadline for a single handler attempt. `None` waits forever.
    ///
    /// On expiry the handler task is aborted, which takes effect at its next
    /// `.await`. A handler that blocks without yielding keeps its thread busy
    /// until it returns, but its result is discarded.
    pub handler_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1_000),
            handler_timeout: None,
        }
    }
}

impl From<&SchedulerSection> for SchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            tick_interval: section.tick_interval(),
            handler_timeout: section.handler_timeout(),
        }
    }
}

/// Transition taken by one call to [`Scheduler::execute_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// One-shot job succeeded and was removed.
    Completed,
    /// One-shot job failed and was retained.
    Failed { error: String, retry_count: u32 },
    /// Recurring job was reset to pending at `next`. `error` is set when the
    /// cycle that just ended failed.
    Rescheduled { next: Millis, error: Option<String> },
    /// The job was already executing, or disappeared before it could start.
    Skipped,
}

struct Ticker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drives the tick loop: finds due jobs, runs their handlers and applies the
/// completion, failure or recurrence policy.
///
/// Jobs within a tick run one at a time. A job id is never executed by two
/// overlapping calls; the duplicate is skipped and logged.
pub struct Scheduler {
    store: Arc<JobStore>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
    ticker: Mutex<Option<Ticker>>,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>, config: SchedulerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<JobStore>, config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            running: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            ticker: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of jobs whose handlers are executing right now.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().expect("in-flight set poisoned").len()
    }

    /// Run one tick immediately, then keep ticking every `tick_interval`.
    ///
    /// No-op if already running. Must be called from within a Tokio runtime.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler started"
        );

        self.tick().await;

        // `halt` clears `running` before taking this lock, so the check below
        // never installs a ticker behind a stopped scheduler.
        let mut slot = self.ticker.lock().expect("ticker poisoned");
        if !self.is_running() || slot.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let period = this.config.tick_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("tick loop exiting");
                            break;
                        }
                    }
                }
            }
        });

        *slot = Some(Ticker { shutdown, handle });
    }

    /// Stop arming new ticks. An in-progress tick finishes its due jobs.
    ///
    /// No-op if not running.
    pub fn stop(&self) {
        if let Some(handle) = self.halt() {
            // Detach: the loop exits on its own once the current tick ends.
            drop(handle);
        }
    }

    /// Like [`Scheduler::stop`], but waits for the tick loop to exit.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.halt() {
            if let Err(e) = handle.await {
                error!("tick loop ended abnormally: {e}");
            }
        }
    }

    fn halt(&self) -> Option<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return None;
        }
        let ticker = self.ticker.lock().expect("ticker poisoned").take();
        info!("scheduler stopped");
        ticker.map(|t| {
            // Receiver may already be gone if the loop exited; nothing to signal then.
            let _ = t.shutdown.send(true);
            t.handle
        })
    }

    /// Execute every job that is due now. Returns how many were picked up.
    ///
    /// No-op while the scheduler is not running. Never fails: every per-job
    /// error is logged and converted into that job's failure path, and a
    /// panic outside the handler only abandons the job it happened in.
    pub async fn tick(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let now = self.clock.now_ms();
        let due = self.store.get_due_jobs(now);
        let count = due.len();
        if count > 0 {
            debug!(count, now, "tick found due jobs");
        }
        for job in due {
            let id = job.id.clone();
            if let Err(payload) = AssertUnwindSafe(self.execute_job(job)).catch_unwind().await {
                error!(job_id = %id, "job execution panicked: {}", panic_message(payload));
            }
        }
        count
    }

    /// Run one execution cycle for `job` and apply the result to the store.
    pub async fn execute_job(&self, job: Job) -> ExecutionOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &job.id) else {
            let dup = SchedulerError::DuplicateExecution { id: job.id.clone() };
            warn!(job_id = %job.id, code = dup.code(), "skipping duplicate execution");
            return ExecutionOutcome::Skipped;
        };

        match self.store.update_job_status(&job.id, JobStatus::Running) {
            Ok(()) => {}
            Err(SchedulerError::JobNotFound { .. }) => {
                warn!(job_id = %job.id, "job disappeared before execution");
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                error!(job_id = %job.id, "could not mark job running, executing anyway: {e}");
            }
        }

        info!(job_id = %job.id, handler = %job.handler_name, "job started");
        let started = Instant::now();
        let result = self.invoke(&job).await;
        let finished_at = self.clock.now_ms();
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                info!(
                    job_id = %job.id,
                    handler = %job.handler_name,
                    duration_ms,
                    result = %preview(&value),
                    "job completed"
                );
                self.apply_success(&job, finished_at)
            }
            Err(message) => {
                warn!(
                    job_id = %job.id,
                    handler = %job.handler_name,
                    duration_ms,
                    error = %message,
                    "job failed"
                );
                self.apply_failure(&job, finished_at, message)
            }
        }
    }

    /// Queue a one-shot job `delay_ms` from now. Returns the generated id.
    pub fn schedule_job(&self, handler_name: &str, delay_ms: u64, data: Value) -> Result<String> {
        let now = self.clock.now_ms();
        let delay = i64::try_from(delay_ms).unwrap_or(i64::MAX);
        let job = Job::new(generate_job_id(now), now.saturating_add(delay), handler_name, data)
            .with_created_at(now);
        self.add_scheduled(job)
    }

    /// Queue a cron-driven recurring job, first due at the next occurrence.
    pub fn schedule_recurring_job(
        &self,
        handler_name: &str,
        cron_expression: &str,
        data: Value,
    ) -> Result<String> {
        schedule::parse(cron_expression)?;
        let now = self.clock.now_ms();
        let first = schedule::next_occurrence(cron_expression, now)?;
        let job = Job::new(generate_job_id(now), first, handler_name, data)
            .with_cron(cron_expression)
            .with_created_at(now);
        self.add_scheduled(job)
    }

    /// Queue a job that repeats every `interval_ms`, first due one interval from now.
    pub fn schedule_interval_job(
        &self,
        handler_name: &str,
        interval_ms: u64,
        data: Value,
    ) -> Result<String> {
        if interval_ms == 0 {
            return Err(SchedulerError::Validation("interval must be positive".into()));
        }
        let now = self.clock.now_ms();
        let first = schedule::next_run(&Recurrence::Interval(interval_ms), now)?;
        let job = Job::new(generate_job_id(now), first, handler_name, data)
            .with_interval(interval_ms)
            .with_created_at(now);
        self.add_scheduled(job)
    }

    fn add_scheduled(&self, job: Job) -> Result<String> {
        let description = job.schedule_description();
        let handler = job.handler_name.clone();
        let id = self.store.add_job(job)?;
        info!(job_id = %id, %handler, schedule = %description, "job scheduled");
        Ok(id)
    }

    /// Resolve and run the handler. Every way an attempt can go wrong comes
    /// back as an error message.
    async fn invoke(&self, job: &Job) -> std::result::Result<Value, String> {
        let handler = self.store.get_handler_for_job(job).map_err(|e| e.to_string())?;
        let data = job.data.clone();
        let mut task = tokio::spawn(async move { handler.call(data).await });

        let joined = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(format!("handler timed out after {}ms", limit.as_millis()));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err(format!("handler panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(format!("handler task was cancelled: {e}")),
        }
    }

    /// The handler succeeded, so the outcome never turns into a failure over
    /// a mirror write: memory already reflects the transition.
    fn apply_success(&self, job: &Job, finished_at: Millis) -> ExecutionOutcome {
        if let Err(e) = self
            .store
            .update_job_execution(&job.id, finished_at, None, job.retry_count)
        {
            error!(job_id = %job.id, code = e.code(), "could not record success: {e}");
        }

        match job.recurrence() {
            Some(recurrence) => match self.reschedule(job, &recurrence, finished_at) {
                Ok(next) => ExecutionOutcome::Rescheduled { next, error: None },
                Err(e) => {
                    error!(job_id = %job.id, code = e.code(), "could not reschedule after success: {e}");
                    self.apply_failure(job, finished_at, e.to_string())
                }
            },
            None => {
                match self.store.remove_job(&job.id) {
                    Ok(_) => info!(job_id = %job.id, "job removed after completion"),
                    // The mirror keeps a `completed` row; `init` purges it.
                    Err(e) => error!(
                        job_id = %job.id,
                        code = e.code(),
                        "job completed but its mirror row was not deleted: {e}"
                    ),
                }
                ExecutionOutcome::Completed
            }
        }
    }

    fn apply_failure(&self, job: &Job, finished_at: Millis, message: String) -> ExecutionOutcome {
        let retry_count = job.retry_count.saturating_add(1);
        if let Err(e) =
            self.store
                .update_job_execution(&job.id, finished_at, Some(message.clone()), retry_count)
        {
            error!(job_id = %job.id, code = e.code(), "could not record failure: {e}");
        }

        match job.recurrence() {
            Some(recurrence) => match self.reschedule(job, &recurrence, finished_at) {
                Ok(next) => ExecutionOutcome::Rescheduled {
                    next,
                    error: Some(message),
                },
                Err(e) => {
                    error!(job_id = %job.id, code = e.code(), "could not reschedule after failure: {e}");
                    ExecutionOutcome::Failed {
                        error: message,
                        retry_count,
                    }
                }
            },
            None => {
                info!(job_id = %job.id, retry_count, "job retained for retry");
                ExecutionOutcome::Failed {
                    error: message,
                    retry_count,
                }
            }
        }
    }

    fn reschedule(&self, job: &Job, recurrence: &Recurrence, from: Millis) -> Result<Millis> {
        let next = schedule::next_run(recurrence, from)?;
        match self.store.reschedule_job(&job.id, next) {
            Ok(_) => info!(job_id = %job.id, next, "recurring job rescheduled"),
            // Memory already holds the new cycle.
            Err(e @ SchedulerError::Persistence(_)) => {
                error!(job_id = %job.id, next, "recurring job rescheduled in memory only: {e}")
            }
            Err(e) => return Err(e),
        }
        Ok(next)
    }
}

/// Removes the job id from the in-flight set when dropped, whatever path
/// the execution took.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .expect("in-flight set poisoned")
            .insert(id.to_string());
        inserted.then(|| Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

/// `job-<ms>-<9 hex chars>`: practically unique, not cryptographically so.
fn generate_job_id(now: Millis) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("job-{now}-{}", &suffix[..9])
}

fn preview(value: &Value) -> String {
    let mut text = value.to_string();
    if text.len() > 100 {
        let mut cut = 100;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::SqliteMirror;
    use crate::mirror::JobMirror;
    use crate::registry::HandlerRegistry;
    use crate::testing::FlakyMirror;

    fn setup(clock: Arc<dyn Clock>, config: SchedulerConfig) -> Arc<Scheduler> {
        setup_with(clock, config, Arc::new(SqliteMirror::open_in_memory().unwrap()))
    }

    fn setup_with(
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        mirror: Arc<dyn JobMirror>,
    ) -> Arc<Scheduler> {
        let registry = Arc::new(HandlerRegistry::new());
        let store = Arc::new(JobStore::new(registry, mirror));
        Arc::new(Scheduler::with_clock(store, config, clock))
    }

    /// Registers `name` and returns how many times it has run.
    fn register_counting(s: &Scheduler, name: &str) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        s.store()
            .registry()
            .register_fn(name, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(Value::Null) }
            })
            .unwrap();
        calls
    }

    /// Long tick interval so only explicit ticks run.
    fn quiet() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(3_600),
            handler_timeout: None,
        }
    }

    fn register_ok(s: &Scheduler, name: &str) {
        s.store()
            .registry()
            .register_fn(name, |_| async { anyhow::Ok(json!("done")) })
            .unwrap();
    }

    fn register_boom(s: &Scheduler, name: &str) {
        s.store()
            .registry()
            .register_fn(name, |_| async { Err::<Value, _>(anyhow::anyhow!("boom")) })
            .unwrap();
    }

    fn t(h: u32, m: u32, s: u32, ms: i64) -> Millis {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s)
            .single()
            .unwrap()
            .timestamp_millis()
            + ms
    }

    #[tokio::test]
    async fn successful_one_shot_job_is_removed() {
        let clock = Arc::new(ManualClock::new(t(9, 0, 0, 0)));
        let s = setup(clock.clone(), quiet());
        register_ok(&s, "h");
        s.store()
            .add_job(Job::new("j1", clock.now_ms(), "h", json!({})))
            .unwrap();

        s.start().await;

        assert!(s.store().get_job("j1").is_none());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn failing_job_is_retained_with_error() {
        let clock = Arc::new(ManualClock::new(t(9, 0, 0, 0)));
        let s = setup(clock.clone(), quiet());
        register_boom(&s, "h");
        s.store()
            .add_job(Job::new("j2", clock.now_ms(), "h", json!({})))
            .unwrap();

        s.start().await;

        let job = s.store().get_job("j2").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.retry_count, 1);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn retry_count_grows_by_one_per_failed_attempt() {
        let clock = Arc::new(ManualClock::new(t(9, 0, 0, 0)));
        let s = setup(clock.clone(), quiet());
        register_boom(&s, "h");
        s.store()
            .add_job(Job::new("j", clock.now_ms(), "h", json!({})))
            .unwrap();

        for expected in 1..=3 {
            let job = s.store().get_job("j").unwrap();
            let outcome = s.execute_job(job).await;
            assert_eq!(
                outcome,
                ExecutionOutcome::Failed {
                    error: "boom".into(),
                    retry_count: expected
                }
            );
            assert_eq!(s.store().get_job("j").unwrap().retry_count, expected);
        }
    }

    #[tokio::test]
    async fn recurring_job_advances_to_following_boundary() {
        let clock = Arc::new(ManualClock::new(t(12, 0, 3, 500)));
        let s = setup(clock.clone(), quiet());
        register_ok(&s, "h");

        let id = s.schedule_recurring_job("h", "*/5 * * * * *", json!({})).unwrap();
        assert_eq!(s.store().get_job(&id).unwrap().schedule_time, t(12, 0, 5, 0));

        s.start().await;
        assert_eq!(s.store().get_job(&id).unwrap().schedule_time, t(12, 0, 5, 0));

        clock.set(t(12, 0, 5, 200));
        assert_eq!(s.tick().await, 1);

        let job = s.store().get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.schedule_time, t(12, 0, 10, 0));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn recurring_job_keeps_recurring_after_failure() {
        let clock = Arc::new(ManualClock::new(t(12, 0, 0, 0)));
        let s = setup(clock.clone(), quiet());
        register_boom(&s, "h");
        let id = s.schedule_recurring_job("h", "0 * * * * *", json!({})).unwrap();

        clock.set(t(12, 1, 0, 10));
        let job = s.store().get_job(&id).unwrap();
        let outcome = s.execute_job(job).await;

        assert_eq!(
            outcome,
            ExecutionOutcome::Rescheduled {
                next: t(12, 2, 0, 0),
                error: Some("boom".into())
            }
        );
        let job = s.store().get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.schedule_time > clock.now_ms());
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn interval_job_reschedules_by_its_interval() {
        let clock = Arc::new(ManualClock::new(10_000));
        let s = setup(clock.clone(), quiet());
        register_ok(&s, "h");
        let id = s.schedule_interval_job("h", 1_000, json!({})).unwrap();
        assert_eq!(s.store().get_job(&id).unwrap().schedule_time, 11_000);

        s.start().await;
        clock.advance(1_250);
        s.tick().await;

        assert_eq!(s.store().get_job(&id).unwrap().schedule_time, 12_250);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn failing_mirror_writes_do_not_stop_a_tick() {
        let mirror = Arc::new(FlakyMirror::new());
        let s = setup_with(Arc::new(ManualClock::new(100)), quiet(), mirror.clone());
        let calls = register_counting(&s, "h");
        s.store().add_job(Job::new("a", 10, "h", json!({}))).unwrap();
        s.store().add_job(Job::new("b", 20, "h", json!({}))).unwrap();
        mirror.fail_writes(true);

        s.start().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(s.store().is_empty());
        // Nothing reached the mirror; a restart would run both again.
        let statuses: Vec<String> = mirror
            .get_all()
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses, vec!["pending".to_string(), "pending".to_string()]);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn success_is_reported_even_when_the_mirror_delete_fails() {
        let mirror = Arc::new(FlakyMirror::new());
        let s = setup_with(Arc::new(ManualClock::new(100)), quiet(), mirror.clone());
        register_counting(&s, "h");
        s.store().add_job(Job::new("j", 10, "h", json!({}))).unwrap();
        mirror.fail_deletes.store(true, Ordering::SeqCst);

        let outcome = s.execute_job(s.store().get_job("j").unwrap()).await;

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert!(s.store().get_job("j").is_none());
        assert_eq!(mirror.get_all().unwrap()[0].status, "completed");

        mirror.fail_deletes.store(false, Ordering::SeqCst);
        let restarted = JobStore::new(Arc::new(HandlerRegistry::new()), mirror.clone());
        assert_eq!(restarted.init().unwrap(), 0);
        assert!(mirror.get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recurring_job_stays_scheduled_when_the_mirror_rejects_writes() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mirror = Arc::new(FlakyMirror::new());
        let s = setup_with(clock.clone(), quiet(), mirror.clone());
        register_counting(&s, "h");
        let id = s.schedule_interval_job("h", 500, json!({})).unwrap();
        mirror.fail_writes(true);

        clock.set(1_600);
        let outcome = s.execute_job(s.store().get_job(&id).unwrap()).await;

        assert_eq!(
            outcome,
            ExecutionOutcome::Rescheduled {
                next: 2_100,
                error: None
            }
        );
        let job = s.store().get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.schedule_time, 2_100);
    }

    #[tokio::test]
    async fn mirror_panic_abandons_one_job_and_ticking_continues() {
        let clock = Arc::new(ManualClock::new(100));
        let mirror = Arc::new(FlakyMirror::new());
        let s = setup_with(clock.clone(), quiet(), mirror.clone());
        let calls = register_counting(&s, "h");
        s.store().add_job(Job::new("first", 10, "h", json!({}))).unwrap();
        s.store().add_job(Job::new("later", 20, "h", json!({}))).unwrap();
        mirror.panic_once_on_update("first");

        s.start().await;

        assert!(s.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(s.store().get_job("later").is_none());
        assert!(s.store().get_job("first").is_some());
        assert_eq!(s.in_flight_count(), 0);

        s.store().add_job(Job::new("next", 150, "h", json!({}))).unwrap();
        clock.set(200);
        assert_eq!(s.tick().await, 1);
        assert!(s.store().get_job("next").is_none());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn stop_during_first_tick_leaves_no_ticker() {
        let s = setup(Arc::new(ManualClock::new(100)), quiet());
        let stopper = Arc::clone(&s);
        s.store()
            .registry()
            .register_fn("stop", move |_| {
                stopper.stop();
                async { anyhow::Ok(Value::Null) }
            })
            .unwrap();
        s.store().add_job(Job::new("j", 10, "stop", json!({}))).unwrap();

        s.start().await;

        assert!(!s.is_running());
        assert!(s.ticker.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_handler_fails_the_job_not_the_loop() {
        let clock = Arc::new(ManualClock::new(t(9, 0, 0, 0)));
        let s = setup(clock.clone(), quiet());
        register_ok(&s, "h");
        s.store()
            .add_job(Job::new("lost", clock.now_ms(), "missing", json!({})))
            .unwrap();
        s.store()
            .add_job(Job::new("fine", clock.now_ms(), "h", json!({})))
            .unwrap();

        s.start().await;

        let lost = s.store().get_job("lost").unwrap();
        assert_eq!(lost.status, JobStatus::Failed);
        assert_eq!(lost.last_error.as_deref(), Some("Handler not found: missing"));
        assert!(s.store().get_job("fine").is_none());
        assert!(s.is_running());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn overlapping_execution_of_same_id_is_skipped() {
        let clock = Arc::new(ManualClock::new(0));
        let s = setup(clock.clone(), quiet());
        let gate = Arc::new(Notify::new());
        let handler_gate = Arc::clone(&gate);
        s.store()
            .registry()
            .register_fn("slow", move |_| {
                let gate = Arc::clone(&handler_gate);
                async move {
                    gate.notified().await;
                    anyhow::Ok(Value::Null)
                }
            })
            .unwrap();
        s.store().add_job(Job::new("j", 0, "slow", json!({}))).unwrap();
        let job = s.store().get_job("j").unwrap();

        let first = {
            let s = Arc::clone(&s);
            let job = job.clone();
            tokio::spawn(async move { s.execute_job(job).await })
        };
        while s.in_flight_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(s.execute_job(job).await, ExecutionOutcome::Skipped);

        gate.notify_one();
        assert_eq!(first.await.unwrap(), ExecutionOutcome::Completed);
        assert_eq!(s.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn slow_handler_times_out_as_failure() {
        let clock = Arc::new(ManualClock::new(0));
        let s = setup(
            clock.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_secs(3_600),
                handler_timeout: Some(Duration::from_millis(50)),
            },
        );
        s.store()
            .registry()
            .register_fn("sleepy", |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                anyhow::Ok(Value::Null)
            })
            .unwrap();
        s.store().add_job(Job::new("j", 0, "sleepy", json!({}))).unwrap();

        let outcome = s.execute_job(s.store().get_job("j").unwrap()).await;

        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                error: "handler timed out after 50ms".into(),
                retry_count: 1
            }
        );
        assert_eq!(s.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_handler_is_aborted() {
        let s = setup(
            Arc::new(ManualClock::new(0)),
            SchedulerConfig {
                tick_interval: Duration::from_secs(3_600),
                handler_timeout: Some(Duration::from_millis(30)),
            },
        );
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        s.store()
            .registry()
            .register_fn("late", move |_| {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    flag.store(true, Ordering::SeqCst);
                    anyhow::Ok(Value::Null)
                }
            })
            .unwrap();
        s.store().add_job(Job::new("j", 0, "late", json!({}))).unwrap();

        let outcome = s.execute_job(s.store().get_job("j").unwrap()).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure() {
        let clock = Arc::new(ManualClock::new(0));
        let s = setup(clock.clone(), quiet());
        s.store()
            .registry()
            .register_fn("bad", |_| async {
                if true {
                    panic!("kaboom");
                }
                anyhow::Ok(Value::Null)
            })
            .unwrap();
        s.store().add_job(Job::new("j", 0, "bad", json!({}))).unwrap();

        let outcome = s.execute_job(s.store().get_job("j").unwrap()).await;

        assert_eq!(
            outcome,
            ExecutionOutcome::Failed {
                error: "handler panicked: kaboom".into(),
                retry_count: 1
            }
        );
    }

    #[tokio::test]
    async fn tick_is_a_no_op_when_not_running() {
        let clock = Arc::new(ManualClock::new(100));
        let s = setup(clock.clone(), quiet());
        register_ok(&s, "h");
        s.store().add_job(Job::new("j", 0, "h", json!({}))).unwrap();

        assert_eq!(s.tick().await, 0);
        assert!(s.store().get_job("j").is_some());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let s = setup(Arc::new(ManualClock::new(0)), quiet());
        s.start().await;
        s.start().await;
        assert!(s.is_running());

        s.stop();
        s.stop();
        assert!(!s.is_running());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_ticks_pick_up_later_jobs() {
        let s = setup(
            Arc::new(SystemClock),
            SchedulerConfig {
                tick_interval: Duration::from_millis(20),
                handler_timeout: None,
            },
        );
        register_ok(&s, "h");
        s.start().await;

        let id = s.schedule_job("h", 30, json!({"n": 1})).unwrap();
        assert!(s.store().get_job(&id).is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        while s.store().get_job(&id).is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(s.store().get_job(&id).is_none());
        s.shutdown().await;
    }

    #[test]
    fn schedule_job_sets_time_from_delay() {
        let clock = Arc::new(ManualClock::new(5_000));
        let s = setup(clock, quiet());

        let id = s.schedule_job("h", 2_000, json!({"a": 1})).unwrap();

        assert!(id.starts_with("job-5000-"));
        let job = s.store().get_job(&id).unwrap();
        assert_eq!(job.schedule_time, 7_000);
        assert_eq!(job.created_at, 5_000);
        assert!(!job.is_recurring());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(generate_job_id(1), generate_job_id(1));
    }

    #[test]
    fn invalid_cron_is_rejected_up_front() {
        let s = setup(Arc::new(ManualClock::new(0)), quiet());
        let err = s
            .schedule_recurring_job("h", "0 9 * * *", json!({}))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON_EXPRESSION");
        assert!(s.store().is_empty());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let s = setup(Arc::new(ManualClock::new(0)), quiet());
        let err = s.schedule_interval_job("h", 0, json!({})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn preview_truncates_long_results() {
        let long = json!("x".repeat(300));
        let text = preview(&long);
        assert!(text.ends_with('…'));
        assert!(text.len() <= 100 + '…'.len_utf8());
    }
}
