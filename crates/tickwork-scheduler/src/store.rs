use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::clock::now_ms;
use crate::error::{Result, SchedulerError};
use crate::mirror::JobMirror;
use crate::registry::{HandlerRegistry, JobHandler};
use crate::types::{FieldUpdate, Job, JobStatus, Millis};

/// Authoritative in-memory job index, mirrored to durable storage.
///
/// Every scheduling decision reads from memory. Each mutation updates memory
/// first and then writes the mirror while still holding the index lock. A
/// failed mirror write is returned to the caller but the in-memory change is
/// kept, so memory and mirror may disagree until the next [`JobStore::init`].
pub struct JobStore {
    registry: Arc<HandlerRegistry>,
    mirror: Arc<dyn JobMirror>,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<String, Job>,
    /// `(schedule_time, id)` entries not yet consumed by a due scan.
    timeline: BTreeSet<(Millis, String)>,
}

impl StoreState {
    fn index(&mut self, job: &Job) {
        self.timeline.insert((job.schedule_time, job.id.clone()));
    }

    fn unindex(&mut self, at: Millis, id: &str) {
        self.timeline.remove(&(at, id.to_string()));
    }
}

impl JobStore {
    pub fn new(registry: Arc<HandlerRegistry>, mirror: Arc<dyn JobMirror>) -> Self {
        Self {
            registry,
            mirror,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Memory is always updated before the mirror call, so a mirror that
    /// panicked mid-write leaves a consistent index behind the poisoned lock.
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuild both indexes from the mirror, replacing whatever is in memory.
    ///
    /// Records that fail to decode are skipped with a warning. Returns the
    /// number of jobs loaded.
    pub fn init(&self) -> Result<usize> {
        info!("job store initialising from mirror");
        let records = self.mirror.get_all()?;

        let mut state = self.state();
        *state = StoreState::default();

        let mut skipped = 0usize;
        let mut leftovers = Vec::new();
        for record in records {
            let id = record.id.clone();
            match Job::from_record(record) {
                // Succeeded, but the process lost the removal that follows.
                Ok(job) if job.status == JobStatus::Completed && !job.is_recurring() => {
                    leftovers.push(job.id);
                }
                Ok(job) => {
                    state.index(&job);
                    state.jobs.insert(job.id.clone(), job);
                }
                Err(e) => {
                    skipped += 1;
                    warn!(job_id = %id, code = e.code(), "skipping corrupt job record: {e}");
                }
            }
        }

        for id in &leftovers {
            match self.mirror.delete(id) {
                Ok(()) => info!(job_id = %id, "purged completed one-shot job"),
                Err(e) => warn!(job_id = %id, "could not purge completed one-shot job: {e}"),
            }
        }

        log_recovery_summary(&state, skipped, now_ms());
        Ok(state.jobs.len())
    }

    /// Insert or overwrite a job by id, then mirror it.
    ///
    /// Overwriting moves the job's time-index entry to its new schedule time.
    pub fn add_job(&self, job: Job) -> Result<String> {
        job.validate()?;
        let id = job.id.clone();
        let record = job.to_record();

        let mut state = self.state();
        if let Some(old_at) = state.jobs.get(&id).map(|old| old.schedule_time) {
            state.unindex(old_at, &id);
        }
        state.index(&job);
        state.jobs.insert(id.clone(), job);

        self.mirror.put(&record).inspect_err(|e| {
            error!(job_id = %id, "mirror write failed on add: {e}");
        })?;
        debug!(job_id = %id, schedule_time = record.schedule_time, "job added");
        Ok(id)
    }

    /// Consume every time-index entry at or before `now`.
    ///
    /// Returns the pending jobs among them, earliest first. Entries for
    /// non-pending jobs are consumed too, so those jobs are never offered
    /// again unless re-added.
    pub fn get_due_jobs(&self, now: Millis) -> Vec<Job> {
        let mut state = self.state();
        let later = state.timeline.split_off(&(now.saturating_add(1), String::new()));
        let consumed = std::mem::replace(&mut state.timeline, later);

        let due: Vec<Job> = consumed
            .into_iter()
            .filter_map(|(_, id)| {
                state
                    .jobs
                    .get(&id)
                    .filter(|job| job.status == JobStatus::Pending)
                    .cloned()
            })
            .collect();

        if !due.is_empty() {
            debug!(count = due.len(), "due jobs collected");
        }
        due
    }

    pub fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        job.status = status;

        self.mirror
            .update_fields(id, &FieldUpdate::status(status))
            .inspect_err(|e| error!(job_id = %id, "mirror write failed on status change: {e}"))?;
        debug!(job_id = %id, %status, "job status changed");
        Ok(())
    }

    /// Record the outcome of an attempt.
    ///
    /// `last_error = None` marks the job `completed`, otherwise `failed`.
    pub fn update_job_execution(
        &self,
        id: &str,
        executed_at: Millis,
        last_error: Option<String>,
        retry_count: u32,
    ) -> Result<()> {
        let status = if last_error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        job.status = status;
        job.executed_at = Some(executed_at);
        job.last_error = last_error.clone();
        job.retry_count = retry_count;

        let fields = FieldUpdate {
            status: Some(status),
            executed_at: Some(Some(executed_at)),
            last_error: Some(last_error),
            retry_count: Some(retry_count),
            ..FieldUpdate::default()
        };
        self.mirror
            .update_fields(id, &fields)
            .inspect_err(|e| error!(job_id = %id, "mirror write failed on execution record: {e}"))?;
        debug!(job_id = %id, %status, executed_at, retry_count, "job execution recorded");
        Ok(())
    }

    /// Reset a recurring job for its next cycle at `next`.
    ///
    /// Clears per-cycle state, moves the time-index entry and mirrors the
    /// whole record. Returns the updated job.
    pub fn reschedule_job(&self, id: &str, next: Millis) -> Result<Job> {
        let mut state = self.state();
        let old_at = state
            .jobs
            .get(id)
            .map(|job| job.schedule_time)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        state.unindex(old_at, id);

        let updated = {
            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
            job.reset_for_next_run();
            job.schedule_time = next;
            job.clone()
        };
        state.index(&updated);

        self.mirror
            .put(&updated.to_record())
            .inspect_err(|e| error!(job_id = %id, "mirror write failed on reschedule: {e}"))?;
        debug!(job_id = %id, next, "job rescheduled");
        Ok(updated)
    }

    /// Remove a job from memory, the time index and the mirror.
    ///
    /// Returns whether the job was present in memory. The mirror delete is
    /// attempted either way.
    pub fn remove_job(&self, id: &str) -> Result<bool> {
        let mut state = self.state();
        let existed = match state.jobs.remove(id) {
            Some(job) => {
                state.unindex(job.schedule_time, id);
                true
            }
            None => {
                warn!(job_id = %id, "remove requested for unknown job");
                false
            }
        };

        self.mirror
            .delete(id)
            .inspect_err(|e| error!(job_id = %id, "mirror delete failed: {e}"))?;
        debug!(job_id = %id, "job removed");
        Ok(existed)
    }

    pub fn get_handler_for_job(&self, job: &Job) -> Result<Arc<dyn JobHandler>> {
        self.registry.get(&job.handler_name)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.state().jobs.get(id).cloned()
    }

    /// Snapshot of every job, ordered by schedule time then id.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| (a.schedule_time, &a.id).cmp(&(b.schedule_time, &b.id)));
        jobs
    }

    pub fn pending_count(&self) -> usize {
        self.state()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn log_recovery_summary(state: &StoreState, skipped: usize, now: Millis) {
    let total = state.jobs.len();
    let due_now = state
        .jobs
        .values()
        .filter(|job| job.is_due(now))
        .count();
    let interrupted: Vec<&str> = state
        .jobs
        .values()
        .filter(|job| job.status == JobStatus::Running)
        .map(|job| job.id.as_str())
        .collect();

    if !interrupted.is_empty() {
        warn!(
            count = interrupted.len(),
            jobs = %interrupted.join(", "),
            "jobs were running when the previous process stopped; left for manual retry"
        );
    }

    let next_pending = state
        .jobs
        .values()
        .filter(|job| job.status == JobStatus::Pending && job.schedule_time > now)
        .map(|job| job.schedule_time)
        .min();
    match next_pending {
        Some(at) => info!(
            total,
            due_now,
            skipped,
            next_in_secs = (at - now) as f64 / 1000.0,
            "job store initialised"
        ),
        None => info!(total, due_now, skipped, "job store initialised"),
    }
}
