//! One job's lifecycle, end to end.
//!
//! A coordinator is the OS process owning a single job (spawned as
//! `fairq exec <id>` by the submit command). It drives the job through
//! `created → waiting|held → pending → running → removed` against the shared
//! store, holding the gate only for the short read-modify-write sessions and
//! never while the payload runs.
//!
//! While not admitted, the process is stopped by the external pause action;
//! the scheduler side resumes it after reserving its resources. The poll that
//! follows the pause request is advisory: it reads the durable state without
//! the gate and discards anything unreadable.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::actions::JobActions;
use crate::config::QueuePaths;
use crate::error::Result;
use crate::gate::Gate;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::store::{self, QueueStore};

/// How often the paused side re-reads durable state waiting for promotion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Coordinator<A: JobActions> {
    paths: QueuePaths,
    gate: Gate,
    store: QueueStore,
    actions: A,
}

impl<A: JobActions> Coordinator<A> {
    pub fn new(paths: QueuePaths, actions: A) -> Result<Self> {
        Self::with_gate(Gate::open()?, paths, actions)
    }

    /// Build against a specific gate. Tests pass uniquely named gates.
    pub fn with_gate(gate: Gate, paths: QueuePaths, actions: A) -> Result<Self> {
        let store = QueueStore::open(paths.clone())?;
        Ok(Self {
            paths,
            gate,
            store,
            actions,
        })
    }

    /// Drive `job_id` from created to removed.
    pub fn run(&mut self, job_id: u32) -> Result<()> {
        let admitted = self.claim(job_id)?;
        if !admitted {
            self.actions.pause_self()?;
            self.wait_for_promotion(job_id);
        }
        let job = self.start(job_id)?;
        let started = Instant::now();
        if let Err(e) = self
            .actions
            .run_payload(&job, self.store.config().abort_on_time_limit)
        {
            // The job is removed either way; resources must never leak.
            tracing::error!(job_id, "payload could not run: {e}");
        }
        self.finish(job_id, started.elapsed())
    }

    /// First gate session: record our pid, leave `created`, try immediate
    /// admission.
    fn claim(&mut self, job_id: u32) -> Result<bool> {
        let guard = self.gate.acquire()?;
        self.store.read()?;
        {
            let job = self.store.job_mut(job_id)?;
            job.pid = std::process::id();
            job.status = if job.depends_on.is_empty() {
                JobStatus::Waiting
            } else {
                JobStatus::Held
            };
        }
        let admitted = self.store.find_executable_job()? == Some(job_id);
        if admitted {
            self.store.admit(job_id)?;
        }
        self.store.write()?;
        guard.release();
        tracing::info!(job_id, admitted, "job claimed");
        Ok(admitted)
    }

    /// Advisory poll outside the gate until promotion is visible.
    fn wait_for_promotion(&self, job_id: u32) {
        loop {
            thread::sleep(POLL_INTERVAL);
            if store::peek_status(&self.paths, job_id) == Some(JobStatus::Pending) {
                return;
            }
        }
    }

    /// Promote to running and hand back a snapshot for the payload.
    fn start(&mut self, job_id: u32) -> Result<Job> {
        let guard = self.gate.acquire()?;
        self.store.read()?;
        {
            let job = self.store.job_mut(job_id)?;
            job.status = JobStatus::Running;
            job.time = Utc::now();
        }
        let job = self.store.job(job_id)?.clone();
        self.store.write()?;
        guard.release();
        tracing::info!(job_id, user = %job.user, "job running");
        Ok(job)
    }

    /// Final gate session: overrun deterrent, removal, cascade.
    fn finish(&mut self, job_id: u32, elapsed: Duration) -> Result<()> {
        let guard = self.gate.acquire()?;
        self.store.read()?;
        let limit = self.store.job(job_id)?.time_limit;
        if elapsed.as_secs_f64() / 3600.0 > f64::from(limit) + 1.0 {
            let elapsed_hours = (elapsed.as_secs() / 3600) as u32;
            tracing::warn!(job_id, limit, elapsed_hours, "job overran its time limit");
            self.store.apply_overrun_penalty(job_id, elapsed_hours)?;
        }
        self.store.remove_job(job_id)?;
        cascade_admissions(&mut self.store, &self.actions)?;
        self.store.write()?;
        guard.release();
        Ok(())
    }
}

/// Admit every job that now fits, resuming each one's paused owner. Used after
/// a completion or after deleting active jobs, while the gate is held.
pub fn cascade_admissions<A: JobActions>(store: &mut QueueStore, actions: &A) -> Result<usize> {
    let mut admitted = 0;
    while let Some(next) = store.find_executable_job()? {
        store.admit(next)?;
        let pid = store.job(next)?.pid;
        if let Err(e) = actions.resume(pid) {
            // The job keeps its reservation; waking it again is up to the
            // operator.
            tracing::warn!(job_id = next, pid, "resume failed: {e}");
        }
        admitted += 1;
    }
    if admitted > 0 {
        tracing::info!(admitted, "cascaded admissions");
    }
    Ok(admitted)
}
