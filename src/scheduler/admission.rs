use chrono::Utc;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::priority::UserPriorities;
use crate::scheduler::store::QueueState;

/// Point-in-time resource check against current occupancy. Reserves nothing.
pub fn job_fits(job: &Job, state: &QueueState, config: &QueueConfig) -> bool {
    let free_threads = config.available_threads - state.occupied_threads;
    let free_memory = config.available_memory - state.occupied_memory;
    job.threads <= free_threads
        && job.memory <= free_memory
        && (!job.use_gpu || state.gpu_occupied.iter().any(|&g| !g))
}

struct RankedJob<'a> {
    job: &'a Job,
    priority: f32,
}

/// Waiting jobs in scheduling order: descending user priority, then
/// descending priority class, then ascending id. The id tie-break makes the
/// order total, so equal-priority jobs run in submission order.
fn ranked_waiting<'a>(
    state: &'a QueueState,
    users: &mut UserPriorities,
) -> Result<Vec<RankedJob<'a>>> {
    let mut ranked = Vec::new();
    for job in state.jobs.iter().filter(|j| j.status == JobStatus::Waiting) {
        let priority = users.priority(&job.user)?;
        ranked.push(RankedJob { job, priority });
    }
    ranked.sort_by(|a, b| {
        b.priority
            .total_cmp(&a.priority)
            .then(b.job.priority_class.cmp(&a.job.priority_class))
            .then(a.job.id.cmp(&b.job.id))
    });
    Ok(ranked)
}

/// Choose the next job to run, if any fits.
///
/// A waiting job holding the maximum priority class is the single candidate
/// of the round: if it does not fit, nothing is selected, even when a smaller
/// job could run. That keeps top-class jobs from being starved by a stream of
/// smaller ones.
pub fn find_executable_job(
    state: &QueueState,
    users: &mut UserPriorities,
    config: &QueueConfig,
) -> Result<Option<u32>> {
    let ranked = ranked_waiting(state, users)?;
    if let Some(top) = ranked
        .iter()
        .find(|r| r.job.priority_class >= config.max_priority_class)
    {
        if job_fits(top.job, state, config) {
            return Ok(Some(top.job.id));
        }
        tracing::debug!(
            job_id = top.job.id,
            "top-class job does not fit, holding all admission"
        );
        return Ok(None);
    }
    Ok(ranked
        .iter()
        .find(|r| job_fits(r.job, state, config))
        .map(|r| r.job.id))
}

/// Reserve resources for `id`, promote it to pending, and charge its user.
///
/// Callers must have established that the job fits. Before committing, the
/// highest-priority other waiting job whose user priority exceeds the
/// admitted job's gets its priority class bumped by one: a job overtaken
/// because it did not fit accumulates authority for later rounds.
pub fn admit(
    state: &mut QueueState,
    users: &mut UserPriorities,
    config: &QueueConfig,
    id: u32,
) -> Result<()> {
    let (threads, memory, use_gpu, user) = {
        let job = state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .ok_or(QueueError::JobNotFound(id))?;
        debug_assert!(job_fits(job, state, config));
        (job.threads, job.memory, job.use_gpu, job.user.clone())
    };

    let admitted_priority = users.priority(&user)?;
    let overtaken = ranked_waiting(state, users)?
        .into_iter()
        .find(|r| r.job.id != id && r.priority > admitted_priority)
        .map(|r| r.job.id);
    if let Some(overtaken_id) = overtaken {
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == overtaken_id) {
            job.priority_class += 1;
            tracing::debug!(
                job_id = overtaken_id,
                priority_class = job.priority_class,
                "escalated overtaken job"
            );
        }
    }

    state.occupied_threads += threads;
    state.occupied_memory += memory;
    let gpu_id = if use_gpu {
        let slot = state
            .gpu_occupied
            .iter()
            .position(|&g| !g)
            .ok_or_else(|| {
                QueueError::Internal(format!("job {id} admitted with every GPU occupied"))
            })?;
        state.gpu_occupied[slot] = true;
        Some(slot as u32)
    } else {
        None
    };

    {
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(QueueError::JobNotFound(id))?;
        job.status = JobStatus::Pending;
        job.gpu_id = gpu_id;
        job.time = Utc::now();
    }

    let job = state
        .jobs
        .iter()
        .find(|j| j.id == id)
        .ok_or(QueueError::JobNotFound(id))?
        .clone();
    users.invoke_penalty(&job, &state.jobs, config, true)?;
    tracing::info!(
        job_id = id,
        user = %job.user,
        threads,
        memory,
        gpu = ?gpu_id,
        "job admitted"
    );
    Ok(())
}
