use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{QueueConfig, QueuePaths};
use crate::error::{QueueError, Result};
use crate::scheduler::admission;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::priority::{UserPriorities, UserRecord};

/// Version stamped into both durable files. Any schema change bumps it.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// Job ids wrap back to 1 past this ceiling.
const MAX_JOB_ID: u32 = 999_999_999;

/// Mutable queue state as held in memory between a read and the next write.
#[derive(Debug, Clone)]
pub struct QueueState {
    pub running_id: u32,
    pub occupied_memory: u32,
    pub occupied_threads: u32,
    /// One slot per configured GPU, true while a pending/running job holds it
    pub gpu_occupied: Vec<bool>,
    pub jobs: Vec<Job>,
}

impl QueueState {
    pub fn empty(gpus: u32) -> Self {
        Self {
            running_id: 0,
            occupied_memory: 0,
            occupied_threads: 0,
            gpu_occupied: vec![false; gpus as usize],
            jobs: Vec::new(),
        }
    }
}

/// On-disk form of the queue state. The GPU bitmap travels bit-packed.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateFile {
    version: u32,
    running_id: u32,
    occupied_memory: u32,
    occupied_threads: u32,
    gpu_mask: u64,
    jobs: Vec<Job>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PrioritiesFile {
    version: u32,
    users: Vec<UserRecord>,
}

/// Everything needed to create one job record.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub name: String,
    pub user: String,
    pub use_gpu: bool,
    pub threads: u32,
    pub memory: u32,
    pub time_limit: u32,
    pub script: String,
    pub directory: PathBuf,
    pub depends_on: Vec<u32>,
}

/// Process-local mirror of the durable queue files.
///
/// Callers hold the gate across every read..write cycle; the in-memory state
/// is meaningless once the gate has been released. The single sanctioned
/// lock-free access is [`peek_status`].
#[derive(Debug)]
pub struct QueueStore {
    paths: QueuePaths,
    config: QueueConfig,
    state: QueueState,
    users: UserPriorities,
}

impl QueueStore {
    /// Load the static configuration and prepare an empty in-memory mirror.
    pub fn open(paths: QueuePaths) -> Result<Self> {
        let config = QueueConfig::load(&paths.config_file())?;
        let state = QueueState::empty(config.available_gpus);
        Ok(Self {
            paths,
            config,
            state,
            users: UserPriorities::default(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    pub fn users(&self) -> &UserPriorities {
        &self.users
    }

    /// Reload both durable files. A missing file reads as the empty state so
    /// a fresh root containing only `queue.config` bootstraps itself.
    pub fn read(&mut self) -> Result<()> {
        self.state = self.read_state()?;
        self.users = self.read_users()?;
        tracing::debug!(
            jobs = self.state.jobs.len(),
            users = self.users.len(),
            "queue state loaded"
        );
        Ok(())
    }

    /// Persist the whole state, overwriting both files atomically.
    pub fn write(&self) -> Result<()> {
        let state = StateFile {
            version: QUEUE_FORMAT_VERSION,
            running_id: self.state.running_id,
            occupied_memory: self.state.occupied_memory,
            occupied_threads: self.state.occupied_threads,
            gpu_mask: mask_from_bitmap(&self.state.gpu_occupied),
            jobs: self.state.jobs.clone(),
        };
        write_atomic(&self.paths.state_file(), &to_json(&state)?)?;

        let users = PrioritiesFile {
            version: QUEUE_FORMAT_VERSION,
            users: self.users.records(),
        };
        write_atomic(&self.paths.priorities_file(), &to_json(&users)?)?;
        tracing::debug!(jobs = self.state.jobs.len(), "queue state persisted");
        Ok(())
    }

    fn read_state(&self) -> Result<QueueState> {
        let path = self.paths.state_file();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(QueueState::empty(self.config.available_gpus));
            }
            Err(source) => return Err(QueueError::Io { path, source }),
        };
        let file: StateFile = serde_json::from_str(&text).map_err(|e| QueueError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        check_version(file.version, &path)?;
        if file.occupied_threads > self.config.available_threads
            || file.occupied_memory > self.config.available_memory
        {
            return Err(QueueError::Corrupt {
                path,
                reason: format!(
                    "occupancy ({} threads, {} MB) exceeds configured capacity",
                    file.occupied_threads, file.occupied_memory
                ),
            });
        }
        let gpu_occupied = bitmap_from_mask(file.gpu_mask, self.config.available_gpus)
            .map_err(|reason| QueueError::Corrupt {
                path: path.clone(),
                reason,
            })?;
        Ok(QueueState {
            running_id: file.running_id,
            occupied_memory: file.occupied_memory,
            occupied_threads: file.occupied_threads,
            gpu_occupied,
            jobs: file.jobs,
        })
    }

    fn read_users(&self) -> Result<UserPriorities> {
        let path = self.paths.priorities_file();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(UserPriorities::default());
            }
            Err(source) => return Err(QueueError::Io { path, source }),
        };
        let file: PrioritiesFile =
            serde_json::from_str(&text).map_err(|e| QueueError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        check_version(file.version, &path)?;
        for record in &file.users {
            if !(record.penalty >= 0.0) || !(record.priority_factor > 0.0) {
                return Err(QueueError::Corrupt {
                    path,
                    reason: format!(
                        "user {} has penalty {} and factor {}",
                        record.name, record.penalty, record.priority_factor
                    ),
                });
            }
        }
        Ok(UserPriorities::from_records(file.users))
    }

    // =========================================================================
    // Job table operations
    // =========================================================================

    pub fn jobs(&self) -> &[Job] {
        &self.state.jobs
    }

    pub fn job(&self, id: u32) -> Result<&Job> {
        self.state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .ok_or(QueueError::JobNotFound(id))
    }

    pub fn job_mut(&mut self, id: u32) -> Result<&mut Job> {
        self.state
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(QueueError::JobNotFound(id))
    }

    pub fn jobs_by_name(&self, name: &str) -> Vec<u32> {
        self.state
            .jobs
            .iter()
            .filter(|j| j.name == name)
            .map(|j| j.id)
            .collect()
    }

    pub fn user_has_jobs(&self, user: &str) -> bool {
        self.state.jobs.iter().any(|j| j.user == user)
    }

    /// Validate a request and append the job record with status `created`.
    pub fn add_job(&mut self, request: JobRequest) -> Result<u32> {
        if request.memory > self.config.available_memory {
            return Err(QueueError::CapacityExceeded {
                what: "memory",
                requested: request.memory,
                available: self.config.available_memory,
            });
        }
        if request.threads > self.config.available_threads {
            return Err(QueueError::CapacityExceeded {
                what: "threads",
                requested: request.threads,
                available: self.config.available_threads,
            });
        }
        if request.use_gpu && self.config.available_gpus == 0 {
            return Err(QueueError::CapacityExceeded {
                what: "GPUs",
                requested: 1,
                available: 0,
            });
        }
        if request.threads == 0 || request.memory == 0 || request.time_limit == 0 {
            return Err(QueueError::InvalidRequest(format!(
                "job {} requests zero threads, memory, or time",
                request.name
            )));
        }
        if !self.users.contains(&request.user) {
            if !self.config.add_unknown_users {
                return Err(QueueError::UnknownUser(request.user));
            }
            tracing::info!(user = %request.user, "registering first-time user");
            self.users.add_user(&request.user, 1.0);
        }

        let id = self.next_job_id();
        tracing::debug!(job_id = id, user = %request.user, name = %request.name, "job queued");
        self.state.jobs.push(Job {
            id,
            pid: 0,
            name: request.name,
            user: request.user,
            time: Utc::now(),
            status: JobStatus::Created,
            use_gpu: request.use_gpu,
            gpu_id: None,
            threads: request.threads,
            memory: request.memory,
            time_limit: request.time_limit,
            script: request.script,
            directory: request.directory,
            priority_class: 0,
            depends_on: request.depends_on,
            siblings: Vec::new(),
        });
        Ok(id)
    }

    /// Remove a job record, freeing whatever it occupied and unhooking it
    /// from every dependency and sibling list. Deletes the generated block
    /// script once the last member of its block is gone.
    pub fn remove_job(&mut self, id: u32) -> Result<()> {
        let idx = self
            .state
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(QueueError::JobNotFound(id))?;
        let job = self.state.jobs.remove(idx);

        if job.status.occupies_resources() {
            self.state.occupied_memory = self.state.occupied_memory.saturating_sub(job.memory);
            self.state.occupied_threads = self.state.occupied_threads.saturating_sub(job.threads);
            if let Some(gpu) = job.gpu_id {
                if let Some(slot) = self.state.gpu_occupied.get_mut(gpu as usize) {
                    *slot = false;
                }
            }
        }

        for other in &mut self.state.jobs {
            other.remove_dependency(id);
            other.remove_sibling(id);
        }

        if job.siblings.is_empty() {
            let script = job.script_path();
            if !script.is_empty() {
                // Best effort; the block script may never have been created.
                let _ = fs::remove_file(script);
            }
        }
        tracing::info!(job_id = id, user = %job.user, status = %job.status, "job removed");
        Ok(())
    }

    /// Drop every job, zero occupancy and the id counter, zero all penalties.
    pub fn reset(&mut self) {
        self.state = QueueState::empty(self.config.available_gpus);
        self.users.reset();
        tracing::info!("queue reset");
    }

    fn next_job_id(&mut self) -> u32 {
        self.state.running_id = if self.state.running_id >= MAX_JOB_ID {
            1
        } else {
            self.state.running_id + 1
        };
        self.state.running_id
    }

    // =========================================================================
    // User registry
    // =========================================================================

    pub fn add_user(&mut self, name: &str, priority_factor: f32) {
        tracing::info!(user = name, priority_factor, "user registered");
        self.users.add_user(name, priority_factor);
    }

    /// Refuse to drop a user who still has jobs queued.
    pub fn remove_user(&mut self, name: &str) -> Result<()> {
        if self.user_has_jobs(name) {
            return Err(QueueError::UserHasJobs(name.to_string()));
        }
        self.users.remove_user(name)
    }

    pub fn priority_of(&mut self, user: &str) -> Result<f32> {
        self.users.priority(user)
    }

    // =========================================================================
    // Admission
    // =========================================================================

    pub fn find_executable_job(&mut self) -> Result<Option<u32>> {
        admission::find_executable_job(&self.state, &mut self.users, &self.config)
    }

    pub fn admit(&mut self, id: u32) -> Result<()> {
        admission::admit(&mut self.state, &mut self.users, &self.config, id)
    }

    /// Deterrent for jobs that ran well past their declared limit: charge the
    /// user as if the job had asked for twice the hours it actually used.
    pub fn apply_overrun_penalty(&mut self, id: u32, elapsed_hours: u32) -> Result<()> {
        {
            let job = self.job_mut(id)?;
            job.time_limit = elapsed_hours.saturating_mul(2);
        }
        let job = self.job(id)?.clone();
        self.users
            .invoke_penalty(&job, &self.state.jobs, &self.config, false)
    }
}

/// Lock-free advisory read used by the coordinator poll loop. Any failure,
/// from a missing file to a torn write, reads as `None`.
pub fn peek_status(paths: &QueuePaths, job_id: u32) -> Option<JobStatus> {
    let text = fs::read_to_string(paths.state_file()).ok()?;
    let file: StateFile = serde_json::from_str(&text).ok()?;
    if file.version != QUEUE_FORMAT_VERSION {
        return None;
    }
    file.jobs.iter().find(|j| j.id == job_id).map(|j| j.status)
}

fn check_version(version: u32, path: &Path) -> Result<()> {
    if version != QUEUE_FORMAT_VERSION {
        return Err(QueueError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("format version {version} (expected {QUEUE_FORMAT_VERSION})"),
        });
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| QueueError::Internal(e.to_string()))
}

/// Write the new contents beside the target and rename over it, so a reader
/// never observes a half-written file.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|source| QueueError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn mask_from_bitmap(bitmap: &[bool]) -> u64 {
    bitmap
        .iter()
        .enumerate()
        .fold(0, |mask, (i, &occupied)| {
            if occupied {
                mask | 1 << i
            } else {
                mask
            }
        })
}

fn bitmap_from_mask(mask: u64, gpus: u32) -> std::result::Result<Vec<bool>, String> {
    if gpus < 64 && mask >> gpus != 0 {
        return Err(format!(
            "GPU mask {mask:#x} has bits beyond the {gpus} configured GPUs"
        ));
    }
    Ok((0..gpus).map(|i| mask & (1 << i) != 0).collect())
}
