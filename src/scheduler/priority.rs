use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::job::Job;

/// Lower bound of the penalty scale in the priority formula.
const PENALTY_SCALE_FLOOR: f32 = 1.01;

/// Durable form of one user's fair-share record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    pub name: String,
    pub penalty: f32,
    pub priority_factor: f32,
}

#[derive(Debug, Clone)]
struct UserEntry {
    penalty: f32,
    priority_factor: f32,
    priority: f32,
}

/// Fair-share bookkeeping for every registered user.
///
/// Penalties measure relative usage debt: after every update the minimum
/// penalty across users is renormalized to zero. Computed priorities are
/// cached and recomputed only when a penalty or factor changed since the
/// last read.
#[derive(Debug, Default)]
pub struct UserPriorities {
    users: BTreeMap<String, UserEntry>,
    dirty: bool,
}

impl UserPriorities {
    pub fn from_records(records: Vec<UserRecord>) -> Self {
        let users = records
            .into_iter()
            .map(|r| {
                let entry = UserEntry {
                    penalty: r.penalty,
                    priority_factor: r.priority_factor,
                    priority: 0.0,
                };
                (r.name, entry)
            })
            .collect();
        Self { users, dirty: true }
    }

    /// Records in name order, the durable layout.
    pub fn records(&self) -> Vec<UserRecord> {
        self.users
            .iter()
            .map(|(name, entry)| UserRecord {
                name: name.clone(),
                penalty: entry.penalty,
                priority_factor: entry.priority_factor,
            })
            .collect()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Register a user, or update only the priority factor of an existing one.
    pub fn add_user(&mut self, name: &str, priority_factor: f32) {
        self.users
            .entry(name.to_string())
            .and_modify(|entry| entry.priority_factor = priority_factor)
            .or_insert(UserEntry {
                penalty: 0.0,
                priority_factor,
                priority: 0.0,
            });
        self.dirty = true;
    }

    pub fn remove_user(&mut self, name: &str) -> Result<()> {
        if self.users.remove(name).is_none() {
            return Err(QueueError::UnknownUser(name.to_string()));
        }
        self.dirty = true;
        Ok(())
    }

    /// Zero every penalty, keeping registrations and factors.
    pub fn reset(&mut self) {
        for entry in self.users.values_mut() {
            entry.penalty = 0.0;
        }
        self.dirty = true;
    }

    pub fn penalty(&self, user: &str) -> Option<f32> {
        self.users.get(user).map(|e| e.penalty)
    }

    pub fn priority_factor(&self, user: &str) -> Option<f32> {
        self.users.get(user).map(|e| e.priority_factor)
    }

    /// Charge `job`'s user for its resource-time and decay everyone else's
    /// debt.
    ///
    /// Decay skips users who currently have a job in the queue (any status):
    /// debt only fades while a user has no active demand. The charge is
    /// `time_limit * max(memory share, thread share)`. Afterwards the minimum
    /// penalty is renormalized to zero.
    pub fn invoke_penalty(
        &mut self,
        job: &Job,
        all_jobs: &[Job],
        config: &QueueConfig,
        decay: bool,
    ) -> Result<()> {
        if !self.users.contains_key(&job.user) {
            return Err(QueueError::UnknownUser(job.user.clone()));
        }
        if decay {
            for (name, entry) in &mut self.users {
                if !all_jobs.iter().any(|j| &j.user == name) {
                    entry.penalty *= config.decay_factor;
                }
            }
        }

        let memory_share = job.memory as f32 / config.available_memory as f32;
        let thread_share = job.threads as f32 / config.available_threads as f32;
        let charge = job.time_limit as f32 * memory_share.max(thread_share);
        if let Some(entry) = self.users.get_mut(&job.user) {
            entry.penalty += charge;
        }
        tracing::trace!(user = %job.user, charge, "penalty applied");

        self.renormalize();
        self.dirty = true;
        Ok(())
    }

    /// Computed priority of `user`, refreshing the cache if anything changed
    /// since the last read.
    pub fn priority(&mut self, user: &str) -> Result<f32> {
        if self.dirty {
            self.recompute();
        }
        self.users
            .get(user)
            .map(|e| e.priority)
            .ok_or_else(|| QueueError::UnknownUser(user.to_string()))
    }

    fn renormalize(&mut self) {
        let min = self
            .users
            .values()
            .map(|e| e.penalty)
            .fold(f32::INFINITY, f32::min);
        if min.is_finite() && min > 0.0 {
            for entry in self.users.values_mut() {
                entry.penalty = (entry.penalty - min).max(0.0);
            }
        }
    }

    fn recompute(&mut self) {
        let max_penalty = self.users.values().map(|e| e.penalty).fold(0.0f32, f32::max);
        let scale = (PENALTY_SCALE_FLOOR * max_penalty).max(PENALTY_SCALE_FLOOR);
        for entry in self.users.values_mut() {
            entry.priority = (1.0 - entry.penalty / scale) * entry.priority_factor;
        }
        self.dirty = false;
    }
}
