use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. The single-character codes are both the durable
/// and the user-visible representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Record exists, owning coordinator process not started yet
    #[serde(rename = "-")]
    Created,
    /// Eligible for admission
    #[serde(rename = "w")]
    Waiting,
    /// Blocked on unfinished dependencies
    #[serde(rename = "h")]
    Held,
    /// Resources reserved, owning process awaiting promotion
    #[serde(rename = "p")]
    Pending,
    #[serde(rename = "r")]
    Running,
}

impl JobStatus {
    pub fn code(self) -> char {
        match self {
            JobStatus::Created => '-',
            JobStatus::Waiting => 'w',
            JobStatus::Held => 'h',
            JobStatus::Pending => 'p',
            JobStatus::Running => 'r',
        }
    }

    /// True once the admission controller has reserved resources for the job.
    pub fn occupies_resources(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One submitted unit of work. Field order matches the durable layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub id: u32,
    /// Pid of the owning coordinator process, 0 until it has claimed the job
    pub pid: u32,
    pub name: String,
    pub user: String,
    /// Submit time, refreshed on admission and on promotion to running
    pub time: DateTime<Utc>,
    pub status: JobStatus,
    pub use_gpu: bool,
    /// Index of the occupied GPU while pending/running with `use_gpu`
    pub gpu_id: Option<u32>,
    pub threads: u32,
    /// Memory request in MB
    pub memory: u32,
    /// Declared time limit in hours
    pub time_limit: u32,
    /// Generated block script followed by submission arguments and subtask index
    pub script: String,
    pub directory: PathBuf,
    pub priority_class: u32,
    pub depends_on: Vec<u32>,
    pub siblings: Vec<u32>,
}

impl Job {
    /// Drop `id` from the dependency list. A held job whose last dependency
    /// disappears becomes waiting.
    pub fn remove_dependency(&mut self, id: u32) {
        self.depends_on.retain(|&dep| dep != id);
        if self.depends_on.is_empty() && self.status == JobStatus::Held {
            self.status = JobStatus::Waiting;
        }
    }

    pub fn remove_sibling(&mut self, id: u32) {
        self.siblings.retain(|&sib| sib != id);
    }

    /// `<name>.<zero-padded id>`, the unique payload name handed to the run
    /// action.
    pub fn qualified_name(&self) -> String {
        format!("{}.{:010}", self.name, self.id)
    }

    /// Path component of [`Job::script`], without the trailing arguments.
    pub fn script_path(&self) -> &str {
        self.script.split_whitespace().next().unwrap_or("")
    }
}
