//! Boundary to the external collaborators: the script-splitting front end,
//! the pause/resume/terminate signals, and the payload runner. Each one is an
//! opaque command living in the queue root, so sites can swap policy (and
//! privilege handling, e.g. a setuid wake helper) without touching the
//! scheduler.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::config::QueuePaths;
use crate::error::{QueueError, Result};
use crate::scheduler::job::Job;

/// One block emitted by the script splitter: a stage of the submission with
/// its resource request and the generated per-block script.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockSpec {
    pub name: String,
    pub threads: u32,
    pub memory: u32,
    pub hours: u32,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default = "one")]
    pub subtasks: u32,
    pub script: String,
}

fn one() -> u32 {
    1
}

/// The actions a scheduler process asks the outside world to perform.
pub trait JobActions {
    /// Run the splitting front end over one submission.
    fn split_script(&self, script: &str, directory: &Path) -> Result<Vec<BlockSpec>>;

    /// Start a detached coordinator process for a freshly created job.
    fn spawn_coordinator(&self, job_id: u32) -> Result<()>;

    /// Stop the calling process until the scheduler resumes it.
    fn pause_self(&self) -> Result<()>;

    /// Resume the paused coordinator with the given pid.
    fn resume(&self, pid: u32) -> Result<()>;

    /// Run one job's payload to completion in its working directory. The
    /// payload's own exit status is not an error; only failing to run it is.
    fn run_payload(&self, job: &Job, abort_on_time_limit: bool) -> Result<()>;

    /// Terminate the coordinator with the given pid.
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Production implementation: every action is a script in the queue root.
#[derive(Debug, Clone)]
pub struct ShellActions {
    paths: QueuePaths,
}

impl ShellActions {
    pub fn new(paths: QueuePaths) -> Self {
        Self { paths }
    }

    fn run_action(&self, script: &str, args: &[String]) -> Result<()> {
        let path = self.paths.action_script(script);
        tracing::debug!(action = script, ?args, "running external action");
        let status = Command::new(&path)
            .args(args)
            .status()
            .map_err(|source| QueueError::Io { path, source })?;
        if !status.success() {
            return Err(QueueError::ActionFailed {
                action: script.to_string(),
                status,
            });
        }
        Ok(())
    }
}

impl JobActions for ShellActions {
    fn split_script(&self, script: &str, directory: &Path) -> Result<Vec<BlockSpec>> {
        let path = self.paths.action_script("split.sh");
        let output = Command::new(&path)
            .arg(script)
            .arg(directory)
            .output()
            .map_err(|source| QueueError::Io { path, source })?;
        if !output.status.success() {
            return Err(QueueError::ActionFailed {
                action: "split.sh".to_string(),
                status: output.status,
            });
        }
        let mut blocks = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let block: BlockSpec = serde_json::from_str(line).map_err(|e| {
                QueueError::InvalidRequest(format!("unusable block from the splitter: {e}"))
            })?;
            blocks.push(block);
        }
        if blocks.is_empty() {
            return Err(QueueError::InvalidRequest(
                "the splitter produced no blocks".to_string(),
            ));
        }
        Ok(blocks)
    }

    fn spawn_coordinator(&self, job_id: u32) -> Result<()> {
        let exe = std::env::current_exe()
            .map_err(|e| QueueError::Internal(format!("cannot locate own executable: {e}")))?;
        Command::new(exe)
            .arg("exec")
            .arg(job_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| QueueError::Io {
                path: PathBuf::from("fairq exec"),
                source,
            })?;
        // The child is intentionally not waited on; it outlives this process.
        tracing::debug!(job_id, "coordinator spawned");
        Ok(())
    }

    fn pause_self(&self) -> Result<()> {
        self.run_action("pause.sh", &[std::process::id().to_string()])
    }

    fn resume(&self, pid: u32) -> Result<()> {
        self.run_action("wake.sh", &[pid.to_string()])
    }

    fn run_payload(&self, job: &Job, abort_on_time_limit: bool) -> Result<()> {
        let path = self.paths.action_script("run.sh");
        let gpu = match job.gpu_id {
            Some(gpu) => gpu.to_string(),
            None => "-1".to_string(),
        };
        tracing::info!(job_id = job.id, script = %job.script, "running payload");
        let status = Command::new(&path)
            .arg(job.qualified_name())
            .arg(job.threads.to_string())
            .arg(job.memory.to_string())
            .arg(job.time_limit.to_string())
            .arg(gpu)
            .arg(if abort_on_time_limit { "1" } else { "0" })
            .arg(&job.script)
            .current_dir(&job.directory)
            .status()
            .map_err(|source| QueueError::Io { path, source })?;
        if !status.success() {
            // The user script's exit code belongs to the user.
            tracing::warn!(job_id = job.id, %status, "payload exited non-zero");
        }
        Ok(())
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.run_action("stop.sh", &[pid.to_string()])
    }
}
