use std::path::Path;

use crate::actions::JobActions;
use crate::error::Result;
use crate::scheduler::store::{JobRequest, QueueStore};

/// One job created by a submission, as reported back to the user.
#[derive(Debug)]
pub struct SubmittedJob {
    pub id: u32,
    pub name: String,
    pub threads: u32,
    pub memory: u32,
    pub time_limit: u32,
    pub use_gpu: bool,
}

/// Expand one submission into per-block, per-subtask job records.
///
/// Every job of block N depends on all jobs of block N-1 (the first block
/// depends on nothing); the subtasks of one block are mutual siblings. Jobs
/// are created with status `created` and claimed later by their own
/// coordinator processes.
pub fn submit_blocks<A: JobActions>(
    store: &mut QueueStore,
    actions: &A,
    script: &str,
    directory: &Path,
    user: &str,
) -> Result<Vec<SubmittedJob>> {
    let blocks = actions.split_script(script, directory)?;
    let script_args = script
        .split_whitespace()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");

    let mut submitted = Vec::new();
    let mut previous_block: Vec<u32> = Vec::new();
    for block in &blocks {
        let subtasks = block.subtasks.max(1);
        let mut block_ids = Vec::new();
        for subtask in 1..=subtasks {
            let name = if subtasks > 1 {
                format!("{}.{}", block.name, subtask)
            } else {
                block.name.clone()
            };
            let mut payload = block.script.clone();
            if !script_args.is_empty() {
                payload.push(' ');
                payload.push_str(&script_args);
            }
            payload.push(' ');
            payload.push_str(&subtask.to_string());

            let id = store.add_job(JobRequest {
                name: name.clone(),
                user: user.to_string(),
                use_gpu: block.gpu,
                threads: block.threads,
                memory: block.memory,
                time_limit: block.hours,
                script: payload,
                directory: directory.to_path_buf(),
                depends_on: previous_block.clone(),
            })?;
            block_ids.push(id);
            submitted.push(SubmittedJob {
                id,
                name,
                threads: block.threads,
                memory: block.memory,
                time_limit: block.hours,
                use_gpu: block.gpu,
            });
        }
        link_siblings(store, &block_ids)?;
        previous_block = block_ids;
    }
    tracing::info!(jobs = submitted.len(), blocks = blocks.len(), "submission expanded");
    Ok(submitted)
}

fn link_siblings(store: &mut QueueStore, block_ids: &[u32]) -> Result<()> {
    for &id in block_ids {
        let siblings = block_ids.iter().copied().filter(|&s| s != id).collect();
        store.job_mut(id)?.siblings = siblings;
    }
    Ok(())
}
