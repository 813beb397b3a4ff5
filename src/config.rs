use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{QueueError, Result};

/// Environment variable overriding the queue root directory.
pub const ROOT_ENV: &str = "FAIRQ_ROOT";

/// Queue root used when [`ROOT_ENV`] is not set.
pub const DEFAULT_ROOT: &str = "/var/lib/fairq";

const CONFIG_FILE: &str = "queue.config";
const STATE_FILE: &str = ".queue.json";
const PRIORITIES_FILE: &str = ".priorities.json";

/// The GPU occupancy bitmap is persisted as one 64-bit integer.
const MAX_GPUS: u32 = 64;

/// Filesystem layout of one queue root: the operator-written configuration,
/// the two durable state files, and the external action scripts.
#[derive(Debug, Clone)]
pub struct QueuePaths {
    root: PathBuf,
}

impl QueuePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `$FAIRQ_ROOT`, falling back to the machine-wide default.
    pub fn from_env() -> Self {
        match std::env::var_os(ROOT_ENV) {
            Some(root) => Self::new(PathBuf::from(root)),
            None => Self::new(DEFAULT_ROOT),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn priorities_file(&self) -> PathBuf {
        self.root.join(PRIORITIES_FILE)
    }

    /// Path of one of the external action scripts (`pause.sh`, `wake.sh`, ...).
    pub fn action_script(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Machine capacity and scheduling policy, read once per invocation from
/// `queue.config` and never written back.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Threads the machine offers to jobs
    pub available_threads: u32,
    /// Memory the machine offers to jobs, in MB
    pub available_memory: u32,
    /// Number of schedulable GPUs (may be zero)
    pub available_gpus: u32,
    /// Passed through to the run action so it can enforce the time limit
    pub abort_on_time_limit: bool,
    /// Register submitting users on first contact instead of rejecting them
    pub add_unknown_users: bool,
    /// Per-update penalty decay for users without queued jobs, in (0, 1]
    pub decay_factor: f32,
    /// Priority class granting the non-starvation guarantee
    pub max_priority_class: u32,
}

impl QueueConfig {
    /// Read and parse `queue.config`. Any structural deviation is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| QueueError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|reason| QueueError::Corrupt {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Strict line-oriented parse: fixed key order, one `key=value` per line.
    fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut lines = text.lines();
        let available_threads = parse_field(&mut lines, "threads=")?;
        let available_memory = parse_field(&mut lines, "memory=")?;
        let available_gpus: u32 = parse_field(&mut lines, "gpus=")?;
        let abort_on_time_limit = parse_field(&mut lines, "abortOnTimeLimit=")?;
        // Key spelling is part of the on-disk interface.
        let add_unknown_users = parse_field(&mut lines, "addUnkownUsers=")?;
        let regeneration_factor: f32 = parse_field(&mut lines, "regeneration-factor=")?;
        let max_priority_class = parse_field(&mut lines, "max-priority-class=")?;

        if available_threads == 0 || available_memory == 0 {
            return Err("thread and memory capacity must be non-zero".to_string());
        }
        if available_gpus > MAX_GPUS {
            return Err(format!("at most {MAX_GPUS} GPUs are supported"));
        }
        let decay_factor = 1.0 - regeneration_factor;
        if !(decay_factor > 0.0 && decay_factor <= 1.0) {
            return Err(format!(
                "regeneration-factor {regeneration_factor} puts the decay factor outside (0, 1]"
            ));
        }

        Ok(Self {
            available_threads,
            available_memory,
            available_gpus,
            abort_on_time_limit,
            add_unknown_users,
            decay_factor,
            max_priority_class,
        })
    }
}

fn parse_field<'a, T>(
    lines: &mut impl Iterator<Item = &'a str>,
    key: &str,
) -> std::result::Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let line = lines
        .next()
        .ok_or_else(|| format!("missing `{key}` line"))?
        .trim_end();
    let value = line
        .strip_prefix(key)
        .ok_or_else(|| format!("expected a `{key}` line, found `{line}`"))?;
    value
        .parse()
        .map_err(|e| format!("bad value `{value}` for `{key}`: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "threads=8\n\
                        memory=4096\n\
                        gpus=2\n\
                        abortOnTimeLimit=true\n\
                        addUnkownUsers=false\n\
                        regeneration-factor=0.05\n\
                        max-priority-class=5\n";

    #[test]
    fn parse_well_formed_config() {
        let cfg = QueueConfig::parse(GOOD).unwrap();
        assert_eq!(cfg.available_threads, 8);
        assert_eq!(cfg.available_memory, 4096);
        assert_eq!(cfg.available_gpus, 2);
        assert!(cfg.abort_on_time_limit);
        assert!(!cfg.add_unknown_users);
        assert!((cfg.decay_factor - 0.95).abs() < 1e-6);
        assert_eq!(cfg.max_priority_class, 5);
    }

    #[test]
    fn keys_out_of_order_are_rejected() {
        let text = GOOD.replace("threads=8\nmemory=4096", "memory=4096\nthreads=8");
        let err = QueueConfig::parse(&text).unwrap_err();
        assert!(err.contains("threads="), "{err}");
    }

    #[test]
    fn missing_trailing_line_is_rejected() {
        let text = GOOD.replace("max-priority-class=5\n", "");
        let err = QueueConfig::parse(&text).unwrap_err();
        assert!(err.contains("max-priority-class="), "{err}");
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        let text = GOOD.replace("threads=8", "threads=eight");
        assert!(QueueConfig::parse(&text).is_err());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let text = GOOD.replace("threads=8", "threads=0");
        assert!(QueueConfig::parse(&text).is_err());
    }

    #[test]
    fn decay_factor_must_stay_in_range() {
        // regeneration-factor 1.0 would zero every penalty on each update
        let text = GOOD.replace("regeneration-factor=0.05", "regeneration-factor=1.0");
        assert!(QueueConfig::parse(&text).is_err());

        let text = GOOD.replace("regeneration-factor=0.05", "regeneration-factor=-0.5");
        assert!(QueueConfig::parse(&text).is_err());

        // zero regeneration (decay factor 1.0) is allowed
        let text = GOOD.replace("regeneration-factor=0.05", "regeneration-factor=0.0");
        let cfg = QueueConfig::parse(&text).unwrap();
        assert_eq!(cfg.decay_factor, 1.0);
    }

    #[test]
    fn load_reports_the_offending_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.config");
        std::fs::write(&path, "threads=nope\n").unwrap();
        match QueueConfig::load(&path) {
            Err(QueueError::Corrupt { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected corruption error, got {other:?}"),
        }
    }

    #[test]
    fn paths_resolve_under_the_root() {
        let paths = QueuePaths::new("/srv/queue");
        assert_eq!(paths.config_file(), Path::new("/srv/queue/queue.config"));
        assert_eq!(paths.state_file(), Path::new("/srv/queue/.queue.json"));
        assert_eq!(
            paths.priorities_file(),
            Path::new("/srv/queue/.priorities.json")
        );
        assert_eq!(
            paths.action_script("wake.sh"),
            Path::new("/srv/queue/wake.sh")
        );
    }
}
