use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Local;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fairq::actions::{JobActions, ShellActions};
use fairq::config::QueuePaths;
use fairq::coordinator::{self, Coordinator};
use fairq::error::{QueueError, Result};
use fairq::gate::Gate;
use fairq::scheduler::store::QueueStore;
use fairq::scheduler::Job;
use fairq::submit;

#[derive(Parser, Debug)]
#[command(name = "fairq")]
#[command(version)]
#[command(about = "Single-node fair-share batch job scheduler")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit a script with its working directory
    Submit {
        /// Script path followed by its arguments, as one quoted string
        script: String,
        /// Directory the jobs run in
        directory: PathBuf,
    },

    /// Run one job's lifecycle (spawned by submit, not for interactive use)
    #[command(hide = true)]
    Exec { job_id: u32 },

    /// Delete jobs by id, id range (a-b), or name
    Del {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Show all queued jobs
    Stat {
        /// Also show resource requests and priority classes
        #[arg(short, long)]
        verbose: bool,
    },

    /// Terminate every job and clear the queue
    Reset,

    /// Show capacity, occupancy, and registered users
    Info,

    /// Show every stored field of one job
    Jobinfo { job_id: u32 },

    /// Register a user, or update an existing user's priority factor
    Adduser { name: String, factor: Option<f32> },

    /// Remove a user who has no jobs in the queue
    Deluser { name: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let paths = QueuePaths::from_env();
    match args.command {
        Commands::Submit { script, directory } => handle_submit(paths, &script, &directory),
        Commands::Exec { job_id } => {
            let actions = ShellActions::new(paths.clone());
            Coordinator::new(paths, actions)?.run(job_id)
        }
        Commands::Del { targets } => handle_del(paths, &targets),
        Commands::Stat { verbose } => handle_stat(paths, verbose),
        Commands::Reset => handle_reset(paths),
        Commands::Info => handle_info(paths),
        Commands::Jobinfo { job_id } => handle_jobinfo(paths, job_id),
        Commands::Adduser { name, factor } => handle_adduser(paths, &name, factor),
        Commands::Deluser { name } => handle_deluser(paths, &name),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

fn handle_submit(paths: QueuePaths, script: &str, directory: &Path) -> Result<()> {
    let user = submitting_user()?;
    let actions = ShellActions::new(paths.clone());
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;
    let submitted = submit::submit_blocks(&mut store, &actions, script, directory, &user)?;
    store.write()?;
    // The coordinators block on the gate until this process releases it.
    for job in &submitted {
        if let Err(e) = actions.spawn_coordinator(job.id) {
            eprintln!("Error: no coordinator started for job {}: {e}", job.id);
        }
    }
    guard.release();

    for job in &submitted {
        println!(
            "submit job {} (id {}): threads={}, memory={}MB, gpu={}, hours={}",
            job.name, job.id, job.threads, job.memory, job.use_gpu, job.time_limit
        );
    }
    Ok(())
}

fn handle_del(paths: QueuePaths, targets: &[String]) -> Result<()> {
    let user = submitting_user()?;
    let actions = ShellActions::new(paths.clone());
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;

    let ids = resolve_targets(&store, targets)?;
    let mut freed_active = false;
    for id in ids {
        let job = store.job(id)?;
        if job.user != user {
            // Per-item refusal; the rest of the batch still runs.
            eprintln!("Error: job {id} belongs to {}", job.user);
            continue;
        }
        if job.status.occupies_resources() {
            if let Err(e) = actions.terminate(job.pid) {
                tracing::warn!(job_id = id, "terminate failed: {e}");
            }
            freed_active = true;
        }
        store.remove_job(id)?;
    }
    if freed_active {
        coordinator::cascade_admissions(&mut store, &actions)?;
    }
    store.write()?;
    guard.release();
    Ok(())
}

fn handle_stat(paths: QueuePaths, verbose: bool) -> Result<()> {
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;
    print_job_table(&mut store, verbose)?;
    guard.release();
    Ok(())
}

fn handle_reset(paths: QueuePaths) -> Result<()> {
    let actions = ShellActions::new(paths.clone());
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;
    let ids: Vec<u32> = store.jobs().iter().map(|j| j.id).collect();
    for id in ids {
        let job = store.job(id)?;
        if job.status.occupies_resources() {
            if let Err(e) = actions.terminate(job.pid) {
                tracing::warn!(job_id = id, "terminate failed: {e}");
            }
        }
        store.remove_job(id)?;
    }
    store.reset();
    store.write()?;
    guard.release();
    println!("queue cleared");
    Ok(())
}

fn handle_info(paths: QueuePaths) -> Result<()> {
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;

    let config = store.config().clone();
    let state = store.state();
    let gpus_occupied = state.gpu_occupied.iter().filter(|&&g| g).count();
    println!(
        "threads:             {} / {} occupied",
        state.occupied_threads, config.available_threads
    );
    println!(
        "memory:              {} / {} MB occupied",
        state.occupied_memory, config.available_memory
    );
    println!(
        "gpus:                {} / {} occupied",
        gpus_occupied, config.available_gpus
    );
    println!("jobs:                {}", state.jobs.len());
    println!("abort on time limit: {}", config.abort_on_time_limit);
    println!("auto-register users: {}", config.add_unknown_users);
    println!("decay factor:        {}", config.decay_factor);
    println!("max priority class:  {}", config.max_priority_class);
    println!("users:");
    for record in store.users().records() {
        let priority = store.priority_of(&record.name)?;
        println!(
            "  {:<12}  penalty {:>9.5}  factor {:>7.3}  priority {:>9.5}",
            record.name, record.penalty, record.priority_factor, priority
        );
    }
    guard.release();
    Ok(())
}

fn handle_jobinfo(paths: QueuePaths, job_id: u32) -> Result<()> {
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;
    let job = store.job(job_id)?.clone();
    let priority = store.priority_of(&job.user)?;

    println!("id:             {}", job.id);
    println!("name:           {}", job.name);
    println!("user:           {}", job.user);
    println!("status:         {}", job.status);
    println!(
        "submitted:      {}",
        job.time.with_timezone(&Local).format("%d-%m-%Y %H:%M:%S")
    );
    println!("pid:            {}", job.pid);
    println!("threads:        {}", job.threads);
    println!("memory:         {} MB", job.memory);
    println!("time limit:     {} h", job.time_limit);
    println!("gpu requested:  {}", job.use_gpu);
    println!("gpu id:         {}", gpu_label(job.gpu_id));
    println!("priority:       {priority:.5}");
    println!("priority class: {}", job.priority_class);
    println!("script:         {}", job.script);
    println!("directory:      {}", job.directory.display());
    println!("depends on:     {}", format_ids(&job.depends_on));
    println!("siblings:       {}", format_ids(&job.siblings));
    guard.release();
    Ok(())
}

fn handle_adduser(paths: QueuePaths, name: &str, factor: Option<f32>) -> Result<()> {
    let factor = factor.unwrap_or(1.0);
    if !factor.is_finite() || factor <= 0.0 {
        return Err(QueueError::InvalidRequest(format!(
            "priority factor must be positive, got {factor}"
        )));
    }
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;
    store.add_user(name, factor);
    store.write()?;
    guard.release();
    Ok(())
}

fn handle_deluser(paths: QueuePaths, name: &str) -> Result<()> {
    let gate = Gate::open()?;
    let guard = gate.acquire()?;
    let mut store = QueueStore::open(paths)?;
    store.read()?;
    store.remove_user(name)?;
    store.write()?;
    guard.release();
    Ok(())
}

// =============================================================================
// Output Formatting
// =============================================================================

fn print_job_table(store: &mut QueueStore, verbose: bool) -> Result<()> {
    let jobs: Vec<Job> = store.jobs().to_vec();

    let mut header = format!(
        "{:>9}  {:<16}  {:<19}  {:<2}  {:<12}  {:>9}",
        "id", "name", "submit/start time", "st", "user", "priority"
    );
    if verbose {
        header.push_str(&format!(
            "  {:>5}  {:>7}  {:>9}  {:>5}  {:>3}",
            "class", "threads", "memory", "hours", "gpu"
        ));
    }
    println!("{header}");

    // Active jobs in id order first, the rest in scheduling order.
    let mut active: Vec<&Job> = jobs
        .iter()
        .filter(|j| j.status.occupies_resources())
        .collect();
    active.sort_by_key(|j| j.id);

    let mut queued: Vec<(f32, &Job)> = Vec::new();
    for job in jobs.iter().filter(|j| !j.status.occupies_resources()) {
        queued.push((store.priority_of(&job.user)?, job));
    }
    queued.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then(b.1.priority_class.cmp(&a.1.priority_class))
            .then(a.1.id.cmp(&b.1.id))
    });

    for job in active {
        print_job_row(store, job, verbose)?;
    }
    for (_, job) in queued {
        print_job_row(store, job, verbose)?;
    }
    Ok(())
}

fn print_job_row(store: &mut QueueStore, job: &Job, verbose: bool) -> Result<()> {
    let priority = store.priority_of(&job.user)?;
    let mut row = format!(
        "{:09}  {:<16}  {:<19}  {:<2}  {:<12}  {:>9.5}",
        job.id,
        clipped(&job.name, 16),
        job.time
            .with_timezone(&Local)
            .format("%d-%m-%Y %H:%M:%S")
            .to_string(),
        job.status.code(),
        clipped(&job.user, 12),
        priority
    );
    if verbose {
        row.push_str(&format!(
            "  {:>5}  {:>7}  {:>9}  {:>5}  {:>3}",
            job.priority_class,
            job.threads,
            job.memory,
            job.time_limit,
            gpu_label(job.gpu_id)
        ));
    }
    println!("{row}");
    Ok(())
}

fn gpu_label(gpu_id: Option<u32>) -> String {
    match gpu_id {
        Some(gpu) => gpu.to_string(),
        None => "-".to_string(),
    }
}

fn format_ids(ids: &[u32]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Helpers
// =============================================================================

fn submitting_user() -> Result<String> {
    std::env::var("USER")
        .map_err(|_| QueueError::InvalidRequest("USER is not set in the environment".to_string()))
}

/// Each deletion target is a job id, an inclusive id range `a-b`, or a job
/// name matching any number of jobs. Overlapping targets resolve to one
/// deletion each.
fn resolve_targets(store: &QueueStore, targets: &[String]) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for target in targets {
        if let Ok(id) = target.parse::<u32>() {
            ids.push(id);
        } else if let Some((first, last)) = parse_range(target) {
            ids.extend(first..=last);
        } else {
            let matched = store.jobs_by_name(target);
            if matched.is_empty() {
                return Err(QueueError::UnknownJobName(target.clone()));
            }
            ids.extend(matched);
        }
    }
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(*id));
    Ok(ids)
}

fn parse_range(target: &str) -> Option<(u32, u32)> {
    let (first, last) = target.split_once('-')?;
    Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
}

fn clipped(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
