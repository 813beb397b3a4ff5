use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use fairq::config::QueuePaths;
use fairq::scheduler::store::{JobRequest, QueueStore};
use fairq::scheduler::JobStatus;

/// CPU-only queue root: 8 threads, 4096 MB, top priority class 5.
fn cpu_root() -> (TempDir, QueuePaths) {
    root_with(8, 4096, 0)
}

fn root_with(threads: u32, memory: u32, gpus: u32) -> (TempDir, QueuePaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = QueuePaths::new(dir.path());
    fs::write(
        paths.config_file(),
        format!(
            "threads={threads}\n\
             memory={memory}\n\
             gpus={gpus}\n\
             abortOnTimeLimit=false\n\
             addUnkownUsers=true\n\
             regeneration-factor=0.5\n\
             max-priority-class=5\n"
        ),
    )
    .unwrap();
    (dir, paths)
}

fn open(paths: &QueuePaths) -> QueueStore {
    let mut store = QueueStore::open(paths.clone()).unwrap();
    store.read().unwrap();
    store
}

/// Add a waiting job, ready for admission.
fn add_waiting(store: &mut QueueStore, name: &str, user: &str, threads: u32, hours: u32) -> u32 {
    let id = store
        .add_job(JobRequest {
            name: name.to_string(),
            user: user.to_string(),
            use_gpu: false,
            threads,
            memory: 128,
            time_limit: hours,
            script: String::new(),
            directory: PathBuf::from("/tmp"),
            depends_on: vec![],
        })
        .unwrap();
    store.job_mut(id).unwrap().status = JobStatus::Waiting;
    id
}

fn add_waiting_gpu(store: &mut QueueStore, name: &str, user: &str) -> u32 {
    let id = store
        .add_job(JobRequest {
            name: name.to_string(),
            user: user.to_string(),
            use_gpu: true,
            threads: 1,
            memory: 128,
            time_limit: 1,
            script: String::new(),
            directory: PathBuf::from("/tmp"),
            depends_on: vec![],
        })
        .unwrap();
    store.job_mut(id).unwrap().status = JobStatus::Waiting;
    id
}

#[test]
fn test_admission_reserves_and_removal_frees() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);

    // X runs, Y has to wait for it.
    let x = add_waiting(&mut store, "x", "alice", 4, 1);
    store.job_mut(x).unwrap().memory = 1024;
    let y = add_waiting(&mut store, "y", "alice", 6, 1);
    store.job_mut(y).unwrap().memory = 1024;

    assert_eq!(store.find_executable_job().unwrap(), Some(x));
    store.admit(x).unwrap();
    assert_eq!(store.state().occupied_threads, 4);
    assert_eq!(store.state().occupied_memory, 1024);
    assert_eq!(store.job(x).unwrap().status, JobStatus::Pending);

    // 6 threads do not fit beside 4 on an 8-thread machine.
    assert_eq!(store.find_executable_job().unwrap(), None);

    store.remove_job(x).unwrap();
    assert_eq!(store.state().occupied_threads, 0);
    assert_eq!(store.find_executable_job().unwrap(), Some(y));
}

#[test]
fn test_occupancy_never_exceeds_capacity() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);

    for (i, threads) in [3u32, 2, 2, 1, 4, 1, 5, 2].iter().enumerate() {
        add_waiting(&mut store, &format!("j{i}"), "alice", *threads, 1);
    }

    let mut admitted = Vec::new();
    while let Some(id) = store.find_executable_job().unwrap() {
        store.admit(id).unwrap();
        admitted.push(id);
        assert!(store.state().occupied_threads <= 8);
        assert!(store.state().occupied_memory <= 4096);
    }
    assert!(!admitted.is_empty());

    // Free half of them and fill again; the bound must still hold.
    for id in admitted.iter().step_by(2) {
        store.remove_job(*id).unwrap();
    }
    while let Some(id) = store.find_executable_job().unwrap() {
        store.admit(id).unwrap();
        assert!(store.state().occupied_threads <= 8);
    }
}

#[test]
fn test_only_waiting_jobs_are_candidates() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);

    let created = store
        .add_job(JobRequest {
            name: "fresh".to_string(),
            user: "alice".to_string(),
            use_gpu: false,
            threads: 1,
            memory: 128,
            time_limit: 1,
            script: String::new(),
            directory: PathBuf::from("/tmp"),
            depends_on: vec![],
        })
        .unwrap();
    assert_eq!(store.find_executable_job().unwrap(), None);

    store.job_mut(created).unwrap().status = JobStatus::Held;
    assert_eq!(store.find_executable_job().unwrap(), None);

    store.job_mut(created).unwrap().status = JobStatus::Waiting;
    assert_eq!(store.find_executable_job().unwrap(), Some(created));
}

#[test]
fn test_higher_user_priority_wins_over_submission_order() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    store.add_user("alice", 1.0);
    store.add_user("bob", 1.0);

    // Charge bob by running one of his jobs through admission first.
    let warmup = add_waiting(&mut store, "warmup", "bob", 4, 10);
    store.admit(warmup).unwrap();
    store.remove_job(warmup).unwrap();
    assert!(store.priority_of("bob").unwrap() < store.priority_of("alice").unwrap());

    let bobs = add_waiting(&mut store, "bobs", "bob", 1, 1);
    let alices = add_waiting(&mut store, "alices", "alice", 1, 1);
    assert!(alices > bobs);
    assert_eq!(store.find_executable_job().unwrap(), Some(alices));
}

#[test]
fn test_equal_rank_falls_back_to_submission_order() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    let first = add_waiting(&mut store, "a", "alice", 1, 1);
    let _second = add_waiting(&mut store, "b", "alice", 1, 1);
    assert_eq!(store.find_executable_job().unwrap(), Some(first));
}

#[test]
fn test_priority_class_breaks_same_user_ties() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    let _first = add_waiting(&mut store, "a", "alice", 1, 1);
    let second = add_waiting(&mut store, "b", "alice", 1, 1);
    store.job_mut(second).unwrap().priority_class = 3;
    assert_eq!(store.find_executable_job().unwrap(), Some(second));
}

#[test]
fn test_top_class_job_blocks_all_admission_until_it_fits() {
    let (_dir, paths) = root_with(4, 4096, 0);
    let mut store = open(&paths);

    let occupier = add_waiting(&mut store, "occupier", "alice", 3, 1);
    store.admit(occupier).unwrap();

    let urgent = add_waiting(&mut store, "urgent", "bob", 4, 1);
    store.job_mut(urgent).unwrap().priority_class = 5;
    let small = add_waiting(&mut store, "small", "carol", 1, 1);

    // The top-class job does not fit, so even the fitting small job waits.
    assert_eq!(store.find_executable_job().unwrap(), None);

    store.remove_job(occupier).unwrap();
    assert_eq!(store.find_executable_job().unwrap(), Some(urgent));
    store.admit(urgent).unwrap();

    // Nothing is left over for the small job beside a 4-thread occupier.
    assert_eq!(store.find_executable_job().unwrap(), None);
    let _ = small;
}

#[test]
fn test_top_class_candidate_outranks_higher_user_priority() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    store.add_user("alice", 1.0);
    store.add_user("bob", 1.0);

    let warmup = add_waiting(&mut store, "warmup", "bob", 4, 10);
    store.admit(warmup).unwrap();
    store.remove_job(warmup).unwrap();

    let escalated = add_waiting(&mut store, "escalated", "bob", 1, 1);
    store.job_mut(escalated).unwrap().priority_class = 5;
    let _fresh = add_waiting(&mut store, "fresh", "alice", 1, 1);

    // Both fit, alice outranks bob, but the top-class job goes first.
    assert_eq!(store.find_executable_job().unwrap(), Some(escalated));
}

#[test]
fn test_overtaken_job_is_escalated_one_class() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    store.add_user("alice", 1.0);
    store.add_user("bob", 1.0);

    let warmup = add_waiting(&mut store, "warmup", "bob", 4, 10);
    store.admit(warmup).unwrap();

    // Alice outranks bob but her job cannot fit beside the warmup job.
    let wide = add_waiting(&mut store, "wide", "alice", 8, 1);
    let narrow = add_waiting(&mut store, "narrow", "bob", 2, 1);
    assert_eq!(store.find_executable_job().unwrap(), Some(narrow));

    store.admit(narrow).unwrap();
    assert_eq!(store.job(wide).unwrap().priority_class, 1);

    // A second overtake escalates it again.
    let narrow2 = add_waiting(&mut store, "narrow2", "bob", 2, 1);
    store.admit(narrow2).unwrap();
    assert_eq!(store.job(wide).unwrap().priority_class, 2);
}

#[test]
fn test_admission_charges_the_user() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    store.add_user("alice", 1.0);
    store.add_user("bob", 1.0);

    let id = add_waiting(&mut store, "big", "bob", 8, 10);
    store.admit(id).unwrap();

    assert!(store.users().penalty("bob").unwrap() > 0.0);
    assert_eq!(store.users().penalty("alice"), Some(0.0));
    assert!(store.priority_of("bob").unwrap() < store.priority_of("alice").unwrap());
}

#[test]
fn test_gpu_slots_are_reused_lowest_first() {
    let (_dir, paths) = root_with(8, 4096, 2);
    let mut store = open(&paths);

    let a = add_waiting_gpu(&mut store, "a", "alice");
    let b = add_waiting_gpu(&mut store, "b", "alice");
    let c = add_waiting_gpu(&mut store, "c", "alice");

    store.admit(a).unwrap();
    store.admit(b).unwrap();
    assert_eq!(store.job(a).unwrap().gpu_id, Some(0));
    assert_eq!(store.job(b).unwrap().gpu_id, Some(1));

    // Both GPUs taken: c fits thread-wise but not GPU-wise.
    assert_eq!(store.find_executable_job().unwrap(), None);

    store.remove_job(a).unwrap();
    assert_eq!(store.find_executable_job().unwrap(), Some(c));
    store.admit(c).unwrap();
    assert_eq!(store.job(c).unwrap().gpu_id, Some(0));

    let held_gpus = store.state().gpu_occupied.iter().filter(|&&g| g).count();
    let gpu_jobs = store
        .jobs()
        .iter()
        .filter(|j| j.status.occupies_resources() && j.gpu_id.is_some())
        .count();
    assert_eq!(held_gpus, gpu_jobs);
}

#[test]
fn test_overrun_doubles_the_booked_hours_and_charges() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    store.add_user("alice", 1.0);
    store.add_user("bob", 1.0);

    let id = add_waiting(&mut store, "runaway", "bob", 4, 1);
    store.admit(id).unwrap();
    let after_admit = store.users().penalty("bob").unwrap();

    // Ran for five hours against a one-hour booking.
    store.apply_overrun_penalty(id, 5).unwrap();
    assert_eq!(store.job(id).unwrap().time_limit, 10);
    assert!(store.users().penalty("bob").unwrap() > after_admit);
    assert!(store.priority_of("bob").unwrap() < store.priority_of("alice").unwrap());
}

#[test]
fn test_priority_factor_scales_the_computed_priority() {
    let (_dir, paths) = cpu_root();
    let mut store = open(&paths);
    store.add_user("staff", 2.0);
    store.add_user("guest", 0.5);

    assert_eq!(store.priority_of("staff").unwrap(), 2.0);
    assert_eq!(store.priority_of("guest").unwrap(), 0.5);

    // With equal debt the factor still decides the order.
    let s = add_waiting(&mut store, "s", "staff", 4, 2);
    let g = add_waiting(&mut store, "g", "guest", 4, 2);
    assert_eq!(store.find_executable_job().unwrap(), Some(s));
    let _ = g;
}
