//! Machine-wide mutual exclusion for the queue state.
//!
//! Every scheduler process, regardless of owning user, contends on one named
//! POSIX semaphore initialized to 1. All reads and writes of the durable
//! queue files happen between [`Gate::acquire`] and the drop of the returned
//! [`GateGuard`]; the only sanctioned lock-free access is the coordinator's
//! advisory poll (`store::peek_status`).
//!
//! A gate that cannot be created or released indicates a broken machine-wide
//! coordination substrate, so both cases terminate the process instead of
//! retrying.

use std::ffi::CString;
use std::io;
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::error::{QueueError, Result};

/// Semaphore name shared by every scheduler process on the machine.
pub const GATE_NAME: &str = "/fairq";

/// Upper bound of the randomized pause taken before acquire and release.
const MAX_DESYNC_MS: u64 = 300;

/// Handle to the machine-wide gate semaphore.
pub struct Gate {
    sem: *mut libc::sem_t,
}

impl Gate {
    /// Open the gate, creating the semaphore on first use.
    pub fn open() -> Result<Self> {
        Self::open_named(GATE_NAME)
    }

    /// Open a gate under a specific name. Tests use throwaway names so they
    /// never contend with a live queue on the same machine.
    pub fn open_named(name: &str) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| QueueError::Gate(format!("invalid semaphore name `{name}`")))?;

        // Any user's process must be able to open and post the semaphore, so
        // it is created world-writable under a cleared umask.
        let sem = unsafe {
            let old_mask = libc::umask(0);
            let sem = libc::sem_open(c_name.as_ptr(), libc::O_CREAT, 0o777 as libc::mode_t, 1);
            libc::umask(old_mask);
            sem
        };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            let reason = match err.raw_os_error() {
                Some(libc::EACCES) => "permission denied",
                Some(libc::ENFILE) => "the machine is out of file descriptors",
                Some(libc::ENOMEM) => "out of memory",
                _ => "unexpected failure",
            };
            return Err(QueueError::Gate(format!("{reason} ({err})")));
        }
        Ok(Self { sem })
    }

    /// Block until this process holds the gate. The guard releases it when
    /// dropped, on every exit path.
    pub fn acquire(&self) -> Result<GateGuard<'_>> {
        desync_pause();
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(QueueError::Gate(format!("waiting failed ({err})")));
        }
        tracing::trace!("gate acquired");
        Ok(GateGuard { gate: self })
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

/// Exclusive access to the queue state, released on drop.
pub struct GateGuard<'a> {
    gate: &'a Gate,
}

impl GateGuard<'_> {
    /// Release the gate now. Identical to dropping the guard.
    pub fn release(self) {}
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        desync_pause();
        if unsafe { libc::sem_post(self.gate.sem) } != 0 {
            // Failing to post would deadlock every other scheduler process on
            // the machine.
            eprintln!(
                "Error: releasing the scheduler gate failed ({})",
                io::Error::last_os_error()
            );
            std::process::exit(1);
        }
        tracing::trace!("gate released");
    }
}

/// Sleep a random few hundred milliseconds so processes that started
/// contending at the same instant spread out.
fn desync_pause() {
    let ms = rand::thread_rng().gen_range(0..=MAX_DESYNC_MS);
    thread::sleep(Duration::from_millis(ms));
}
