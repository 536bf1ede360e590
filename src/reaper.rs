//! Child reaping and exit-status delivery.
//!
//! As PID 1 the supervisor inherits every orphan, so a single background
//! thread owns `waitpid(-1)` and routes each status to whoever registered an
//! interest in that PID. Nothing else in the process may wait on children
//! directly; doing so would race the reaper for the status.

use std::{
    collections::HashMap,
    io,
    process::{Child, Command},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::{
        signal,
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use tracing::{debug, info, warn};

/// Exit information delivered for a reaped process. Deaths by signal map to
/// the shell convention `128 + signo`.
#[derive(Debug, Clone, Copy)]
pub struct ReapStatus {
    pub pid: libc::pid_t,
    pub code: i32,
}

impl ReapStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Default)]
struct ExitSlot {
    status: Mutex<Option<ReapStatus>>,
    cond: Condvar,
}

impl ExitSlot {
    fn fill(&self, status: ReapStatus) {
        let mut guard = self.status.lock().unwrap_or_else(|err| err.into_inner());
        *guard = Some(status);
        self.cond.notify_all();
    }

    fn wait(&self) -> ReapStatus {
        let mut guard = self.status.lock().unwrap_or_else(|err| err.into_inner());
        loop {
            if let Some(status) = *guard {
                return status;
            }
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(|err| err.into_inner());
        }
    }
}

/// Handle to a launched child: its PID plus the slot its exit status lands in.
#[derive(Clone)]
pub struct CommandHandle {
    pid: libc::pid_t,
    slot: Arc<ExitSlot>,
}

impl CommandHandle {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Blocks until the reaper delivers the exit status.
    pub fn wait(&self) -> ReapStatus {
        self.slot.wait()
    }
}

/// The process-wide reaper. Exactly one per process; concurrent reapers would
/// steal each other's wait results.
pub struct Reaper {
    waiters: Mutex<HashMap<libc::pid_t, Arc<ExitSlot>>>,
    debug: bool,
}

/// True while a signal can still be delivered to the process.
pub fn process_alive(pid: libc::pid_t) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

impl Reaper {
    pub fn new(debug: bool) -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(HashMap::new()),
            debug,
        })
    }

    /// Starts the background wait loop.
    pub fn spawn(self: &Arc<Self>) {
        let reaper = Arc::clone(self);
        thread::spawn(move || {
            loop {
                match waitpid(Pid::from_raw(-1), None) {
                    Ok(status) => reaper.route(status),
                    Err(Errno::EINTR) => {}
                    Err(Errno::ECHILD) => thread::sleep(Duration::from_secs(1)),
                    Err(err) => {
                        warn!("reaper wait failed: {err}");
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        });
    }

    fn route(&self, status: WaitStatus) {
        let (pid, code) = match status {
            WaitStatus::Exited(pid, code) => (pid.as_raw(), code),
            WaitStatus::Signaled(pid, sig, _) => (pid.as_raw(), 128 + sig as i32),
            // Stop/continue notifications are not exits.
            _ => return,
        };
        if self.debug {
            info!("reaped pid {pid} with status {code}");
        }
        let slot = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|err| err.into_inner());
            waiters.remove(&pid)
        };
        match slot {
            Some(slot) => slot.fill(ReapStatus { pid, code }),
            None => debug!("reaped orphan pid {pid} with status {code}"),
        }
    }

    /// Drains remaining zombies without blocking. Run once at final shutdown.
    pub fn final_reap(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => self.route(status),
                Err(_) => break,
            }
        }
    }

    /// Spawns the command and registers its exit slot atomically.
    ///
    /// The registry lock is held across the spawn: the wait loop needs the
    /// same lock to route a status, so the slot is always bound before the
    /// child's exit can be observed. The returned [`Child`] only carries the
    /// stdio pipes; callers must never `wait()` it.
    pub fn launch(&self, mut cmd: Command) -> io::Result<(CommandHandle, Child)> {
        let mut waiters = self.waiters.lock().unwrap_or_else(|err| err.into_inner());
        let child = cmd.spawn()?;
        let pid = child.id() as libc::pid_t;
        let slot = Arc::new(ExitSlot::default());
        waiters.insert(pid, slot.clone());
        drop(waiters);
        Ok((CommandHandle { pid, slot }, child))
    }

    /// Waits for an externally-discovered PID (pidfile, tracker). Returns
    /// `None` when the process is already gone.
    pub fn wait_pid(&self, pid: libc::pid_t) -> Option<ReapStatus> {
        let slot = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|err| err.into_inner());
            match waiters.get(&pid) {
                Some(slot) => slot.clone(),
                None => {
                    // Liveness check under the lock: the wait loop cannot
                    // route this PID until we release it.
                    if !process_alive(pid) {
                        return None;
                    }
                    let slot = Arc::new(ExitSlot::default());
                    waiters.insert(pid, slot.clone());
                    slot
                }
            }
        };
        Some(slot.wait())
    }
}
