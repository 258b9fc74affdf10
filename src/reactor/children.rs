//! Child process registry (spec §3 "Child entry", §4.1 `register_child`).
//!
//! `SIGCHLD` is process-wide, so the self-pipe and signal handler are
//! installed once per process (`std::sync::Once`) and shared by every
//! `Reactor`. This mirrors the source's own process-wide `EventManager`
//! for child supervision (§9): registering children with more than one
//! live `Reactor` concurrently is unsupported, since a child reaped by one
//! reactor's `waitpid` call is invisible to the others.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;

use crate::reactor::Reactor;

/// A child process id (as returned by `fork`/`posix_spawn`).
pub type Pid = libc::pid_t;

/// The exit disposition of a reaped child, preserving whether it exited
/// normally, was killed by a signal, or stopped/continued (ptrace-style).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    fn from_raw(status: i32) -> Option<Self> {
        if libc_wifexited(status) {
            Some(ExitStatus::Exited(libc_wexitstatus(status)))
        } else if libc_wifsignaled(status) {
            Some(ExitStatus::Signaled(libc_wtermsig(status)))
        } else {
            // Stopped/continued notifications are not reaped here; we only
            // register with WNOHANG/WEXITED semantics.
            None
        }
    }
}

// Small re-implementations of the WIF* macros, which libc exposes only as
// C macros (not callable functions) on most targets.
fn libc_wifexited(status: i32) -> bool {
    (status & 0x7f) == 0
}
fn libc_wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}
fn libc_wifsignaled(status: i32) -> bool {
    ((status & 0x7f) + 1) as i8 >> 1 > 0
}
fn libc_wtermsig(status: i32) -> i32 {
    status & 0x7f
}

struct ChildPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

static CHILD_PIPE: OnceLock<ChildPipe> = OnceLock::new();

extern "C" fn sigchld_handler(_signum: libc::c_int) {
    if let Some(pipe) = CHILD_PIPE.get() {
        let byte: u8 = 1;
        // Async-signal-safe: write(2) only.
        unsafe {
            libc::write(pipe.write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let fdflags = libc::fcntl(fd, libc::F_GETFD, 0);
        libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
    }
}

/// Installs the process-wide `SIGCHLD` self-pipe exactly once and returns
/// its read end.
pub(crate) fn ensure_installed() -> RawFd {
    let pipe = CHILD_PIPE.get_or_init(|| {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "failed to create child-reap self-pipe");
        set_nonblocking_cloexec(fds[0]);
        set_nonblocking_cloexec(fds[1]);

        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = sigchld_handler as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut());
        }

        ChildPipe {
            read_fd: fds[0],
            write_fd: fds[1],
        }
    });
    pipe.read_fd
}

type ChildCallback = Box<dyn FnOnce(&mut Reactor, ExitStatus)>;

#[derive(Default)]
pub(crate) struct ChildRegistry {
    handlers: HashMap<Pid, ChildCallback>,
}

impl ChildRegistry {
    pub(crate) fn new() -> Self {
        ChildRegistry {
            handlers: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, pid: Pid, handler: ChildCallback) {
        self.handlers.insert(pid, handler);
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> bool {
        self.handlers.remove(&pid).is_some()
    }

    /// Drains the self-pipe and reaps every exited/signaled child currently
    /// waitable with `WNOHANG`, returning the callbacks for pids we have a
    /// registration for (spec: "entry removed before handler observes the
    /// final status").
    pub(crate) fn drain_pipe_and_reap(&mut self, read_fd: RawFd) -> Vec<(ChildCallback, ExitStatus)> {
        // Drain any queued wakeup bytes; their count is irrelevant, only
        // their presence as a wakeup signal matters.
        let mut scratch = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(read_fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
            };
            if n <= 0 {
                break;
            }
        }

        let mut ready = Vec::new();
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            let Some(exit) = ExitStatus::from_raw(status) else {
                continue;
            };
            #[cfg(feature = "log")]
            log::debug!("reaped child {pid}: {exit:?}");
            if let Some(cb) = self.handlers.remove(&pid) {
                ready.push((cb, exit));
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_decoding() {
        // WIFEXITED encoding: low byte 0, exit code in bits 8-15.
        let encoded = 42 << 8;
        assert_eq!(ExitStatus::from_raw(encoded), Some(ExitStatus::Exited(42)));
    }

    #[test]
    fn signaled_status_decoding() {
        // WIFSIGNALED encoding: low 7 bits hold the signal number, not 0 or 0x7f.
        let encoded = 9; // SIGKILL
        assert_eq!(ExitStatus::from_raw(encoded), Some(ExitStatus::Signaled(9)));
    }
}
