//! Peer-process liveness.
//!
//! Every blocking wait in the protocol alternates between its semaphore
//! and a check of the peer's process handle, so a vanished peer is
//! observed within one poll tick. On Linux the handle is a pidfd; where
//! that is unavailable a `kill(pid, 0)` probe stands in. In-process
//! connections (tests, fault injection) use a shared flag instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

enum Inner {
    #[cfg(target_os = "linux")]
    Pidfd {
        fd: libc::c_int,
    },
    Probe {
        pid: u32,
    },
    Flag(Arc<AtomicBool>),
}

/// Watches one peer process for termination.
pub struct PeerHandle {
    inner: Inner,
}

/// The killing end of an in-process peer pair.
#[derive(Clone)]
pub struct PeerFlag(Arc<AtomicBool>);

impl PeerFlag {
    /// Mark the simulated peer as dead.
    pub fn kill(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl PeerHandle {
    /// Watch a real process.
    pub fn from_pid(pid: u32) -> PeerHandle {
        #[cfg(target_os = "linux")]
        {
            let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::c_long, 0) };
            if fd >= 0 {
                return PeerHandle {
                    inner: Inner::Pidfd { fd: fd as libc::c_int },
                };
            }
        }
        PeerHandle {
            inner: Inner::Probe { pid },
        }
    }

    /// An in-process pair: the handle reports alive until the flag's
    /// `kill` is called or the flag end is dropped with `kill`.
    pub fn local_pair() -> (PeerHandle, PeerFlag) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            PeerHandle {
                inner: Inner::Flag(flag.clone()),
            },
            PeerFlag(flag),
        )
    }

    pub fn is_alive(&self) -> bool {
        match &self.inner {
            #[cfg(target_os = "linux")]
            Inner::Pidfd { fd } => {
                let mut pfd = libc::pollfd {
                    fd: *fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
                // pidfd becomes readable when the process exits.
                !(rc > 0 && pfd.revents & libc::POLLIN != 0)
            }
            Inner::Probe { pid } => {
                let rc = unsafe { libc::kill(*pid as libc::pid_t, 0) };
                rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
            }
            Inner::Flag(flag) => !flag.load(Ordering::Acquire),
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Inner::Pidfd { fd } = self.inner {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        let h = PeerHandle::from_pid(std::process::id());
        assert!(h.is_alive());
    }

    #[test]
    fn local_pair_observes_kill() {
        let (handle, flag) = PeerHandle::local_pair();
        assert!(handle.is_alive());
        flag.kill();
        assert!(!handle.is_alive());
    }
}
