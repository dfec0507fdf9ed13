//! Named semaphores and the named mutex built on top of one.
//!
//! Waits are always bounded: the protocol observes peer death and stop
//! requests by polling in ticks rather than blocking forever, so the
//! only primitive needed is wait-with-timeout.

use std::ffi::CString;
use std::io;
use std::time::Duration;

/// A system-global named counting semaphore.
pub struct Semaphore {
    sem: *mut libc::sem_t,
    name: CString,
    owner: bool,
}

// Safety: sem_t operations are thread-safe; the pointer is stable for
// the lifetime of the open.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

fn posix_name(name: &str) -> io::Result<CString> {
    CString::new(format!("/{}", name))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid semaphore name"))
}

impl Semaphore {
    /// Create with exclusive ownership of the name.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        Self::open_impl(name, initial, libc::O_CREAT | libc::O_EXCL, true)
    }

    /// Open an existing semaphore.
    pub fn open(name: &str) -> io::Result<Self> {
        Self::open_impl(name, 0, 0, false)
    }

    /// Create the semaphore, or open it if someone else won the race.
    pub fn create_or_open(name: &str, initial: u32) -> io::Result<Self> {
        match Self::create(name, initial) {
            Ok(s) => Ok(s),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Self::open(name),
            Err(e) => Err(e),
        }
    }

    /// Like `create_or_open`, but the name outlives this handle even if
    /// it did the creating; for rendezvous objects a peer may open after
    /// this side gives up.
    pub fn create_or_open_persistent(name: &str, initial: u32) -> io::Result<Self> {
        match Self::open_impl(name, initial, libc::O_CREAT | libc::O_EXCL, false) {
            Ok(s) => Ok(s),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Self::open(name),
            Err(e) => Err(e),
        }
    }

    fn open_impl(name: &str, initial: u32, extra_flags: i32, owner: bool) -> io::Result<Self> {
        let c_name = posix_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_RDWR | extra_flags,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Semaphore {
            sem,
            name: c_name,
            owner,
        })
    }

    pub fn post(&self) -> io::Result<()> {
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Decrement if possible without blocking. Returns whether the
    /// semaphore was taken.
    pub fn try_wait(&self) -> io::Result<bool> {
        let rc = unsafe { libc::sem_trywait(self.sem) };
        if rc == 0 {
            return Ok(true);
        }
        match io::Error::last_os_error() {
            e if e.raw_os_error() == Some(libc::EAGAIN) => Ok(false),
            e if e.raw_os_error() == Some(libc::EINTR) => Ok(false),
            e => Err(e),
        }
    }

    /// Wait up to `timeout`. Returns whether the semaphore was taken.
    #[cfg(target_os = "linux")]
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        ts.tv_sec += timeout.as_secs() as libc::time_t;
        ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }

        loop {
            let rc = unsafe { libc::sem_timedwait(self.sem, &ts) };
            if rc == 0 {
                return Ok(true);
            }
            match io::Error::last_os_error() {
                e if e.raw_os_error() == Some(libc::ETIMEDOUT) => return Ok(false),
                e if e.raw_os_error() == Some(libc::EINTR) => continue,
                e => return Err(e),
            }
        }
    }

    /// Fallback for platforms without `sem_timedwait`: poll in small
    /// sleeps until the deadline.
    #[cfg(not(target_os = "linux"))]
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain any pending counts.
    pub fn drain(&self) -> io::Result<()> {
        while self.try_wait()? {}
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

/// A named cross-process mutex: a binary semaphore created full.
pub struct NamedMutex {
    sema: Semaphore,
}

impl NamedMutex {
    pub fn create_or_open(name: &str) -> io::Result<Self> {
        Ok(NamedMutex {
            sema: Semaphore::create_or_open(name, 1)?,
        })
    }

    /// Variant whose name persists past this handle; see
    /// [`Semaphore::create_or_open_persistent`].
    pub fn create_or_open_persistent(name: &str) -> io::Result<Self> {
        Ok(NamedMutex {
            sema: Semaphore::create_or_open_persistent(name, 1)?,
        })
    }

    /// Acquire with a bound; `None` means the bound expired.
    pub fn lock(&self, timeout: Duration) -> io::Result<Option<NamedMutexGuard<'_>>> {
        if self.sema.wait_timeout(timeout)? {
            Ok(Some(NamedMutexGuard { mutex: self }))
        } else {
            Ok(None)
        }
    }
}

pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        // Nothing useful to do if the post fails; the peer will time out.
        let _ = self.mutex.sema.post();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("{}_{}_{}", name, std::process::id(), line!())
    }

    #[test]
    fn post_then_wait() {
        let name = unique("lamina_sema_test_a");
        let sema = Semaphore::create(&name, 0).unwrap();
        assert!(!sema.try_wait().unwrap());
        sema.post().unwrap();
        assert!(sema.wait_timeout(Duration::from_millis(100)).unwrap());
        assert!(!sema.wait_timeout(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn two_opens_share_the_count() {
        let name = unique("lamina_sema_test_b");
        let a = Semaphore::create(&name, 0).unwrap();
        let b = Semaphore::open(&name).unwrap();
        a.post().unwrap();
        assert!(b.wait_timeout(Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn named_mutex_excludes() {
        let name = unique("lamina_mutex_test");
        let m = NamedMutex::create_or_open(&name).unwrap();
        let guard = m.lock(Duration::from_millis(100)).unwrap();
        assert!(guard.is_some());
        // Second take must time out while held.
        assert!(m.lock(Duration::from_millis(20)).unwrap().is_none());
        drop(guard);
        assert!(m.lock(Duration::from_millis(100)).unwrap().is_some());
    }
}
