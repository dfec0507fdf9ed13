//! Futex wait/wake over a word in shared memory.
//!
//! The soft graphics backend keeps its keyed mutex as an atomic word
//! inside the shared texture header; cross-process blocking on that word
//! needs a futex. Non-Linux builds fall back to a sleep-poll loop, which
//! is slower but has the same semantics.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Wait until the word no longer holds `expected`, or the timeout runs
/// out. Spurious wakeups are allowed; callers loop on their predicate.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts;
    let ts_ptr = match timeout {
        Some(t) => {
            ts = libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => std::ptr::null(),
    };
    unsafe {
        // Deliberately not FUTEX_PRIVATE: the word may be shared between
        // processes.
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    while word.load(Ordering::Acquire) == expected {
        if let Some(d) = deadline {
            if std::time::Instant::now() >= d {
                return;
            }
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

/// Wake up to `count` waiters on the word.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) {
    // Sleep-poll waiters notice the store on their own.
}
