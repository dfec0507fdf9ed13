//! Named shared memory segments.
//!
//! The protocol's rendezvous runs over system-global named objects, so
//! this wraps POSIX `shm_open` + `mmap`. `create` is exclusive and makes
//! the caller the owner (the owner unlinks the name on drop);
//! `create_or_open` is the both-sides-race-to-create idiom the
//! negotiation and RPC channels use.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

/// A mapped named shared-memory segment.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    name: CString,
    owner: bool,
}

// Safety: the mapping is plain memory; all concurrent access is
// coordinated by the callers (semaphores, futexes, atomics).
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

fn posix_name(name: &str) -> io::Result<CString> {
    CString::new(format!("/{}", name))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid shm name"))
}

impl SharedMemory {
    /// Create a new segment with exclusive ownership of the name.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        Self::open_impl(name, size, libc::O_CREAT | libc::O_EXCL, true)
    }

    /// Open an existing segment.
    pub fn open(name: &str, size: usize) -> io::Result<Self> {
        Self::open_impl(name, size, 0, false)
    }

    /// Create the segment, or open it if someone else won the race.
    pub fn create_or_open(name: &str, size: usize) -> io::Result<Self> {
        match Self::create(name, size) {
            Ok(shm) => Ok(shm),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Self::open(name, size),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Self::open(name, size),
            Err(e) => Err(e),
        }
    }

    /// Like `create_or_open`, but the name outlives this handle even if
    /// it did the creating. Used for rendezvous objects that a peer may
    /// still need to open after this side gives up.
    pub fn create_or_open_persistent(name: &str, size: usize) -> io::Result<Self> {
        match Self::open_impl(name, size, libc::O_CREAT | libc::O_EXCL, false) {
            Ok(shm) => Ok(shm),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Self::open(name, size),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Self::open(name, size),
            Err(e) => Err(e),
        }
    }

    fn open_impl(name: &str, size: usize, extra_flags: i32, owner: bool) -> io::Result<Self> {
        let c_name = posix_name(name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR | extra_flags, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Whoever actually created the object sizes it.
        if extra_flags & libc::O_CREAT != 0 {
            let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(err);
            }
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // The mapping keeps the object alive; the descriptor is no
        // longer needed.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if extra_flags & libc::O_CREAT != 0 {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            return Err(err);
        }

        Ok(SharedMemory {
            ptr: NonNull::new(ptr as *mut u8).unwrap(),
            len: size,
            name: c_name,
            owner,
        })
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("{}_{}_{}", name, std::process::id(), line!())
    }

    #[test]
    fn create_write_open_read() {
        let name = unique("lamina_shm_test_a");
        let owner = SharedMemory::create(&name, 4096).unwrap();
        unsafe { owner.as_ptr().write(0xAB) };

        let view = SharedMemory::open(&name, 4096).unwrap();
        assert_eq!(unsafe { view.as_ptr().read() }, 0xAB);
        assert_eq!(view.len(), 4096);
    }

    #[test]
    fn exclusive_create_detects_existing() {
        let name = unique("lamina_shm_test_b");
        let _owner = SharedMemory::create(&name, 4096).unwrap();
        assert!(SharedMemory::create(&name, 4096).is_err());
        // create_or_open falls through to an open.
        let second = SharedMemory::create_or_open(&name, 4096).unwrap();
        assert_eq!(second.len(), 4096);
    }

    #[test]
    fn owner_unlinks_on_drop() {
        let name = unique("lamina_shm_test_c");
        {
            let _owner = SharedMemory::create(&name, 4096).unwrap();
        }
        assert!(SharedMemory::open(&name, 4096).is_err());
    }
}
