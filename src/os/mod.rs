//! OS primitives behind the IPC layer: named shared memory, named
//! semaphores, peer-process liveness, and futex waits for the soft keyed
//! mutex. Everything here is `libc`-level with platform fallbacks.

pub mod futex;
pub mod process;
pub mod sema;
pub mod shm;

pub use process::PeerHandle;
pub use sema::{NamedMutex, Semaphore};
pub use shm::SharedMemory;
