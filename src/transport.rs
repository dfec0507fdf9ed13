//! Per-overlay RPC transport: one shared-memory arena, a connection
//! mutex, a request semaphore, a response semaphore, and a watch on the
//! peer process.
//!
//! The caller (overlay side) holds the connection mutex from send
//! through receive, so RPCs from one overlay are strictly sequential.
//! The servicer never takes the mutex; the request semaphore hands it
//! the arena, the response semaphore hands it back. Every wait
//! alternates between its semaphore and the peer watch in short ticks,
//! so either side observes the other's death within a bounded time.

use std::time::Duration;

use tracing::{debug, trace};

use crate::arena::Arena;
use crate::config::RpcNames;
use crate::error::{ChannelError, ResultCode};
use crate::opcode::Opcode;
use crate::os::{NamedMutex, PeerHandle, Semaphore, SharedMemory};

pub struct RpcChannel {
    shm: SharedMemory,
    mutex: NamedMutex,
    request_sema: Semaphore,
    response_sema: Semaphore,
    peer: PeerHandle,
    poll_tick: Duration,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("poll_tick", &self.poll_tick)
            .finish_non_exhaustive()
    }
}

/// Outcome of a servicer wait.
pub enum ServeWait {
    /// A request is in the arena.
    Request,
    /// The overlay process is gone.
    PeerGone,
    /// The host asked this servicer to retire.
    Stopped,
    /// The wait itself failed.
    Failed(ChannelError),
}

impl RpcChannel {
    /// Create or open the four named objects for one connection. Both
    /// sides call this with the same names; whoever arrives first
    /// creates, the other opens.
    pub fn open(
        names: &RpcNames,
        arena_size: usize,
        peer: PeerHandle,
        poll_tick: Duration,
    ) -> Result<RpcChannel, ChannelError> {
        let shm = SharedMemory::create_or_open(&names.shmem, arena_size)?;
        let mutex = NamedMutex::create_or_open(&names.mutex)?;
        let request_sema = Semaphore::create_or_open(&names.request_sema, 0)?;
        let response_sema = Semaphore::create_or_open(&names.response_sema, 0)?;
        Ok(RpcChannel {
            shm,
            mutex,
            request_sema,
            response_sema,
            peer,
            poll_tick,
        })
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    /// View the shared arena.
    ///
    /// # Safety
    /// The caller must own the arena per the protocol: the overlay side
    /// between taking the connection mutex and posting the request (and
    /// again after the response arrives), the servicer between the
    /// request arriving and the response being posted.
    pub unsafe fn arena(&self) -> Arena<'_> {
        Arena::from_raw(self.shm.as_non_null(), self.shm.len())
    }

    /// Issue one RPC: serialize with `build`, wait for the response, and
    /// read outputs with `read`. Returns the result code from the arena
    /// header alongside whatever `read` produced.
    pub fn call<T>(
        &self,
        opcode: Opcode,
        build: impl FnOnce(&mut Arena) -> Result<(), ChannelError>,
        read: impl FnOnce(&mut Arena) -> T,
    ) -> Result<(ResultCode, T), ChannelError> {
        // Hold the connection mutex from send through receive.
        let _guard = loop {
            if let Some(g) = self.mutex.lock(self.poll_tick)? {
                break g;
            }
            if !self.peer.is_alive() {
                return Err(ChannelError::PeerGone);
            }
        };

        // Safety: mutex held and no request in flight, so this side owns
        // the arena.
        let mut arena = unsafe { self.arena() };
        arena.begin_request(opcode.as_u64());
        // A serialization failure leaves the shmem untouched as far as
        // the peer is concerned: nothing was posted.
        build(&mut arena)?;

        arena.relativize();
        self.request_sema.post()?;
        trace!(opcode = opcode.as_u64(), "rpc request posted");

        loop {
            if self.response_sema.wait_timeout(self.poll_tick)? {
                break;
            }
            if !self.peer.is_alive() {
                // The peer may have posted the response and then died;
                // give the semaphore one final look.
                if self.response_sema.try_wait()? {
                    break;
                }
                debug!(opcode = opcode.as_u64(), "peer died during rpc");
                return Err(ChannelError::PeerGone);
            }
        }

        let mut arena = unsafe { self.arena() };
        arena.absolutize()?;
        let code =
            ResultCode::from_i32(arena.result()).unwrap_or(ResultCode::RuntimeFailure);
        let value = read(&mut arena);
        Ok((code, value))
    }

    /// Servicer side: block until a request is ready. `Err(PeerGone)`
    /// means the overlay vanished and the connection must be cleaned up.
    pub fn wait_request(&self) -> Result<(), ChannelError> {
        match self.wait_request_or_stop(&std::sync::atomic::AtomicBool::new(false)) {
            ServeWait::Request => Ok(()),
            ServeWait::PeerGone => Err(ChannelError::PeerGone),
            ServeWait::Stopped => unreachable!("stop flag never set"),
            ServeWait::Failed(e) => Err(e),
        }
    }

    /// Like [`RpcChannel::wait_request`], but also watches a stop flag so
    /// a shutting-down host can retire its servicer threads promptly.
    pub fn wait_request_or_stop(&self, stop: &std::sync::atomic::AtomicBool) -> ServeWait {
        use std::sync::atomic::Ordering;
        loop {
            match self.request_sema.wait_timeout(self.poll_tick) {
                Ok(true) => return ServeWait::Request,
                Ok(false) => {}
                Err(e) => return ServeWait::Failed(ChannelError::Os(e)),
            }
            if stop.load(Ordering::Acquire) {
                return ServeWait::Stopped;
            }
            if !self.peer.is_alive() {
                match self.request_sema.try_wait() {
                    Ok(true) => return ServeWait::Request,
                    Ok(false) => return ServeWait::PeerGone,
                    Err(e) => return ServeWait::Failed(ChannelError::Os(e)),
                }
            }
        }
    }

    /// Servicer side: hand the arena back to the caller.
    pub fn post_response(&self) -> Result<(), ChannelError> {
        self.response_sema.post()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerConfig;
    use std::sync::Arc;

    fn test_channel_pair(tag: &str) -> (Arc<RpcChannel>, Arc<RpcChannel>, crate::os::process::PeerFlag) {
        let mut cfg = LayerConfig::default();
        cfg.name_prefix = format!("lamina_test_{}_{}", std::process::id(), tag);
        let names = cfg.rpc_names(1);
        let (caller_peer, servicer_flag) = PeerHandle::local_pair();
        let (servicer_peer, _caller_flag) = PeerHandle::local_pair();
        let caller = Arc::new(
            RpcChannel::open(&names, 64 * 1024, caller_peer, Duration::from_millis(20)).unwrap(),
        );
        let servicer = Arc::new(
            RpcChannel::open(&names, 64 * 1024, servicer_peer, Duration::from_millis(20)).unwrap(),
        );
        (caller, servicer, servicer_flag)
    }

    #[test]
    fn request_response_roundtrip() {
        let (caller, servicer, _flag) = test_channel_pair("roundtrip");

        let server = std::thread::spawn(move || {
            servicer.wait_request().unwrap();
            let mut arena = unsafe { servicer.arena() };
            arena.absolutize().unwrap();
            assert_eq!(arena.opcode(), Opcode::Handshake.as_u64());
            // Double the u64 the caller wrote at the start of the bump
            // region.
            let p = arena.args_ptr() as *mut u64;
            unsafe { p.write(p.read() * 2) };
            arena.set_result(ResultCode::Success);
            arena.relativize();
            servicer.post_response().unwrap();
        });

        let (code, value) = caller
            .call(
                Opcode::Handshake,
                |arena| {
                    arena.alloc_value(21u64).map_err(ChannelError::from)?;
                    Ok(())
                },
                |arena| unsafe { (arena.args_ptr() as *const u64).read() },
            )
            .unwrap();
        assert_eq!(code, ResultCode::Success);
        assert_eq!(value, 42);
        server.join().unwrap();
    }

    #[test]
    fn caller_observes_peer_death() {
        let (caller, _servicer, flag) = test_channel_pair("death");
        // No servicer thread: the "peer" dies mid-call.
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            flag.kill();
        });
        let err = caller
            .call(Opcode::WaitFrame, |_arena| Ok(()), |_arena| ())
            .unwrap_err();
        assert!(matches!(err, ChannelError::PeerGone));
        killer.join().unwrap();
    }

    #[test]
    fn servicer_observes_peer_death() {
        let mut cfg = LayerConfig::default();
        cfg.name_prefix = format!("lamina_test_{}_sdeath", std::process::id());
        let names = cfg.rpc_names(1);
        let (dead_peer, flag) = PeerHandle::local_pair();
        flag.kill();
        let channel =
            RpcChannel::open(&names, 64 * 1024, dead_peer, Duration::from_millis(10)).unwrap();
        let err = channel.wait_request().unwrap_err();
        assert!(matches!(err, ChannelError::PeerGone));
    }

    #[test]
    fn serialization_failure_posts_nothing() {
        let (caller, servicer, _flag) = test_channel_pair("overflow");
        let err = caller
            .call(
                Opcode::EndFrame,
                |arena| {
                    // Ask for more than the arena holds.
                    arena
                        .alloc_bytes(10 * 1024 * 1024)
                        .map_err(ChannelError::from)?;
                    Ok(())
                },
                |_arena| (),
            )
            .unwrap_err();
        assert!(matches!(err, ChannelError::Arena(_)));
        // The servicer never saw a request.
        let mut arena = unsafe { servicer.arena() };
        assert!(!servicer.request_sema.try_wait().unwrap());
        let _ = &mut arena;
    }
}
