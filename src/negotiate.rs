//! Singleton rendezvous between the main process and overlay processes.
//!
//! The main side publishes its pid and layer version in a well-known
//! shared-memory record and then loops: release one permit on the
//! overlay-wait semaphore ("one overlay may attempt"), wait on the
//! main-wait semaphore, validate, open that overlay's RPC channels, hand
//! the connection to the accept callback. The overlay side takes the
//! negotiation mutex, waits for a permit, checks the published version
//! against its own, writes its pid, opens its RPC channels, and releases
//! the main side.
//!
//! Version checking happens on both ends: the overlay aborts early when
//! the published main version differs from its own, and the main side
//! re-validates the record before spawning a servicer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{LayerConfig, LAYER_BINARY_VERSION};
use crate::error::{ChannelError, RejectReason};
use crate::os::{NamedMutex, PeerHandle, Semaphore, SharedMemory};
use crate::transport::RpcChannel;

/// Negotiation status values in the shared record.
pub const NEGOTIATION_SUCCESS: u32 = 0;
pub const NEGOTIATION_VERSION_MISMATCH: u32 = 1;

/// The record exchanged through negotiation shared memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NegotiationParams {
    pub main_pid: u32,
    pub overlay_pid: u32,
    pub main_version: u32,
    pub overlay_version: u32,
    pub status: u32,
}

const _: () = {
    assert!(std::mem::size_of::<NegotiationParams>() == 20);
};

/// Variable-length half of the handshake, carried as the first RPC after
/// the channels open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub pid: u32,
    pub version: u32,
    pub app_name: String,
}

/// The four process-global negotiation objects.
pub struct NegotiationChannels {
    shm: SharedMemory,
    mutex: NamedMutex,
    overlay_wait: Semaphore,
    main_wait: Semaphore,
}

impl NegotiationChannels {
    /// Main side: create (or adopt) the negotiation objects. The main
    /// process owns the names and removes them on teardown.
    pub fn create(config: &LayerConfig) -> Result<Self, ChannelError> {
        let names = config.negotiation_names();
        let shm = SharedMemory::create_or_open(
            &names.shmem,
            std::mem::size_of::<NegotiationParams>(),
        )?;
        let mutex = NamedMutex::create_or_open(&names.mutex)?;
        let overlay_wait = Semaphore::create_or_open(&names.overlay_wait_sema, 0)?;
        let main_wait = Semaphore::create_or_open(&names.main_wait_sema, 0)?;
        Ok(NegotiationChannels {
            shm,
            mutex,
            overlay_wait,
            main_wait,
        })
    }

    /// Overlay side: create-or-open without ever unlinking, so an
    /// overlay that arrives first and gives up does not strand a main
    /// process that opened the same names in the meantime.
    pub fn join(config: &LayerConfig) -> Result<Self, ChannelError> {
        let names = config.negotiation_names();
        let shm = SharedMemory::create_or_open_persistent(
            &names.shmem,
            std::mem::size_of::<NegotiationParams>(),
        )?;
        let mutex = NamedMutex::create_or_open_persistent(&names.mutex)?;
        let overlay_wait = Semaphore::create_or_open_persistent(&names.overlay_wait_sema, 0)?;
        let main_wait = Semaphore::create_or_open_persistent(&names.main_wait_sema, 0)?;
        Ok(NegotiationChannels {
            shm,
            mutex,
            overlay_wait,
            main_wait,
        })
    }

    fn params_ptr(&self) -> *mut NegotiationParams {
        self.shm.as_ptr() as *mut NegotiationParams
    }

    fn read_params(&self) -> NegotiationParams {
        // Safety: the record fits the segment and writes are serialized
        // by the negotiation protocol.
        unsafe { self.params_ptr().read_volatile() }
    }

    fn write_params(&self, params: NegotiationParams) {
        unsafe { self.params_ptr().write_volatile(params) }
    }
}

/// A freshly accepted overlay connection, before any RPC was served.
pub struct AcceptedOverlay {
    pub pid: u32,
    pub channel: RpcChannel,
}

/// Handle to the negotiator thread. Dropping it (or calling `stop`)
/// stops the accept loop.
pub struct Negotiator {
    stop: Arc<AtomicBool>,
    wake: Arc<NegotiationChannels>,
    thread: Option<JoinHandle<()>>,
}

impl Negotiator {
    /// Publish this process as the main side and start accepting
    /// overlays. `on_accept` is called on the negotiator thread with
    /// each new connection.
    pub fn spawn(
        config: LayerConfig,
        on_accept: impl FnMut(AcceptedOverlay) + Send + 'static,
    ) -> Result<Negotiator, ChannelError> {
        let channels = Arc::new(NegotiationChannels::create(&config)?);

        // Only one main instance may exist; the negotiation mutex guards
        // the published record while we stamp it.
        let guard = channels
            .mutex
            .lock(config.mutex_wait)?
            .ok_or(ChannelError::ConnectTimeout)?;
        channels.write_params(NegotiationParams {
            main_pid: std::process::id(),
            overlay_pid: 0,
            main_version: LAYER_BINARY_VERSION,
            overlay_version: 0,
            status: NEGOTIATION_SUCCESS,
        });
        drop(guard);

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            let channels = channels.clone();
            std::thread::Builder::new()
                .name("lamina-negotiator".into())
                .spawn(move || negotiate_loop(&config, &channels, &stop, on_accept))
                .map_err(ChannelError::Os)?
        };

        Ok(Negotiator {
            stop,
            wake: channels,
            thread: Some(thread),
        })
    }

    /// Stop the accept loop and join the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Cut the wait short so shutdown is prompt.
        let _ = self.wake.main_wait.post();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn negotiate_loop(
    config: &LayerConfig,
    channels: &NegotiationChannels,
    stop: &AtomicBool,
    mut on_accept: impl FnMut(AcceptedOverlay),
) {
    let _span = tracing::info_span!("negotiator", pid = std::process::id()).entered();
    info!("accepting overlay connections");

    loop {
        // One overlay may attempt to connect.
        if channels.overlay_wait.post().is_err() {
            error!("could not release overlay-wait semaphore");
            return;
        }

        loop {
            match channels.main_wait.wait_timeout(config.negotiation_tick) {
                Ok(true) => break,
                Ok(false) => {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "negotiation wait failed");
                    return;
                }
            }
        }
        if stop.load(Ordering::Acquire) {
            return;
        }

        let params = channels.read_params();
        if params.status != NEGOTIATION_SUCCESS
            || params.overlay_version != LAYER_BINARY_VERSION
        {
            warn!(
                main_version = LAYER_BINARY_VERSION,
                overlay_version = params.overlay_version,
                "overlay layer version differs, connection rejected"
            );
            channels.write_params(NegotiationParams {
                status: NEGOTIATION_VERSION_MISMATCH,
                ..params
            });
            continue;
        }

        let pid = params.overlay_pid;
        let peer = PeerHandle::from_pid(pid);
        match RpcChannel::open(
            &config.rpc_names(pid),
            config.arena_size,
            peer,
            config.poll_tick,
        ) {
            Ok(channel) => {
                debug!(overlay_pid = pid, "overlay connected");
                on_accept(AcceptedOverlay { pid, channel });
            }
            Err(e) => {
                warn!(overlay_pid = pid, error = %e, "could not open RPC channels, connection rejected");
            }
        }
    }
}

/// Overlay side: rendezvous with the main process and open this
/// process's RPC channels. Fails with `ConnectTimeout` when no main
/// process shows up within the connect bound, and with
/// `Rejected(VersionMismatch)` when the published layer version differs.
pub fn connect_to_main(config: &LayerConfig) -> Result<RpcChannel, ChannelError> {
    let channels = NegotiationChannels::join(config)?;
    let deadline = Instant::now() + config.connect_timeout;

    let _guard = loop {
        if let Some(g) = channels.mutex.lock(config.mutex_wait)? {
            break g;
        }
        if Instant::now() >= deadline {
            return Err(ChannelError::ConnectTimeout);
        }
    };

    // Wait for the main side to admit one overlay.
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(ChannelError::ConnectTimeout)?;
        let tick = remaining.min(config.negotiation_tick);
        if channels.overlay_wait.wait_timeout(tick)? {
            break;
        }
        if Instant::now() >= deadline {
            return Err(ChannelError::ConnectTimeout);
        }
    }

    let mut params = channels.read_params();
    if params.main_pid == 0 {
        return Err(ChannelError::ConnectTimeout);
    }
    if params.main_version != LAYER_BINARY_VERSION {
        // Tell the main side why we walked away, then unblock it.
        params.overlay_pid = std::process::id();
        params.overlay_version = LAYER_BINARY_VERSION;
        params.status = NEGOTIATION_VERSION_MISMATCH;
        channels.write_params(params);
        let _ = channels.main_wait.post();
        return Err(ChannelError::Rejected(RejectReason::VersionMismatch {
            main: params.main_version,
            overlay: LAYER_BINARY_VERSION,
        }));
    }

    params.overlay_pid = std::process::id();
    params.overlay_version = LAYER_BINARY_VERSION;
    params.status = NEGOTIATION_SUCCESS;
    channels.write_params(params);

    let peer = PeerHandle::from_pid(params.main_pid);
    let channel = RpcChannel::open(
        &config.rpc_names(std::process::id()),
        config.arena_size,
        peer,
        config.poll_tick,
    )?;

    channels.main_wait.post()?;
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_config(tag: &str) -> LayerConfig {
        let mut cfg = LayerConfig::default();
        cfg.name_prefix = format!("lamina_neg_{}_{}", std::process::id(), tag);
        cfg.connect_timeout = Duration::from_millis(500);
        cfg.negotiation_tick = Duration::from_millis(50);
        cfg.poll_tick = Duration::from_millis(20);
        cfg
    }

    #[test]
    fn overlay_connects_to_main() {
        let cfg = test_config("ok");
        let (tx, rx) = mpsc::channel();
        let mut negotiator = Negotiator::spawn(cfg.clone(), move |accepted| {
            tx.send(accepted.pid).unwrap();
        })
        .unwrap();

        let channel = connect_to_main(&cfg).unwrap();
        let accepted_pid = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(accepted_pid, std::process::id());
        drop(channel);
        negotiator.stop();
    }

    #[test]
    fn connect_without_main_times_out() {
        let cfg = test_config("nomain");
        let start = Instant::now();
        let err = connect_to_main(&cfg).unwrap_err();
        assert!(matches!(err, ChannelError::ConnectTimeout));
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn two_overlays_connect_sequentially() {
        let cfg = test_config("two");
        let (tx, rx) = mpsc::channel();
        let mut negotiator = Negotiator::spawn(cfg.clone(), move |accepted| {
            tx.send(accepted.pid).unwrap();
        })
        .unwrap();

        let a = connect_to_main(&cfg).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let b = connect_to_main(&cfg).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        drop((a, b));
        negotiator.stop();
    }
}
