//! The main-process role.
//!
//! [`MainLayer`] wraps the real compositor runtime and implements
//! [`CompositorRuntime`] itself, so the main application calls through
//! it unchanged. Creating the main session starts the negotiator;
//! every accepted overlay gets a [`Connection`] and a dedicated
//! servicer thread. The layer's own interpositions are: publishing
//! wait-frame results to the frame coordinator, merging cached overlay
//! layers into end-frame, hiding the overlay layer budget from
//! get-system-properties, and fanning runtime events out to overlay
//! queues.

pub mod arbiter;
pub mod bridge;
pub(crate) mod dispatch;
pub mod events;
pub mod frame;
pub(crate) mod servicer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, info, warn};

use crate::api::*;
use crate::config::LayerConfig;
use crate::error::{ApiResult, CallError, ResultCode};
use crate::graphics::GraphicsDevice;
use crate::negotiate::Negotiator;
use crate::runtime::CompositorRuntime;
use crate::transport::RpcChannel;
use crate::types::*;

use arbiter::SessionStateTracker;
use bridge::SwapchainBridge;
use events::EventQueue;
use frame::FrameLoop;

/// Per-overlay-swapchain record on the host side.
pub(crate) struct SwapchainEntry {
    pub real: SwapchainHandle,
    pub info: SwapchainCreateInfo,
    pub bridge: Arc<SwapchainBridge>,
}

/// Everything the host tracks for one overlay connection.
pub(crate) struct OverlayCtx {
    /// Local id of the overlay's session façade; 0 before create.
    pub session_local: RawHandle,
    pub placement: i32,
    pub relaxed: bool,
    pub tracker: SessionStateTracker,
    /// Frame-gate bookkeeping: last published sequence this overlay
    /// consumed and the last predicted time it was handed.
    pub last_frame_seq: u64,
    pub last_frame_time: DisplayTime,
    /// Cached composition layers (real handles), replaced on each
    /// overlay end-frame, merged into every main end-frame.
    pub layers: Vec<CompositionLayer>,
    pub events: EventQueue,
    pub swapchains: HashMap<RawHandle, SwapchainEntry>,
    pub spaces: HashMap<RawHandle, SpaceHandle>,
    pub action_sets: HashMap<RawHandle, ActionSetHandle>,
    pub actions: HashMap<RawHandle, ActionHandle>,
    /// Swapchains whose runtime destroy waits for the next successful
    /// main end-frame.
    pub deferred_destroy: Vec<(RawHandle, SwapchainHandle)>,
}

impl OverlayCtx {
    fn new(max_saved_events: usize) -> Self {
        OverlayCtx {
            session_local: 0,
            placement: 0,
            relaxed: false,
            tracker: SessionStateTracker::default(),
            last_frame_seq: 0,
            last_frame_time: 0,
            layers: Vec::new(),
            events: EventQueue::new(max_saved_events),
            swapchains: HashMap::new(),
            spaces: HashMap::new(),
            action_sets: HashMap::new(),
            actions: HashMap::new(),
            deferred_destroy: Vec::new(),
        }
    }
}

pub(crate) struct Connection {
    pub pid: u32,
    pub accept_seq: u64,
    pub channel: RpcChannel,
    pub closed: AtomicBool,
    pub ctx: Mutex<OverlayCtx>,
}

struct ConnectionEntry {
    conn: Arc<Connection>,
    thread: Option<JoinHandle<()>>,
}

pub(crate) struct HostShared {
    pub runtime: Arc<dyn CompositorRuntime>,
    pub device: Arc<dyn GraphicsDevice>,
    pub config: LayerConfig,
    pub ids: LocalIdAllocator,
    pub frame: FrameLoop,
    /// The real session's serializing mutex. With one real session,
    /// per-session granularity and one lock coincide; the
    /// serialize-everything flag only widens what takes it.
    session_lock: ReentrantMutex<()>,
    main_session: Mutex<Option<SessionHandle>>,
    /// Last state the runtime surfaced for the main session; overlay
    /// session trackers follow it.
    main_state: Mutex<SessionState>,
    connections: Mutex<HashMap<u32, ConnectionEntry>>,
    accept_counter: AtomicU64,
}

impl HostShared {
    /// The real main session, if it currently exists.
    pub fn main_session(&self) -> Option<SessionHandle> {
        *self.main_session.lock()
    }

    /// The main session's last surfaced lifecycle state.
    pub fn main_state(&self) -> SessionState {
        *self.main_state.lock()
    }

    /// Serialize a call that touches the real session.
    pub fn session_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.session_lock.lock()
    }

    /// The bring-up escape hatch: with `serialize_everything` set, even
    /// instance-scoped calls take the session lock, degrading to one
    /// coarse call mutex.
    pub fn coarse_guard(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        if self.config.serialize_everything {
            Some(self.session_lock.lock())
        } else {
            None
        }
    }

    /// Register a new overlay connection and spawn its servicer.
    pub fn attach(self: &Arc<Self>, pid: u32, channel: RpcChannel) {
        let conn = Arc::new(Connection {
            pid,
            accept_seq: self.accept_counter.fetch_add(1, Ordering::Relaxed),
            channel,
            closed: AtomicBool::new(false),
            ctx: Mutex::new(OverlayCtx::new(self.config.max_saved_events)),
        });
        let thread = {
            let conn = conn.clone();
            let shared = self.clone();
            std::thread::Builder::new()
                .name(format!("lamina-servicer-{}", pid))
                .spawn(move || servicer::run(conn, shared))
                .ok()
        };
        let mut connections = self.connections.lock();
        if let Some(stale) = connections.insert(pid, ConnectionEntry { conn, thread }) {
            // A reconnect from the same pid replaces the dead entry.
            warn!(pid, "replacing stale connection for pid");
            stale.conn.closed.store(true, Ordering::Release);
        }
    }

    /// Drop a connection from the registry (called by its servicer after
    /// cleanup). The servicer's own thread handle is left to detach.
    pub fn detach(&self, pid: u32) {
        self.connections.lock().remove(&pid);
    }

    fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .values()
            .filter(|e| !e.conn.closed.load(Ordering::Acquire))
            .map(|e| e.conn.clone())
            .collect()
    }

    /// Route one runtime event. The main caller always keeps the
    /// original. State changes of the main session only move the target
    /// the overlay trackers follow; loss warnings and instance-wide
    /// events are replayed into every overlay queue (session handles are
    /// rewritten to the overlay's local id at dequeue time).
    fn fan_out(&self, event: &EventData) {
        match event {
            EventData::SessionStateChanged { session, state, .. } => {
                if Some(*session) == self.main_session() {
                    *self.main_state.lock() = *state;
                }
            }
            EventData::SessionLossPending { .. } => {
                for conn in self.live_connections() {
                    let mut ctx = conn.ctx.lock();
                    ctx.tracker.mark_loss_pending();
                    ctx.events.push(*event);
                }
            }
            _ => {
                for conn in self.live_connections() {
                    conn.ctx.lock().events.push(*event);
                }
            }
        }
    }

    /// Merge cached overlay layers around the main layer list, ordered
    /// by placement ordinal (negative below, non-negative above), ties
    /// in accept order.
    fn merge_layers(&self, main_layers: &[CompositionLayer]) -> Vec<CompositionLayer> {
        let mut below: Vec<(i32, u64, Vec<CompositionLayer>)> = Vec::new();
        let mut above: Vec<(i32, u64, Vec<CompositionLayer>)> = Vec::new();
        for conn in self.live_connections() {
            let ctx = conn.ctx.lock();
            if ctx.layers.is_empty() {
                continue;
            }
            let slot = (ctx.placement, conn.accept_seq, ctx.layers.clone());
            if ctx.placement < 0 {
                below.push(slot);
            } else {
                above.push(slot);
            }
        }
        below.sort_by_key(|(placement, seq, _)| (*placement, *seq));
        above.sort_by_key(|(placement, seq, _)| (*placement, *seq));

        let mut merged = Vec::new();
        for (_, _, layers) in below {
            merged.extend(layers);
        }
        merged.extend_from_slice(main_layers);
        for (_, _, layers) in above {
            merged.extend(layers);
        }
        merged
    }

    /// After a successful main end-frame, run deferred swapchain
    /// destroys and drop cached layers that referenced them.
    fn run_deferred_destroys(&self) {
        for conn in self.live_connections() {
            let deferred: Vec<(RawHandle, SwapchainHandle)> = {
                let mut ctx = conn.ctx.lock();
                let deferred = std::mem::take(&mut ctx.deferred_destroy);
                for (_, real) in &deferred {
                    ctx.layers
                        .retain(|layer| !layer.swapchains().contains(real));
                }
                deferred
            };
            for (local, real) in deferred {
                debug!(local, real = real.as_raw(), "running deferred swapchain destroy");
                let _ = self.runtime.destroy_swapchain(real);
            }
        }
    }

    /// Centralized teardown of everything one overlay connection owned.
    /// Idempotent: every step tolerates already-removed state.
    pub fn cleanup_connection(&self, conn: &Connection) {
        conn.closed.store(true, Ordering::Release);
        // Session lock before connection context, like every other path
        // that touches both.
        let _guard = self.session_guard();
        let mut ctx = conn.ctx.lock();

        for (_, entry) in ctx.swapchains.drain() {
            entry.bridge.force_release_all();
            let _ = self.runtime.destroy_swapchain(entry.real);
        }
        for (_, real) in ctx.spaces.drain() {
            let _ = self.runtime.destroy_space(real);
        }
        for (_, real) in ctx.actions.drain() {
            let _ = self.runtime.destroy_action(real);
        }
        for (_, real) in ctx.action_sets.drain() {
            let _ = self.runtime.destroy_action_set(real);
        }
        ctx.layers.clear();
        ctx.deferred_destroy.clear();
        ctx.events.clear();
        ctx.session_local = 0;
        drop(ctx);

        self.detach(conn.pid);
        info!(pid = conn.pid, "overlay connection cleaned up");
    }
}

/// The main-process layer. Construct it around the real runtime and the
/// graphics device, then use it wherever the runtime would be used.
pub struct MainLayer {
    shared: Arc<HostShared>,
    negotiator: Mutex<Option<Negotiator>>,
}

impl MainLayer {
    pub fn new(
        runtime: Arc<dyn CompositorRuntime>,
        device: Arc<dyn GraphicsDevice>,
        config: LayerConfig,
    ) -> MainLayer {
        MainLayer {
            shared: Arc::new(HostShared {
                runtime,
                device,
                config,
                ids: LocalIdAllocator::new(),
                frame: FrameLoop::new(),
                session_lock: ReentrantMutex::new(()),
                main_session: Mutex::new(None),
                main_state: Mutex::new(SessionState::Unknown),
                connections: Mutex::new(HashMap::new()),
                accept_counter: AtomicU64::new(0),
            }),
            negotiator: Mutex::new(None),
        }
    }

    /// Attach an overlay connection directly, bypassing negotiation.
    /// This is the seam the in-process tests use; production connections
    /// arrive through the negotiator.
    #[doc(hidden)]
    pub fn attach_overlay(&self, pid: u32, channel: RpcChannel) {
        self.shared.attach(pid, channel);
    }

    /// Tear down everything associated with the main session: stop the
    /// negotiator, buffer loss events for overlays, destroy the real
    /// session.
    fn teardown_main_session(&self, session: SessionHandle) -> ApiResult<()> {
        if let Some(mut negotiator) = self.negotiator.lock().take() {
            negotiator.stop();
        }
        let loss_time = self.shared.frame.current().predicted_display_time;
        for conn in self.shared.live_connections() {
            let mut ctx = conn.ctx.lock();
            if ctx.session_local != 0 {
                ctx.events.push(EventData::SessionLossPending {
                    session,
                    loss_time,
                });
                ctx.tracker.mark_lost();
            }
            ctx.layers.clear();
        }
        let result = {
            let _guard = self.shared.session_guard();
            self.shared.runtime.destroy_session(session)
        };
        *self.shared.main_session.lock() = None;
        result
    }

    /// Stop servicer threads and the negotiator. Called on drop; safe to
    /// call twice.
    fn shutdown(&self) {
        if let Some(mut negotiator) = self.negotiator.lock().take() {
            negotiator.stop();
        }
        let entries: Vec<ConnectionEntry> = {
            let mut connections = self.shared.connections.lock();
            connections.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            entry.conn.closed.store(true, Ordering::Release);
        }
        for mut entry in entries {
            if let Some(t) = entry.thread.take() {
                let _ = t.join();
            }
        }
    }
}

impl Drop for MainLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CompositorRuntime for MainLayer {
    fn get_instance_properties(&self) -> ApiResult<InstanceProperties> {
        let _coarse = self.shared.coarse_guard();
        self.shared.runtime.get_instance_properties()
    }

    fn get_system(&self) -> ApiResult<SystemId> {
        self.shared.runtime.get_system()
    }

    fn get_system_properties(&self, system: SystemId) -> ApiResult<SystemProperties> {
        let _coarse = self.shared.coarse_guard();
        let mut props = self.shared.runtime.get_system_properties(system)?;
        // Hide the slots reserved for overlay layers from the main app.
        props.max_layer_count = props
            .max_layer_count
            .saturating_sub(self.shared.config.overlay_layer_budget);
        Ok(props)
    }

    fn enumerate_view_configurations(
        &self,
        system: SystemId,
        out: &mut [ViewConfigurationKind],
    ) -> ApiResult<u32> {
        self.shared.runtime.enumerate_view_configurations(system, out)
    }

    fn get_view_configuration_properties(
        &self,
        system: SystemId,
        kind: ViewConfigurationKind,
    ) -> ApiResult<ViewConfigurationProperties> {
        self.shared
            .runtime
            .get_view_configuration_properties(system, kind)
    }

    fn enumerate_view_configuration_views(
        &self,
        system: SystemId,
        kind: ViewConfigurationKind,
        out: &mut [ViewConfigurationView],
    ) -> ApiResult<u32> {
        self.shared
            .runtime
            .enumerate_view_configuration_views(system, kind, out)
    }

    fn poll_event(&self) -> ApiResult<Option<EventData>> {
        let _coarse = self.shared.coarse_guard();
        let event = self.shared.runtime.poll_event()?;
        if let Some(ev) = &event {
            self.shared.fan_out(ev);
        }
        Ok(event)
    }

    fn create_session(&self, info: &SessionCreateInfo) -> ApiResult<SessionHandle> {
        if info.overlay.is_some() {
            // The overlay path runs in the overlay process, not here.
            return Err(CallError(ResultCode::ValidationFailure));
        }
        let session = self.shared.runtime.create_session(info)?;
        *self.shared.main_session.lock() = Some(session);

        let shared = self.shared.clone();
        match Negotiator::spawn(self.shared.config.clone(), move |accepted| {
            shared.attach(accepted.pid, accepted.channel);
        }) {
            Ok(negotiator) => {
                *self.negotiator.lock() = Some(negotiator);
                info!(session = session.as_raw(), "main session created, negotiator running");
            }
            Err(e) => {
                warn!(error = %e, "negotiator could not start; overlays will not connect");
            }
        }
        Ok(session)
    }

    fn destroy_session(&self, session: SessionHandle) -> ApiResult<()> {
        if self.shared.main_session() == Some(session) {
            return self.teardown_main_session(session);
        }
        let _guard = self.shared.session_guard();
        self.shared.runtime.destroy_session(session)
    }

    fn begin_session(&self, session: SessionHandle, info: &SessionBeginInfo) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.begin_session(session, info)
    }

    fn end_session(&self, session: SessionHandle) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.end_session(session)
    }

    fn request_exit_session(&self, session: SessionHandle) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.request_exit_session(session)
    }

    fn enumerate_reference_spaces(
        &self,
        session: SessionHandle,
        out: &mut [ReferenceSpaceKind],
    ) -> ApiResult<u32> {
        self.shared.runtime.enumerate_reference_spaces(session, out)
    }

    fn create_reference_space(
        &self,
        session: SessionHandle,
        info: &ReferenceSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.create_reference_space(session, info)
    }

    fn get_reference_space_bounds_rect(
        &self,
        session: SessionHandle,
        kind: ReferenceSpaceKind,
    ) -> ApiResult<(bool, Extent2Df)> {
        self.shared
            .runtime
            .get_reference_space_bounds_rect(session, kind)
    }

    fn create_action_space(
        &self,
        session: SessionHandle,
        info: &ActionSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.create_action_space(session, info)
    }

    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        time: DisplayTime,
    ) -> ApiResult<SpaceLocation> {
        self.shared.runtime.locate_space(space, base, time)
    }

    fn destroy_space(&self, space: SpaceHandle) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.destroy_space(space)
    }

    fn enumerate_swapchain_formats(
        &self,
        session: SessionHandle,
        out: &mut [i64],
    ) -> ApiResult<u32> {
        self.shared.runtime.enumerate_swapchain_formats(session, out)
    }

    fn create_swapchain(
        &self,
        session: SessionHandle,
        info: &SwapchainCreateInfo,
    ) -> ApiResult<SwapchainHandle> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.create_swapchain(session, info)
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.destroy_swapchain(swapchain)
    }

    fn enumerate_swapchain_images(
        &self,
        swapchain: SwapchainHandle,
        out: &mut [SwapchainImage],
    ) -> ApiResult<u32> {
        self.shared.runtime.enumerate_swapchain_images(swapchain, out)
    }

    fn acquire_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<u32> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.acquire_swapchain_image(swapchain)
    }

    fn wait_swapchain_image(&self, swapchain: SwapchainHandle, timeout_ns: i64) -> ApiResult<()> {
        self.shared.runtime.wait_swapchain_image(swapchain, timeout_ns)
    }

    fn release_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.release_swapchain_image(swapchain)
    }

    fn wait_frame(&self, session: SessionHandle) -> ApiResult<FrameState> {
        let state = {
            let _guard = self.shared.session_guard();
            self.shared.runtime.wait_frame(session)?
        };
        if self.shared.main_session() == Some(session) {
            self.shared.frame.publish(state);
        }
        Ok(state)
    }

    fn begin_frame(&self, session: SessionHandle) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.begin_frame(session)
    }

    fn end_frame(&self, session: SessionHandle, info: &FrameEndInfo) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        if self.shared.main_session() != Some(session) {
            return self.shared.runtime.end_frame(session, info);
        }
        let merged = FrameEndInfo {
            display_time: info.display_time,
            blend_mode: info.blend_mode,
            layers: self.shared.merge_layers(&info.layers),
        };
        self.shared.runtime.end_frame(session, &merged)?;
        self.shared.run_deferred_destroys();
        Ok(())
    }

    fn locate_views(
        &self,
        session: SessionHandle,
        info: &ViewLocateInfo,
        out: &mut [View],
    ) -> ApiResult<(ViewState, u32)> {
        self.shared.runtime.locate_views(session, info, out)
    }

    fn create_action_set(&self, info: &ActionSetCreateInfo) -> ApiResult<ActionSetHandle> {
        self.shared.runtime.create_action_set(info)
    }

    fn destroy_action_set(&self, action_set: ActionSetHandle) -> ApiResult<()> {
        self.shared.runtime.destroy_action_set(action_set)
    }

    fn create_action(
        &self,
        action_set: ActionSetHandle,
        info: &ActionCreateInfo,
    ) -> ApiResult<ActionHandle> {
        self.shared.runtime.create_action(action_set, info)
    }

    fn destroy_action(&self, action: ActionHandle) -> ApiResult<()> {
        self.shared.runtime.destroy_action(action)
    }

    fn sync_actions(&self, session: SessionHandle, info: &ActionsSyncInfo) -> ApiResult<()> {
        let _guard = self.shared.session_guard();
        self.shared.runtime.sync_actions(session, info)
    }

    fn get_action_state(
        &self,
        session: SessionHandle,
        info: &ActionStateGetInfo,
    ) -> ApiResult<ActionState> {
        self.shared.runtime.get_action_state(session, info)
    }

    fn apply_haptic_feedback(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
        vibration: &HapticVibration,
    ) -> ApiResult<()> {
        self.shared.runtime.apply_haptic_feedback(session, info, vibration)
    }

    fn stop_haptic_feedback(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
    ) -> ApiResult<()> {
        self.shared.runtime.stop_haptic_feedback(session, info)
    }

    fn get_input_source_localized_name(
        &self,
        session: SessionHandle,
        info: &InputSourceLocalizedNameGetInfo,
        out: &mut [u8],
    ) -> ApiResult<u32> {
        self.shared
            .runtime
            .get_input_source_localized_name(session, info, out)
    }
}
