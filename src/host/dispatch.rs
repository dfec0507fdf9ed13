//! Opcode dispatch for the RPC servicer.
//!
//! Each handler casts the arena-resident args struct, translates the
//! overlay's local handles into real ones, serializes against the
//! session mutex where the runtime is touched, writes outputs back in
//! place, and records the result code in the arena header. Protocol
//! violations (bad opcode, malformed chains) are fatal to the current
//! RPC only and surface as a runtime-failure result.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::api::*;
use crate::arena::Arena;
use crate::config::LAYER_BINARY_VERSION;
use crate::error::{ApiResult, ResultCode};
use crate::graphics::ShareHandle;
use crate::marshal::{self, *};
use crate::negotiate::HandshakePayload;
use crate::opcode::Opcode;
use crate::types::*;

use super::bridge::SwapchainBridge;
use super::{Connection, HostShared, SwapchainEntry};

/// Bound on keyed-mutex acquires during release copies. The overlay
/// released with the MAIN key before issuing the RPC, so anything near
/// this bound means the texture state is corrupt.
const COPY_ACQUIRE_BOUND: Duration = Duration::from_secs(1);

pub(crate) fn dispatch(shared: &Arc<HostShared>, conn: &Arc<Connection>, arena: &mut Arena) {
    let code = match Opcode::from_u64(arena.opcode()) {
        Some(op) => {
            debug!(opcode = ?op, pid = conn.pid, "dispatching");
            // Safety of every handler: the servicer owns the arena
            // between request and response, and absolutize bounds-checked
            // every registered pointer.
            unsafe { handle(shared, conn, arena, op) }
        }
        None => {
            warn!(opcode = arena.opcode(), "unknown opcode");
            ResultCode::RuntimeFailure
        }
    };
    arena.set_result(code);
}

fn code_of<T>(result: ApiResult<T>) -> (ResultCode, Option<T>) {
    match result {
        Ok(v) => (ResultCode::Success, Some(v)),
        Err(e) => (e.code(), None),
    }
}

/// Run an enumeration twice to collect the full item list.
fn collect<T: Copy + Default>(mut f: impl FnMut(&mut [T]) -> ApiResult<u32>) -> ApiResult<Vec<T>> {
    let n = f(&mut [])? as usize;
    let mut v = vec![T::default(); n];
    let m = f(&mut v)? as usize;
    v.truncate(m);
    Ok(v)
}

unsafe fn handle(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
    op: Opcode,
) -> ResultCode {
    match op {
        Opcode::Handshake => handshake(arena),
        Opcode::CreateInstance => create_instance(shared, arena),
        Opcode::CreateSession => create_session(shared, conn, arena),
        Opcode::DestroySession => destroy_session(shared, conn, arena),
        Opcode::BeginSession => begin_session(conn, arena),
        Opcode::EndSession => end_session(conn, arena),
        Opcode::RequestExitSession => request_exit(conn, arena),
        Opcode::EnumerateSwapchainFormats => enumerate_formats(shared, conn, arena),
        Opcode::CreateSwapchain => create_swapchain(shared, conn, arena),
        Opcode::DestroySwapchain => destroy_swapchain(shared, conn, arena),
        Opcode::EnumerateSwapchainImages => enumerate_images(shared, conn, arena),
        Opcode::AcquireSwapchainImage => acquire_image(shared, conn, arena),
        Opcode::WaitSwapchainImage => wait_image(shared, conn, arena),
        Opcode::ReleaseSwapchainImage => release_image(shared, conn, arena),
        Opcode::CreateReferenceSpace => create_reference_space(shared, conn, arena),
        Opcode::CreateActionSpace => create_action_space(shared, conn, arena),
        Opcode::LocateSpace => locate_space(shared, conn, arena),
        Opcode::DestroySpace => destroy_space(shared, conn, arena),
        Opcode::EnumerateViewConfigurations => enumerate_view_configurations(shared, arena),
        Opcode::EnumerateViewConfigurationViews => enumerate_view_configuration_views(shared, arena),
        Opcode::GetViewConfigurationProperties => get_view_configuration_properties(shared, arena),
        Opcode::GetSystemProperties => get_system_properties(shared, arena),
        Opcode::GetInstanceProperties => get_instance_properties(shared, arena),
        Opcode::PollEvent => poll_event(shared, conn, arena),
        Opcode::WaitFrame => wait_frame(shared, conn, arena),
        Opcode::BeginFrame => begin_frame(conn, arena),
        Opcode::EndFrame => end_frame(shared, conn, arena),
        Opcode::SyncActionsAndGetState => sync_actions(shared, conn, arena),
        Opcode::StopHaptic => haptic(shared, conn, arena),
        Opcode::ApplyHaptic => haptic(shared, conn, arena),
        Opcode::LocateViews => locate_views(shared, conn, arena),
        Opcode::GetInputSourceLocalizedName => input_source_name(shared, conn, arena),
        Opcode::CreateActionSet => create_action_set(shared, conn, arena),
        Opcode::DestroyActionSet => destroy_action_set(shared, conn, arena),
        Opcode::CreateAction => create_action(shared, conn, arena),
        Opcode::DestroyAction => destroy_action(shared, conn, arena),
        Opcode::EnumerateReferenceSpaces => enumerate_reference_spaces(shared, conn, arena),
        Opcode::GetReferenceSpaceBoundsRect => reference_space_bounds(shared, conn, arena),
    }
}

/// Validate that the RPC names this connection's session façade.
fn check_session(conn: &Connection, session: u64) -> Result<(), ResultCode> {
    let ctx = conn.ctx.lock();
    if ctx.session_local == 0 || ctx.session_local != session {
        return Err(ResultCode::HandleInvalid);
    }
    Ok(())
}

fn real_session(shared: &HostShared) -> Result<SessionHandle, ResultCode> {
    shared.main_session().ok_or(ResultCode::SessionLost)
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

unsafe fn handshake(arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<HandshakeArgs>(arena);
    let request = read_array((*args).request as *const u8, (*args).request_len);
    let payload = match decode_handshake(&request) {
        Ok(p) => p,
        Err(code) => return code,
    };
    debug!(pid = payload.pid, app = %payload.app_name, "overlay handshake");

    let response = HandshakePayload {
        pid: std::process::id(),
        version: LAYER_BINARY_VERSION,
        app_name: "main".into(),
    };
    let bytes = match encode_handshake(&response) {
        Ok(b) => b,
        Err(code) => return code,
    };
    if bytes.len() > (*args).response_capacity as usize || (*args).response.is_null() {
        return ResultCode::SizeInsufficient;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), (*args).response, bytes.len());
    (*args).response_len = bytes.len() as u32;
    ResultCode::Success
}

unsafe fn create_instance(shared: &Arc<HostShared>, arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<CreateInstanceArgs>(arena);
    let (code, system) = code_of(shared.runtime.get_system());
    if let Some(system) = system {
        (*args).out_instance = shared.ids.allocate();
        (*args).out_system = system.0;
    }
    code
}

unsafe fn create_session(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<CreateSessionArgs>(arena);
    let Some(info) = crate::chain::parse_session_create_info((*args).create_info) else {
        return ResultCode::ValidationFailure;
    };
    let Some(overlay) = info.overlay else {
        // A session without the overlay extension has no business on
        // this channel.
        return ResultCode::ValidationFailure;
    };
    if info.graphics.api != GraphicsApi::SharedTexture {
        return ResultCode::GraphicsDeviceInvalid;
    }
    if shared.main_session().is_none() {
        return ResultCode::RuntimeFailure;
    }

    let mut ctx = conn.ctx.lock();
    if ctx.session_local != 0 {
        return ResultCode::ValidationFailure;
    }
    let local = shared.ids.allocate();
    ctx.session_local = local;
    ctx.placement = overlay.placement;
    ctx.relaxed = overlay
        .flags
        .contains(OverlaySessionFlags::RELAXED_DISPLAY_TIME);
    ctx.tracker = super::arbiter::SessionStateTracker::default();
    drop(ctx);

    debug!(pid = conn.pid, session = local, placement = overlay.placement, "overlay session created");
    (*args).out_session = local;
    ResultCode::Success
}

unsafe fn destroy_session(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<SessionOnlyArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    // Session lock before connection context, matching the end-frame
    // merge path.
    let _guard = shared.session_guard();
    let mut ctx = conn.ctx.lock();
    for (_, entry) in ctx.swapchains.drain() {
        entry.bridge.force_release_all();
        let _ = shared.runtime.destroy_swapchain(entry.real);
    }
    for (_, real) in ctx.spaces.drain() {
        let _ = shared.runtime.destroy_space(real);
    }
    for (_, real) in ctx.actions.drain() {
        let _ = shared.runtime.destroy_action(real);
    }
    for (_, real) in ctx.action_sets.drain() {
        let _ = shared.runtime.destroy_action_set(real);
    }
    ctx.layers.clear();
    ctx.deferred_destroy.clear();
    ctx.events.clear();
    ctx.session_local = 0;
    ResultCode::Success
}

unsafe fn begin_session(conn: &Arc<Connection>, arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<BeginSessionArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    if ViewConfigurationKind::from_i32((*args).view_configuration).is_none() {
        return ResultCode::ValidationFailure;
    }
    let mut ctx = conn.ctx.lock();
    if ctx.tracker.running {
        return ResultCode::SessionRunning;
    }
    ctx.tracker.apply_command(super::arbiter::SessionCommand::Begin);
    ResultCode::Success
}

unsafe fn end_session(conn: &Arc<Connection>, arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<SessionOnlyArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let mut ctx = conn.ctx.lock();
    if !ctx.tracker.running {
        return ResultCode::SessionNotRunning;
    }
    ctx.tracker.apply_command(super::arbiter::SessionCommand::End);
    ctx.layers.clear();
    ResultCode::Success
}

unsafe fn request_exit(conn: &Arc<Connection>, arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<SessionOnlyArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    conn.ctx
        .lock()
        .tracker
        .apply_command(super::arbiter::SessionCommand::RequestExit);
    ResultCode::Success
}

// ---------------------------------------------------------------------------
// Swapchains
// ---------------------------------------------------------------------------

unsafe fn enumerate_formats(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<EnumerateFormatsArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let _guard = shared.session_guard();
    let (code, formats) = code_of(collect(|out| {
        shared.runtime.enumerate_swapchain_formats(session, out)
    }));
    match formats {
        Some(formats) => write_array_out(
            (*args).capacity,
            std::ptr::addr_of_mut!((*args).count_out),
            (*args).formats,
            &formats,
        ),
        None => code,
    }
}

fn validate_swapchain_info(info: &SwapchainCreateInfo) -> Result<(), ResultCode> {
    let allowed = SwapchainUsageFlags::COLOR_ATTACHMENT | SwapchainUsageFlags::SAMPLED;
    if info.sample_count != 1
        || info.mip_count != 1
        || info.array_size != 1
        || info.face_count != 1
        || !allowed.contains(info.usage)
    {
        return Err(ResultCode::FeatureUnsupported);
    }
    Ok(())
}

unsafe fn create_swapchain(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<CreateSwapchainArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let info = (*args).info.to_api();
    if let Err(code) = validate_swapchain_info(&info) {
        return code;
    }

    let _guard = shared.session_guard();
    let real = match shared.runtime.create_swapchain(session, &info) {
        Ok(r) => r,
        Err(e) => return e.code(),
    };
    let image_ids = match collect(|out: &mut [SwapchainImage]| {
        shared.runtime.enumerate_swapchain_images(real, out)
    }) {
        Ok(images) => images.iter().map(|i| i.image_id).collect::<Vec<_>>(),
        Err(e) => {
            let _ = shared.runtime.destroy_swapchain(real);
            return e.code();
        }
    };
    let bridge = match SwapchainBridge::new(shared.device.clone(), real, &image_ids) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            warn!(error = %e, "could not open runtime swapchain images");
            let _ = shared.runtime.destroy_swapchain(real);
            return ResultCode::RuntimeFailure;
        }
    };

    let local = shared.ids.allocate();
    conn.ctx.lock().swapchains.insert(
        local,
        SwapchainEntry {
            real,
            info,
            bridge: bridge.clone(),
        },
    );
    (*args).out_swapchain = local;
    (*args).out_image_count = bridge.image_count();
    ResultCode::Success
}

unsafe fn destroy_swapchain(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<SwapchainOnlyArgs>(arena);
    let mut ctx = conn.ctx.lock();
    let Some(entry) = ctx.swapchains.remove(&(*args).swapchain) else {
        return ResultCode::HandleInvalid;
    };
    // The bridge lets go of shared textures right away so the overlay
    // may free them after this response.
    entry.bridge.force_release_all();

    let referenced = ctx
        .layers
        .iter()
        .any(|layer| layer.swapchains().contains(&entry.real));
    if referenced {
        debug!(swapchain = entry.real.as_raw(), "deferring swapchain destroy until next end-frame");
        ctx.deferred_destroy.push(((*args).swapchain, entry.real));
        return ResultCode::Success;
    }
    drop(ctx);

    let _guard = shared.session_guard();
    match shared.runtime.destroy_swapchain(entry.real) {
        Ok(()) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

unsafe fn enumerate_images(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<EnumerateImagesArgs>(arena);
    let real = {
        let ctx = conn.ctx.lock();
        match ctx.swapchains.get(&(*args).swapchain) {
            Some(entry) => entry.real,
            None => return ResultCode::HandleInvalid,
        }
    };
    let _guard = shared.session_guard();
    let (code, images) = code_of(collect(|out: &mut [SwapchainImage]| {
        shared.runtime.enumerate_swapchain_images(real, out)
    }));
    match images {
        Some(images) => {
            let ids: Vec<u64> = images.iter().map(|i| i.image_id).collect();
            write_array_out(
                (*args).capacity,
                std::ptr::addr_of_mut!((*args).count_out),
                (*args).image_ids,
                &ids,
            )
        }
        None => code,
    }
}

unsafe fn acquire_image(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<AcquireImageArgs>(arena);
    let real = {
        let ctx = conn.ctx.lock();
        match ctx.swapchains.get(&(*args).swapchain) {
            Some(entry) => entry.real,
            None => return ResultCode::HandleInvalid,
        }
    };
    let _guard = shared.session_guard();
    let (code, index) = code_of(shared.runtime.acquire_swapchain_image(real));
    if let Some(index) = index {
        (*args).out_index = index;
    }
    code
}

unsafe fn wait_image(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<WaitImageArgs>(arena);
    let (real, bridge, info) = {
        let ctx = conn.ctx.lock();
        match ctx.swapchains.get(&(*args).swapchain) {
            Some(entry) => (entry.real, entry.bridge.clone(), entry.info),
            None => return ResultCode::HandleInvalid,
        }
    };
    let share: ShareHandle = (*args).share.to_api();
    if share.width != info.width || share.height != info.height || share.format != info.format {
        return ResultCode::SwapchainFormatUnsupported;
    }
    if bridge.on_wait(&share).is_err() {
        return ResultCode::RuntimeFailure;
    }
    let _guard = shared.session_guard();
    match shared.runtime.wait_swapchain_image(real, (*args).timeout_ns) {
        Ok(()) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

unsafe fn release_image(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<ReleaseImageArgs>(arena);
    let (real, bridge) = {
        let ctx = conn.ctx.lock();
        match ctx.swapchains.get(&(*args).swapchain) {
            Some(entry) => (entry.real, entry.bridge.clone()),
            None => return ResultCode::HandleInvalid,
        }
    };
    let share: ShareHandle = (*args).share.to_api();
    if let Err(e) = bridge.on_release(&share, (*args).index, COPY_ACQUIRE_BOUND) {
        warn!(error = %e, "release-time texture copy failed");
        return ResultCode::RuntimeFailure;
    }
    let _guard = shared.session_guard();
    match shared.runtime.release_swapchain_image(real) {
        Ok(()) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

// ---------------------------------------------------------------------------
// Spaces
// ---------------------------------------------------------------------------

unsafe fn create_reference_space(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<CreateReferenceSpaceArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let Some(kind) = ReferenceSpaceKind::from_i32((*args).kind) else {
        return ResultCode::ValidationFailure;
    };
    let _guard = shared.session_guard();
    let (code, space) = code_of(shared.runtime.create_reference_space(
        session,
        &ReferenceSpaceCreateInfo {
            kind,
            pose_in_reference_space: (*args).pose,
        },
    ));
    if let Some(space) = space {
        let local = shared.ids.allocate();
        conn.ctx.lock().spaces.insert(local, space);
        (*args).out_space = local;
    }
    code
}

unsafe fn create_action_space(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<CreateActionSpaceArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let action = {
        let ctx = conn.ctx.lock();
        match ctx.actions.get(&(*args).action) {
            Some(real) => *real,
            None => return ResultCode::HandleInvalid,
        }
    };
    let subaction = {
        let s = read_inline(&(*args).subaction, (*args).subaction_len);
        (!s.is_empty()).then_some(s)
    };
    let _guard = shared.session_guard();
    let (code, space) = code_of(shared.runtime.create_action_space(
        session,
        &ActionSpaceCreateInfo {
            action,
            subaction_path: subaction,
            pose_in_action_space: (*args).pose,
        },
    ));
    if let Some(space) = space {
        let local = shared.ids.allocate();
        conn.ctx.lock().spaces.insert(local, space);
        (*args).out_space = local;
    }
    code
}

unsafe fn locate_space(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<LocateSpaceArgs>(arena);
    let (space, base) = {
        let ctx = conn.ctx.lock();
        let space = ctx.spaces.get(&(*args).space).copied();
        let base = ctx.spaces.get(&(*args).base).copied();
        match (space, base) {
            (Some(s), Some(b)) => (s, b),
            _ => return ResultCode::HandleInvalid,
        }
    };
    let (code, location) = code_of(shared.runtime.locate_space(space, base, (*args).time));
    if let Some(location) = location {
        (*args).out_flags = location.flags.bits();
        (*args).out_pose = location.pose;
    }
    code
}

unsafe fn destroy_space(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<SpaceOnlyArgs>(arena);
    let Some(real) = conn.ctx.lock().spaces.remove(&(*args).space) else {
        return ResultCode::HandleInvalid;
    };
    let _guard = shared.session_guard();
    match shared.runtime.destroy_space(real) {
        Ok(()) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

unsafe fn enumerate_reference_spaces(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<EnumerateReferenceSpacesArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let (code, kinds) = code_of((|| {
        let n = shared.runtime.enumerate_reference_spaces(session, &mut [])? as usize;
        let mut staging = vec![ReferenceSpaceKind::View; n];
        let m = shared
            .runtime
            .enumerate_reference_spaces(session, &mut staging)? as usize;
        staging.truncate(m);
        Ok(staging.iter().map(|k| *k as i32).collect::<Vec<i32>>())
    })());
    match kinds {
        Some(kinds) => write_array_out(
            (*args).capacity,
            std::ptr::addr_of_mut!((*args).count_out),
            (*args).kinds,
            &kinds,
        ),
        None => code,
    }
}

unsafe fn reference_space_bounds(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<GetReferenceSpaceBoundsRectArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let Some(kind) = ReferenceSpaceKind::from_i32((*args).kind) else {
        return ResultCode::ValidationFailure;
    };
    let (code, bounds) = code_of(shared.runtime.get_reference_space_bounds_rect(session, kind));
    if let Some((has_bounds, extent)) = bounds {
        (*args).out_has_bounds = has_bounds as u32;
        (*args).out_bounds = extent;
    }
    code
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

unsafe fn enumerate_view_configurations(
    shared: &Arc<HostShared>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<EnumerateViewConfigurationsArgs>(arena);
    let system = SystemId((*args).system);
    let (code, kinds) = code_of((|| {
        let n = shared.runtime.enumerate_view_configurations(system, &mut [])? as usize;
        let mut staging = vec![ViewConfigurationKind::Mono; n];
        let m = shared
            .runtime
            .enumerate_view_configurations(system, &mut staging)? as usize;
        staging.truncate(m);
        Ok(staging.iter().map(|k| *k as i32).collect::<Vec<i32>>())
    })());
    match kinds {
        Some(kinds) => write_array_out(
            (*args).capacity,
            std::ptr::addr_of_mut!((*args).count_out),
            (*args).kinds,
            &kinds,
        ),
        None => code,
    }
}

unsafe fn enumerate_view_configuration_views(
    shared: &Arc<HostShared>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<EnumerateViewConfigurationViewsArgs>(arena);
    let system = SystemId((*args).system);
    let Some(kind) = ViewConfigurationKind::from_i32((*args).kind) else {
        return ResultCode::ValidationFailure;
    };
    let (code, views) = code_of(collect(|out| {
        shared
            .runtime
            .enumerate_view_configuration_views(system, kind, out)
    }));
    match views {
        Some(views) => write_array_out(
            (*args).capacity,
            std::ptr::addr_of_mut!((*args).count_out),
            (*args).views,
            &views,
        ),
        None => code,
    }
}

unsafe fn get_view_configuration_properties(
    shared: &Arc<HostShared>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<GetViewConfigurationPropertiesArgs>(arena);
    let Some(kind) = ViewConfigurationKind::from_i32((*args).kind) else {
        return ResultCode::ValidationFailure;
    };
    let (code, props) = code_of(
        shared
            .runtime
            .get_view_configuration_properties(SystemId((*args).system), kind),
    );
    if let Some(props) = props {
        (*args).out_fov_mutable = props.fov_mutable as u32;
    }
    code
}

unsafe fn get_system_properties(shared: &Arc<HostShared>, arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<GetSystemPropertiesArgs>(arena);
    let _coarse = shared.coarse_guard();
    let (code, props) = code_of(shared.runtime.get_system_properties(SystemId((*args).system)));
    if let Some(props) = props {
        (*args).out_vendor_id = props.vendor_id;
        (*args).out_name_len = copy_inline(&mut (*args).out_name, &props.system_name);
        (*args).out_max_swapchain_width = props.max_swapchain_width;
        (*args).out_max_swapchain_height = props.max_swapchain_height;
        // The overlay reservation is invisible to callers on either
        // side: the budget is subtracted before the value leaves the
        // layer.
        (*args).out_max_layer_count = props
            .max_layer_count
            .saturating_sub(shared.config.overlay_layer_budget);
        (*args).out_orientation_tracking = props.orientation_tracking as u32;
        (*args).out_position_tracking = props.position_tracking as u32;
    }
    code
}

unsafe fn get_instance_properties(shared: &Arc<HostShared>, arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<GetInstancePropertiesArgs>(arena);
    let _coarse = shared.coarse_guard();
    let (code, props) = code_of(shared.runtime.get_instance_properties());
    if let Some(props) = props {
        (*args).out_name_len = copy_inline(&mut (*args).out_name, &props.runtime_name);
        (*args).out_version = props.runtime_version;
    }
    code
}

// ---------------------------------------------------------------------------
// Events and frames
// ---------------------------------------------------------------------------

unsafe fn poll_event(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<PollEventArgs>(arena);
    let main_state = shared.main_state();
    let now = shared.frame.current().predicted_display_time;

    let mut ctx = conn.ctx.lock();
    let local = ctx.session_local;
    let event = match ctx.events.pop() {
        Some(ev) => {
            // Session-scoped events leave here wearing the overlay's own
            // session handle.
            if ev.session().is_some() && local != 0 {
                Some(ev.with_session(SessionHandle::from_raw(local)))
            } else {
                Some(ev)
            }
        }
        None => {
            if local != 0 {
                ctx.tracker
                    .pending_state_change(main_state)
                    .map(|state| EventData::SessionStateChanged {
                        session: SessionHandle::from_raw(local),
                        state,
                        time: now,
                    })
            } else {
                None
            }
        }
    };
    drop(ctx);

    match event {
        Some(ev) => {
            (*args).out_has_event = 1;
            (*args).out_event = WireEvent::from_api(&ev);
        }
        None => (*args).out_has_event = 0,
    }
    ResultCode::Success
}

unsafe fn wait_frame(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<WaitFrameArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let (last_seq, relaxed) = {
        let ctx = conn.ctx.lock();
        if ctx.tracker.loss == super::arbiter::LossState::Lost {
            return ResultCode::SessionLost;
        }
        if !ctx.tracker.running {
            return ResultCode::SessionNotRunning;
        }
        (ctx.last_frame_seq, ctx.relaxed)
    };

    // Gate on the main's wait-frame, observing peer death each tick.
    // The connection context must not stay locked here: the main
    // thread's end-frame merge needs it.
    let tick = shared.config.poll_tick;
    let (seq, mut state) = loop {
        if let Some(r) = shared.frame.wait_newer(last_seq, relaxed, tick) {
            break r;
        }
        if !conn.channel.peer().is_alive()
            || conn.closed.load(std::sync::atomic::Ordering::Acquire)
        {
            return ResultCode::RuntimeFailure;
        }
        if shared.main_session().is_none() {
            return ResultCode::SessionLost;
        }
    };

    let mut ctx = conn.ctx.lock();
    if state.predicted_display_time <= ctx.last_frame_time {
        // Same frame handed again (relaxed overlays): nudge the
        // prediction so successive results never go backwards.
        state.predicted_display_time = ctx.last_frame_time + 1;
    }
    ctx.last_frame_seq = seq;
    ctx.last_frame_time = state.predicted_display_time;
    drop(ctx);

    (*args).out_predicted_display_time = state.predicted_display_time;
    (*args).out_predicted_display_period = state.predicted_display_period;
    (*args).out_should_render = state.should_render as u32;
    ResultCode::Success
}

unsafe fn begin_frame(conn: &Arc<Connection>, arena: &mut Arena) -> ResultCode {
    let args = args_ptr::<SessionOnlyArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    if !conn.ctx.lock().tracker.running {
        return ResultCode::SessionNotRunning;
    }
    // Nothing is forwarded: the main session's begin-frame covers the
    // real session.
    ResultCode::Success
}

unsafe fn end_frame(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let Some((session, info)) = marshal::read_end_frame(arena) else {
        // A malformed or non-quad/projection layer rejects the whole
        // submission and clears the cache.
        conn.ctx.lock().layers.clear();
        return ResultCode::LayerInvalid;
    };
    if let Err(code) = check_session(conn, session) {
        return code;
    }

    let mut ctx = conn.ctx.lock();
    if !ctx.tracker.running {
        return ResultCode::SessionNotRunning;
    }
    if info.layers.len() > shared.config.max_overlay_layers {
        ctx.layers.clear();
        return ResultCode::LimitReached;
    }

    // Swap the overlay's local handles for real ones before caching, so
    // the merge path hands the runtime ready-to-use layers.
    let mut translated = Vec::with_capacity(info.layers.len());
    for layer in &info.layers {
        match translate_layer(&ctx, layer) {
            Some(l) => translated.push(l),
            None => {
                ctx.layers.clear();
                return ResultCode::HandleInvalid;
            }
        }
    }
    ctx.layers = translated;
    ResultCode::Success
}

fn translate_layer(ctx: &super::OverlayCtx, layer: &CompositionLayer) -> Option<CompositionLayer> {
    let space_of = |local: SpaceHandle| ctx.spaces.get(&local.as_raw()).copied();
    let swapchain_of = |local: SwapchainHandle| {
        ctx.swapchains
            .get(&local.as_raw())
            .map(|entry| entry.real)
    };
    Some(match layer {
        CompositionLayer::Projection(p) => {
            let mut views = Vec::with_capacity(p.views.len());
            for view in &p.views {
                let mut v = view.clone();
                v.sub_image.swapchain = swapchain_of(view.sub_image.swapchain)?;
                if let Some(depth) = &mut v.depth {
                    depth.sub_image.swapchain = swapchain_of(depth.sub_image.swapchain)?;
                }
                views.push(v);
            }
            CompositionLayer::Projection(CompositionLayerProjection {
                flags: p.flags,
                space: space_of(p.space)?,
                views,
            })
        }
        CompositionLayer::Quad(q) => {
            let mut quad = q.clone();
            quad.space = space_of(q.space)?;
            quad.sub_image.swapchain = swapchain_of(q.sub_image.swapchain)?;
            CompositionLayer::Quad(quad)
        }
    })
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

unsafe fn sync_actions(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<SyncActionsArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };

    let set_locals = read_array((*args).sets as *const u64, (*args).set_count);
    let sets = {
        let ctx = conn.ctx.lock();
        let mut sets = Vec::with_capacity(set_locals.len());
        for local in set_locals {
            match ctx.action_sets.get(&local) {
                Some(real) => sets.push(*real),
                None => return ResultCode::HandleInvalid,
            }
        }
        sets
    };

    let _guard = shared.session_guard();
    if let Err(e) = shared.runtime.sync_actions(
        session,
        &ActionsSyncInfo {
            active_action_sets: sets,
        },
    ) {
        return e.code();
    }

    let count = (*args).query_count as usize;
    if count > 0 && (*args).queries.is_null() {
        return ResultCode::ValidationFailure;
    }
    for i in 0..count {
        let query = (*args).queries.add(i);
        let action = {
            let ctx = conn.ctx.lock();
            match ctx.actions.get(&(*query).action) {
                Some(real) => *real,
                None => return ResultCode::HandleInvalid,
            }
        };
        let subaction = {
            let s = read_inline(&(*query).subaction, (*query).subaction_len);
            (!s.is_empty()).then_some(s)
        };
        match shared.runtime.get_action_state(
            session,
            &ActionStateGetInfo {
                action,
                subaction_path: subaction,
            },
        ) {
            Ok(state) => (*query).out_state = WireActionState::from_api(&state),
            Err(e) => return e.code(),
        }
    }
    ResultCode::Success
}

unsafe fn haptic(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<HapticArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let action = {
        let ctx = conn.ctx.lock();
        match ctx.actions.get(&(*args).action) {
            Some(real) => *real,
            None => return ResultCode::HandleInvalid,
        }
    };
    let subaction = {
        let s = read_inline(&(*args).subaction, (*args).subaction_len);
        (!s.is_empty()).then_some(s)
    };
    let info = HapticActionInfo {
        action,
        subaction_path: subaction,
    };
    let _guard = shared.session_guard();
    let result = if (*args).has_vibration != 0 {
        shared.runtime.apply_haptic_feedback(
            session,
            &info,
            &HapticVibration {
                duration: (*args).duration,
                frequency: (*args).frequency,
                amplitude: (*args).amplitude,
            },
        )
    } else {
        shared.runtime.stop_haptic_feedback(session, &info)
    };
    match result {
        Ok(()) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

unsafe fn locate_views(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<LocateViewsArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let space = {
        let ctx = conn.ctx.lock();
        match ctx.spaces.get(&(*args).space) {
            Some(real) => *real,
            None => return ResultCode::HandleInvalid,
        }
    };
    let Some(view_configuration) = ViewConfigurationKind::from_i32((*args).view_configuration)
    else {
        return ResultCode::ValidationFailure;
    };
    let info = ViewLocateInfo {
        view_configuration,
        display_time: (*args).display_time,
        space,
    };

    let mut state_flags = ViewStateFlags::empty();
    let (code, views) = code_of(collect(|out| {
        let (state, n) = shared.runtime.locate_views(session, &info, out)?;
        state_flags = state.flags;
        Ok(n)
    }));
    match views {
        Some(views) => {
            (*args).out_state_flags = state_flags.bits();
            write_array_out(
                (*args).capacity,
                std::ptr::addr_of_mut!((*args).count_out),
                (*args).views,
                &views,
            )
        }
        None => code,
    }
}

unsafe fn input_source_name(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<GetInputSourceLocalizedNameArgs>(arena);
    if let Err(code) = check_session(conn, (*args).session) {
        return code;
    }
    let session = match real_session(shared) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let path_bytes = read_array((*args).path as *const u8, (*args).path_len);
    let info = InputSourceLocalizedNameGetInfo {
        source_path: String::from_utf8_lossy(&path_bytes).into_owned(),
        components: (*args).components,
    };
    let (code, name) = code_of(collect(|out| {
        shared
            .runtime
            .get_input_source_localized_name(session, &info, out)
    }));
    match name {
        Some(name) => write_array_out(
            (*args).capacity,
            std::ptr::addr_of_mut!((*args).count_out),
            (*args).buffer,
            &name,
        ),
        None => code,
    }
}

unsafe fn create_action_set(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<CreateActionSetArgs>(arena);
    let info = ActionSetCreateInfo {
        name: read_inline(&(*args).name, (*args).name_len),
        localized_name: read_inline(&(*args).localized, (*args).localized_len),
        priority: (*args).priority,
    };
    let (code, real) = code_of(shared.runtime.create_action_set(&info));
    if let Some(real) = real {
        let local = shared.ids.allocate();
        conn.ctx.lock().action_sets.insert(local, real);
        (*args).out_action_set = local;
    }
    code
}

unsafe fn destroy_action_set(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<ActionSetOnlyArgs>(arena);
    let Some(real) = conn.ctx.lock().action_sets.remove(&(*args).action_set) else {
        return ResultCode::HandleInvalid;
    };
    match shared.runtime.destroy_action_set(real) {
        Ok(()) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

unsafe fn create_action(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<CreateActionArgs>(arena);
    let Some(kind) = ActionKind::from_i32((*args).kind) else {
        return ResultCode::ValidationFailure;
    };
    let set = {
        let ctx = conn.ctx.lock();
        match ctx.action_sets.get(&(*args).action_set) {
            Some(real) => *real,
            None => return ResultCode::HandleInvalid,
        }
    };
    let info = ActionCreateInfo {
        name: read_inline(&(*args).name, (*args).name_len),
        kind,
        localized_name: read_inline(&(*args).localized, (*args).localized_len),
    };
    let (code, real) = code_of(shared.runtime.create_action(set, &info));
    if let Some(real) = real {
        let local = shared.ids.allocate();
        conn.ctx.lock().actions.insert(local, real);
        (*args).out_action = local;
    }
    code
}

unsafe fn destroy_action(
    shared: &Arc<HostShared>,
    conn: &Arc<Connection>,
    arena: &mut Arena,
) -> ResultCode {
    let args = args_ptr::<ActionOnlyArgs>(arena);
    let Some(real) = conn.ctx.lock().actions.remove(&(*args).action) else {
        return ResultCode::HandleInvalid;
    };
    match shared.runtime.destroy_action(real) {
        Ok(()) => ResultCode::Success,
        Err(e) => e.code(),
    }
}
