//! The compositor runtime seam.
//!
//! [`CompositorRuntime`] is the full API surface of the underlying VR
//! compositor, one method per opcode family. Three things implement it:
//! the real runtime binding supplied by the embedder, the main-side
//! layer ([`host::MainLayer`](crate::host::MainLayer), which wraps a
//! runtime and interposes), and the overlay-side proxy
//! ([`overlay::OverlayRuntime`](crate::overlay::OverlayRuntime), which
//! forwards every call over RPC). Application code is written against
//! the trait and cannot tell the three apart.
//!
//! Enumeration methods follow the two-call capacity idiom: an empty
//! output slice asks for the required count, a large-enough slice gets
//! filled, and a too-small non-empty slice fails with
//! `SizeInsufficient`.

use crate::api::*;
use crate::error::ApiResult;
use crate::types::{
    ActionHandle, ActionSetHandle, DisplayTime, SessionHandle, SpaceHandle, SwapchainHandle,
    SystemId,
};

pub trait CompositorRuntime: Send + Sync {
    // ---- instance and system ----
    fn get_instance_properties(&self) -> ApiResult<InstanceProperties>;
    fn get_system(&self) -> ApiResult<SystemId>;
    fn get_system_properties(&self, system: SystemId) -> ApiResult<SystemProperties>;
    fn enumerate_view_configurations(
        &self,
        system: SystemId,
        out: &mut [ViewConfigurationKind],
    ) -> ApiResult<u32>;
    fn get_view_configuration_properties(
        &self,
        system: SystemId,
        kind: ViewConfigurationKind,
    ) -> ApiResult<ViewConfigurationProperties>;
    fn enumerate_view_configuration_views(
        &self,
        system: SystemId,
        kind: ViewConfigurationKind,
        out: &mut [ViewConfigurationView],
    ) -> ApiResult<u32>;
    fn poll_event(&self) -> ApiResult<Option<EventData>>;

    // ---- session lifecycle ----
    fn create_session(&self, info: &SessionCreateInfo) -> ApiResult<SessionHandle>;
    fn destroy_session(&self, session: SessionHandle) -> ApiResult<()>;
    fn begin_session(&self, session: SessionHandle, info: &SessionBeginInfo) -> ApiResult<()>;
    fn end_session(&self, session: SessionHandle) -> ApiResult<()>;
    fn request_exit_session(&self, session: SessionHandle) -> ApiResult<()>;

    // ---- spaces ----
    fn enumerate_reference_spaces(
        &self,
        session: SessionHandle,
        out: &mut [ReferenceSpaceKind],
    ) -> ApiResult<u32>;
    fn create_reference_space(
        &self,
        session: SessionHandle,
        info: &ReferenceSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle>;
    fn get_reference_space_bounds_rect(
        &self,
        session: SessionHandle,
        kind: ReferenceSpaceKind,
    ) -> ApiResult<(bool, Extent2Df)>;
    fn create_action_space(
        &self,
        session: SessionHandle,
        info: &ActionSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle>;
    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        time: DisplayTime,
    ) -> ApiResult<SpaceLocation>;
    fn destroy_space(&self, space: SpaceHandle) -> ApiResult<()>;

    // ---- swapchains ----
    fn enumerate_swapchain_formats(
        &self,
        session: SessionHandle,
        out: &mut [i64],
    ) -> ApiResult<u32>;
    fn create_swapchain(
        &self,
        session: SessionHandle,
        info: &SwapchainCreateInfo,
    ) -> ApiResult<SwapchainHandle>;
    fn destroy_swapchain(&self, swapchain: SwapchainHandle) -> ApiResult<()>;
    fn enumerate_swapchain_images(
        &self,
        swapchain: SwapchainHandle,
        out: &mut [SwapchainImage],
    ) -> ApiResult<u32>;
    fn acquire_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<u32>;
    fn wait_swapchain_image(&self, swapchain: SwapchainHandle, timeout_ns: i64) -> ApiResult<()>;
    fn release_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<()>;

    // ---- frame loop ----
    fn wait_frame(&self, session: SessionHandle) -> ApiResult<FrameState>;
    fn begin_frame(&self, session: SessionHandle) -> ApiResult<()>;
    fn end_frame(&self, session: SessionHandle, info: &FrameEndInfo) -> ApiResult<()>;
    fn locate_views(
        &self,
        session: SessionHandle,
        info: &ViewLocateInfo,
        out: &mut [View],
    ) -> ApiResult<(ViewState, u32)>;

    // ---- input ----
    fn create_action_set(&self, info: &ActionSetCreateInfo) -> ApiResult<ActionSetHandle>;
    fn destroy_action_set(&self, action_set: ActionSetHandle) -> ApiResult<()>;
    fn create_action(
        &self,
        action_set: ActionSetHandle,
        info: &ActionCreateInfo,
    ) -> ApiResult<ActionHandle>;
    fn destroy_action(&self, action: ActionHandle) -> ApiResult<()>;
    fn sync_actions(&self, session: SessionHandle, info: &ActionsSyncInfo) -> ApiResult<()>;
    fn get_action_state(
        &self,
        session: SessionHandle,
        info: &ActionStateGetInfo,
    ) -> ApiResult<ActionState>;
    fn apply_haptic_feedback(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
        vibration: &HapticVibration,
    ) -> ApiResult<()>;
    fn stop_haptic_feedback(&self, session: SessionHandle, info: &HapticActionInfo)
        -> ApiResult<()>;
    fn get_input_source_localized_name(
        &self,
        session: SessionHandle,
        info: &InputSourceLocalizedNameGetInfo,
        out: &mut [u8],
    ) -> ApiResult<u32>;
}

/// Shared helper for the two-call capacity idiom: `required` items are
/// available, `fill` writes them. An empty `out` only reports the count.
pub fn write_capacity<T: Copy>(
    out: &mut [T],
    required: &[T],
) -> ApiResult<u32> {
    use crate::error::{CallError, ResultCode};
    if out.is_empty() {
        return Ok(required.len() as u32);
    }
    if out.len() < required.len() {
        return Err(CallError(ResultCode::SizeInsufficient));
    }
    out[..required.len()].copy_from_slice(required);
    Ok(required.len() as u32)
}
