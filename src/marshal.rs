//! Per-opcode argument structs and marshalling helpers.
//!
//! Every RPC places one `#[repr(C)]` args struct at the start of the
//! arena's bump region; buffers it references follow it, each reachable
//! through a pointer field recorded in the fixup table. Scalar outputs
//! are plain fields the host writes in place; output arrays are
//! caller-allocated (capacity + count + pointer), so the host never
//! allocates into an arena it received.
//!
//! Strings with protocol-bounded lengths (action names, subaction paths)
//! travel inline as fixed arrays, like the API's own name fields;
//! unbounded ones travel as registered pointer + length.

use crate::api::*;
use crate::arena::Arena;
use crate::error::{ArenaError, ResultCode};
use crate::negotiate::HandshakePayload;
use crate::types::SessionHandle;

pub const INLINE_PATH_LEN: usize = 64;
pub const INLINE_NAME_LEN: usize = 64;
pub const INLINE_TEXT_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// View the args struct of the current request.
///
/// # Safety
/// The arena must carry a request of the opcode whose args type is `T`,
/// already absolutized on this side.
pub unsafe fn args_ptr<T>(arena: &Arena) -> *mut T {
    arena.args_ptr() as *mut T
}

/// Allocate the args struct. Must be the first allocation after
/// `begin_request` so the peer finds it at the bump start.
pub fn alloc_args<T: Copy>(arena: &mut Arena, value: T) -> Result<*mut T, ArenaError> {
    debug_assert_eq!(arena.remaining(), arena.size() - crate::arena::BUMP_OFFSET);
    arena.alloc_value(value)
}

/// Store `value` into a pointer field and record it for fixup when
/// non-null.
///
/// # Safety
/// `field` must point into the arena (normally a field of the args
/// struct or of an arena-resident array element).
pub unsafe fn set_ptr_field<T>(
    arena: &mut Arena,
    field: *mut *mut T,
    value: *mut T,
) -> Result<(), ArenaError> {
    field.write(value);
    if !value.is_null() {
        arena.register_pointer(field as *mut *mut u8)?;
    }
    Ok(())
}

/// Copy a string into an inline fixed-size field, truncating.
pub fn copy_inline(dst: &mut [u8], s: &str) -> u32 {
    let n = s.len().min(dst.len());
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
    n as u32
}

/// Read back an inline fixed-size string field.
pub fn read_inline(src: &[u8], len: u32) -> String {
    let n = (len as usize).min(src.len());
    String::from_utf8_lossy(&src[..n]).into_owned()
}

/// The host side of the capacity/count idiom: the count is written
/// unconditionally, the array only up to the minimum of capacity and
/// produced count.
///
/// # Safety
/// `count_out` must be a valid field; `dst` must be null or point at
/// `capacity` elements inside the arena.
pub unsafe fn write_array_out<T: Copy>(
    capacity: u32,
    count_out: *mut u32,
    dst: *mut T,
    items: &[T],
) -> ResultCode {
    count_out.write(items.len() as u32);
    if capacity == 0 {
        return ResultCode::Success;
    }
    if (capacity as usize) < items.len() {
        return ResultCode::SizeInsufficient;
    }
    if !dst.is_null() && !items.is_empty() {
        std::ptr::copy_nonoverlapping(items.as_ptr(), dst, items.len());
    }
    ResultCode::Success
}

/// Read back an output array after a successful (or size-reporting)
/// call.
///
/// # Safety
/// `src` must be null or point at least `len` elements inside the arena.
pub unsafe fn read_array<T: Copy>(src: *const T, len: u32) -> Vec<T> {
    if src.is_null() || len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(src, len as usize).to_vec()
}

pub fn encode_handshake(payload: &HandshakePayload) -> Result<Vec<u8>, ResultCode> {
    postcard::to_allocvec(payload).map_err(|_| ResultCode::RuntimeFailure)
}

pub fn decode_handshake(bytes: &[u8]) -> Result<HandshakePayload, ResultCode> {
    postcard::from_bytes(bytes).map_err(|_| ResultCode::RuntimeFailure)
}

// ---------------------------------------------------------------------------
// Wire mirrors of owned types
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireSwapchainCreateInfo {
    pub usage: u64,
    pub format: i64,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
}

impl WireSwapchainCreateInfo {
    pub fn from_api(info: &SwapchainCreateInfo) -> Self {
        WireSwapchainCreateInfo {
            usage: info.usage.bits(),
            format: info.format,
            sample_count: info.sample_count,
            width: info.width,
            height: info.height,
            face_count: info.face_count,
            array_size: info.array_size,
            mip_count: info.mip_count,
        }
    }

    pub fn to_api(&self) -> SwapchainCreateInfo {
        SwapchainCreateInfo {
            usage: SwapchainUsageFlags::from_bits_truncate(self.usage),
            format: self.format,
            sample_count: self.sample_count,
            width: self.width,
            height: self.height,
            face_count: self.face_count,
            array_size: self.array_size,
            mip_count: self.mip_count,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireShareHandle {
    pub token: [u8; INLINE_TEXT_LEN],
    pub token_len: u32,
    pub width: u32,
    pub height: u32,
    pub _reserved: u32,
    pub format: i64,
}

impl WireShareHandle {
    pub fn from_api(handle: &crate::graphics::ShareHandle) -> Self {
        let mut token = [0u8; INLINE_TEXT_LEN];
        let token_len = copy_inline(&mut token, &handle.token);
        WireShareHandle {
            token,
            token_len,
            width: handle.width,
            height: handle.height,
            _reserved: 0,
            format: handle.format,
        }
    }

    pub fn to_api(&self) -> crate::graphics::ShareHandle {
        crate::graphics::ShareHandle {
            token: read_inline(&self.token, self.token_len),
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireActionState {
    pub kind: i32,
    pub active: u32,
    pub changed: u32,
    pub bool_value: u32,
    pub float_value: f32,
    pub vec2_value: [f32; 2],
    pub last_change_time: i64,
}

impl WireActionState {
    pub fn from_api(state: &ActionState) -> Self {
        WireActionState {
            kind: state.kind,
            active: state.active as u32,
            changed: state.changed_since_last_sync as u32,
            bool_value: state.boolean_value as u32,
            float_value: state.float_value,
            vec2_value: state.vector2_value,
            last_change_time: state.last_change_time,
        }
    }

    pub fn to_api(&self) -> ActionState {
        ActionState {
            kind: self.kind,
            active: self.active != 0,
            changed_since_last_sync: self.changed != 0,
            boolean_value: self.bool_value != 0,
            float_value: self.float_value,
            vector2_value: self.vec2_value,
            last_change_time: self.last_change_time,
        }
    }
}

/// Flat wire record for one event; `kind` selects which fields matter.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireEvent {
    pub kind: i32,
    pub state: i32,
    pub session: u64,
    pub time: i64,
    pub space_kind: i32,
    pub count: u32,
}

const EVENT_SESSION_STATE: i32 = 1;
const EVENT_SESSION_LOSS_PENDING: i32 = 2;
const EVENT_INSTANCE_LOSS_PENDING: i32 = 3;
const EVENT_REFERENCE_SPACE_CHANGE: i32 = 4;
const EVENT_EVENTS_LOST: i32 = 5;

impl WireEvent {
    pub fn from_api(event: &EventData) -> Self {
        let mut wire = WireEvent {
            kind: 0,
            state: 0,
            session: 0,
            time: 0,
            space_kind: 0,
            count: 0,
        };
        match *event {
            EventData::SessionStateChanged {
                session,
                state,
                time,
            } => {
                wire.kind = EVENT_SESSION_STATE;
                wire.session = session.as_raw();
                wire.state = state as i32;
                wire.time = time;
            }
            EventData::SessionLossPending { session, loss_time } => {
                wire.kind = EVENT_SESSION_LOSS_PENDING;
                wire.session = session.as_raw();
                wire.time = loss_time;
            }
            EventData::InstanceLossPending { loss_time } => {
                wire.kind = EVENT_INSTANCE_LOSS_PENDING;
                wire.time = loss_time;
            }
            EventData::ReferenceSpaceChangePending {
                session,
                kind,
                change_time,
            } => {
                wire.kind = EVENT_REFERENCE_SPACE_CHANGE;
                wire.session = session.as_raw();
                wire.space_kind = kind as i32;
                wire.time = change_time;
            }
            EventData::EventsLost { count } => {
                wire.kind = EVENT_EVENTS_LOST;
                wire.count = count;
            }
        }
        wire
    }

    pub fn to_api(&self) -> Option<EventData> {
        Some(match self.kind {
            EVENT_SESSION_STATE => EventData::SessionStateChanged {
                session: SessionHandle::from_raw(self.session),
                state: SessionState::from_i32(self.state)?,
                time: self.time,
            },
            EVENT_SESSION_LOSS_PENDING => EventData::SessionLossPending {
                session: SessionHandle::from_raw(self.session),
                loss_time: self.time,
            },
            EVENT_INSTANCE_LOSS_PENDING => EventData::InstanceLossPending {
                loss_time: self.time,
            },
            EVENT_REFERENCE_SPACE_CHANGE => EventData::ReferenceSpaceChangePending {
                session: SessionHandle::from_raw(self.session),
                kind: ReferenceSpaceKind::from_i32(self.space_kind)?,
                change_time: self.time,
            },
            EVENT_EVENTS_LOST => EventData::EventsLost { count: self.count },
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Args structs, one per opcode
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HandshakeArgs {
    pub request: *mut u8,
    pub request_len: u32,
    pub response_capacity: u32,
    pub response: *mut u8,
    pub response_len: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateInstanceArgs {
    pub app_name: *mut u8,
    pub app_name_len: u32,
    pub _reserved: u32,
    pub out_instance: u64,
    pub out_system: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateSessionArgs {
    /// Chain: session create info, graphics binding, overlay info.
    pub create_info: *mut crate::chain::StructHeader,
    pub out_session: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SessionOnlyArgs {
    pub session: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BeginSessionArgs {
    pub session: u64,
    pub view_configuration: i32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EnumerateFormatsArgs {
    pub session: u64,
    pub capacity: u32,
    pub count_out: u32,
    pub formats: *mut i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateSwapchainArgs {
    pub session: u64,
    pub info: WireSwapchainCreateInfo,
    pub out_swapchain: u64,
    pub out_image_count: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SwapchainOnlyArgs {
    pub swapchain: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EnumerateImagesArgs {
    pub swapchain: u64,
    pub capacity: u32,
    pub count_out: u32,
    pub image_ids: *mut u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AcquireImageArgs {
    pub swapchain: u64,
    pub out_index: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WaitImageArgs {
    pub swapchain: u64,
    pub timeout_ns: i64,
    /// Shared texture of the image being waited on; the host opens and
    /// caches it on first sight.
    pub share: WireShareHandle,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReleaseImageArgs {
    pub swapchain: u64,
    /// The acquired index on the overlay side, so the host copies into
    /// the right runtime image.
    pub index: u32,
    pub _reserved: u32,
    pub share: WireShareHandle,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateReferenceSpaceArgs {
    pub session: u64,
    pub kind: i32,
    pub _reserved: u32,
    pub pose: Posef,
    pub out_space: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateActionSpaceArgs {
    pub session: u64,
    pub action: u64,
    pub pose: Posef,
    pub subaction: [u8; INLINE_PATH_LEN],
    pub subaction_len: u32,
    pub _reserved: u32,
    pub out_space: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LocateSpaceArgs {
    pub space: u64,
    pub base: u64,
    pub time: i64,
    pub out_flags: u64,
    pub out_pose: Posef,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SpaceOnlyArgs {
    pub space: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EnumerateViewConfigurationsArgs {
    pub system: u64,
    pub capacity: u32,
    pub count_out: u32,
    pub kinds: *mut i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EnumerateViewConfigurationViewsArgs {
    pub system: u64,
    pub kind: i32,
    pub capacity: u32,
    pub count_out: u32,
    pub _reserved: u32,
    pub views: *mut ViewConfigurationView,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GetViewConfigurationPropertiesArgs {
    pub system: u64,
    pub kind: i32,
    pub out_fov_mutable: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GetSystemPropertiesArgs {
    pub system: u64,
    pub out_vendor_id: u32,
    pub out_name_len: u32,
    pub out_name: [u8; INLINE_TEXT_LEN],
    pub out_max_swapchain_width: u32,
    pub out_max_swapchain_height: u32,
    pub out_max_layer_count: u32,
    pub out_orientation_tracking: u32,
    pub out_position_tracking: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GetInstancePropertiesArgs {
    pub out_name: [u8; INLINE_TEXT_LEN],
    pub out_name_len: u32,
    pub out_version: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PollEventArgs {
    pub out_has_event: u32,
    pub _reserved: u32,
    pub out_event: WireEvent,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WaitFrameArgs {
    pub session: u64,
    pub out_predicted_display_time: i64,
    pub out_predicted_display_period: i64,
    pub out_should_render: u32,
    pub _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EndFrameArgs {
    pub session: u64,
    pub display_time: i64,
    pub blend_mode: i32,
    pub layer_count: u32,
    /// Array of `layer_count` pointers, each to an emitted layer node;
    /// the array pointer and every element are in the fixup table.
    pub layers: *mut *mut crate::chain::StructHeader,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WireActionQuery {
    pub action: u64,
    pub subaction: [u8; INLINE_PATH_LEN],
    pub subaction_len: u32,
    pub _reserved: u32,
    pub out_state: WireActionState,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SyncActionsArgs {
    pub session: u64,
    pub set_count: u32,
    pub query_count: u32,
    pub sets: *mut u64,
    pub queries: *mut WireActionQuery,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HapticArgs {
    pub session: u64,
    pub action: u64,
    pub subaction: [u8; INLINE_PATH_LEN],
    pub subaction_len: u32,
    /// 1 when duration/frequency/amplitude carry a vibration to apply,
    /// 0 for a stop.
    pub has_vibration: u32,
    pub duration: i64,
    pub frequency: f32,
    pub amplitude: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LocateViewsArgs {
    pub session: u64,
    pub view_configuration: i32,
    pub _reserved: u32,
    pub display_time: i64,
    pub space: u64,
    pub out_state_flags: u64,
    pub capacity: u32,
    pub count_out: u32,
    pub views: *mut View,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GetInputSourceLocalizedNameArgs {
    pub session: u64,
    pub components: u32,
    pub path_len: u32,
    pub path: *mut u8,
    pub capacity: u32,
    pub count_out: u32,
    pub buffer: *mut u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateActionSetArgs {
    pub name: [u8; INLINE_NAME_LEN],
    pub name_len: u32,
    pub priority: u32,
    pub localized: [u8; INLINE_TEXT_LEN],
    pub localized_len: u32,
    pub _reserved: u32,
    pub out_action_set: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ActionSetOnlyArgs {
    pub action_set: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreateActionArgs {
    pub action_set: u64,
    pub kind: i32,
    pub name_len: u32,
    pub name: [u8; INLINE_NAME_LEN],
    pub localized: [u8; INLINE_TEXT_LEN],
    pub localized_len: u32,
    pub _reserved: u32,
    pub out_action: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ActionOnlyArgs {
    pub action: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EnumerateReferenceSpacesArgs {
    pub session: u64,
    pub capacity: u32,
    pub count_out: u32,
    pub kinds: *mut i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GetReferenceSpaceBoundsRectArgs {
    pub session: u64,
    pub kind: i32,
    pub out_has_bounds: u32,
    pub out_bounds: Extent2Df,
}

// ---------------------------------------------------------------------------
// Compound serializers (the cases with real structure)
// ---------------------------------------------------------------------------

/// Serialize an end-frame request: args struct, pointer array, one
/// emitted node per layer.
pub fn write_end_frame(
    arena: &mut Arena,
    session: u64,
    info: &FrameEndInfo,
) -> Result<(), ArenaError> {
    let args = alloc_args(
        arena,
        EndFrameArgs {
            session,
            display_time: info.display_time,
            blend_mode: info.blend_mode as i32,
            layer_count: info.layers.len() as u32,
            layers: std::ptr::null_mut(),
        },
    )?;

    if info.layers.is_empty() {
        return Ok(());
    }

    let array = arena.alloc_zeroed::<*mut crate::chain::StructHeader>(info.layers.len())?;
    for (i, layer) in info.layers.iter().enumerate() {
        let node = crate::chain::emit_composition_layer(arena, layer)?;
        // Safety: array has room for every layer; elements live in the
        // arena.
        unsafe { set_ptr_field(arena, array.add(i), node)? };
    }
    // Safety: args points into the arena.
    unsafe { set_ptr_field(arena, std::ptr::addr_of_mut!((*args).layers), array)? };
    Ok(())
}

/// Host side: parse the layers of an end-frame request back into owned
/// form. `None` if any layer node is malformed or of a kind that is not
/// a composition layer.
///
/// # Safety
/// The arena must hold an absolutized end-frame request.
pub unsafe fn read_end_frame(arena: &Arena) -> Option<(u64, FrameEndInfo)> {
    let args = args_ptr::<EndFrameArgs>(arena);
    let count = (*args).layer_count as usize;
    let mut layers = Vec::with_capacity(count);
    if count > 0 {
        let array = (*args).layers;
        if array.is_null() {
            return None;
        }
        for i in 0..count {
            let node = *array.add(i);
            if node.is_null() {
                return None;
            }
            layers.push(crate::chain::parse_composition_layer(node)?);
        }
    }
    Some((
        (*args).session,
        FrameEndInfo {
            display_time: (*args).display_time,
            blend_mode: EnvironmentBlendMode::from_i32((*args).blend_mode)?,
            layers,
        },
    ))
}

/// Serialize a sync-actions-and-get-state request.
pub fn write_sync_actions(
    arena: &mut Arena,
    session: u64,
    sets: &[u64],
    queries: &[WireActionQuery],
) -> Result<(), ArenaError> {
    let args = alloc_args(
        arena,
        SyncActionsArgs {
            session,
            set_count: sets.len() as u32,
            query_count: queries.len() as u32,
            sets: std::ptr::null_mut(),
            queries: std::ptr::null_mut(),
        },
    )?;
    let sets_ptr = arena.alloc_slice(sets)?;
    let queries_ptr = arena.alloc_slice(queries)?;
    unsafe {
        set_ptr_field(arena, std::ptr::addr_of_mut!((*args).sets), sets_ptr)?;
        set_ptr_field(arena, std::ptr::addr_of_mut!((*args).queries), queries_ptr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BUMP_OFFSET;
    use std::ptr::NonNull;

    fn heap_arena(buf: &mut Vec<u8>) -> Arena<'_> {
        unsafe { Arena::from_raw(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len()) }
    }

    #[test]
    fn end_frame_roundtrip_preserves_layers() {
        let mut buf = vec![0u8; BUMP_OFFSET + 8192];
        let mut arena = heap_arena(&mut buf);
        arena.begin_request(crate::opcode::Opcode::EndFrame.as_u64());

        let info = FrameEndInfo {
            display_time: 12345,
            blend_mode: EnvironmentBlendMode::Opaque,
            layers: vec![
                CompositionLayer::Quad(CompositionLayerQuad {
                    flags: CompositionLayerFlags::empty(),
                    space: crate::types::SpaceHandle::from_raw(4),
                    eye_visibility: EyeVisibility::Both,
                    sub_image: SwapchainSubImage {
                        swapchain: crate::types::SwapchainHandle::from_raw(9),
                        image_rect: Rect2Di::default(),
                        image_array_index: 0,
                    },
                    pose: Posef::IDENTITY,
                    size: Extent2Df {
                        width: 1.0,
                        height: 1.0,
                    },
                }),
                CompositionLayer::Projection(CompositionLayerProjection {
                    flags: CompositionLayerFlags::empty(),
                    space: crate::types::SpaceHandle::from_raw(4),
                    views: vec![ProjectionLayerView {
                        pose: Posef::IDENTITY,
                        fov: Fovf::default(),
                        sub_image: SwapchainSubImage {
                            swapchain: crate::types::SwapchainHandle::from_raw(10),
                            image_rect: Rect2Di::default(),
                            image_array_index: 0,
                        },
                        depth: None,
                    }],
                }),
            ],
        };
        write_end_frame(&mut arena, 77, &info).unwrap();

        // Cross the "process boundary" in place.
        arena.relativize();
        arena.absolutize().unwrap();

        let (session, parsed) = unsafe { read_end_frame(&arena) }.unwrap();
        assert_eq!(session, 77);
        assert_eq!(parsed.display_time, 12345);
        assert_eq!(parsed.layers, info.layers);
    }

    #[test]
    fn end_frame_with_no_layers_has_null_array() {
        let mut buf = vec![0u8; BUMP_OFFSET + 1024];
        let mut arena = heap_arena(&mut buf);
        arena.begin_request(crate::opcode::Opcode::EndFrame.as_u64());
        write_end_frame(
            &mut arena,
            1,
            &FrameEndInfo {
                display_time: 1,
                blend_mode: EnvironmentBlendMode::Opaque,
                layers: vec![],
            },
        )
        .unwrap();
        assert_eq!(arena.fixup_count(), 0);
        let (_, parsed) = unsafe { read_end_frame(&arena) }.unwrap();
        assert!(parsed.layers.is_empty());
    }

    #[test]
    fn fixup_table_matches_non_null_pointer_fields() {
        let mut buf = vec![0u8; BUMP_OFFSET + 8192];
        let mut arena = heap_arena(&mut buf);
        arena.begin_request(crate::opcode::Opcode::EndFrame.as_u64());

        let quad = CompositionLayer::Quad(CompositionLayerQuad {
            flags: CompositionLayerFlags::empty(),
            space: crate::types::SpaceHandle::from_raw(4),
            eye_visibility: EyeVisibility::Both,
            sub_image: SwapchainSubImage {
                swapchain: crate::types::SwapchainHandle::from_raw(9),
                image_rect: Rect2Di::default(),
                image_array_index: 0,
            },
            pose: Posef::IDENTITY,
            size: Extent2Df {
                width: 1.0,
                height: 1.0,
            },
        });
        write_end_frame(
            &mut arena,
            1,
            &FrameEndInfo {
                display_time: 1,
                blend_mode: EnvironmentBlendMode::Opaque,
                layers: vec![quad.clone(), quad],
            },
        )
        .unwrap();
        // Pointer-bearing locations: args.layers, plus one array element
        // per layer. Quad nodes carry no nested pointers.
        assert_eq!(arena.fixup_count(), 3);
    }

    #[test]
    fn capacity_count_idiom_at_the_wire() {
        let items = [28i64, 29, 91];
        let mut count = 0u32;
        let mut dst = [0i64; 3];

        // Zero capacity: count only, success.
        let code = unsafe { write_array_out(0, &mut count, std::ptr::null_mut(), &items) };
        assert_eq!(code, ResultCode::Success);
        assert_eq!(count, 3);

        // Short capacity: count still written, size error.
        let code = unsafe { write_array_out(2, &mut count, dst.as_mut_ptr(), &items) };
        assert_eq!(code, ResultCode::SizeInsufficient);
        assert_eq!(count, 3);

        // Full capacity: filled.
        let code = unsafe { write_array_out(3, &mut count, dst.as_mut_ptr(), &items) };
        assert_eq!(code, ResultCode::Success);
        assert_eq!(dst, items);
    }

    #[test]
    fn handshake_payload_roundtrips() {
        let payload = HandshakePayload {
            pid: 4242,
            version: 1,
            app_name: "overlay-widget".into(),
        };
        let bytes = encode_handshake(&payload).unwrap();
        assert_eq!(decode_handshake(&bytes).unwrap(), payload);
    }

    #[test]
    fn wire_event_roundtrips() {
        let events = [
            EventData::SessionStateChanged {
                session: SessionHandle::from_raw(5),
                state: SessionState::Focused,
                time: 9,
            },
            EventData::SessionLossPending {
                session: SessionHandle::from_raw(5),
                loss_time: 10,
            },
            EventData::InstanceLossPending { loss_time: 11 },
            EventData::EventsLost { count: 3 },
        ];
        for ev in events {
            assert_eq!(WireEvent::from_api(&ev).to_api(), Some(ev));
        }
    }
}
