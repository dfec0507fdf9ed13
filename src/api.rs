//! Compositor API data types.
//!
//! These are the owned, in-process representations used by the
//! [`CompositorRuntime`](crate::runtime::CompositorRuntime) trait and all
//! layer logic. Geometry types are `#[repr(C)]` plain data and travel
//! through the IPC arena verbatim; everything else is converted to wire
//! form by [`chain`](crate::chain) and [`marshal`](crate::marshal).

use bitflags::bitflags;

use crate::types::{
    ActionHandle, ActionSetHandle, DisplayPeriod, DisplayTime, SessionHandle, SpaceHandle,
    SwapchainHandle, SystemId,
};

// ---------------------------------------------------------------------------
// Geometry (plain data, shared with the wire)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternionf {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quaternionf {
    fn default() -> Self {
        Quaternionf {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Posef {
    pub orientation: Quaternionf,
    pub position: Vector3f,
}

impl Posef {
    pub const IDENTITY: Posef = Posef {
        orientation: Quaternionf {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        },
        position: Vector3f {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        },
    };
}

/// Field of view as four half-angles in radians.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fovf {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset2Di {
    pub x: i32,
    pub y: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent2Di {
    pub width: i32,
    pub height: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Extent2Df {
    pub width: f32,
    pub height: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect2Di {
    pub offset: Offset2Di,
    pub extent: Extent2Di,
}

// Wire structs embed these directly; their layout is part of the protocol.
const _: () = {
    assert!(std::mem::size_of::<Posef>() == 28);
    assert!(std::mem::size_of::<Fovf>() == 16);
    assert!(std::mem::size_of::<Rect2Di>() == 16);
};

// ---------------------------------------------------------------------------
// Enums and flags
// ---------------------------------------------------------------------------

/// Lifecycle state surfaced by the runtime for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SessionState {
    Unknown = 0,
    Idle = 1,
    Ready = 2,
    Synchronized = 3,
    Visible = 4,
    Focused = 5,
    Stopping = 6,
    LossPending = 7,
    Exiting = 8,
}

impl SessionState {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Unknown,
            1 => Self::Idle,
            2 => Self::Ready,
            3 => Self::Synchronized,
            4 => Self::Visible,
            5 => Self::Focused,
            6 => Self::Stopping,
            7 => Self::LossPending,
            8 => Self::Exiting,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReferenceSpaceKind {
    View = 1,
    Local = 2,
    Stage = 3,
}

impl ReferenceSpaceKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::View,
            2 => Self::Local,
            3 => Self::Stage,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ViewConfigurationKind {
    Mono = 1,
    Stereo = 2,
}

impl ViewConfigurationKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::Mono,
            2 => Self::Stereo,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EnvironmentBlendMode {
    Opaque = 1,
    Additive = 2,
    AlphaBlend = 3,
}

impl EnvironmentBlendMode {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::Opaque,
            2 => Self::Additive,
            3 => Self::AlphaBlend,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EyeVisibility {
    Both = 0,
    Left = 1,
    Right = 2,
}

impl EyeVisibility {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Both,
            1 => Self::Left,
            2 => Self::Right,
            _ => return None,
        })
    }
}

/// Which graphics API a session binds. Only the shared-texture-capable
/// one is bridged across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GraphicsApi {
    SharedTexture = 1,
    OpenGl = 2,
    Vulkan = 3,
}

impl GraphicsApi {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::SharedTexture,
            2 => Self::OpenGl,
            3 => Self::Vulkan,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ActionKind {
    BooleanInput = 1,
    FloatInput = 2,
    Vector2Input = 3,
    PoseInput = 4,
    VibrationOutput = 5,
}

impl ActionKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::BooleanInput,
            2 => Self::FloatInput,
            3 => Self::Vector2Input,
            4 => Self::PoseInput,
            5 => Self::VibrationOutput,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SwapchainUsageFlags: u64 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 1;
        const SAMPLED = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompositionLayerFlags: u64 {
        const CORRECT_CHROMATIC_ABERRATION = 1 << 0;
        const BLEND_TEXTURE_SOURCE_ALPHA = 1 << 1;
        const UNPREMULTIPLIED_ALPHA = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OverlaySessionFlags: u64 {
        /// The overlay accepts being handed the same frame state twice.
        const RELAXED_DISPLAY_TIME = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpaceLocationFlags: u64 {
        const ORIENTATION_VALID = 1 << 0;
        const POSITION_VALID = 1 << 1;
        const ORIENTATION_TRACKED = 1 << 2;
        const POSITION_TRACKED = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ViewStateFlags: u64 {
        const ORIENTATION_VALID = 1 << 0;
        const POSITION_VALID = 1 << 1;
        const ORIENTATION_TRACKED = 1 << 2;
        const POSITION_TRACKED = 1 << 3;
    }
}

// ---------------------------------------------------------------------------
// Create infos and query results
// ---------------------------------------------------------------------------

/// How a session binds to a graphics device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsBinding {
    pub api: GraphicsApi,
    /// Backend-specific device identity; for the shared-texture backend
    /// this is the id under which shared handles are opened.
    pub device_id: u64,
}

/// Extension info marking a session create as an overlay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlaySessionCreateInfo {
    pub flags: OverlaySessionFlags,
    /// Merge position of this overlay's layers relative to the main
    /// application's layers: negative sorts below, non-negative above.
    pub placement: i32,
}

#[derive(Debug, Clone)]
pub struct SessionCreateInfo {
    pub system: SystemId,
    pub graphics: GraphicsBinding,
    pub overlay: Option<OverlaySessionCreateInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBeginInfo {
    pub primary_view_configuration: ViewConfigurationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub usage: SwapchainUsageFlags,
    pub format: i64,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
}

/// One image of a swapchain as reported by enumeration. The id is
/// backend-specific (the soft backend uses it to find pixel storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapchainImage {
    pub image_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceSpaceCreateInfo {
    pub kind: ReferenceSpaceKind,
    pub pose_in_reference_space: Posef,
}

#[derive(Debug, Clone)]
pub struct ActionSpaceCreateInfo {
    pub action: ActionHandle,
    pub subaction_path: Option<String>,
    pub pose_in_action_space: Posef,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceLocation {
    pub flags: SpaceLocationFlags,
    pub pose: Posef,
}

#[derive(Debug, Clone)]
pub struct ActionSetCreateInfo {
    pub name: String,
    pub localized_name: String,
    pub priority: u32,
}

#[derive(Debug, Clone)]
pub struct ActionCreateInfo {
    pub name: String,
    pub kind: ActionKind,
    pub localized_name: String,
}

#[derive(Debug, Clone)]
pub struct ActionsSyncInfo {
    pub active_action_sets: Vec<ActionSetHandle>,
}

#[derive(Debug, Clone)]
pub struct ActionStateGetInfo {
    pub action: ActionHandle,
    pub subaction_path: Option<String>,
}

/// Flat action state; which fields are meaningful depends on `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActionState {
    pub kind: i32,
    pub active: bool,
    pub changed_since_last_sync: bool,
    pub boolean_value: bool,
    pub float_value: f32,
    pub vector2_value: [f32; 2],
    pub last_change_time: DisplayTime,
}

#[derive(Debug, Clone)]
pub struct HapticActionInfo {
    pub action: ActionHandle,
    pub subaction_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticVibration {
    pub duration: i64,
    pub frequency: f32,
    pub amplitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewLocateInfo {
    pub view_configuration: ViewConfigurationKind,
    pub display_time: DisplayTime,
    pub space: SpaceHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewState {
    pub flags: ViewStateFlags,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct View {
    pub pose: Posef,
    pub fov: Fovf,
}

#[derive(Debug, Clone)]
pub struct InputSourceLocalizedNameGetInfo {
    pub source_path: String,
    pub components: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProperties {
    pub runtime_name: String,
    pub runtime_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProperties {
    pub system_id: SystemId,
    pub vendor_id: u32,
    pub system_name: String,
    pub max_swapchain_width: u32,
    pub max_swapchain_height: u32,
    pub max_layer_count: u32,
    pub orientation_tracking: bool,
    pub position_tracking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewConfigurationProperties {
    pub kind: ViewConfigurationKind,
    pub fov_mutable: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewConfigurationView {
    pub recommended_width: u32,
    pub max_width: u32,
    pub recommended_height: u32,
    pub max_height: u32,
    pub recommended_sample_count: u32,
    pub max_sample_count: u32,
}

// ---------------------------------------------------------------------------
// Frames and composition layers
// ---------------------------------------------------------------------------

/// Result of `wait_frame`: the runtime's prediction for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameState {
    pub predicted_display_time: DisplayTime,
    pub predicted_display_period: DisplayPeriod,
    pub should_render: bool,
}

/// A portion of a swapchain image referenced by a composition layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSubImage {
    pub swapchain: SwapchainHandle,
    pub image_rect: Rect2Di,
    pub image_array_index: u32,
}

/// Depth data attached to a projection view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthInfo {
    pub sub_image: SwapchainSubImage,
    pub min_depth: f32,
    pub max_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionLayerView {
    pub pose: Posef,
    pub fov: Fovf,
    pub sub_image: SwapchainSubImage,
    pub depth: Option<DepthInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositionLayerProjection {
    pub flags: CompositionLayerFlags,
    pub space: SpaceHandle,
    pub views: Vec<ProjectionLayerView>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositionLayerQuad {
    pub flags: CompositionLayerFlags,
    pub space: SpaceHandle,
    pub eye_visibility: EyeVisibility,
    pub sub_image: SwapchainSubImage,
    pub pose: Posef,
    pub size: Extent2Df,
}

/// A composition layer submitted at end-frame. Only these two kinds may
/// come from an overlay; anything else rejects the whole submission.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositionLayer {
    Projection(CompositionLayerProjection),
    Quad(CompositionLayerQuad),
}

impl CompositionLayer {
    /// Every swapchain referenced by this layer.
    pub fn swapchains(&self) -> Vec<SwapchainHandle> {
        match self {
            CompositionLayer::Projection(p) => {
                let mut v: Vec<_> = p.views.iter().map(|view| view.sub_image.swapchain).collect();
                v.extend(
                    p.views
                        .iter()
                        .filter_map(|view| view.depth.as_ref().map(|d| d.sub_image.swapchain)),
                );
                v
            }
            CompositionLayer::Quad(q) => vec![q.sub_image.swapchain],
        }
    }

    /// The space the layer is positioned in.
    pub fn space(&self) -> SpaceHandle {
        match self {
            CompositionLayer::Projection(p) => p.space,
            CompositionLayer::Quad(q) => q.space,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameEndInfo {
    pub display_time: DisplayTime,
    pub blend_mode: EnvironmentBlendMode,
    pub layers: Vec<CompositionLayer>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event surfaced by `poll_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventData {
    SessionStateChanged {
        session: SessionHandle,
        state: SessionState,
        time: DisplayTime,
    },
    SessionLossPending {
        session: SessionHandle,
        loss_time: DisplayTime,
    },
    InstanceLossPending {
        loss_time: DisplayTime,
    },
    ReferenceSpaceChangePending {
        session: SessionHandle,
        kind: ReferenceSpaceKind,
        change_time: DisplayTime,
    },
    EventsLost {
        count: u32,
    },
}

impl EventData {
    /// The session the event is scoped to, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        match self {
            EventData::SessionStateChanged { session, .. }
            | EventData::SessionLossPending { session, .. }
            | EventData::ReferenceSpaceChangePending { session, .. } => Some(*session),
            _ => None,
        }
    }

    /// Replace the session handle (used when rewriting real handles to
    /// an overlay's local handles).
    pub fn with_session(self, new: SessionHandle) -> Self {
        match self {
            EventData::SessionStateChanged { state, time, .. } => EventData::SessionStateChanged {
                session: new,
                state,
                time,
            },
            EventData::SessionLossPending { loss_time, .. } => EventData::SessionLossPending {
                session: new,
                loss_time,
            },
            EventData::ReferenceSpaceChangePending {
                kind, change_time, ..
            } => EventData::ReferenceSpaceChangePending {
                session: new,
                kind,
                change_time,
            },
            other => other,
        }
    }

    /// Events that must survive queue overflow: session state changes
    /// and loss warnings.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            EventData::SessionStateChanged { .. }
                | EventData::SessionLossPending { .. }
                | EventData::InstanceLossPending { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_swapchain_collection_includes_depth() {
        let sub = |raw| SwapchainSubImage {
            swapchain: SwapchainHandle::from_raw(raw),
            image_rect: Rect2Di::default(),
            image_array_index: 0,
        };
        let layer = CompositionLayer::Projection(CompositionLayerProjection {
            flags: CompositionLayerFlags::empty(),
            space: SpaceHandle::from_raw(1),
            views: vec![ProjectionLayerView {
                pose: Posef::IDENTITY,
                fov: Fovf::default(),
                sub_image: sub(10),
                depth: Some(DepthInfo {
                    sub_image: sub(11),
                    min_depth: 0.0,
                    max_depth: 1.0,
                    near_z: 0.1,
                    far_z: 100.0,
                }),
            }],
        });
        let chains = layer.swapchains();
        assert!(chains.contains(&SwapchainHandle::from_raw(10)));
        assert!(chains.contains(&SwapchainHandle::from_raw(11)));
    }

    #[test]
    fn event_session_rewrite() {
        let ev = EventData::SessionStateChanged {
            session: SessionHandle::from_raw(7),
            state: SessionState::Visible,
            time: 123,
        };
        let rewritten = ev.with_session(SessionHandle::from_raw(9));
        assert_eq!(rewritten.session(), Some(SessionHandle::from_raw(9)));
        assert!(rewritten.is_critical());
        assert!(!EventData::EventsLost { count: 1 }.is_critical());
    }

    #[test]
    fn session_state_roundtrip() {
        for i in 0..=8 {
            let s = SessionState::from_i32(i).unwrap();
            assert_eq!(s as i32, i);
        }
        assert!(SessionState::from_i32(99).is_none());
    }
}
