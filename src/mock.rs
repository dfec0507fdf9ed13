//! An in-process compositor runtime for tests and bring-up.
//!
//! Plays the role of the "real" downchain runtime: hands out handles,
//! tracks session and swapchain state strictly enough to catch
//! call-order bugs, advances predicted display times deterministically,
//! and records every end-frame so tests can assert on the merged layer
//! lists. Swapchain images are soft-device textures, so bridged copies
//! are observable as pixels.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::*;
use crate::error::{ApiResult, CallError, ResultCode};
use crate::graphics::{GraphicsDevice, SharedTexture, TextureDesc};
use crate::runtime::{write_capacity, CompositorRuntime};
use crate::soft::SoftDevice;
use crate::types::*;

const IMAGE_COUNT: usize = 3;
const FRAME_PERIOD: i64 = 100_000;

fn err(code: ResultCode) -> CallError {
    CallError(code)
}

struct MockSession {
    running: bool,
}

struct MockSwapchain {
    info: SwapchainCreateInfo,
    image_ids: Vec<u64>,
    textures: Vec<Arc<dyn SharedTexture>>,
    acquired: VecDeque<u32>,
    next_index: u32,
    waited: bool,
}

struct MockAction {
    state: ActionState,
}

struct MockState {
    next_handle: u64,
    sessions: HashMap<u64, MockSession>,
    swapchains: HashMap<u64, MockSwapchain>,
    spaces: HashMap<u64, u64>,
    action_sets: HashMap<u64, ()>,
    actions: HashMap<u64, MockAction>,
    events: VecDeque<EventData>,
    frame_time: i64,
    end_frames: Vec<FrameEndInfo>,
    haptics: Vec<(ActionHandle, Option<HapticVibration>)>,
}

pub struct MockRuntime {
    device: Arc<SoftDevice>,
    state: Mutex<MockState>,
    system: SystemId,
    max_layer_count: u32,
}

impl MockRuntime {
    pub fn new(device: Arc<SoftDevice>) -> Arc<MockRuntime> {
        Self::with_max_layers(device, 16)
    }

    pub fn with_max_layers(device: Arc<SoftDevice>, max_layer_count: u32) -> Arc<MockRuntime> {
        Arc::new(MockRuntime {
            device,
            state: Mutex::new(MockState {
                next_handle: 0x1000,
                sessions: HashMap::new(),
                swapchains: HashMap::new(),
                spaces: HashMap::new(),
                action_sets: HashMap::new(),
                actions: HashMap::new(),
                events: VecDeque::new(),
                frame_time: 1_000_000,
                end_frames: Vec::new(),
                haptics: Vec::new(),
            }),
            system: SystemId(1),
            max_layer_count,
        })
    }

    pub fn device(&self) -> &Arc<SoftDevice> {
        &self.device
    }

    // ---- test hooks ----

    pub fn push_event(&self, event: EventData) {
        self.state.lock().events.push_back(event);
    }

    pub fn last_end_frame(&self) -> Option<FrameEndInfo> {
        self.state.lock().end_frames.last().cloned()
    }

    pub fn end_frame_count(&self) -> usize {
        self.state.lock().end_frames.len()
    }

    pub fn set_action_state(&self, action: ActionHandle, state: ActionState) {
        if let Some(a) = self.state.lock().actions.get_mut(&action.as_raw()) {
            a.state = state;
        }
    }

    pub fn haptic_log(&self) -> Vec<(ActionHandle, Option<HapticVibration>)> {
        self.state.lock().haptics.clone()
    }

    /// Handles of every live swapchain, in creation order.
    pub fn swapchain_handles(&self) -> Vec<SwapchainHandle> {
        let state = self.state.lock();
        let mut handles: Vec<u64> = state.swapchains.keys().copied().collect();
        handles.sort_unstable();
        handles.into_iter().map(SwapchainHandle::from_raw).collect()
    }

    /// The texture behind a swapchain image, for pixel assertions.
    pub fn swapchain_texture(
        &self,
        swapchain: SwapchainHandle,
        index: u32,
    ) -> Option<Arc<dyn SharedTexture>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.as_raw())
            .and_then(|sc| sc.textures.get(index as usize).cloned())
    }

    fn alloc_handle(state: &mut MockState) -> u64 {
        let h = state.next_handle;
        state.next_handle += 1;
        h
    }
}

impl CompositorRuntime for MockRuntime {
    fn get_instance_properties(&self) -> ApiResult<InstanceProperties> {
        Ok(InstanceProperties {
            runtime_name: "soft-compositor".into(),
            runtime_version: 1,
        })
    }

    fn get_system(&self) -> ApiResult<SystemId> {
        Ok(self.system)
    }

    fn get_system_properties(&self, system: SystemId) -> ApiResult<SystemProperties> {
        if system != self.system {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok(SystemProperties {
            system_id: system,
            vendor_id: 0x1209,
            system_name: "Soft Compositor".into(),
            max_swapchain_width: 4096,
            max_swapchain_height: 4096,
            max_layer_count: self.max_layer_count,
            orientation_tracking: true,
            position_tracking: true,
        })
    }

    fn enumerate_view_configurations(
        &self,
        system: SystemId,
        out: &mut [ViewConfigurationKind],
    ) -> ApiResult<u32> {
        if system != self.system {
            return Err(err(ResultCode::HandleInvalid));
        }
        write_capacity(out, &[ViewConfigurationKind::Stereo])
    }

    fn get_view_configuration_properties(
        &self,
        system: SystemId,
        kind: ViewConfigurationKind,
    ) -> ApiResult<ViewConfigurationProperties> {
        if system != self.system {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok(ViewConfigurationProperties {
            kind,
            fov_mutable: false,
        })
    }

    fn enumerate_view_configuration_views(
        &self,
        system: SystemId,
        _kind: ViewConfigurationKind,
        out: &mut [ViewConfigurationView],
    ) -> ApiResult<u32> {
        if system != self.system {
            return Err(err(ResultCode::HandleInvalid));
        }
        let view = ViewConfigurationView {
            recommended_width: 1024,
            max_width: 4096,
            recommended_height: 1024,
            max_height: 4096,
            recommended_sample_count: 1,
            max_sample_count: 4,
        };
        write_capacity(out, &[view, view])
    }

    fn poll_event(&self) -> ApiResult<Option<EventData>> {
        Ok(self.state.lock().events.pop_front())
    }

    fn create_session(&self, info: &SessionCreateInfo) -> ApiResult<SessionHandle> {
        if info.graphics.api != GraphicsApi::SharedTexture
            || info.graphics.device_id != self.device.device_id()
        {
            return Err(err(ResultCode::GraphicsDeviceInvalid));
        }
        if info.system != self.system {
            return Err(err(ResultCode::HandleInvalid));
        }
        let mut state = self.state.lock();
        let handle = Self::alloc_handle(&mut state);
        state.sessions.insert(handle, MockSession { running: false });
        let session = SessionHandle::from_raw(handle);
        let t = state.frame_time;
        state.events.push_back(EventData::SessionStateChanged {
            session,
            state: SessionState::Idle,
            time: t,
        });
        state.events.push_back(EventData::SessionStateChanged {
            session,
            state: SessionState::Ready,
            time: t,
        });
        Ok(session)
    }

    fn destroy_session(&self, session: SessionHandle) -> ApiResult<()> {
        let mut state = self.state.lock();
        if state.sessions.remove(&session.as_raw()).is_none() {
            return Err(err(ResultCode::HandleInvalid));
        }
        state.spaces.retain(|_, owner| *owner != session.as_raw());
        Ok(())
    }

    fn begin_session(&self, session: SessionHandle, _info: &SessionBeginInfo) -> ApiResult<()> {
        let mut state = self.state.lock();
        let t = state.frame_time;
        let s = state
            .sessions
            .get_mut(&session.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if s.running {
            return Err(err(ResultCode::SessionRunning));
        }
        s.running = true;
        for st in [
            SessionState::Synchronized,
            SessionState::Visible,
            SessionState::Focused,
        ] {
            state.events.push_back(EventData::SessionStateChanged {
                session,
                state: st,
                time: t,
            });
        }
        Ok(())
    }

    fn end_session(&self, session: SessionHandle) -> ApiResult<()> {
        let mut state = self.state.lock();
        let t = state.frame_time;
        let s = state
            .sessions
            .get_mut(&session.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if !s.running {
            return Err(err(ResultCode::SessionNotRunning));
        }
        s.running = false;
        state.events.push_back(EventData::SessionStateChanged {
            session,
            state: SessionState::Idle,
            time: t,
        });
        Ok(())
    }

    fn request_exit_session(&self, session: SessionHandle) -> ApiResult<()> {
        let mut state = self.state.lock();
        let t = state.frame_time;
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        state.events.push_back(EventData::SessionStateChanged {
            session,
            state: SessionState::Stopping,
            time: t,
        });
        Ok(())
    }

    fn enumerate_reference_spaces(
        &self,
        session: SessionHandle,
        out: &mut [ReferenceSpaceKind],
    ) -> ApiResult<u32> {
        if !self.state.lock().sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        write_capacity(
            out,
            &[
                ReferenceSpaceKind::View,
                ReferenceSpaceKind::Local,
                ReferenceSpaceKind::Stage,
            ],
        )
    }

    fn create_reference_space(
        &self,
        session: SessionHandle,
        _info: &ReferenceSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        let handle = Self::alloc_handle(&mut state);
        state.spaces.insert(handle, session.as_raw());
        Ok(SpaceHandle::from_raw(handle))
    }

    fn get_reference_space_bounds_rect(
        &self,
        session: SessionHandle,
        _kind: ReferenceSpaceKind,
    ) -> ApiResult<(bool, Extent2Df)> {
        if !self.state.lock().sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok((false, Extent2Df::default()))
    }

    fn create_action_space(
        &self,
        session: SessionHandle,
        info: &ActionSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        if !state.actions.contains_key(&info.action.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        let handle = Self::alloc_handle(&mut state);
        state.spaces.insert(handle, session.as_raw());
        Ok(SpaceHandle::from_raw(handle))
    }

    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        _time: DisplayTime,
    ) -> ApiResult<SpaceLocation> {
        let state = self.state.lock();
        if !state.spaces.contains_key(&space.as_raw()) || !state.spaces.contains_key(&base.as_raw())
        {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok(SpaceLocation {
            flags: SpaceLocationFlags::all(),
            pose: Posef::IDENTITY,
        })
    }

    fn destroy_space(&self, space: SpaceHandle) -> ApiResult<()> {
        if self.state.lock().spaces.remove(&space.as_raw()).is_none() {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok(())
    }

    fn enumerate_swapchain_formats(
        &self,
        session: SessionHandle,
        out: &mut [i64],
    ) -> ApiResult<u32> {
        if !self.state.lock().sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        write_capacity(out, &[28, 29, 91])
    }

    fn create_swapchain(
        &self,
        session: SessionHandle,
        info: &SwapchainCreateInfo,
    ) -> ApiResult<SwapchainHandle> {
        if info.sample_count != 1 || info.mip_count != 1 || info.array_size != 1 {
            return Err(err(ResultCode::FeatureUnsupported));
        }
        let desc = TextureDesc {
            width: info.width,
            height: info.height,
            format: info.format,
            sample_count: info.sample_count,
            array_size: info.array_size,
            mip_count: info.mip_count,
            usage: info.usage,
        };
        let mut textures = Vec::with_capacity(IMAGE_COUNT);
        let mut image_ids = Vec::with_capacity(IMAGE_COUNT);
        for _ in 0..IMAGE_COUNT {
            let tex = self
                .device
                .create_shared_texture(&desc)
                .map_err(|_| err(ResultCode::RuntimeFailure))?;
            image_ids.push(self.device.register_image(tex.clone()));
            textures.push(tex);
        }

        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        let handle = Self::alloc_handle(&mut state);
        state.swapchains.insert(
            handle,
            MockSwapchain {
                info: *info,
                image_ids,
                textures,
                acquired: VecDeque::new(),
                next_index: 0,
                waited: false,
            },
        );
        Ok(SwapchainHandle::from_raw(handle))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) -> ApiResult<()> {
        if self
            .state
            .lock()
            .swapchains
            .remove(&swapchain.as_raw())
            .is_none()
        {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok(())
    }

    fn enumerate_swapchain_images(
        &self,
        swapchain: SwapchainHandle,
        out: &mut [SwapchainImage],
    ) -> ApiResult<u32> {
        let state = self.state.lock();
        let sc = state
            .swapchains
            .get(&swapchain.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        let images: Vec<SwapchainImage> = sc
            .image_ids
            .iter()
            .map(|&image_id| SwapchainImage { image_id })
            .collect();
        write_capacity(out, &images)
    }

    fn acquire_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<u32> {
        let mut state = self.state.lock();
        let sc = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if sc.acquired.len() >= sc.image_ids.len() {
            return Err(err(ResultCode::CallOrderInvalid));
        }
        let index = sc.next_index;
        sc.next_index = (sc.next_index + 1) % sc.image_ids.len() as u32;
        sc.acquired.push_back(index);
        Ok(index)
    }

    fn wait_swapchain_image(&self, swapchain: SwapchainHandle, _timeout_ns: i64) -> ApiResult<()> {
        let mut state = self.state.lock();
        let sc = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if sc.acquired.is_empty() || sc.waited {
            return Err(err(ResultCode::CallOrderInvalid));
        }
        sc.waited = true;
        Ok(())
    }

    fn release_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<()> {
        let mut state = self.state.lock();
        let sc = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if !sc.waited {
            return Err(err(ResultCode::CallOrderInvalid));
        }
        sc.acquired.pop_front();
        sc.waited = false;
        Ok(())
    }

    fn wait_frame(&self, session: SessionHandle) -> ApiResult<FrameState> {
        let mut state = self.state.lock();
        let s = state
            .sessions
            .get(&session.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if !s.running {
            return Err(err(ResultCode::SessionNotRunning));
        }
        state.frame_time += FRAME_PERIOD;
        Ok(FrameState {
            predicted_display_time: state.frame_time,
            predicted_display_period: FRAME_PERIOD,
            should_render: true,
        })
    }

    fn begin_frame(&self, session: SessionHandle) -> ApiResult<()> {
        let state = self.state.lock();
        let s = state
            .sessions
            .get(&session.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if !s.running {
            return Err(err(ResultCode::SessionNotRunning));
        }
        Ok(())
    }

    fn end_frame(&self, session: SessionHandle, info: &FrameEndInfo) -> ApiResult<()> {
        let mut state = self.state.lock();
        let s = state
            .sessions
            .get(&session.as_raw())
            .ok_or(err(ResultCode::HandleInvalid))?;
        if !s.running {
            return Err(err(ResultCode::SessionNotRunning));
        }
        if info.layers.len() > self.max_layer_count as usize {
            return Err(err(ResultCode::LimitReached));
        }
        state.end_frames.push(info.clone());
        Ok(())
    }

    fn locate_views(
        &self,
        session: SessionHandle,
        _info: &ViewLocateInfo,
        out: &mut [View],
    ) -> ApiResult<(ViewState, u32)> {
        if !self.state.lock().sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        let fov = Fovf {
            angle_left: -0.78,
            angle_right: 0.78,
            angle_up: 0.78,
            angle_down: -0.78,
        };
        let views = [
            View {
                pose: Posef::IDENTITY,
                fov,
            },
            View {
                pose: Posef::IDENTITY,
                fov,
            },
        ];
        let count = write_capacity(out, &views)?;
        Ok((
            ViewState {
                flags: ViewStateFlags::all(),
            },
            count,
        ))
    }

    fn create_action_set(&self, _info: &ActionSetCreateInfo) -> ApiResult<ActionSetHandle> {
        let mut state = self.state.lock();
        let handle = Self::alloc_handle(&mut state);
        state.action_sets.insert(handle, ());
        Ok(ActionSetHandle::from_raw(handle))
    }

    fn destroy_action_set(&self, action_set: ActionSetHandle) -> ApiResult<()> {
        if self
            .state
            .lock()
            .action_sets
            .remove(&action_set.as_raw())
            .is_none()
        {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok(())
    }

    fn create_action(
        &self,
        action_set: ActionSetHandle,
        info: &ActionCreateInfo,
    ) -> ApiResult<ActionHandle> {
        let mut state = self.state.lock();
        if !state.action_sets.contains_key(&action_set.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        let handle = Self::alloc_handle(&mut state);
        state.actions.insert(
            handle,
            MockAction {
                state: ActionState {
                    kind: info.kind as i32,
                    ..ActionState::default()
                },
            },
        );
        Ok(ActionHandle::from_raw(handle))
    }

    fn destroy_action(&self, action: ActionHandle) -> ApiResult<()> {
        if self.state.lock().actions.remove(&action.as_raw()).is_none() {
            return Err(err(ResultCode::HandleInvalid));
        }
        Ok(())
    }

    fn sync_actions(&self, session: SessionHandle, _info: &ActionsSyncInfo) -> ApiResult<()> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        for action in state.actions.values_mut() {
            action.state.active = true;
        }
        Ok(())
    }

    fn get_action_state(
        &self,
        session: SessionHandle,
        info: &ActionStateGetInfo,
    ) -> ApiResult<ActionState> {
        let state = self.state.lock();
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        state
            .actions
            .get(&info.action.as_raw())
            .map(|a| a.state)
            .ok_or(err(ResultCode::HandleInvalid))
    }

    fn apply_haptic_feedback(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
        vibration: &HapticVibration,
    ) -> ApiResult<()> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        state.haptics.push((info.action, Some(*vibration)));
        Ok(())
    }

    fn stop_haptic_feedback(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
    ) -> ApiResult<()> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        state.haptics.push((info.action, None));
        Ok(())
    }

    fn get_input_source_localized_name(
        &self,
        session: SessionHandle,
        info: &InputSourceLocalizedNameGetInfo,
        out: &mut [u8],
    ) -> ApiResult<u32> {
        if !self.state.lock().sessions.contains_key(&session.as_raw()) {
            return Err(err(ResultCode::HandleInvalid));
        }
        let name = format!("source:{}", info.source_path);
        write_capacity(out, name.as_bytes())
    }
}
