//! The overlay-process role.
//!
//! [`OverlayRuntime`] implements [`CompositorRuntime`] by marshalling
//! every call through the shared-memory channel to the main process.
//! The overlay application cannot tell it apart from a real runtime
//! binding: handles it receives are layer-minted local identifiers, its
//! swapchain images are shared textures bridged into the real session,
//! and its frame cadence is slaved to the main application's.

pub(crate) mod swapchain;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::api::*;
use crate::arena::Arena;
use crate::config::{LayerConfig, LAYER_BINARY_VERSION};
use crate::error::{ApiResult, CallError, ChannelError, ResultCode};
use crate::graphics::{GraphicsDevice, TextureDesc};
use crate::marshal::*;
use crate::negotiate::{self, HandshakePayload};
use crate::opcode::Opcode;
use crate::registry::{HandleInfo, HandleTable};
use crate::transport::RpcChannel;
use crate::types::*;

use swapchain::OverlaySwapchain;

pub struct OverlayRuntime {
    channel: RpcChannel,
    device: Arc<dyn GraphicsDevice>,
    instance: InstanceHandle,
    system: SystemId,
    session: Mutex<Option<SessionHandle>>,
    swapchains: HandleTable<Arc<Mutex<OverlaySwapchain>>>,
    action_sets: HandleTable<()>,
    /// Per-action state cache, refreshed by each sync RPC.
    actions: HandleTable<ActionState>,
}

impl std::fmt::Debug for OverlayRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayRuntime")
            .field("instance", &self.instance)
            .field("system", &self.system)
            .finish_non_exhaustive()
    }
}

impl OverlayRuntime {
    /// Rendezvous with the main process and complete the handshake.
    ///
    /// Blocks up to the configured connect bound waiting for a main
    /// process to appear; fails with a runtime-failure error if none
    /// does or the layer versions differ.
    pub fn connect(
        config: LayerConfig,
        device: Arc<dyn GraphicsDevice>,
        app_name: &str,
    ) -> Result<OverlayRuntime, ChannelError> {
        let channel = negotiate::connect_to_main(&config)?;
        Self::with_channel(channel, device, app_name)
    }

    /// Build an overlay runtime over an already-open channel. The seam
    /// the in-process tests use; production code goes through
    /// [`OverlayRuntime::connect`].
    #[doc(hidden)]
    pub fn with_channel(
        channel: RpcChannel,
        device: Arc<dyn GraphicsDevice>,
        app_name: &str,
    ) -> Result<OverlayRuntime, ChannelError> {
        // Layer threads and app threads will both touch the device.
        device.set_multithread_protected();

        let request = encode_handshake(&HandshakePayload {
            pid: std::process::id(),
            version: LAYER_BINARY_VERSION,
            app_name: app_name.to_string(),
        })
        .map_err(|_| ChannelError::BadHandshake)?;

        let (code, response) = channel.call(
            Opcode::Handshake,
            |arena| {
                let args = alloc_args(
                    arena,
                    HandshakeArgs {
                        request: std::ptr::null_mut(),
                        request_len: request.len() as u32,
                        response_capacity: 256,
                        response: std::ptr::null_mut(),
                        response_len: 0,
                        _reserved: 0,
                    },
                )?;
                let req = arena.alloc_slice(&request)?;
                let resp = arena.alloc_zeroed::<u8>(256)?;
                // Safety: args and both buffers are arena-resident.
                unsafe {
                    set_ptr_field(arena, std::ptr::addr_of_mut!((*args).request), req)?;
                    set_ptr_field(arena, std::ptr::addr_of_mut!((*args).response), resp)?;
                }
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<HandshakeArgs>(arena);
                read_array((*args).response as *const u8, (*args).response_len)
            },
        )?;
        if !code.is_success() {
            return Err(ChannelError::BadHandshake);
        }
        let main = decode_handshake(&response).map_err(|_| ChannelError::BadHandshake)?;
        debug!(main_pid = main.pid, "handshake complete");

        let (code, (instance, system)) = channel.call(
            Opcode::CreateInstance,
            |arena| {
                let args = alloc_args(
                    arena,
                    CreateInstanceArgs {
                        app_name: std::ptr::null_mut(),
                        app_name_len: app_name.len() as u32,
                        _reserved: 0,
                        out_instance: 0,
                        out_system: 0,
                    },
                )?;
                let name = arena.alloc_str(app_name)?;
                unsafe {
                    set_ptr_field(arena, std::ptr::addr_of_mut!((*args).app_name), name)?;
                }
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<CreateInstanceArgs>(arena);
                ((*args).out_instance, (*args).out_system)
            },
        )?;
        if !code.is_success() {
            return Err(ChannelError::BadHandshake);
        }

        info!(main_pid = main.pid, "connected to main compositor process");
        Ok(OverlayRuntime {
            channel,
            device,
            instance: InstanceHandle::from_raw(instance),
            system: SystemId(system),
            session: Mutex::new(None),
            swapchains: HandleTable::new(),
            action_sets: HandleTable::new(),
            actions: HandleTable::new(),
        })
    }

    pub fn instance(&self) -> InstanceHandle {
        self.instance
    }

    pub fn system(&self) -> SystemId {
        self.system
    }

    /// The overlay session, if one is currently live.
    pub fn session(&self) -> Option<SessionHandle> {
        *self.session.lock()
    }

    fn rpc<T>(
        &self,
        opcode: Opcode,
        build: impl FnOnce(&mut Arena) -> Result<(), ChannelError>,
        read: impl FnOnce(&mut Arena) -> T,
    ) -> ApiResult<T> {
        let (code, value) = self
            .channel
            .call(opcode, build, read)
            .map_err(CallError::from)?;
        if code.is_success() {
            Ok(value)
        } else {
            Err(CallError(code))
        }
    }

    /// Enumeration RPCs share one shape: send a capacity, get a count,
    /// read back at most `capacity` items.
    fn rpc_enumerate<A: Copy, T: Copy>(
        &self,
        opcode: Opcode,
        out_len: usize,
        make_args: impl FnOnce(u32) -> A,
        ptr_field: impl Fn(*mut A) -> *mut *mut T,
        count_field: impl Fn(*mut A) -> *mut u32,
    ) -> ApiResult<(u32, Vec<T>)> {
        self.rpc(
            opcode,
            |arena| {
                let args = alloc_args(arena, make_args(out_len as u32))?;
                let buffer = arena.alloc_zeroed::<T>(out_len)?;
                unsafe { set_ptr_field(arena, ptr_field(args), buffer)? };
                Ok(())
            },
            |arena| unsafe {
                let args = arena.args_ptr() as *mut A;
                let count = count_field(args).read();
                let stored = count.min(out_len as u32);
                let items = read_array(ptr_field(args).read() as *const T, stored);
                (count, items)
            },
        )
    }
}

impl crate::runtime::CompositorRuntime for OverlayRuntime {
    fn get_instance_properties(&self) -> ApiResult<InstanceProperties> {
        self.rpc(
            Opcode::GetInstanceProperties,
            |arena| {
                alloc_args(
                    arena,
                    GetInstancePropertiesArgs {
                        out_name: [0; INLINE_TEXT_LEN],
                        out_name_len: 0,
                        out_version: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<GetInstancePropertiesArgs>(arena);
                InstanceProperties {
                    runtime_name: read_inline(&(*args).out_name, (*args).out_name_len),
                    runtime_version: (*args).out_version,
                }
            },
        )
    }

    fn get_system(&self) -> ApiResult<SystemId> {
        Ok(self.system)
    }

    fn get_system_properties(&self, system: SystemId) -> ApiResult<SystemProperties> {
        self.rpc(
            Opcode::GetSystemProperties,
            |arena| {
                alloc_args(
                    arena,
                    GetSystemPropertiesArgs {
                        system: system.0,
                        out_vendor_id: 0,
                        out_name_len: 0,
                        out_name: [0; INLINE_TEXT_LEN],
                        out_max_swapchain_width: 0,
                        out_max_swapchain_height: 0,
                        out_max_layer_count: 0,
                        out_orientation_tracking: 0,
                        out_position_tracking: 0,
                        _reserved: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<GetSystemPropertiesArgs>(arena);
                SystemProperties {
                    system_id: system,
                    vendor_id: (*args).out_vendor_id,
                    system_name: read_inline(&(*args).out_name, (*args).out_name_len),
                    max_swapchain_width: (*args).out_max_swapchain_width,
                    max_swapchain_height: (*args).out_max_swapchain_height,
                    max_layer_count: (*args).out_max_layer_count,
                    orientation_tracking: (*args).out_orientation_tracking != 0,
                    position_tracking: (*args).out_position_tracking != 0,
                }
            },
        )
    }

    fn enumerate_view_configurations(
        &self,
        system: SystemId,
        out: &mut [ViewConfigurationKind],
    ) -> ApiResult<u32> {
        let (count, items) = self.rpc_enumerate::<EnumerateViewConfigurationsArgs, i32>(
            Opcode::EnumerateViewConfigurations,
            out.len(),
            |capacity| EnumerateViewConfigurationsArgs {
                system: system.0,
                capacity,
                count_out: 0,
                kinds: std::ptr::null_mut(),
            },
            |args| unsafe { std::ptr::addr_of_mut!((*args).kinds) },
            |args| unsafe { std::ptr::addr_of_mut!((*args).count_out) },
        )?;
        for (dst, raw) in out.iter_mut().zip(items.iter()) {
            *dst = ViewConfigurationKind::from_i32(*raw)
                .ok_or(CallError(ResultCode::RuntimeFailure))?;
        }
        Ok(count)
    }

    fn get_view_configuration_properties(
        &self,
        system: SystemId,
        kind: ViewConfigurationKind,
    ) -> ApiResult<ViewConfigurationProperties> {
        self.rpc(
            Opcode::GetViewConfigurationProperties,
            |arena| {
                alloc_args(
                    arena,
                    GetViewConfigurationPropertiesArgs {
                        system: system.0,
                        kind: kind as i32,
                        out_fov_mutable: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<GetViewConfigurationPropertiesArgs>(arena);
                ViewConfigurationProperties {
                    kind,
                    fov_mutable: (*args).out_fov_mutable != 0,
                }
            },
        )
    }

    fn enumerate_view_configuration_views(
        &self,
        system: SystemId,
        kind: ViewConfigurationKind,
        out: &mut [ViewConfigurationView],
    ) -> ApiResult<u32> {
        let (count, items) = self.rpc_enumerate::<EnumerateViewConfigurationViewsArgs, _>(
            Opcode::EnumerateViewConfigurationViews,
            out.len(),
            |capacity| EnumerateViewConfigurationViewsArgs {
                system: system.0,
                kind: kind as i32,
                capacity,
                count_out: 0,
                _reserved: 0,
                views: std::ptr::null_mut(),
            },
            |args| unsafe { std::ptr::addr_of_mut!((*args).views) },
            |args| unsafe { std::ptr::addr_of_mut!((*args).count_out) },
        )?;
        out[..items.len()].copy_from_slice(&items);
        Ok(count)
    }

    fn poll_event(&self) -> ApiResult<Option<EventData>> {
        self.rpc(
            Opcode::PollEvent,
            |arena| {
                alloc_args(
                    arena,
                    PollEventArgs {
                        out_has_event: 0,
                        _reserved: 0,
                        out_event: WireEvent {
                            kind: 0,
                            state: 0,
                            session: 0,
                            time: 0,
                            space_kind: 0,
                            count: 0,
                        },
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<PollEventArgs>(arena);
                if (*args).out_has_event != 0 {
                    (*args).out_event.to_api()
                } else {
                    None
                }
            },
        )
    }

    fn create_session(&self, info: &SessionCreateInfo) -> ApiResult<SessionHandle> {
        let Some(_overlay) = &info.overlay else {
            return Err(CallError(ResultCode::ValidationFailure));
        };
        // Only the shared-texture binding can be bridged; reject other
        // kinds before any RPC.
        if info.graphics.api != GraphicsApi::SharedTexture
            || info.graphics.device_id != self.device.device_id()
        {
            return Err(CallError(ResultCode::GraphicsDeviceInvalid));
        }
        let info = info.clone();
        let session = self.rpc(
            Opcode::CreateSession,
            move |arena| {
                let args = alloc_args(
                    arena,
                    CreateSessionArgs {
                        create_info: std::ptr::null_mut(),
                        out_session: 0,
                    },
                )?;
                let chain = crate::chain::emit_session_create_info(arena, &info)?;
                unsafe {
                    set_ptr_field(arena, std::ptr::addr_of_mut!((*args).create_info), chain)?;
                }
                Ok(())
            },
            |arena| unsafe { (*args_ptr::<CreateSessionArgs>(arena)).out_session },
        )?;
        let handle = SessionHandle::from_raw(session);
        *self.session.lock() = Some(handle);
        Ok(handle)
    }

    fn destroy_session(&self, session: SessionHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::DestroySession,
            move |arena| {
                alloc_args(
                    arena,
                    SessionOnlyArgs {
                        session: session.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )?;
        *self.session.lock() = None;
        // Host-side children are gone; drop the local shadows too.
        for local in self.swapchains.locals() {
            self.swapchains.remove(local);
        }
        for local in self.actions.locals() {
            self.actions.remove(local);
        }
        for local in self.action_sets.locals() {
            self.action_sets.remove(local);
        }
        Ok(())
    }

    fn begin_session(&self, session: SessionHandle, info: &SessionBeginInfo) -> ApiResult<()> {
        let view = info.primary_view_configuration as i32;
        self.rpc(
            Opcode::BeginSession,
            move |arena| {
                alloc_args(
                    arena,
                    BeginSessionArgs {
                        session: session.as_raw(),
                        view_configuration: view,
                        _reserved: 0,
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )
    }

    fn end_session(&self, session: SessionHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::EndSession,
            move |arena| {
                alloc_args(
                    arena,
                    SessionOnlyArgs {
                        session: session.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )
    }

    fn request_exit_session(&self, session: SessionHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::RequestExitSession,
            move |arena| {
                alloc_args(
                    arena,
                    SessionOnlyArgs {
                        session: session.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )
    }

    fn enumerate_reference_spaces(
        &self,
        session: SessionHandle,
        out: &mut [ReferenceSpaceKind],
    ) -> ApiResult<u32> {
        let (count, items) = self.rpc_enumerate::<EnumerateReferenceSpacesArgs, i32>(
            Opcode::EnumerateReferenceSpaces,
            out.len(),
            |capacity| EnumerateReferenceSpacesArgs {
                session: session.as_raw(),
                capacity,
                count_out: 0,
                kinds: std::ptr::null_mut(),
            },
            |args| unsafe { std::ptr::addr_of_mut!((*args).kinds) },
            |args| unsafe { std::ptr::addr_of_mut!((*args).count_out) },
        )?;
        for (dst, raw) in out.iter_mut().zip(items.iter()) {
            *dst =
                ReferenceSpaceKind::from_i32(*raw).ok_or(CallError(ResultCode::RuntimeFailure))?;
        }
        Ok(count)
    }

    fn create_reference_space(
        &self,
        session: SessionHandle,
        info: &ReferenceSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle> {
        let kind = info.kind as i32;
        let pose = info.pose_in_reference_space;
        let space = self.rpc(
            Opcode::CreateReferenceSpace,
            move |arena| {
                alloc_args(
                    arena,
                    CreateReferenceSpaceArgs {
                        session: session.as_raw(),
                        kind,
                        _reserved: 0,
                        pose,
                        out_space: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe { (*args_ptr::<CreateReferenceSpaceArgs>(arena)).out_space },
        )?;
        Ok(SpaceHandle::from_raw(space))
    }

    fn get_reference_space_bounds_rect(
        &self,
        session: SessionHandle,
        kind: ReferenceSpaceKind,
    ) -> ApiResult<(bool, Extent2Df)> {
        self.rpc(
            Opcode::GetReferenceSpaceBoundsRect,
            move |arena| {
                alloc_args(
                    arena,
                    GetReferenceSpaceBoundsRectArgs {
                        session: session.as_raw(),
                        kind: kind as i32,
                        out_has_bounds: 0,
                        out_bounds: Extent2Df::default(),
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<GetReferenceSpaceBoundsRectArgs>(arena);
                ((*args).out_has_bounds != 0, (*args).out_bounds)
            },
        )
    }

    fn create_action_space(
        &self,
        session: SessionHandle,
        info: &ActionSpaceCreateInfo,
    ) -> ApiResult<SpaceHandle> {
        let mut subaction = [0u8; INLINE_PATH_LEN];
        let subaction_len = info
            .subaction_path
            .as_deref()
            .map(|s| copy_inline(&mut subaction, s))
            .unwrap_or(0);
        let action = info.action.as_raw();
        let pose = info.pose_in_action_space;
        let space = self.rpc(
            Opcode::CreateActionSpace,
            move |arena| {
                alloc_args(
                    arena,
                    CreateActionSpaceArgs {
                        session: session.as_raw(),
                        action,
                        pose,
                        subaction,
                        subaction_len,
                        _reserved: 0,
                        out_space: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe { (*args_ptr::<CreateActionSpaceArgs>(arena)).out_space },
        )?;
        Ok(SpaceHandle::from_raw(space))
    }

    fn locate_space(
        &self,
        space: SpaceHandle,
        base: SpaceHandle,
        time: DisplayTime,
    ) -> ApiResult<SpaceLocation> {
        self.rpc(
            Opcode::LocateSpace,
            move |arena| {
                alloc_args(
                    arena,
                    LocateSpaceArgs {
                        space: space.as_raw(),
                        base: base.as_raw(),
                        time,
                        out_flags: 0,
                        out_pose: Posef::IDENTITY,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<LocateSpaceArgs>(arena);
                SpaceLocation {
                    flags: SpaceLocationFlags::from_bits_truncate((*args).out_flags),
                    pose: (*args).out_pose,
                }
            },
        )
    }

    fn destroy_space(&self, space: SpaceHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::DestroySpace,
            move |arena| {
                alloc_args(
                    arena,
                    SpaceOnlyArgs {
                        space: space.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )
    }

    fn enumerate_swapchain_formats(
        &self,
        session: SessionHandle,
        out: &mut [i64],
    ) -> ApiResult<u32> {
        let (count, items) = self.rpc_enumerate::<EnumerateFormatsArgs, i64>(
            Opcode::EnumerateSwapchainFormats,
            out.len(),
            |capacity| EnumerateFormatsArgs {
                session: session.as_raw(),
                capacity,
                count_out: 0,
                formats: std::ptr::null_mut(),
            },
            |args| unsafe { std::ptr::addr_of_mut!((*args).formats) },
            |args| unsafe { std::ptr::addr_of_mut!((*args).count_out) },
        )?;
        out[..items.len()].copy_from_slice(&items);
        Ok(count)
    }

    fn create_swapchain(
        &self,
        session: SessionHandle,
        info: &SwapchainCreateInfo,
    ) -> ApiResult<SwapchainHandle> {
        let wire = WireSwapchainCreateInfo::from_api(info);
        let (local, image_count) = self.rpc(
            Opcode::CreateSwapchain,
            move |arena| {
                alloc_args(
                    arena,
                    CreateSwapchainArgs {
                        session: session.as_raw(),
                        info: wire,
                        out_swapchain: 0,
                        out_image_count: 0,
                        _reserved: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<CreateSwapchainArgs>(arena);
                ((*args).out_swapchain, (*args).out_image_count)
            },
        )?;

        // Local shared textures, one per image, exported to the main
        // process through their share handles.
        let desc = TextureDesc {
            width: info.width,
            height: info.height,
            format: info.format,
            sample_count: info.sample_count,
            array_size: info.array_size,
            mip_count: info.mip_count,
            usage: info.usage,
        };
        let mut textures = Vec::with_capacity(image_count as usize);
        let mut image_ids = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            let tex = self
                .device
                .create_shared_texture(&desc)
                .map_err(|_| CallError(ResultCode::RuntimeFailure))?;
            image_ids.push(self.device.register_image(tex.clone()));
            textures.push(tex);
        }

        self.swapchains.insert(
            local,
            HandleInfo {
                real: 0,
                parent: session.as_raw(),
                state: Arc::new(Mutex::new(OverlaySwapchain::new(*info, textures, image_ids))),
            },
        );
        Ok(SwapchainHandle::from_raw(local))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::DestroySwapchain,
            move |arena| {
                alloc_args(
                    arena,
                    SwapchainOnlyArgs {
                        swapchain: swapchain.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )?;
        // The main side has dropped its keyed-mutex holds by the time
        // the response arrives, so the textures may be freed.
        self.swapchains.remove(swapchain.as_raw());
        Ok(())
    }

    fn enumerate_swapchain_images(
        &self,
        swapchain: SwapchainHandle,
        out: &mut [SwapchainImage],
    ) -> ApiResult<u32> {
        let entry = self
            .swapchains
            .get(swapchain.as_raw())
            .ok_or(CallError(ResultCode::HandleInvalid))?;
        let images: Vec<SwapchainImage> = entry
            .state
            .lock()
            .image_ids
            .iter()
            .map(|&image_id| SwapchainImage { image_id })
            .collect();
        crate::runtime::write_capacity(out, &images)
    }

    fn acquire_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<u32> {
        let entry = self
            .swapchains
            .get(swapchain.as_raw())
            .ok_or(CallError(ResultCode::HandleInvalid))?;
        let index = self.rpc(
            Opcode::AcquireSwapchainImage,
            move |arena| {
                alloc_args(
                    arena,
                    AcquireImageArgs {
                        swapchain: swapchain.as_raw(),
                        out_index: 0,
                        _reserved: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe { (*args_ptr::<AcquireImageArgs>(arena)).out_index },
        )?;
        entry.state.lock().record_acquired(index);
        Ok(index)
    }

    fn wait_swapchain_image(&self, swapchain: SwapchainHandle, timeout_ns: i64) -> ApiResult<()> {
        let entry = self
            .swapchains
            .get(swapchain.as_raw())
            .ok_or(CallError(ResultCode::HandleInvalid))?;
        let (index, share) = entry.state.lock().wait_target()?;
        let wire_share = WireShareHandle::from_api(&share);

        // The RPC first: the main side drops any hold it kept from the
        // previous release of this image, then this side's keyed-mutex
        // acquire can complete.
        self.rpc(
            Opcode::WaitSwapchainImage,
            move |arena| {
                alloc_args(
                    arena,
                    WaitImageArgs {
                        swapchain: swapchain.as_raw(),
                        timeout_ns,
                        share: wire_share,
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )?;

        let result = entry.state.lock().complete_wait(index, timeout_ns);
        result
    }

    fn release_swapchain_image(&self, swapchain: SwapchainHandle) -> ApiResult<()> {
        let entry = self
            .swapchains
            .get(swapchain.as_raw())
            .ok_or(CallError(ResultCode::HandleInvalid))?;
        let (index, share) = entry.state.lock().begin_release()?;
        let wire_share = WireShareHandle::from_api(&share);
        self.rpc(
            Opcode::ReleaseSwapchainImage,
            move |arena| {
                alloc_args(
                    arena,
                    ReleaseImageArgs {
                        swapchain: swapchain.as_raw(),
                        index,
                        _reserved: 0,
                        share: wire_share,
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )
    }

    fn wait_frame(&self, session: SessionHandle) -> ApiResult<FrameState> {
        self.rpc(
            Opcode::WaitFrame,
            move |arena| {
                alloc_args(
                    arena,
                    WaitFrameArgs {
                        session: session.as_raw(),
                        out_predicted_display_time: 0,
                        out_predicted_display_period: 0,
                        out_should_render: 0,
                        _reserved: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<WaitFrameArgs>(arena);
                FrameState {
                    predicted_display_time: (*args).out_predicted_display_time,
                    predicted_display_period: (*args).out_predicted_display_period,
                    should_render: (*args).out_should_render != 0,
                }
            },
        )
    }

    fn begin_frame(&self, session: SessionHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::BeginFrame,
            move |arena| {
                alloc_args(
                    arena,
                    SessionOnlyArgs {
                        session: session.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )
    }

    fn end_frame(&self, session: SessionHandle, info: &FrameEndInfo) -> ApiResult<()> {
        let info = info.clone();
        self.rpc(
            Opcode::EndFrame,
            move |arena| {
                write_end_frame(arena, session.as_raw(), &info)?;
                Ok(())
            },
            |_arena| (),
        )
    }

    fn locate_views(
        &self,
        session: SessionHandle,
        info: &ViewLocateInfo,
        out: &mut [View],
    ) -> ApiResult<(ViewState, u32)> {
        let view_configuration = info.view_configuration as i32;
        let display_time = info.display_time;
        let space = info.space.as_raw();
        let (flags, count, items) = self.rpc(
            Opcode::LocateViews,
            {
                let capacity = out.len() as u32;
                move |arena| {
                    let args = alloc_args(
                        arena,
                        LocateViewsArgs {
                            session: session.as_raw(),
                            view_configuration,
                            _reserved: 0,
                            display_time,
                            space,
                            out_state_flags: 0,
                            capacity,
                            count_out: 0,
                            views: std::ptr::null_mut(),
                        },
                    )?;
                    let buffer = arena.alloc_zeroed::<View>(capacity as usize)?;
                    unsafe {
                        set_ptr_field(arena, std::ptr::addr_of_mut!((*args).views), buffer)?;
                    }
                    Ok(())
                }
            },
            |arena| unsafe {
                let args = args_ptr::<LocateViewsArgs>(arena);
                let count = (*args).count_out;
                let stored = count.min((*args).capacity);
                let items = read_array((*args).views as *const View, stored);
                ((*args).out_state_flags, count, items)
            },
        )?;
        out[..items.len()].copy_from_slice(&items);
        Ok((
            ViewState {
                flags: ViewStateFlags::from_bits_truncate(flags),
            },
            count,
        ))
    }

    fn create_action_set(&self, info: &ActionSetCreateInfo) -> ApiResult<ActionSetHandle> {
        let mut name = [0u8; INLINE_NAME_LEN];
        let name_len = copy_inline(&mut name, &info.name);
        let mut localized = [0u8; INLINE_TEXT_LEN];
        let localized_len = copy_inline(&mut localized, &info.localized_name);
        let priority = info.priority;
        let local = self.rpc(
            Opcode::CreateActionSet,
            move |arena| {
                alloc_args(
                    arena,
                    CreateActionSetArgs {
                        name,
                        name_len,
                        priority,
                        localized,
                        localized_len,
                        _reserved: 0,
                        out_action_set: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe { (*args_ptr::<CreateActionSetArgs>(arena)).out_action_set },
        )?;
        self.action_sets.insert(
            local,
            HandleInfo {
                real: 0,
                parent: self.instance.as_raw(),
                state: (),
            },
        );
        Ok(ActionSetHandle::from_raw(local))
    }

    fn destroy_action_set(&self, action_set: ActionSetHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::DestroyActionSet,
            move |arena| {
                alloc_args(
                    arena,
                    ActionSetOnlyArgs {
                        action_set: action_set.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )?;
        self.action_sets.remove(action_set.as_raw());
        Ok(())
    }

    fn create_action(
        &self,
        action_set: ActionSetHandle,
        info: &ActionCreateInfo,
    ) -> ApiResult<ActionHandle> {
        let mut name = [0u8; INLINE_NAME_LEN];
        let name_len = copy_inline(&mut name, &info.name);
        let mut localized = [0u8; INLINE_TEXT_LEN];
        let localized_len = copy_inline(&mut localized, &info.localized_name);
        let kind = info.kind;
        let local = self.rpc(
            Opcode::CreateAction,
            move |arena| {
                alloc_args(
                    arena,
                    CreateActionArgs {
                        action_set: action_set.as_raw(),
                        kind: kind as i32,
                        name_len,
                        name,
                        localized,
                        localized_len,
                        _reserved: 0,
                        out_action: 0,
                    },
                )?;
                Ok(())
            },
            |arena| unsafe { (*args_ptr::<CreateActionArgs>(arena)).out_action },
        )?;
        self.actions.insert(
            local,
            HandleInfo {
                real: 0,
                parent: action_set.as_raw(),
                state: ActionState {
                    kind: kind as i32,
                    ..ActionState::default()
                },
            },
        );
        Ok(ActionHandle::from_raw(local))
    }

    fn destroy_action(&self, action: ActionHandle) -> ApiResult<()> {
        self.rpc(
            Opcode::DestroyAction,
            move |arena| {
                alloc_args(
                    arena,
                    ActionOnlyArgs {
                        action: action.as_raw(),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )?;
        self.actions.remove(action.as_raw());
        Ok(())
    }

    fn sync_actions(&self, session: SessionHandle, info: &ActionsSyncInfo) -> ApiResult<()> {
        let sets: Vec<u64> = info
            .active_action_sets
            .iter()
            .map(|s| s.as_raw())
            .collect();
        // One batched RPC refreshes the state of every live action.
        let action_locals = self.actions.locals();
        let queries: Vec<WireActionQuery> = action_locals
            .iter()
            .map(|&action| WireActionQuery {
                action,
                subaction: [0; INLINE_PATH_LEN],
                subaction_len: 0,
                _reserved: 0,
                out_state: WireActionState {
                    kind: 0,
                    active: 0,
                    changed: 0,
                    bool_value: 0,
                    float_value: 0.0,
                    vec2_value: [0.0; 2],
                    last_change_time: 0,
                },
            })
            .collect();

        let states = self.rpc(
            Opcode::SyncActionsAndGetState,
            {
                let sets = sets.clone();
                let queries = queries.clone();
                let session = session.as_raw();
                move |arena| {
                    write_sync_actions(arena, session, &sets, &queries)?;
                    Ok(())
                }
            },
            {
                let count = queries.len();
                move |arena| unsafe {
                    let args = args_ptr::<SyncActionsArgs>(arena);
                    read_array((*args).queries as *const WireActionQuery, count as u32)
                }
            },
        )?;

        for query in states {
            self.actions.with(query.action, |info| {
                info.state = query.out_state.to_api();
            });
        }
        Ok(())
    }

    fn get_action_state(
        &self,
        _session: SessionHandle,
        info: &ActionStateGetInfo,
    ) -> ApiResult<ActionState> {
        self.actions
            .get(info.action.as_raw())
            .map(|i| i.state)
            .ok_or(CallError(ResultCode::HandleInvalid))
    }

    fn apply_haptic_feedback(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
        vibration: &HapticVibration,
    ) -> ApiResult<()> {
        self.haptic_rpc(session, info, Some(*vibration))
    }

    fn stop_haptic_feedback(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
    ) -> ApiResult<()> {
        self.haptic_rpc(session, info, None)
    }

    fn get_input_source_localized_name(
        &self,
        session: SessionHandle,
        info: &InputSourceLocalizedNameGetInfo,
        out: &mut [u8],
    ) -> ApiResult<u32> {
        let path = info.source_path.clone();
        let components = info.components;
        let capacity = out.len() as u32;
        let (count, bytes) = self.rpc(
            Opcode::GetInputSourceLocalizedName,
            move |arena| {
                let args = alloc_args(
                    arena,
                    GetInputSourceLocalizedNameArgs {
                        session: session.as_raw(),
                        components,
                        path_len: path.len() as u32,
                        path: std::ptr::null_mut(),
                        capacity,
                        count_out: 0,
                        buffer: std::ptr::null_mut(),
                    },
                )?;
                let path_ptr = arena.alloc_str(&path)?;
                let buffer = arena.alloc_zeroed::<u8>(capacity as usize)?;
                unsafe {
                    set_ptr_field(arena, std::ptr::addr_of_mut!((*args).path), path_ptr)?;
                    set_ptr_field(arena, std::ptr::addr_of_mut!((*args).buffer), buffer)?;
                }
                Ok(())
            },
            |arena| unsafe {
                let args = args_ptr::<GetInputSourceLocalizedNameArgs>(arena);
                let count = (*args).count_out;
                let stored = count.min((*args).capacity);
                (count, read_array((*args).buffer as *const u8, stored))
            },
        )?;
        out[..bytes.len()].copy_from_slice(&bytes);
        Ok(count)
    }
}

impl OverlayRuntime {
    fn haptic_rpc(
        &self,
        session: SessionHandle,
        info: &HapticActionInfo,
        vibration: Option<HapticVibration>,
    ) -> ApiResult<()> {
        let mut subaction = [0u8; INLINE_PATH_LEN];
        let subaction_len = info
            .subaction_path
            .as_deref()
            .map(|s| copy_inline(&mut subaction, s))
            .unwrap_or(0);
        let action = info.action.as_raw();
        let opcode = if vibration.is_some() {
            Opcode::ApplyHaptic
        } else {
            Opcode::StopHaptic
        };
        self.rpc(
            opcode,
            move |arena| {
                alloc_args(
                    arena,
                    HapticArgs {
                        session: session.as_raw(),
                        action,
                        subaction,
                        subaction_len,
                        has_vibration: vibration.is_some() as u32,
                        duration: vibration.map(|v| v.duration).unwrap_or(0),
                        frequency: vibration.map(|v| v.frequency).unwrap_or(0.0),
                        amplitude: vibration.map(|v| v.amplitude).unwrap_or(0.0),
                    },
                )?;
                Ok(())
            },
            |_arena| (),
        )
    }
}
