//! Shared fixture for the scenario tests: a main layer over the mock
//! runtime and soft device, plus in-process overlay connections whose
//! peer watches are flags so tests can simulate abrupt process death.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lamina::api::*;
use lamina::config::LayerConfig;
use lamina::graphics::GraphicsDevice;
use lamina::mock::MockRuntime;
use lamina::os::process::{PeerFlag, PeerHandle};
use lamina::runtime::CompositorRuntime;
use lamina::soft::SoftDevice;
use lamina::transport::RpcChannel;
use lamina::types::{SessionHandle, SystemId};
use lamina::{MainLayer, OverlayRuntime};

static NEXT_PID: AtomicU32 = AtomicU32::new(0x4000);

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(tag: &str) -> LayerConfig {
    let mut cfg = LayerConfig::default();
    cfg.name_prefix = format!("lamina_it_{}_{}", std::process::id(), tag);
    cfg.poll_tick = Duration::from_millis(30);
    cfg.negotiation_tick = Duration::from_millis(50);
    cfg.connect_timeout = Duration::from_secs(2);
    cfg
}

pub struct Harness {
    pub config: LayerConfig,
    pub device: Arc<SoftDevice>,
    pub runtime: Arc<MockRuntime>,
    pub main: MainLayer,
}

impl Harness {
    pub fn new(tag: &str) -> Harness {
        init_tracing();
        let config = test_config(tag);
        let device = SoftDevice::new(1, &config.name_prefix);
        let runtime = MockRuntime::new(device.clone());
        let main = MainLayer::new(runtime.clone(), device.clone(), config.clone());
        Harness {
            config,
            device,
            runtime,
            main,
        }
    }

    pub fn main_session_info(&self) -> SessionCreateInfo {
        SessionCreateInfo {
            system: SystemId(1),
            graphics: GraphicsBinding {
                api: GraphicsApi::SharedTexture,
                device_id: self.device.device_id(),
            },
            overlay: None,
        }
    }

    /// Create and begin the main session.
    pub fn start_main_session(&self) -> SessionHandle {
        let session = self.main.create_session(&self.main_session_info()).unwrap();
        self.main
            .begin_session(
                session,
                &SessionBeginInfo {
                    primary_view_configuration: ViewConfigurationKind::Stereo,
                },
            )
            .unwrap();
        session
    }

    /// Attach an in-process overlay connection, bypassing negotiation.
    /// The returned flag simulates the overlay process dying abruptly.
    pub fn connect_overlay(&self, app_name: &str) -> (OverlayRuntime, PeerFlag) {
        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let names = self.config.rpc_names(pid);

        // The overlay watches "the main process": this process, always
        // alive. The host watches the flag.
        let (overlay_watches_main, _main_flag) = PeerHandle::local_pair();
        let (host_watches_overlay, overlay_flag) = PeerHandle::local_pair();

        let host_channel = RpcChannel::open(
            &names,
            self.config.arena_size,
            host_watches_overlay,
            self.config.poll_tick,
        )
        .unwrap();
        let overlay_channel = RpcChannel::open(
            &names,
            self.config.arena_size,
            overlay_watches_main,
            self.config.poll_tick,
        )
        .unwrap();

        self.main.attach_overlay(pid, host_channel);
        let runtime =
            OverlayRuntime::with_channel(overlay_channel, self.device.clone(), app_name).unwrap();
        (runtime, overlay_flag)
    }
}

pub fn overlay_session_info(device: &SoftDevice, placement: i32, relaxed: bool) -> SessionCreateInfo {
    SessionCreateInfo {
        system: SystemId(1),
        graphics: GraphicsBinding {
            api: GraphicsApi::SharedTexture,
            device_id: device.device_id(),
        },
        overlay: Some(OverlaySessionCreateInfo {
            flags: if relaxed {
                OverlaySessionFlags::RELAXED_DISPLAY_TIME
            } else {
                OverlaySessionFlags::empty()
            },
            placement,
        }),
    }
}

pub fn begin_overlay_session(overlay: &OverlayRuntime, session: SessionHandle) {
    overlay
        .begin_session(
            session,
            &SessionBeginInfo {
                primary_view_configuration: ViewConfigurationKind::Stereo,
            },
        )
        .unwrap();
}

pub fn small_swapchain_info() -> SwapchainCreateInfo {
    SwapchainCreateInfo {
        usage: SwapchainUsageFlags::COLOR_ATTACHMENT,
        format: 28,
        sample_count: 1,
        width: 4,
        height: 4,
        face_count: 1,
        array_size: 1,
        mip_count: 1,
    }
}

pub fn quad_layer(space: lamina::types::SpaceHandle, swapchain: lamina::types::SwapchainHandle, size: f32) -> CompositionLayer {
    CompositionLayer::Quad(CompositionLayerQuad {
        flags: CompositionLayerFlags::empty(),
        space,
        eye_visibility: EyeVisibility::Both,
        sub_image: SwapchainSubImage {
            swapchain,
            image_rect: Rect2Di::default(),
            image_array_index: 0,
        },
        pose: Posef::IDENTITY,
        size: Extent2Df {
            width: size,
            height: size,
        },
    })
}

/// Poll until `predicate` holds or the bound expires.
pub fn wait_until(bound: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + bound;
    loop {
        if predicate() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
