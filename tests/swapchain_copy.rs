//! The swapchain bridge end to end: overlay pixels land in the runtime
//! swapchain image on release, with keyed-mutex handoff in between.

mod support;

use lamina::error::ResultCode;
use lamina::graphics::GraphicsDevice;
use lamina::runtime::CompositorRuntime;

use support::*;

#[test]
fn released_image_reaches_the_runtime_swapchain() {
    let harness = Harness::new("sc_copy");
    harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("painter");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    begin_overlay_session(&overlay, session);

    let swapchain = overlay
        .create_swapchain(session, &small_swapchain_info())
        .unwrap();

    // Three images, like the real swapchains behind this bridge.
    let mut images = [Default::default(); 3];
    let count = overlay.enumerate_swapchain_images(swapchain, &mut images).unwrap();
    assert_eq!(count, 3);

    let index = overlay.acquire_swapchain_image(swapchain).unwrap();
    assert_eq!(index, 0);
    overlay.wait_swapchain_image(swapchain, 1_000_000_000).unwrap();

    // Paint the acquired image red through the device.
    let tex = harness
        .device
        .open_image(images[index as usize].image_id)
        .unwrap();
    let red: Vec<u8> = [255u8, 0, 0, 255].repeat(16);
    tex.write_pixels(&red).unwrap();

    overlay.release_swapchain_image(swapchain).unwrap();

    // The runtime's swapchain image at the acquired index is now red.
    let real = *harness.runtime.swapchain_handles().last().unwrap();
    let runtime_tex = harness.runtime.swapchain_texture(real, index).unwrap();
    assert_eq!(runtime_tex.read_pixels().unwrap(), red);
}

#[test]
fn acquire_wait_release_order_is_enforced_locally() {
    let harness = Harness::new("sc_order");
    harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("order");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    begin_overlay_session(&overlay, session);
    let swapchain = overlay
        .create_swapchain(session, &small_swapchain_info())
        .unwrap();

    assert_eq!(
        overlay
            .wait_swapchain_image(swapchain, 0)
            .unwrap_err()
            .code(),
        ResultCode::CallOrderInvalid
    );
    assert_eq!(
        overlay.release_swapchain_image(swapchain).unwrap_err().code(),
        ResultCode::CallOrderInvalid
    );

    overlay.acquire_swapchain_image(swapchain).unwrap();
    assert_eq!(
        overlay.release_swapchain_image(swapchain).unwrap_err().code(),
        ResultCode::CallOrderInvalid
    );
    overlay.wait_swapchain_image(swapchain, 1_000_000_000).unwrap();
    overlay.release_swapchain_image(swapchain).unwrap();
}

#[test]
fn unsupported_swapchain_shapes_are_rejected() {
    let harness = Harness::new("sc_shape");
    harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("shape");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    begin_overlay_session(&overlay, session);

    let mut info = small_swapchain_info();
    info.sample_count = 4;
    assert_eq!(
        overlay.create_swapchain(session, &info).unwrap_err().code(),
        ResultCode::FeatureUnsupported
    );

    let mut info = small_swapchain_info();
    info.usage |= lamina::api::SwapchainUsageFlags::TRANSFER_DST;
    assert_eq!(
        overlay.create_swapchain(session, &info).unwrap_err().code(),
        ResultCode::FeatureUnsupported
    );
}

#[test]
fn deferred_destroy_waits_for_main_end_frame() {
    use lamina::api::*;

    let harness = Harness::new("sc_defer");
    let main_session = harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("defer");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    begin_overlay_session(&overlay, session);
    let space = overlay
        .create_reference_space(
            session,
            &ReferenceSpaceCreateInfo {
                kind: ReferenceSpaceKind::Local,
                pose_in_reference_space: Posef::IDENTITY,
            },
        )
        .unwrap();
    let swapchain = overlay
        .create_swapchain(session, &small_swapchain_info())
        .unwrap();

    // Cache a layer referencing the swapchain, then destroy it.
    overlay
        .end_frame(
            session,
            &FrameEndInfo {
                display_time: 0,
                blend_mode: EnvironmentBlendMode::Opaque,
                layers: vec![quad_layer(space, swapchain, 1.0)],
            },
        )
        .unwrap();
    let live_before = harness.runtime.swapchain_handles().len();
    overlay.destroy_swapchain(swapchain).unwrap();

    // Still alive in the runtime: the destroy was deferred.
    assert_eq!(harness.runtime.swapchain_handles().len(), live_before);

    let state = harness.main.wait_frame(main_session).unwrap();
    harness.main.begin_frame(main_session).unwrap();
    harness
        .main
        .end_frame(
            main_session,
            &FrameEndInfo {
                display_time: state.predicted_display_time,
                blend_mode: EnvironmentBlendMode::Opaque,
                layers: vec![],
            },
        )
        .unwrap();

    // Consumed and freed.
    assert_eq!(harness.runtime.swapchain_handles().len(), live_before - 1);
}
