//! Teardown scenarios: abrupt overlay death mid-frame, double destroys,
//! and the events overlays receive when the main session goes away.

mod support;

use std::time::Duration;

use lamina::api::*;
use lamina::error::ResultCode;
use lamina::graphics::{GraphicsDevice, KEYED_MUTEX_OVERLAY};
use lamina::runtime::CompositorRuntime;

use support::*;

#[test]
fn abrupt_overlay_death_cleans_up_connection_state() {
    let harness = Harness::new("dc_death");
    let main_session = harness.start_main_session();
    let (overlay, flag) = harness.connect_overlay("doomed");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 1, false))
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

    // Cache a layer, then run one full image cycle so the host keeps a
    // MAIN-key hold on the shared texture.
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
    let mut images = [SwapchainImage::default(); 3];
    overlay.enumerate_swapchain_images(swapchain, &mut images).unwrap();
    let index = overlay.acquire_swapchain_image(swapchain).unwrap();
    overlay.wait_swapchain_image(swapchain, 1_000_000_000).unwrap();
    overlay.release_swapchain_image(swapchain).unwrap();

    // Keep a handle on the shared texture to observe the force-release.
    let tex = harness
        .device
        .open_image(images[index as usize].image_id)
        .unwrap();

    let live_before = harness.runtime.swapchain_handles().len();

    // The overlay process "dies" without any teardown RPCs.
    flag.kill();
    std::mem::forget(overlay);

    // Within the wait bound the servicer notices, force-releases the
    // keyed-mutex hold, frees the real swapchain, and drops the cached
    // layers.
    assert!(wait_until(Duration::from_secs(3), || {
        harness.runtime.swapchain_handles().len() < live_before
    }));
    assert!(wait_until(Duration::from_secs(1), || {
        tex.acquire_keyed(KEYED_MUTEX_OVERLAY, Duration::from_millis(50))
            .is_ok()
    }));

    // The next main end-frame carries only main layers.
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
    assert!(harness.runtime.last_end_frame().unwrap().layers.is_empty());
}

#[test]
fn destroy_session_twice_is_success_then_handle_invalid() {
    let harness = Harness::new("dc_double");
    harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("twice");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();

    overlay.destroy_session(session).unwrap();
    assert_eq!(
        overlay.destroy_session(session).unwrap_err().code(),
        ResultCode::HandleInvalid
    );
}

#[test]
fn session_destroy_frees_owned_objects() {
    let harness = Harness::new("dc_children");
    harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("children");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    begin_overlay_session(&overlay, session);
    overlay
        .create_swapchain(session, &small_swapchain_info())
        .unwrap();
    assert_eq!(harness.runtime.swapchain_handles().len(), 1);

    overlay.destroy_session(session).unwrap();
    assert!(harness.runtime.swapchain_handles().is_empty());
}

#[test]
fn main_teardown_buffers_loss_then_exiting() {
    let harness = Harness::new("dc_mainloss");
    let main_session = harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("bereft");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    begin_overlay_session(&overlay, session);

    harness.main.destroy_session(main_session).unwrap();

    // The overlay observes loss-pending and then the descent to
    // exiting, all scoped to its own session handle.
    let mut saw_loss = false;
    let mut saw_exiting = false;
    for _ in 0..32 {
        match overlay.poll_event().unwrap() {
            Some(EventData::SessionLossPending { session: s, .. }) => {
                assert_eq!(s, session);
                saw_loss = true;
            }
            Some(EventData::SessionStateChanged { session: s, state, .. }) => {
                assert_eq!(s, session);
                if state == SessionState::Exiting {
                    saw_exiting = true;
                    break;
                }
            }
            Some(_) => {}
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    assert!(saw_loss, "loss-pending event never surfaced");
    assert!(saw_exiting, "exiting state change never surfaced");

    // Frame waits now fail rather than hanging.
    assert_eq!(
        overlay.wait_frame(session).unwrap_err().code(),
        ResultCode::SessionLost
    );
}
