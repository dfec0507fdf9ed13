//! Frame coordination: overlay wait-frame gates on the main loop and
//! stays monotonic, and overlay layers merge into the main end-frame in
//! placement order.

mod support;

use lamina::api::*;
use lamina::error::ResultCode;
use lamina::runtime::CompositorRuntime;

use support::*;

fn main_frame_end(
    session: lamina::types::SessionHandle,
    state: &FrameState,
    layers: Vec<CompositionLayer>,
) -> (lamina::types::SessionHandle, FrameEndInfo) {
    (
        session,
        FrameEndInfo {
            display_time: state.predicted_display_time,
            blend_mode: EnvironmentBlendMode::Opaque,
            layers,
        },
    )
}

#[test]
fn layers_merge_in_placement_order() {
    let harness = Harness::new("fm_merge");
    let main_session = harness.start_main_session();

    // Two overlays with placements 1 and 3; distinct quad sizes tell
    // them apart in the merged list.
    let mut overlays = Vec::new();
    for (placement, size) in [(1, 1.0f32), (3, 3.0f32)] {
        let (overlay, _flag) = harness.connect_overlay(&format!("merge-{placement}"));
        let session = overlay
            .create_session(&overlay_session_info(&harness.device, placement, false))
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
        let swapchain = overlay.create_swapchain(session, &small_swapchain_info()).unwrap();
        overlay
            .end_frame(
                session,
                &FrameEndInfo {
                    display_time: 0,
                    blend_mode: EnvironmentBlendMode::Opaque,
                    layers: vec![quad_layer(space, swapchain, size)],
                },
            )
            .unwrap();
        overlays.push((overlay, session));
    }

    // Main submits two projection layers of its own.
    let main_space = harness
        .main
        .create_reference_space(
            main_session,
            &ReferenceSpaceCreateInfo {
                kind: ReferenceSpaceKind::Local,
                pose_in_reference_space: Posef::IDENTITY,
            },
        )
        .unwrap();
    let main_swapchain = harness
        .main
        .create_swapchain(main_session, &small_swapchain_info())
        .unwrap();
    let projection = |_: u32| {
        CompositionLayer::Projection(CompositionLayerProjection {
            flags: CompositionLayerFlags::empty(),
            space: main_space,
            views: vec![ProjectionLayerView {
                pose: Posef::IDENTITY,
                fov: Fovf::default(),
                sub_image: SwapchainSubImage {
                    swapchain: main_swapchain,
                    image_rect: Rect2Di::default(),
                    image_array_index: 0,
                },
                depth: None,
            }],
        })
    };

    let state = harness.main.wait_frame(main_session).unwrap();
    harness.main.begin_frame(main_session).unwrap();
    let (s, info) = main_frame_end(main_session, &state, vec![projection(0), projection(1)]);
    harness.main.end_frame(s, &info).unwrap();

    let merged = harness.runtime.last_end_frame().unwrap();
    assert_eq!(merged.layers.len(), 4);
    assert!(matches!(merged.layers[0], CompositionLayer::Projection(_)));
    assert!(matches!(merged.layers[1], CompositionLayer::Projection(_)));
    let quad_size = |layer: &CompositionLayer| match layer {
        CompositionLayer::Quad(q) => q.size.width,
        _ => panic!("expected quad"),
    };
    assert_eq!(quad_size(&merged.layers[2]), 1.0);
    assert_eq!(quad_size(&merged.layers[3]), 3.0);
}

#[test]
fn negative_placement_sorts_below_main_layers() {
    let harness = Harness::new("fm_below");
    let main_session = harness.start_main_session();

    let (overlay, _flag) = harness.connect_overlay("below");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, -1, false))
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
    let swapchain = overlay.create_swapchain(session, &small_swapchain_info()).unwrap();
    overlay
        .end_frame(
            session,
            &FrameEndInfo {
                display_time: 0,
                blend_mode: EnvironmentBlendMode::Opaque,
                layers: vec![quad_layer(space, swapchain, 2.0)],
            },
        )
        .unwrap();

    let main_space = harness
        .main
        .create_reference_space(
            main_session,
            &ReferenceSpaceCreateInfo {
                kind: ReferenceSpaceKind::Local,
                pose_in_reference_space: Posef::IDENTITY,
            },
        )
        .unwrap();
    let main_swapchain = harness
        .main
        .create_swapchain(main_session, &small_swapchain_info())
        .unwrap();

    let state = harness.main.wait_frame(main_session).unwrap();
    harness.main.begin_frame(main_session).unwrap();
    let (s, info) = main_frame_end(
        main_session,
        &state,
        vec![quad_layer(main_space, main_swapchain, 9.0)],
    );
    harness.main.end_frame(s, &info).unwrap();

    let merged = harness.runtime.last_end_frame().unwrap();
    assert_eq!(merged.layers.len(), 2);
    let quad_size = |layer: &CompositionLayer| match layer {
        CompositionLayer::Quad(q) => q.size.width,
        _ => panic!("expected quad"),
    };
    assert_eq!(quad_size(&merged.layers[0]), 2.0);
    assert_eq!(quad_size(&merged.layers[1]), 9.0);
}

#[test]
fn overlay_wait_frame_gates_on_main_and_stays_monotonic() {
    let harness = Harness::new("fm_gate");
    let main_session = harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("gate");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    begin_overlay_session(&overlay, session);

    // Main waits first, then the overlay's gate opens immediately.
    let main_state = harness.main.wait_frame(main_session).unwrap();
    let overlay_state = overlay.wait_frame(session).unwrap();
    assert!(overlay_state.predicted_display_time >= main_state.predicted_display_time);

    // A strict overlay blocks until the main waits again.
    let main2 = harness.main.wait_frame(main_session).unwrap();
    let overlay2 = overlay.wait_frame(session).unwrap();
    assert!(overlay2.predicted_display_time >= main2.predicted_display_time);
    assert!(overlay2.predicted_display_time > overlay_state.predicted_display_time);
}

#[test]
fn relaxed_overlay_gets_nondecreasing_times_without_new_frames() {
    let harness = Harness::new("fm_relaxed");
    let main_session = harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("relaxed");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, true))
        .unwrap();
    begin_overlay_session(&overlay, session);

    harness.main.wait_frame(main_session).unwrap();
    let a = overlay.wait_frame(session).unwrap();
    // No new main wait-frame: the relaxed overlay is handed the same
    // frame again with a nudged prediction.
    let b = overlay.wait_frame(session).unwrap();
    assert!(b.predicted_display_time > a.predicted_display_time);
}

#[test]
fn invalid_layer_kind_rejects_whole_submission() {
    let harness = Harness::new("fm_badlayer");
    let main_session = harness.start_main_session();
    let (overlay, _flag) = harness.connect_overlay("bad");
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
    let swapchain = overlay.create_swapchain(session, &small_swapchain_info()).unwrap();

    // First, a valid cached submission.
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

    // A layer naming an unknown swapchain handle fails and clears the
    // cache.
    let err = overlay
        .end_frame(
            session,
            &FrameEndInfo {
                display_time: 0,
                blend_mode: EnvironmentBlendMode::Opaque,
                layers: vec![quad_layer(
                    space,
                    lamina::types::SwapchainHandle::from_raw(0xbad),
                    1.0,
                )],
            },
        )
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::HandleInvalid);

    let state = harness.main.wait_frame(main_session).unwrap();
    harness.main.begin_frame(main_session).unwrap();
    let (s, info) = main_frame_end(main_session, &state, vec![]);
    harness.main.end_frame(s, &info).unwrap();
    assert!(harness.runtime.last_end_frame().unwrap().layers.is_empty());
}
