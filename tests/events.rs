//! Event fan-out: overlay sessions see their own synthesized lifecycle,
//! instance-wide events are replayed to every overlay, and queue
//! overflow surfaces as an events-lost record.

mod support;

use lamina::api::*;
use lamina::runtime::CompositorRuntime;

use support::*;

fn drain_main_events(harness: &Harness) {
    while harness.main.poll_event().unwrap().is_some() {}
}

fn poll_states(overlay: &lamina::OverlayRuntime, limit: usize) -> Vec<SessionState> {
    let mut states = Vec::new();
    for _ in 0..limit {
        match overlay.poll_event().unwrap() {
            Some(EventData::SessionStateChanged { state, .. }) => states.push(state),
            Some(_) => {}
            None => break,
        }
    }
    states
}

#[test]
fn overlay_lifecycle_is_synthesized_from_the_arbiter() {
    let harness = Harness::new("ev_lifecycle");
    harness.start_main_session();
    // Push the mock's main-session state events through the layer so
    // the tracker target advances to focused.
    drain_main_events(&harness);

    let (overlay, _flag) = harness.connect_overlay("lifecycle");
    let session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();

    // Not yet begun: the session climbs to ready and stops.
    assert_eq!(
        poll_states(&overlay, 8),
        vec![SessionState::Idle, SessionState::Ready]
    );

    begin_overlay_session(&overlay, session);
    assert_eq!(
        poll_states(&overlay, 8),
        vec![
            SessionState::Synchronized,
            SessionState::Visible,
            SessionState::Focused
        ]
    );

    // Steady state: no more events.
    assert!(overlay.poll_event().unwrap().is_none());

    // The overlay's own exit request descends through stopping.
    overlay.request_exit_session(session).unwrap();
    assert_eq!(
        poll_states(&overlay, 8),
        vec![SessionState::Stopping, SessionState::Exiting]
    );
}

#[test]
fn instance_scoped_events_reach_overlays() {
    let harness = Harness::new("ev_instance");
    harness.start_main_session();
    drain_main_events(&harness);
    let (overlay, _flag) = harness.connect_overlay("listener");
    let _session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();
    // Skip the synthesized idle/ready pair.
    poll_states(&overlay, 4);

    harness.runtime.push_event(EventData::InstanceLossPending { loss_time: 777 });
    // The main application polls, which fans the event out.
    let main_seen = harness.main.poll_event().unwrap();
    assert_eq!(
        main_seen,
        Some(EventData::InstanceLossPending { loss_time: 777 })
    );

    let overlay_seen = overlay.poll_event().unwrap();
    assert_eq!(
        overlay_seen,
        Some(EventData::InstanceLossPending { loss_time: 777 })
    );
}

#[test]
fn queue_overflow_reports_lost_events() {
    let harness = Harness::new("ev_overflow");
    harness.start_main_session();
    drain_main_events(&harness);
    let (overlay, _flag) = harness.connect_overlay("flooded");
    let _session = overlay
        .create_session(&overlay_session_info(&harness.device, 0, false))
        .unwrap();

    // Flood past the 16-entry bound with non-critical events.
    for i in 0..20 {
        harness
            .runtime
            .push_event(EventData::ReferenceSpaceChangePending {
                session: lamina::types::SessionHandle::from_raw(0xfeed),
                kind: ReferenceSpaceKind::Local,
                change_time: i,
            });
    }
    while harness.main.poll_event().unwrap().is_some() {}

    let first = overlay.poll_event().unwrap();
    assert_eq!(first, Some(EventData::EventsLost { count: 4 }));
}
