//! The frame coordinator.
//!
//! The main application's wait-frame is the source of truth: every
//! result is published here with a sequence number, and overlay
//! wait-frames gate on the sequence advancing past what that overlay
//! last saw. Relaxed overlays may be handed the current frame state
//! again without waiting; the per-connection time clamp in the servicer
//! keeps their predicted times non-decreasing regardless.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::api::FrameState;

#[derive(Debug, Default)]
struct FrameShared {
    /// Number of main wait-frames completed; zero means none yet.
    seq: u64,
    state: FrameState,
}

pub struct FrameLoop {
    inner: Mutex<FrameShared>,
    cond: Condvar,
}

impl Default for FrameLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLoop {
    pub fn new() -> Self {
        FrameLoop {
            inner: Mutex::new(FrameShared::default()),
            cond: Condvar::new(),
        }
    }

    /// Publish the result of a main wait-frame and wake every gated
    /// overlay.
    pub fn publish(&self, state: FrameState) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        inner.state = state;
        self.cond.notify_all();
    }

    /// Current sequence number (0 before the first main wait-frame).
    pub fn seq(&self) -> u64 {
        self.inner.lock().seq
    }

    /// The most recently published frame state.
    pub fn current(&self) -> FrameState {
        self.inner.lock().state
    }

    /// Wait one tick for a frame newer than `last_seen`. Returns the
    /// frame when available; `None` when the tick expired (the caller
    /// re-checks its peer and loops).
    ///
    /// A relaxed caller is satisfied by the current frame as long as the
    /// main has waited at least once.
    pub fn wait_newer(
        &self,
        last_seen: u64,
        relaxed: bool,
        tick: Duration,
    ) -> Option<(u64, FrameState)> {
        let mut inner = self.inner.lock();
        if relaxed && inner.seq > 0 {
            return Some((inner.seq, inner.state));
        }
        if inner.seq > last_seen {
            return Some((inner.seq, inner.state));
        }
        self.cond.wait_for(&mut inner, tick);
        if inner.seq > last_seen || (relaxed && inner.seq > 0) {
            Some((inner.seq, inner.state))
        } else {
            None
        }
    }
}
