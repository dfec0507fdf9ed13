//! Session lifecycle tracking for overlay sessions.
//!
//! An overlay session is a façade over the main session: it has no
//! runtime state of its own, but its owner still expects the normal
//! lifecycle (idle, ready, synchronized, visible, focused, and the
//! stopping/loss/exiting terminations). The tracker follows the main
//! session's surfaced state one step per poll, with the overlay's own
//! begin/end/exit commands and the loss state layered on top.

use crate::api::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossState {
    NotLost,
    LossPending,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Begin,
    End,
    RequestExit,
}

#[derive(Debug, Clone)]
pub struct SessionStateTracker {
    pub loss: LossState,
    pub state: SessionState,
    pub running: bool,
    pub exit_requested: bool,
}

impl Default for SessionStateTracker {
    fn default() -> Self {
        SessionStateTracker {
            loss: LossState::NotLost,
            state: SessionState::Unknown,
            running: false,
            exit_requested: false,
        }
    }
}

fn rank(state: SessionState) -> Option<u8> {
    Some(match state {
        SessionState::Idle => 1,
        SessionState::Ready => 2,
        SessionState::Synchronized => 3,
        SessionState::Visible => 4,
        SessionState::Focused => 5,
        _ => return None,
    })
}

fn from_rank(r: u8) -> SessionState {
    match r {
        1 => SessionState::Idle,
        2 => SessionState::Ready,
        3 => SessionState::Synchronized,
        4 => SessionState::Visible,
        _ => SessionState::Focused,
    }
}

impl SessionStateTracker {
    pub fn apply_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Begin => self.running = true,
            SessionCommand::End => self.running = false,
            SessionCommand::RequestExit => self.exit_requested = true,
        }
    }

    pub fn mark_loss_pending(&mut self) {
        if self.loss == LossState::NotLost {
            self.loss = LossState::LossPending;
        }
    }

    pub fn mark_lost(&mut self) {
        self.loss = LossState::Lost;
    }

    /// The next state change to surface to the overlay, if any. Walks
    /// one valid edge per call: up or down the idle→focused ladder
    /// toward the main session's state, or into the stopping/exiting
    /// terminations when an exit was requested or the session was lost.
    pub fn pending_state_change(&mut self, main_state: SessionState) -> Option<SessionState> {
        // Terminations win over ladder movement.
        if self.loss == LossState::Lost || self.exit_requested {
            let next = match self.state {
                SessionState::Exiting => return None,
                SessionState::Stopping => SessionState::Exiting,
                _ if self.running => SessionState::Stopping,
                _ => SessionState::Exiting,
            };
            self.state = next;
            return Some(next);
        }

        let target = match rank(main_state) {
            Some(r) => r,
            // Main is stopping or lost; the overlay follows it down.
            None => match main_state {
                SessionState::Stopping | SessionState::Exiting | SessionState::LossPending => {
                    let next = match self.state {
                        SessionState::Exiting => return None,
                        SessionState::Stopping => SessionState::Exiting,
                        _ => SessionState::Stopping,
                    };
                    self.state = next;
                    return Some(next);
                }
                _ => return None,
            },
        };

        let current = rank(self.state).unwrap_or(0);
        // An overlay that has not begun its session never advances past
        // ready.
        let ceiling = if self.running { target } else { target.min(2) };
        if current < ceiling {
            let next = from_rank(current + 1);
            self.state = next;
            Some(next)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(tracker: &mut SessionStateTracker, main: SessionState) -> Vec<SessionState> {
        let mut out = Vec::new();
        while let Some(s) = tracker.pending_state_change(main) {
            out.push(s);
        }
        out
    }

    #[test]
    fn climbs_the_ladder_toward_main() {
        let mut t = SessionStateTracker::default();
        // Not yet begun: stops at ready even though main is focused.
        assert_eq!(
            drain(&mut t, SessionState::Focused),
            vec![SessionState::Idle, SessionState::Ready]
        );
        t.apply_command(SessionCommand::Begin);
        assert_eq!(
            drain(&mut t, SessionState::Focused),
            vec![
                SessionState::Synchronized,
                SessionState::Visible,
                SessionState::Focused
            ]
        );
        // Steady state: nothing more to surface.
        assert!(t.pending_state_change(SessionState::Focused).is_none());
    }

    #[test]
    fn exit_request_descends_through_stopping() {
        let mut t = SessionStateTracker::default();
        t.apply_command(SessionCommand::Begin);
        drain(&mut t, SessionState::Focused);
        t.apply_command(SessionCommand::RequestExit);
        assert_eq!(
            drain(&mut t, SessionState::Focused),
            vec![SessionState::Stopping, SessionState::Exiting]
        );
    }

    #[test]
    fn follows_main_down_when_main_stops() {
        let mut t = SessionStateTracker::default();
        t.apply_command(SessionCommand::Begin);
        drain(&mut t, SessionState::Focused);
        assert_eq!(
            drain(&mut t, SessionState::Stopping),
            vec![SessionState::Stopping, SessionState::Exiting]
        );
    }

    #[test]
    fn loss_terminates_even_when_idle() {
        let mut t = SessionStateTracker::default();
        drain(&mut t, SessionState::Idle);
        t.mark_lost();
        assert_eq!(
            drain(&mut t, SessionState::Idle),
            vec![SessionState::Exiting]
        );
    }
}
