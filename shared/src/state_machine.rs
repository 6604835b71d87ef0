//! Peer Lifecycle State Machine
//!
//! Defines the valid lifecycle transitions of a single strip peer and the
//! bookkeeping that drives automatic reconnection.

use std::time::Duration;

use crate::{PeerState, ReconnectPolicy};

/// Events that can trigger lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Caller (or radio recovery) asked for a fresh connect sequence
    ConnectRequested,
    /// A transport session was opened for this peer
    AttemptStarted,
    /// The transport refused to open a session (radio off, bad address)
    AttemptFailed,
    /// Transport reported the link as up
    SessionUp,
    /// Required write capability was found
    DiscoverySucceeded,
    /// Discovery failed or the capability is missing
    DiscoveryFailed,
    /// Transport reported the link as down (or the connect attempt stalled)
    SessionDown,
    /// Caller explicitly closed the peer
    ManualClose,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid; the peer is now in the given state
    Success(PeerState),
    /// Peer dropped unexpectedly and must reconnect after `delay`
    Reconnect { attempt: u32, delay: Duration },
    /// Link is up but unusable; the peer stays Connected with writes disabled
    Degraded,
    /// Event does not apply to the current state
    Invalid { from: PeerState, event: SessionEvent },
}

/// Lifecycle bookkeeping for one peer
#[derive(Debug, Clone)]
pub struct PeerLifecycle {
    state: PeerState,
    reconnect_attempts: u32,
    user_requested_close: bool,
    session_open: bool,
    write_ready: bool,
    policy: ReconnectPolicy,
}

impl Default for PeerLifecycle {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl PeerLifecycle {
    /// Create a lifecycle in Idle state
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: PeerState::Idle,
            reconnect_attempts: 0,
            user_requested_close: false,
            session_open: false,
            write_ready: false,
            policy,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn user_requested_close(&self) -> bool {
        self.user_requested_close
    }

    /// Session open and write capability discovered
    pub fn is_ready(&self) -> bool {
        self.session_open && self.write_ready
    }

    /// Guard checked whenever an automatic reconnect is about to run
    pub fn may_reconnect(&self) -> bool {
        !self.user_requested_close
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SessionEvent) -> TransitionResult {
        use PeerState::*;
        use SessionEvent::*;

        match (self.state, event) {
            (_, ConnectRequested) => {
                self.reconnect_attempts = 0;
                self.user_requested_close = false;
                TransitionResult::Success(self.state)
            }

            // A new attempt always replaces whatever session existed before
            (_, AttemptStarted) => {
                self.session_open = true;
                self.write_ready = false;
                self.enter(Connecting)
            }

            // Transport unavailable: no automatic retry
            (Connecting | Connected | Ready, AttemptFailed) => {
                self.session_open = false;
                self.write_ready = false;
                self.enter(Disconnected)
            }

            (Connecting, SessionUp) => self.enter(Connected),

            (Connected, DiscoverySucceeded) => {
                self.write_ready = true;
                self.reconnect_attempts = 0;
                self.enter(Ready)
            }
            (Connected, DiscoveryFailed) => {
                self.write_ready = false;
                TransitionResult::Degraded
            }

            (Connecting | Connected | Ready, SessionDown) => {
                self.session_open = false;
                self.write_ready = false;
                self.state = Disconnected;

                if self.user_requested_close {
                    return TransitionResult::Success(Disconnected);
                }

                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                TransitionResult::Reconnect {
                    attempt: self.reconnect_attempts,
                    delay: self.policy.delay_for(self.reconnect_attempts),
                }
            }

            (_, ManualClose) => {
                self.user_requested_close = true;
                self.reconnect_attempts = 0;
                self.session_open = false;
                self.write_ready = false;
                self.enter(Disconnected)
            }

            (from, event) => TransitionResult::Invalid { from, event },
        }
    }

    fn enter(&mut self, state: PeerState) -> TransitionResult {
        self.state = state;
        TransitionResult::Success(state)
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: PeerState, to: PeerState) -> bool {
    use PeerState::*;

    match (from, to) {
        // Same state is always valid
        (a, b) if a == b => true,

        // A fresh attempt or a manual close can happen anywhere
        (_, Connecting) | (_, Disconnected) => true,

        (Connecting, Connected) => true,
        (Connected, Ready) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_lifecycle() -> PeerLifecycle {
        let mut fsm = PeerLifecycle::default();
        fsm.process_event(SessionEvent::ConnectRequested);
        fsm.process_event(SessionEvent::AttemptStarted);
        fsm.process_event(SessionEvent::SessionUp);
        fsm.process_event(SessionEvent::DiscoverySucceeded);
        fsm
    }

    #[test]
    fn test_initial_state() {
        let fsm = PeerLifecycle::default();
        assert_eq!(fsm.state(), PeerState::Idle);
        assert_eq!(fsm.reconnect_attempts(), 0);
        assert!(!fsm.is_ready());
    }

    #[test]
    fn test_normal_connect_flow() {
        let mut fsm = PeerLifecycle::default();

        let result = fsm.process_event(SessionEvent::ConnectRequested);
        assert_eq!(result, TransitionResult::Success(PeerState::Idle));

        let result = fsm.process_event(SessionEvent::AttemptStarted);
        assert_eq!(result, TransitionResult::Success(PeerState::Connecting));
        assert!(!fsm.is_ready());

        let result = fsm.process_event(SessionEvent::SessionUp);
        assert_eq!(result, TransitionResult::Success(PeerState::Connected));
        assert!(!fsm.is_ready());

        let result = fsm.process_event(SessionEvent::DiscoverySucceeded);
        assert_eq!(result, TransitionResult::Success(PeerState::Ready));
        assert!(fsm.is_ready());
    }

    #[test]
    fn test_ready_iff_state_ready_after_every_transition() {
        let events = [
            SessionEvent::ConnectRequested,
            SessionEvent::AttemptStarted,
            SessionEvent::SessionUp,
            SessionEvent::DiscoveryFailed,
            SessionEvent::SessionDown,
            SessionEvent::AttemptStarted,
            SessionEvent::SessionUp,
            SessionEvent::DiscoverySucceeded,
            SessionEvent::AttemptStarted,
            SessionEvent::SessionUp,
            SessionEvent::DiscoverySucceeded,
            SessionEvent::SessionDown,
            SessionEvent::ManualClose,
            SessionEvent::SessionDown,
        ];

        let mut fsm = PeerLifecycle::default();
        for event in events {
            let from = fsm.state();
            fsm.process_event(event);
            assert_eq!(
                fsm.is_ready(),
                fsm.state() == PeerState::Ready,
                "readiness mismatch after {:?}",
                event
            );
            assert!(is_valid_transition(from, fsm.state()));
        }
    }

    #[test]
    fn test_discovery_failure_stays_connected() {
        let mut fsm = PeerLifecycle::default();
        fsm.process_event(SessionEvent::AttemptStarted);
        fsm.process_event(SessionEvent::SessionUp);

        let result = fsm.process_event(SessionEvent::DiscoveryFailed);
        assert_eq!(result, TransitionResult::Degraded);
        assert_eq!(fsm.state(), PeerState::Connected);
        assert!(!fsm.is_ready());
    }

    #[test]
    fn test_drop_schedules_linear_backoff() {
        let mut fsm = ready_lifecycle();

        let mut delays = Vec::new();
        for _ in 0..3 {
            match fsm.process_event(SessionEvent::SessionDown) {
                TransitionResult::Reconnect { delay, .. } => delays.push(delay.as_secs()),
                other => panic!("expected reconnect, got {:?}", other),
            }
            assert_eq!(fsm.state(), PeerState::Disconnected);
            fsm.process_event(SessionEvent::AttemptStarted);
        }

        assert_eq!(delays, vec![2, 4, 6]);
        assert_eq!(fsm.reconnect_attempts(), 3);
    }

    #[test]
    fn test_backoff_resets_after_ready() {
        let mut fsm = ready_lifecycle();
        fsm.process_event(SessionEvent::SessionDown);
        fsm.process_event(SessionEvent::AttemptStarted);
        fsm.process_event(SessionEvent::SessionDown);
        assert_eq!(fsm.reconnect_attempts(), 2);

        fsm.process_event(SessionEvent::AttemptStarted);
        fsm.process_event(SessionEvent::SessionUp);
        fsm.process_event(SessionEvent::DiscoverySucceeded);
        assert_eq!(fsm.reconnect_attempts(), 0);

        let result = fsm.process_event(SessionEvent::SessionDown);
        assert_eq!(
            result,
            TransitionResult::Reconnect {
                attempt: 1,
                delay: Duration::from_secs(2),
            }
        );
    }

    #[test]
    fn test_manual_close_suppresses_reconnect() {
        let mut fsm = ready_lifecycle();

        let result = fsm.process_event(SessionEvent::ManualClose);
        assert_eq!(result, TransitionResult::Success(PeerState::Disconnected));
        assert!(fsm.user_requested_close());
        assert!(!fsm.may_reconnect());

        // Late session-down reports from the transport are stale
        let result = fsm.process_event(SessionEvent::SessionDown);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.reconnect_attempts(), 0);
    }

    #[test]
    fn test_drop_while_closing_does_not_reconnect() {
        let mut fsm = PeerLifecycle::default();
        fsm.process_event(SessionEvent::ManualClose);
        fsm.process_event(SessionEvent::AttemptStarted);

        let result = fsm.process_event(SessionEvent::SessionDown);
        assert_eq!(result, TransitionResult::Success(PeerState::Disconnected));
    }

    #[test]
    fn test_connect_clears_user_close() {
        let mut fsm = ready_lifecycle();
        fsm.process_event(SessionEvent::ManualClose);

        fsm.process_event(SessionEvent::ConnectRequested);
        assert!(fsm.may_reconnect());
        assert_eq!(fsm.reconnect_attempts(), 0);
    }

    #[test]
    fn test_failed_attempt_does_not_reconnect() {
        let mut fsm = ready_lifecycle();

        let result = fsm.process_event(SessionEvent::AttemptFailed);
        assert_eq!(result, TransitionResult::Success(PeerState::Disconnected));
        assert_eq!(fsm.reconnect_attempts(), 0);
        assert!(!fsm.is_ready());

        // Nothing was open, so nothing changes
        let mut idle = PeerLifecycle::default();
        let result = idle.process_event(SessionEvent::AttemptFailed);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(idle.state(), PeerState::Idle);
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = PeerLifecycle::default();

        // Can't discover before the link is up
        let result = fsm.process_event(SessionEvent::DiscoverySucceeded);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), PeerState::Idle);

        let result = fsm.process_event(SessionEvent::SessionUp);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }
}
