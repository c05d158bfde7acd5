//! Node boot sequencing as an explicit state machine.
//!
//! ```text
//! Booting ──Started──► Connecting ──PeersConnected──► CatchingUp ──CatchupFinished──► Running
//!                          │                              │
//!                          └──NoPeers──► Running          └──CatchupFailed──► Connecting
//!
//! any live state ──ShutdownRequested──► ShuttingDown ──Halted──► Stopped
//! ```
//!
//! Transitions live in one table keyed by `(state, event)`. Anything not in
//! the table is an error and leaves the state unchanged.

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Booting,
    Connecting,
    CatchingUp,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    Started,
    PeersConnected,
    NoPeers,
    CatchupFinished,
    CatchupFailed,
    ShutdownRequested,
    Halted,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no transition from {state:?} on {event:?}")]
pub struct LifecycleError {
    pub state: NodeState,
    pub event: NodeEvent,
}

use NodeEvent as E;
use NodeState as S;

const TRANSITIONS: &[(NodeState, NodeEvent, NodeState)] = &[
    (S::Booting, E::Started, S::Connecting),
    (S::Connecting, E::PeersConnected, S::CatchingUp),
    (S::Connecting, E::NoPeers, S::Running),
    (S::CatchingUp, E::CatchupFinished, S::Running),
    (S::CatchingUp, E::CatchupFailed, S::Connecting),
    // A running node that falls behind goes back through catchup.
    (S::Running, E::PeersConnected, S::CatchingUp),
    (S::Booting, E::ShutdownRequested, S::ShuttingDown),
    (S::Connecting, E::ShutdownRequested, S::ShuttingDown),
    (S::CatchingUp, E::ShutdownRequested, S::ShuttingDown),
    (S::Running, E::ShutdownRequested, S::ShuttingDown),
    (S::ShuttingDown, E::Halted, S::Stopped),
];

pub fn next_state(state: NodeState, event: NodeEvent) -> Option<NodeState> {
    TRANSITIONS
        .iter()
        .find(|(from, on, _)| *from == state && *on == event)
        .map(|(_, _, to)| *to)
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<NodeState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NodeState::Booting),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn fire(&self, event: NodeEvent) -> Result<NodeState, LifecycleError> {
        let mut state = self.state.lock();
        let next = next_state(*state, event).ok_or(LifecycleError {
            state: *state,
            event,
        })?;
        info!(from = ?*state, to = ?next, ?event, "node state change");
        *state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let lc = Lifecycle::new();
        assert_eq!(lc.fire(E::Started), Ok(S::Connecting));
        assert_eq!(lc.fire(E::PeersConnected), Ok(S::CatchingUp));
        assert_eq!(lc.fire(E::CatchupFinished), Ok(S::Running));
        assert_eq!(lc.fire(E::ShutdownRequested), Ok(S::ShuttingDown));
        assert_eq!(lc.fire(E::Halted), Ok(S::Stopped));
    }

    #[test]
    fn lonely_node_goes_straight_to_running() {
        let lc = Lifecycle::new();
        lc.fire(E::Started).unwrap();
        assert_eq!(lc.fire(E::NoPeers), Ok(S::Running));
    }

    #[test]
    fn failed_catchup_retries_connecting() {
        let lc = Lifecycle::new();
        lc.fire(E::Started).unwrap();
        lc.fire(E::PeersConnected).unwrap();
        assert_eq!(lc.fire(E::CatchupFailed), Ok(S::Connecting));
    }

    #[test]
    fn invalid_event_keeps_state() {
        let lc = Lifecycle::new();
        let err = lc.fire(E::CatchupFinished).unwrap_err();
        assert_eq!(
            err,
            LifecycleError {
                state: S::Booting,
                event: E::CatchupFinished
            }
        );
        assert_eq!(lc.state(), S::Booting);
    }

    #[test]
    fn stopped_is_terminal() {
        for event in [
            E::Started,
            E::PeersConnected,
            E::NoPeers,
            E::CatchupFinished,
            E::CatchupFailed,
            E::ShutdownRequested,
            E::Halted,
        ] {
            assert_eq!(next_state(S::Stopped, event), None);
        }
    }
}
