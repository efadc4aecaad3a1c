//! Peer lifecycle state machine
//!
//! ```text
//! NotConnected ──► ConnectedToService ──► ConnectedToPeers
//!      │                                        ▲
//!      └────────────── (direct connect) ────────┘
//! ```
//!
//! The state lives in a single atomic and only moves through
//! compare-and-swap, so two racing callers can never both win a transition.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

// ============================================================================
// Peer State
// ============================================================================

/// Lifecycle state of the local peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerState {
    /// Transport not started
    NotConnected = 0,
    /// Rendezvous connection to the service node is open
    ConnectedToService = 1,
    /// Direct peer links are being established or are live
    ConnectedToPeers = 2,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PeerState::ConnectedToService,
            2 => PeerState::ConnectedToPeers,
            _ => PeerState::NotConnected,
        }
    }

    /// Whether `self → to` is an edge of the state machine
    pub fn can_transition_to(self, to: PeerState) -> bool {
        matches!(
            (self, to),
            (PeerState::NotConnected, PeerState::ConnectedToService)
                | (PeerState::ConnectedToService, PeerState::ConnectedToPeers)
                | (PeerState::NotConnected, PeerState::ConnectedToPeers)
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::NotConnected => write!(f, "not connected"),
            PeerState::ConnectedToService => write!(f, "connected to service"),
            PeerState::ConnectedToPeers => write!(f, "connected to peers"),
        }
    }
}

// ============================================================================
// Atomic Cell
// ============================================================================

/// Atomically updated [`PeerState`]
#[derive(Debug)]
pub struct PeerStateCell {
    state: AtomicU8,
}

impl PeerStateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PeerState::NotConnected as u8),
        }
    }

    /// Current state
    pub fn get(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from → to` if the cell currently holds `from`
    ///
    /// Returns the state observed before the attempt. Illegal edges are
    /// refused without touching the cell.
    pub fn transition(&self, from: PeerState, to: PeerState) -> Result<(), PeerState> {
        if !from.can_transition_to(to) {
            return Err(self.get());
        }

        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(PeerState::from_u8)
    }

    /// Undo a transition whose follow-up work failed
    ///
    /// Only succeeds if nobody moved the state in between.
    pub fn rollback(&self, applied: PeerState, previous: PeerState) -> bool {
        self.state
            .compare_exchange(
                applied as u8,
                previous as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for PeerStateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_initial_state() {
        assert_eq!(PeerStateCell::new().get(), PeerState::NotConnected);
    }

    #[test]
    fn test_legal_edges() {
        let cell = PeerStateCell::new();
        assert!(cell
            .transition(PeerState::NotConnected, PeerState::ConnectedToService)
            .is_ok());
        assert!(cell
            .transition(PeerState::ConnectedToService, PeerState::ConnectedToPeers)
            .is_ok());
        assert_eq!(cell.get(), PeerState::ConnectedToPeers);

        let direct = PeerStateCell::new();
        assert!(direct
            .transition(PeerState::NotConnected, PeerState::ConnectedToPeers)
            .is_ok());
    }

    #[test]
    fn test_illegal_edges_refused() {
        let cell = PeerStateCell::new();
        cell.transition(PeerState::NotConnected, PeerState::ConnectedToService)
            .unwrap();

        assert_eq!(
            cell.transition(PeerState::ConnectedToService, PeerState::NotConnected),
            Err(PeerState::ConnectedToService)
        );
        assert_eq!(
            cell.transition(PeerState::ConnectedToPeers, PeerState::ConnectedToService),
            Err(PeerState::ConnectedToService)
        );
        assert_eq!(cell.get(), PeerState::ConnectedToService);
    }

    #[test]
    fn test_wrong_source_state_reports_actual() {
        let cell = PeerStateCell::new();
        assert_eq!(
            cell.transition(PeerState::ConnectedToService, PeerState::ConnectedToPeers),
            Err(PeerState::NotConnected)
        );
    }

    #[test]
    fn test_rollback() {
        let cell = PeerStateCell::new();
        cell.transition(PeerState::NotConnected, PeerState::ConnectedToService)
            .unwrap();

        assert!(cell.rollback(PeerState::ConnectedToService, PeerState::NotConnected));
        assert_eq!(cell.get(), PeerState::NotConnected);
        assert!(!cell.rollback(PeerState::ConnectedToService, PeerState::NotConnected));
    }

    #[test]
    fn test_concurrent_transition_single_winner() {
        let cell = Arc::new(PeerStateCell::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    cell.transition(PeerState::NotConnected, PeerState::ConnectedToService)
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(cell.get(), PeerState::ConnectedToService);
    }
}
