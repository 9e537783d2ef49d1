//! Pairing flow state machine.

/// Lifecycle state of a connection handle's pairing flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingState {
    /// Flow started, no code seen yet.
    #[default]
    New,
    /// A code is out and waiting for the owner to scan it.
    AwaitingScan,
    /// Transport reports a stable device identity.
    Connected,
    /// The network stopped issuing codes.
    Expired,
    /// The pairing stream failed.
    Error,
}

impl PairingState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - New -> AwaitingScan | Connected | Expired | Error
    /// - AwaitingScan -> AwaitingScan (rotated code) | Connected | Expired | Error
    pub fn can_transition_to(&self, target: PairingState) -> bool {
        use PairingState::*;
        matches!(
            (*self, target),
            (New, AwaitingScan)
                | (New, Connected)
                | (New, Expired)
                | (New, Error)
                | (AwaitingScan, AwaitingScan)
                | (AwaitingScan, Connected)
                | (AwaitingScan, Expired)
                | (AwaitingScan, Error)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `true` if the transition happened. Invalid transitions leave
    /// the state untouched.
    pub fn transition_to(&mut self, target: PairingState) -> bool {
        if self.can_transition_to(target) {
            *self = target;
            true
        } else {
            false
        }
    }

    /// Check if this is a terminal state. The background task of a flow in a
    /// terminal state has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingState::Connected | PairingState::Expired | PairingState::Error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = PairingState::New;
        assert!(state.transition_to(PairingState::AwaitingScan));
        assert!(state.transition_to(PairingState::AwaitingScan));
        assert!(state.transition_to(PairingState::Connected));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_identity_without_code() {
        let mut state = PairingState::New;
        assert!(state.transition_to(PairingState::Connected));
    }

    #[test]
    fn test_no_way_out_of_terminal_states() {
        for terminal in [
            PairingState::Connected,
            PairingState::Expired,
            PairingState::Error,
        ] {
            let mut state = terminal;
            assert!(!state.transition_to(PairingState::AwaitingScan));
            assert!(!state.transition_to(PairingState::New));
            assert_eq!(state, terminal);
        }
    }

    #[test]
    fn test_cannot_go_back_to_new() {
        let mut state = PairingState::AwaitingScan;
        assert!(!state.transition_to(PairingState::New));
        assert_eq!(state, PairingState::AwaitingScan);
    }

    #[test]
    fn test_default() {
        assert_eq!(PairingState::default(), PairingState::New);
        assert!(!PairingState::New.is_terminal());
        assert!(!PairingState::AwaitingScan.is_terminal());
    }
}
