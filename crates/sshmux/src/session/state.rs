//! Session lifecycle states.

use std::fmt;

/// Unique identifier for a session.
pub type SessionId = String;

/// Lifecycle state of a remote-shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Registered, not yet dialed.
    Created,
    /// The connector is authenticating and negotiating the shell.
    Connecting,
    /// Connected and selected: receives keystrokes, output is displayed.
    Active,
    /// Connected but in the background.
    Idle,
    /// Connection or I/O failure; only `Closed` may follow.
    Error,
    /// Terminal state. Handles are released and never reused.
    Closed,
}

impl SessionState {
    /// Returns whether moving from `self` to `next` is a legal transition.
    ///
    /// Staying `Closed` is accepted so that repeated closes are no-ops.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Closed, Closed) => true,
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, Connecting) => true,
            (Connecting, Idle) | (Connecting, Error) => true,
            (Active, Idle) | (Active, Error) => true,
            (Idle, Active) | (Idle, Error) => true,
            _ => false,
        }
    }

    /// Connected states always hold transport and I/O handles.
    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Idle)
    }

    /// `Error` and `Closed` end output forwarding.
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    /// Lowercase name used in listings and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    const ALL: [SessionState; 6] = [Created, Connecting, Active, Idle, Error, Closed];

    #[test]
    fn test_forward_transitions() {
        assert!(Created.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Idle));
        assert!(Connecting.can_transition_to(Error));
        assert!(Active.can_transition_to(Idle));
        assert!(Active.can_transition_to(Error));
        assert!(Idle.can_transition_to(Active));
        assert!(Error.can_transition_to(Closed));
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in ALL {
            assert_eq!(Closed.can_transition_to(next), next == Closed);
        }
    }

    #[test]
    fn test_every_open_state_can_close() {
        for state in ALL {
            assert!(state.can_transition_to(Closed), "{state} -> closed");
        }
    }

    #[test]
    fn test_error_has_no_retry() {
        assert!(!Error.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Active));
        assert!(!Error.can_transition_to(Idle));
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!Created.can_transition_to(Active));
        assert!(!Created.can_transition_to(Idle));
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Active.can_transition_to(Connecting));
    }

    #[test]
    fn test_ready_and_finished() {
        assert!(Active.is_ready());
        assert!(Idle.is_ready());
        assert!(!Connecting.is_ready());
        assert!(Error.is_finished());
        assert!(Closed.is_finished());
        assert!(!Idle.is_finished());
    }

    #[test]
    fn test_display() {
        assert_eq!(Active.to_string(), "active");
        assert_eq!(Connecting.to_string(), "connecting");
    }
}
