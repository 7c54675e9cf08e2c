//! Session lifecycle state machine.
//!
//! ```text
//! INITIATED -> DISPATCHING -> IN_PROGRESS -> EXHAUSTED -> COMPLETE -> FINALIZED
//!                                  \______________________/^
//! FAILED is reachable from every non-terminal state.
//! ```
//!
//! Exhaustion (every worker told to stop) and completion (every index
//! reported) are independent milestones, so COMPLETE may be reached straight
//! from DISPATCHING or IN_PROGRESS. A transition that is not listed in
//! [`SessionStatus::valid_transitions`] is rejected; callers treat a
//! rejected forward move (e.g. EXHAUSTED after COMPLETE) as a no-op.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initiated,
    Dispatching,
    InProgress,
    Exhausted,
    Complete,
    Finalized,
    Failed,
}

impl SessionStatus {
    /// Returns the set of states reachable from `self` in one step.
    ///
    /// Terminal states (Finalized, Failed) return an empty slice.
    pub fn valid_transitions(self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            Initiated => &[Dispatching, Failed],
            Dispatching => &[InProgress, Exhausted, Complete, Failed],
            InProgress => &[Exhausted, Complete, Failed],
            Exhausted => &[Complete, Failed],
            Complete => &[Finalized, Failed],
            Finalized | Failed => &[],
        }
    }

    /// Check whether a transition from `self` to `to` is valid.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Finalized and Failed sessions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Finalized | SessionStatus::Failed)
    }

    /// Whether new units may still be handed out for this session.
    pub fn accepts_dispatch(self) -> bool {
        matches!(
            self,
            SessionStatus::Dispatching | SessionStatus::InProgress | SessionStatus::Exhausted
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionStatus::Initiated => "INITIATED",
            SessionStatus::Dispatching => "DISPATCHING",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Exhausted => "EXHAUSTED",
            SessionStatus::Complete => "COMPLETE",
            SessionStatus::Finalized => "FINALIZED",
            SessionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::SessionStatus::*;
    use super::*;

    const ALL: [SessionStatus; 7] = [
        Initiated,
        Dispatching,
        InProgress,
        Exhausted,
        Complete,
        Finalized,
        Failed,
    ];

    #[test]
    fn happy_path_is_valid() {
        let path = [Initiated, Dispatching, InProgress, Exhausted, Complete, Finalized];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn complete_may_precede_exhaustion() {
        assert!(InProgress.can_transition(Complete));
        assert!(!Complete.can_transition(Exhausted));
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        for status in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition(Failed), "{status} -> FAILED");
        }
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(Finalized.valid_transitions().is_empty());
        assert!(Failed.valid_transitions().is_empty());
    }

    #[test]
    fn no_backwards_transitions() {
        assert!(!InProgress.can_transition(Dispatching));
        assert!(!Complete.can_transition(InProgress));
        assert!(!Finalized.can_transition(Complete));
    }

    #[test]
    fn only_active_states_accept_dispatch() {
        let accepting: Vec<_> = ALL.into_iter().filter(|s| s.accepts_dispatch()).collect();
        assert_eq!(accepting, vec![Dispatching, InProgress, Exhausted]);
    }
}
