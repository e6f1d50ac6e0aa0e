use thiserror::Error;

/// Phases of a single wait for a launched server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Listening,
    Resolving,
    Connected,
    TimedOut,
    Crashed,
    Cancelled,
    /// The server announced itself but could not be looked up.
    Unresolved,
}

impl WaitState {
    /// Settled states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WaitState::Connected
                | WaitState::TimedOut
                | WaitState::Crashed
                | WaitState::Cancelled
                | WaitState::Unresolved
        )
    }
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(WaitState, WaitState),
}

pub struct StateMachine {
    pub state: WaitState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: WaitState::Listening }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: &WaitState) -> bool {
        matches!(
            (&self.state, to),
            (WaitState::Listening, WaitState::Resolving)
                | (WaitState::Listening, WaitState::TimedOut)
                | (WaitState::Listening, WaitState::Crashed)
                | (WaitState::Listening, WaitState::Cancelled)
                | (WaitState::Resolving, WaitState::Connected)
                | (WaitState::Resolving, WaitState::TimedOut)
                | (WaitState::Resolving, WaitState::Crashed)
                | (WaitState::Resolving, WaitState::Cancelled)
                | (WaitState::Resolving, WaitState::Unresolved)
        )
    }

    pub fn transition(&mut self, to: WaitState) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::info!("Wait state transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
