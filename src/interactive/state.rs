use std::fmt;

use serde::{Deserialize, Serialize};

use super::EndReason;
use crate::model::JobStatus;

/// Where a conversation turn currently stands.
///
/// A turn flows AWAITING_USER_INPUT → SUBMITTED → POLLING → RESPONDED, FAILED
/// or TIMED_OUT, and from there back to AWAITING_USER_INPUT, to SUBMITTED on
/// retry, or to ENDED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    AwaitingUserInput,
    Submitted,
    Polling,
    Responded,
    Failed,
    TimedOut,
    Ended,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::AwaitingUserInput => write!(f, "AWAITING_USER_INPUT"),
            TurnState::Submitted => write!(f, "SUBMITTED"),
            TurnState::Polling => write!(f, "POLLING"),
            TurnState::Responded => write!(f, "RESPONDED"),
            TurnState::Failed => write!(f, "FAILED"),
            TurnState::TimedOut => write!(f, "TIMED_OUT"),
            TurnState::Ended => write!(f, "ENDED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// The user supplied the next message.
    UserMessage,
    /// The service accepted the job.
    JobSubmitted,
    /// Posting or submitting was rejected before a job existed.
    SubmitFailed,
    /// The job reached this status.
    JobSettled(JobStatus),
    /// The user wants another message after a response.
    Continue,
    /// The user asked to run the last message again.
    Retry,
    Exit(EndReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(TurnState),
    /// The event does not apply in the current state; nothing changed.
    Rejected { state: TurnState, event: TurnEvent },
    End(EndReason),
}

/// Drives one interactive session through its turn states.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: TurnState,
    history: Vec<TurnState>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: TurnState::AwaitingUserInput,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Every state left so far, oldest first.
    pub fn history(&self) -> &[TurnState] {
        &self.history
    }

    pub fn is_ended(&self) -> bool {
        self.state == TurnState::Ended
    }

    pub fn apply(&mut self, event: TurnEvent) -> Transition {
        use TurnState::*;

        let transition = match (self.state, event) {
            (Ended, _) => Transition::Rejected {
                state: Ended,
                event,
            },
            (_, TurnEvent::Exit(reason)) => Transition::End(reason),
            (AwaitingUserInput, TurnEvent::UserMessage) => Transition::Next(Submitted),
            (Submitted, TurnEvent::JobSubmitted) => Transition::Next(Polling),
            (Submitted, TurnEvent::SubmitFailed) => Transition::Next(Failed),
            (Polling, TurnEvent::JobSettled(status)) => Transition::Next(match status {
                JobStatus::Completed => Responded,
                JobStatus::TimedOut => TimedOut,
                _ => Failed,
            }),
            (Responded, TurnEvent::Continue) => Transition::Next(AwaitingUserInput),
            (Failed | TimedOut, TurnEvent::Retry) => Transition::Next(Submitted),
            (state, event) => Transition::Rejected { state, event },
        };

        match transition {
            Transition::Next(next) => {
                self.history.push(self.state);
                self.state = next;
            }
            Transition::End(_) => {
                self.history.push(self.state);
                self.state = Ended;
            }
            Transition::Rejected { .. } => {}
        }
        transition
    }
}
