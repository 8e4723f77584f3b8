//! Multi-turn research conversation with a single agent.
//!
//! One session handle (from the session store) carries the whole
//! conversation. Each turn posts a user message, runs one job and then asks
//! the user how to continue.

mod controller;
mod state;

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Citation, Metrics};

pub use controller::{InteractiveController, InteractiveSettings, Prompter, SavedSession};
pub use state::{SessionMachine, Transition, TurnEvent, TurnState};

static CLARIFICATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"could you (please )?clarify",
        r"could you (please )?specify",
        r"which .* do you mean",
        r"what (specific|particular) .* are you (interested|looking)",
        r"please provide (more|additional) (information|details|context)",
        r"to better assist you",
        r"would you like me to focus on",
        r"are you (asking|looking for|interested in)",
        r"did you mean",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("clarification pattern compiles"))
    .collect()
});

/// True when the agent's reply reads as a question back to the user.
pub fn is_clarification_request(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.ends_with('?') {
        return true;
    }
    let lower = trimmed.to_lowercase();
    CLARIFICATION_PATTERNS.iter().any(|re| re.is_match(&lower))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
    System,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "USER"),
            Speaker::Agent => write!(f, "AGENT"),
            Speaker::System => write!(f, "SYSTEM"),
        }
    }
}

/// Why a turn was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Question,
    ClarificationAnswer,
    FollowUp,
    Continuation,
    Response,
    Error,
}

impl fmt::Display for TurnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnKind::Question => "question",
            TurnKind::ClarificationAnswer => "clarification answer",
            TurnKind::FollowUp => "follow-up",
            TurnKind::Continuation => "continuation",
            TurnKind::Response => "response",
            TurnKind::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub kind: TurnKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl TranscriptTurn {
    pub fn user(content: impl Into<String>, kind: TurnKind) -> Self {
        Self {
            speaker: Speaker::User,
            kind,
            content: content.into(),
            citations: Vec::new(),
        }
    }

    pub fn agent(content: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            speaker: Speaker::Agent,
            kind: TurnKind::Response,
            content: content.into(),
            citations,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::System,
            kind: TurnKind::Error,
            content: content.into(),
            citations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserExit,
    BudgetExhausted,
    InputClosed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::UserExit => write!(f, "ended by user"),
            EndReason::BudgetExhausted => write!(f, "session time budget exhausted"),
            EndReason::InputClosed => write!(f, "input closed"),
        }
    }
}

/// Everything persisted when a session ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTranscript {
    pub session_key: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: EndReason,
    pub turns: Vec<TranscriptTurn>,
    pub metrics: Metrics,
    pub citations: Vec<Citation>,
}

impl SessionTranscript {
    /// The first question asked, if any.
    pub fn initial_question(&self) -> Option<&str> {
        self.turns
            .iter()
            .find(|t| t.kind == TurnKind::Question)
            .map(|t| t.content.as_str())
    }

    pub fn responses(&self) -> impl Iterator<Item = &TranscriptTurn> {
        self.turns.iter().filter(|t| t.kind == TurnKind::Response)
    }
}
