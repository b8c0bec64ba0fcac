//! Conversation history: user instructions and the agent turns answering them.
//!
//! Agent turns only change by folding stream events over them in delivery
//! order (`AgentTurn::apply`). Once a terminal event has been applied the
//! turn is frozen.

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::Action;
use crate::stream::StreamEvent;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub thinking: String,
    pub action: Action,
    pub step_success: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTurn {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub final_content: Option<String>,
    pub final_success: Option<bool>,
    pub streaming: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User {
        id: String,
        timestamp: DateTime<Utc>,
        content: String,
    },
    Agent(AgentTurn),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("no agent turn with id {0}")]
    UnknownTurn(String),
    #[error("turn {0} is no longer streaming")]
    Closed(String),
    #[error("step {got} out of order, expected {expected}")]
    OutOfOrder { expected: usize, got: usize },
}

impl AgentTurn {
    fn new() -> Self {
        Self {
            id: nanoid!(),
            timestamp: Utc::now(),
            steps: Vec::new(),
            final_content: None,
            final_success: None,
            streaming: true,
        }
    }

    pub fn apply(&mut self, event: &StreamEvent) -> Result<(), HistoryError> {
        if !self.streaming {
            return Err(HistoryError::Closed(self.id.clone()));
        }
        match event {
            StreamEvent::Step { step, thinking, action, success, .. } => {
                let expected = self.steps.len() + 1;
                if *step != expected {
                    return Err(HistoryError::OutOfOrder { expected, got: *step });
                }
                self.steps.push(StepRecord {
                    index: *step,
                    thinking: thinking.clone(),
                    action: action.clone(),
                    step_success: *success,
                });
            }
            StreamEvent::Done { message, success, .. } => {
                self.final_content = Some(message.clone());
                self.final_success = Some(*success);
                self.streaming = false;
            }
            StreamEvent::Error { message } => {
                self.final_content = Some(message.clone());
                self.final_success = Some(false);
                self.streaming = false;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> String {
        let id = nanoid!();
        self.turns.push(Turn::User {
            id: id.clone(),
            timestamp: Utc::now(),
            content: content.into(),
        });
        id
    }

    /// Opens an empty, streaming agent turn and returns its id.
    pub fn open_agent_turn(&mut self) -> String {
        let turn = AgentTurn::new();
        let id = turn.id.clone();
        self.turns.push(Turn::Agent(turn));
        id
    }

    pub fn apply(&mut self, turn_id: &str, event: &StreamEvent) -> Result<(), HistoryError> {
        self.agent_turn_mut(turn_id)
            .ok_or_else(|| HistoryError::UnknownTurn(turn_id.to_string()))?
            .apply(event)
    }

    pub fn agent_turn(&self, turn_id: &str) -> Option<&AgentTurn> {
        self.turns.iter().rev().find_map(|t| match t {
            Turn::Agent(turn) if turn.id == turn_id => Some(turn),
            _ => None,
        })
    }

    fn agent_turn_mut(&mut self, turn_id: &str) -> Option<&mut AgentTurn> {
        self.turns.iter_mut().rev().find_map(|t| match t {
            Turn::Agent(turn) if turn.id == turn_id => Some(turn),
            _ => None,
        })
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
