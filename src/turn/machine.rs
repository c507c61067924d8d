// Conversation turn-taking state machine
//
// Idle -> UserSpeaking -> AwaitingModel -> ModelStreaming -> TurnComplete -> Idle
// with AwaitingModel/ModelStreaming -> Interrupted -> Idle, and Closed/Error
// reachable from anywhere. TurnComplete and Interrupted are pass-through
// states; the machine settles in Idle after either.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info};

use super::turn::{Part, Role, Turn};

const TRACE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    UserSpeaking,
    AwaitingModel,
    ModelStreaming,
    TurnComplete,
    Interrupted,
    Closed,
    Error,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Closed | TurnState::Error)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid turn transition from {from:?} on {event}")]
pub struct TransitionError {
    pub from: TurnState,
    pub event: &'static str,
}

pub struct TurnStateMachine {
    state: TurnState,
    next_ordinal: u64,
    open: Option<Turn>,
    trace: VecDeque<TurnState>,
    completed: u64,
    interrupted: u64,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnStateMachine {
    pub fn new() -> Self {
        let mut trace = VecDeque::with_capacity(TRACE_LEN);
        trace.push_back(TurnState::Idle);
        Self {
            state: TurnState::Idle,
            next_ordinal: 0,
            open: None,
            trace,
            completed: 0,
            interrupted: 0,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn open_turn(&self) -> Option<&Turn> {
        self.open.as_ref()
    }

    /// Recently visited states, oldest first
    pub fn trace(&self) -> impl Iterator<Item = &TurnState> {
        self.trace.iter()
    }

    pub fn completed_turns(&self) -> u64 {
        self.completed
    }

    pub fn interrupted_turns(&self) -> u64 {
        self.interrupted
    }

    /// Capture started or a text message is being sent.
    ///
    /// While the model is streaming the user's input does not change the
    /// state; the backend signals barge-in with `interrupted`.
    pub fn user_input_started(&mut self, text: Option<&str>) -> Result<(), TransitionError> {
        self.ensure_live("user_input_started")?;

        match self.state {
            TurnState::Idle | TurnState::AwaitingModel => {
                let ordinal = self.take_ordinal();
                let mut turn = Turn::new(ordinal, Role::User);
                if let Some(text) = text {
                    turn.parts.push(Part::Text(text.to_string()));
                }
                self.open = Some(turn);
                self.transition(TurnState::UserSpeaking);
            }
            TurnState::UserSpeaking => {
                if let (Some(turn), Some(text)) = (self.open.as_mut(), text) {
                    turn.parts.push(Part::Text(text.to_string()));
                }
            }
            _ => debug!("User input while {:?}, state unchanged", self.state),
        }
        Ok(())
    }

    /// The user's input has been fully transmitted. Returns the finished user turn.
    pub fn user_input_transmitted(&mut self) -> Option<Turn> {
        if self.state != TurnState::UserSpeaking {
            return None;
        }
        let turn = self.close_user_turn();
        self.transition(TurnState::AwaitingModel);
        turn
    }

    /// A model part arrived. Returns the ordinal of the model turn it joined.
    pub fn model_part(&mut self, part: Part) -> Result<u64, TransitionError> {
        self.ensure_live("model_part")?;

        // Server-side voice detection can answer before input is marked done
        if self.state == TurnState::UserSpeaking {
            self.close_user_turn();
            self.transition(TurnState::AwaitingModel);
        }
        if self.state == TurnState::Idle {
            self.transition(TurnState::AwaitingModel);
        }

        if self.state == TurnState::AwaitingModel {
            let ordinal = self.take_ordinal();
            self.open = Some(Turn::new(ordinal, Role::Model));
            self.transition(TurnState::ModelStreaming);
        }

        match self.open.as_mut() {
            Some(turn) if turn.role == Role::Model && self.state == TurnState::ModelStreaming => {
                turn.parts.push(part);
                Ok(turn.ordinal)
            }
            _ => Err(TransitionError {
                from: self.state,
                event: "model_part",
            }),
        }
    }

    /// `turnComplete` received. Returns the completed model turn, if one was open.
    pub fn turn_complete(&mut self) -> Option<Turn> {
        match self.state {
            TurnState::ModelStreaming => {
                let mut turn = self.open.take()?;
                turn.is_complete = true;
                self.completed += 1;
                self.transition(TurnState::TurnComplete);
                self.transition(TurnState::Idle);
                info!("Turn {} complete ({} parts)", turn.ordinal, turn.parts.len());
                Some(turn)
            }
            TurnState::AwaitingModel => {
                // Empty model turn
                self.transition(TurnState::Idle);
                None
            }
            _ => {
                debug!("turnComplete while {:?} ignored", self.state);
                None
            }
        }
    }

    /// `interrupted` received. Returns the discarded model turn, if one was open.
    pub fn interrupted(&mut self) -> Option<Turn> {
        match self.state {
            TurnState::AwaitingModel | TurnState::ModelStreaming => {
                let turn = self
                    .open
                    .take()
                    .filter(|t| t.role == Role::Model)
                    .map(|mut t| {
                        t.interrupted = true;
                        t
                    });
                if turn.is_some() {
                    self.interrupted += 1;
                }
                self.transition(TurnState::Interrupted);
                self.transition(TurnState::Idle);
                if let Some(t) = &turn {
                    info!("Turn {} interrupted ({} parts discarded)", t.ordinal, t.parts.len());
                }
                turn
            }
            _ => {
                debug!("interrupted while {:?} ignored", self.state);
                None
            }
        }
    }

    /// Explicit close
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.open = None;
            self.transition(TurnState::Closed);
        }
    }

    /// Fatal transport error
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.open = None;
            self.transition(TurnState::Error);
        }
    }

    fn ensure_live(&self, event: &'static str) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            Err(TransitionError {
                from: self.state,
                event,
            })
        } else {
            Ok(())
        }
    }

    fn close_user_turn(&mut self) -> Option<Turn> {
        match self.open.take() {
            Some(mut turn) if turn.role == Role::User => {
                turn.is_complete = true;
                Some(turn)
            }
            other => {
                self.open = other;
                None
            }
        }
    }

    fn take_ordinal(&mut self) -> u64 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }

    fn transition(&mut self, next: TurnState) {
        debug!("Turn state {:?} -> {:?}", self.state, next);
        self.state = next;
        if self.trace.len() == TRACE_LEN {
            self.trace.pop_front();
        }
        self.trace.push_back(next);
    }
}
