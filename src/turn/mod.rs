//! Conversation turns and the turn-taking state machine

mod machine;
mod turn;

pub use machine::{TransitionError, TurnState, TurnStateMachine};
pub use turn::{Part, Role, Turn};
