//! Level-scoped dialogue orchestration for the Tomb of the Silver King.
//!
//! [`TurnService`] answers one stateless turn request: it resolves the puzzle, compiles
//! the instruction, calls the engine and validates the reply. [`GameSession`] owns the
//! transcript and progression state of one player and drives the level state machine
//! on top of it.

mod service;
mod session;

pub use service::{CATALOG_EXHAUSTED_MESSAGE, ReplySource, TurnError, TurnReply, TurnService};
pub use session::{
    GameSession, IgnoreReason, InitOutcome, LEVEL_COMPLETE_TEXT, SessionSnapshot, SkipReason,
    TurnOutcome, VICTORY_TEXT,
};
