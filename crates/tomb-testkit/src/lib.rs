//! Test doubles and fixtures shared by the game, RPC and CLI tests.

use anyhow::Result;
use serde_json::json;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tomb_core::{EngineResult, PromptTemplate, PuzzleCatalog};
use tomb_errors::EngineError;
use tomb_llm::{EngineClient, EngineRequest};

pub const SAMPLE_TEMPLATE: &str = "You are the Dungeon Master of the Tomb of the Silver King.\n\nCurrent puzzle:\n${current_puzzle_json}\n\nNever reveal the exit condition.";

/// Serializes a structured reply the way a well-behaved engine would.
pub fn reply_json(message: &str, solved: bool) -> String {
    json!({"message": message, "solved": solved}).to_string()
}

pub fn sample_catalog_json(levels: u32) -> String {
    let levels: Vec<_> = (1..=levels)
        .map(|id| {
            json!({
                "id": id,
                "description": format!("Chamber {id} of the tomb."),
                "exit_condition": format!("speak the word {id}"),
            })
        })
        .collect();
    json!({ "levels": levels }).to_string()
}

pub fn sample_catalog(levels: u32) -> PuzzleCatalog {
    PuzzleCatalog::from_json(&sample_catalog_json(levels)).expect("sample catalog")
}

pub fn sample_template() -> PromptTemplate {
    PromptTemplate::parse(SAMPLE_TEMPLATE).expect("sample template")
}

/// Writes `puzzles.json` and `DM_prompt.md` into `dir`.
pub fn write_game_files(dir: &Path, levels: u32) -> Result<()> {
    fs::write(dir.join("puzzles.json"), sample_catalog_json(levels))?;
    fs::write(dir.join("DM_prompt.md"), SAMPLE_TEMPLATE)?;
    Ok(())
}

#[derive(Default)]
struct ScriptState {
    replies: VecDeque<std::result::Result<String, EngineError>>,
    requests: Vec<EngineRequest>,
    held: bool,
}

/// An [`EngineClient`] that replays queued replies and records every request.
///
/// When the script runs dry it answers with an unsolved "The torches flicker." reply.
/// A held engine blocks inside `complete` until [`ScriptedEngine::release`] is called.
#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<ScriptState>,
    changed: Condvar,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, message: &str, solved: bool) -> &Self {
        self.push_raw(&reply_json(message, solved))
    }

    pub fn push_raw(&self, raw: &str) -> &Self {
        self.lock().replies.push_back(Ok(raw.to_string()));
        self
    }

    pub fn push_error(&self, err: EngineError) -> &Self {
        self.lock().replies.push_back(Err(err));
        self
    }

    pub fn hold(&self) {
        self.lock().held = true;
    }

    pub fn release(&self) {
        self.lock().held = false;
        self.changed.notify_all();
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.lock().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Blocks until at least `count` calls have entered `complete`, or the timeout passes.
    pub fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| state.requests.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        guard.requests.len() >= count
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EngineClient for ScriptedEngine {
    fn complete(&self, req: &EngineRequest) -> std::result::Result<String, EngineError> {
        let mut state = self.lock();
        state.requests.push(req.clone());
        self.changed.notify_all();
        let mut state = self
            .changed
            .wait_while(state, |state| state.held)
            .unwrap_or_else(PoisonError::into_inner);
        let reply = state
            .replies
            .pop_front()
            .unwrap_or_else(|| Ok(reply_json("The torches flicker.", false)));
        reply
    }
}

/// Parses a reply produced by [`reply_json`]; handy for assertions.
pub fn result_of(raw: &str) -> EngineResult {
    serde_json::from_str(raw).expect("structured reply")
}
