use crate::service::TurnService;
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tomb_core::{
    EngineResult, EventKind, Phase, SessionState, Speaker, Transcript, Turn, TurnRequest,
    is_valid_phase_transition, scope_history,
};
use tomb_errors::FailureKind;
use uuid::Uuid;

pub const LEVEL_COMPLETE_TEXT: &str =
    "*** DUNGEON COMPLETE ***\nProceeding to the next challenge...";
pub const VICTORY_TEXT: &str =
    "*** CONGRATULATIONS ***\nYou have conquered the Tomb of the Silver King!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Ignored { reason: IgnoreReason },
    Continued,
    LevelAdvanced { from: u32, to: u32 },
    GameFinished,
    Failed { kind: FailureKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    EmptyInput,
    Busy,
    GameFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InitOutcome {
    Initialized,
    Skipped { reason: SkipReason },
    Failed { kind: FailureKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyInitialized,
    Busy,
    GameFinished,
    /// A scheduled init found the session on a different level than it was scheduled for.
    LevelChanged,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::AlreadyInitialized => "already_initialized",
            SkipReason::Busy => "busy",
            SkipReason::GameFinished => "game_finished",
            SkipReason::LevelChanged => "level_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub phase: Phase,
    pub transcript: Transcript,
}

struct SessionInner {
    state: SessionState,
    transcript: Transcript,
}

struct Shared {
    id: Uuid,
    service: Arc<TurnService>,
    advance_delay: Duration,
    inner: Mutex<SessionInner>,
    /// Signalled whenever `busy` clears.
    idle: Condvar,
    scheduled: Mutex<Vec<JoinHandle<InitOutcome>>>,
}

/// One player's progression through the catalog.
///
/// Cloning yields another handle to the same session. At most one engine call is in flight
/// per session; the `busy` flag is claimed under the lock and released by [`BusyGuard`].
#[derive(Clone)]
pub struct GameSession {
    shared: Arc<Shared>,
}

/// Clears `busy` on every exit path, unwinding included.
///
/// Must be created after the session lock is released: dropping it takes the lock.
struct BusyGuard<'a> {
    shared: &'a Shared,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut inner = lock(&self.shared.inner);
        inner.state.busy = false;
        drop(inner);
        self.shared.idle.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GameSession {
    pub fn new(service: Arc<TurnService>, advance_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::now_v7(),
                service,
                advance_delay,
                inner: Mutex::new(SessionInner {
                    state: SessionState::default(),
                    transcript: Transcript::new(),
                }),
                idle: Condvar::new(),
                scheduled: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.inner).state
    }

    pub fn transcript_len(&self) -> usize {
        lock(&self.shared.inner).transcript.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = lock(&self.shared.inner);
        SessionSnapshot {
            session_id: self.shared.id,
            state: inner.state,
            phase: inner.state.phase(),
            transcript: inner.transcript.clone(),
        }
    }

    /// Turns appended after the first `offset` entries of the transcript.
    pub fn turns_since(&self, offset: usize) -> Vec<Turn> {
        lock(&self.shared.inner).transcript.since(offset).to_vec()
    }

    /// Plays one player turn. Never fails: engine failures become a narrator turn.
    pub fn submit(&self, input: &str) -> TurnOutcome {
        if input.trim().is_empty() {
            return TurnOutcome::Ignored {
                reason: IgnoreReason::EmptyInput,
            };
        }

        let (level, history) = {
            let mut inner = lock(&self.shared.inner);
            if inner.state.finished {
                return TurnOutcome::Ignored {
                    reason: IgnoreReason::GameFinished,
                };
            }
            if inner.state.busy {
                return TurnOutcome::Ignored {
                    reason: IgnoreReason::Busy,
                };
            }
            let level = inner.state.current_level;
            // Scoped before the player turn lands; the gateway appends the utterance itself.
            let history = scope_history(&inner.transcript, level);
            self.update(&mut inner, |state| state.busy = true);
            self.append(&mut inner, Speaker::Player, input);
            (level, history)
        };
        let guard = BusyGuard {
            shared: &self.shared,
        };

        let request = TurnRequest::player(level, history, input);
        let outcome = match self.shared.service.handle_turn(self.shared.id, &request) {
            Ok(reply) => self.apply_result(reply.result),
            Err(err) => {
                let mut inner = lock(&self.shared.inner);
                self.append(&mut inner, Speaker::Narrator, &err.narrator_message());
                TurnOutcome::Failed { kind: err.kind() }
            }
        };
        drop(guard);

        if let TurnOutcome::LevelAdvanced { to, .. } = outcome {
            self.schedule_init(to);
        }
        outcome
    }

    /// Opens the current level with a setting description, unless the engine already spoke on it.
    pub fn initialize(&self) -> InitOutcome {
        let claimed = {
            let mut inner = lock(&self.shared.inner);
            self.claim_init(&mut inner, None)
        };
        match claimed {
            Ok(level) => self.run_init(level),
            Err(reason) => InitOutcome::Skipped { reason },
        }
    }

    /// Joins every outstanding scheduled init, including ones scheduled while waiting.
    pub fn wait_for_scheduled(&self) -> Vec<InitOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let handles = std::mem::take(&mut *lock(&self.shared.scheduled));
            if handles.is_empty() {
                return outcomes;
            }
            for handle in handles {
                outcomes.push(handle.join().unwrap_or(InitOutcome::Failed {
                    kind: FailureKind::Internal,
                }));
            }
        }
    }

    fn schedule_init(&self, level: u32) {
        let session = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("tomb-init-{level}"))
            .spawn(move || session.run_scheduled_init(level));
        match spawned {
            Ok(handle) => lock(&self.shared.scheduled).push(handle),
            Err(err) => self
                .shared
                .service
                .observer()
                .warn_log(&format!("failed to schedule init for level {level}: {err}")),
        }
    }

    fn run_scheduled_init(&self, level: u32) -> InitOutcome {
        thread::sleep(self.shared.advance_delay);
        let claimed = {
            let inner = lock(&self.shared.inner);
            let mut inner = self
                .shared
                .idle
                .wait_while(inner, |inner| inner.state.busy && !inner.state.finished)
                .unwrap_or_else(PoisonError::into_inner);
            self.claim_init(&mut inner, Some(level))
        };
        match claimed {
            Ok(level) => self.run_init(level),
            Err(reason) => InitOutcome::Skipped { reason },
        }
    }

    /// Checks every init precondition and claims `busy` on success.
    fn claim_init(
        &self,
        inner: &mut SessionInner,
        expected_level: Option<u32>,
    ) -> Result<u32, SkipReason> {
        let level = inner.state.current_level;
        let verdict = if inner.state.finished {
            Err(SkipReason::GameFinished)
        } else if expected_level.is_some_and(|expected| expected != level) {
            Err(SkipReason::LevelChanged)
        } else if inner.state.busy {
            Err(SkipReason::Busy)
        } else if inner.transcript.has_engine_turn(level) {
            Err(SkipReason::AlreadyInitialized)
        } else {
            Ok(level)
        };
        match verdict {
            Ok(level) => {
                self.update(inner, |state| state.busy = true);
                Ok(level)
            }
            Err(reason) => {
                self.record(EventKind::InitSkipped {
                    level,
                    reason: reason.as_str().to_string(),
                });
                Err(reason)
            }
        }
    }

    /// Runs the init pipeline for a level whose `busy` flag was already claimed.
    fn run_init(&self, level: u32) -> InitOutcome {
        let _guard = BusyGuard {
            shared: &self.shared,
        };
        let result = self
            .shared
            .service
            .handle_turn(self.shared.id, &TurnRequest::init(level));
        let mut inner = lock(&self.shared.inner);
        match result {
            // `solved` on an opening description carries no meaning.
            Ok(reply) => {
                self.append(&mut inner, Speaker::Engine, &reply.result.message);
                InitOutcome::Initialized
            }
            Err(err) => {
                self.append(&mut inner, Speaker::Narrator, &err.narrator_message());
                InitOutcome::Failed { kind: err.kind() }
            }
        }
    }

    fn apply_result(&self, result: EngineResult) -> TurnOutcome {
        let mut inner = lock(&self.shared.inner);
        self.append(&mut inner, Speaker::Engine, &result.message);
        if !result.solved {
            return TurnOutcome::Continued;
        }

        let from = inner.state.current_level;
        if from < self.shared.service.catalog().last_level() {
            self.append(&mut inner, Speaker::Narrator, LEVEL_COMPLETE_TEXT);
            let to = from + 1;
            self.update(&mut inner, |state| state.current_level = to);
            self.record(EventKind::LevelAdvanced { from, to });
            TurnOutcome::LevelAdvanced { from, to }
        } else {
            self.append(&mut inner, Speaker::Narrator, VICTORY_TEXT);
            self.update(&mut inner, |state| state.finished = true);
            self.record(EventKind::GameFinished { level: from });
            TurnOutcome::GameFinished
        }
    }

    /// Applies a state change, refusing it when the phase table forbids the move.
    fn update(&self, inner: &mut SessionInner, change: impl FnOnce(&mut SessionState)) {
        let mut next = inner.state;
        change(&mut next);
        let (from, to) = (inner.state.phase(), next.phase());
        if is_valid_phase_transition(from, to) {
            inner.state = next;
        } else {
            self.shared
                .service
                .observer()
                .warn_log(&format!("refused session transition {from:?} -> {to:?}"));
        }
    }

    /// Appends a turn pinned to the current level.
    fn append(&self, inner: &mut SessionInner, speaker: Speaker, text: &str) {
        let level = inner.state.current_level;
        inner.transcript.push(Turn::new(speaker, text, level));
        self.record(EventKind::TurnAppended { speaker, level });
    }

    fn record(&self, kind: EventKind) {
        self.shared.service.observer().record(self.shared.id, kind);
    }
}
