use anyhow::Result;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tomb_core::{
    EngineResult, EventKind, GameConfig, PromptTemplate, PuzzleCatalog, TurnRequest,
    compile_instruction, parse_reply,
};
use tomb_errors::{EngineError, FailureKind};
use tomb_llm::{EngineClient, EngineRequest};
use tomb_observe::Observer;
use uuid::Uuid;

/// Returned instead of calling the engine when the requested level is past the catalog.
pub const CATALOG_EXHAUSTED_MESSAGE: &str = "The dungeon ends here. (No more levels)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Structured,
    /// The engine answered outside the contract; its raw text is used as narration.
    Fallback,
    CatalogExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReply {
    pub result: EngineResult,
    pub source: ReplySource,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to compile instruction for level {level}: {detail}")]
    Instruction { level: u32, detail: String },

    #[error("turn for level {level} panicked: {detail}")]
    Panicked { level: u32, detail: String },
}

impl TurnError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TurnError::Engine(err) => err.kind(),
            TurnError::Instruction { .. } | TurnError::Panicked { .. } => FailureKind::Internal,
        }
    }

    pub fn narrator_message(&self) -> String {
        match self {
            TurnError::Engine(err) => err.narrator_message(),
            TurnError::Instruction { .. } | TurnError::Panicked { .. } => {
                FailureKind::Internal.narrator_message().to_string()
            }
        }
    }
}

/// Stateless handler for one turn request against the puzzle catalog.
pub struct TurnService {
    catalog: PuzzleCatalog,
    template: PromptTemplate,
    engine: Arc<dyn EngineClient>,
    observer: Arc<Observer>,
}

impl TurnService {
    pub fn new(
        catalog: PuzzleCatalog,
        template: PromptTemplate,
        engine: Arc<dyn EngineClient>,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            catalog,
            template,
            engine,
            observer,
        }
    }

    /// Reads the catalog and template named by `cfg`, relative to `workspace`.
    pub fn load(
        workspace: &Path,
        cfg: &GameConfig,
        engine: Arc<dyn EngineClient>,
        observer: Arc<Observer>,
    ) -> Result<Self> {
        let catalog = PuzzleCatalog::load(&cfg.catalog_path(workspace))?;
        let template = PromptTemplate::load(&cfg.prompt_path(workspace))?;
        Ok(Self::new(catalog, template, engine, observer))
    }

    pub fn catalog(&self) -> &PuzzleCatalog {
        &self.catalog
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    /// Runs one turn. `session_id` only tags the emitted events.
    ///
    /// `req.history` must already be scoped to `req.current_level` and must not contain
    /// `req.user_message`; the gateway appends the utterance itself. A panic while handling
    /// the turn is returned as [`TurnError::Panicked`].
    pub fn handle_turn(
        &self,
        session_id: Uuid,
        req: &TurnRequest,
    ) -> std::result::Result<TurnReply, TurnError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_turn(session_id, req)));
        match result {
            Ok(outcome) => outcome,
            Err(payload) => {
                let level = req.current_level;
                let detail = panic_detail(payload.as_ref());
                self.observer
                    .warn_log(&format!("turn for level {level} panicked: {detail}"));
                self.observer.record(
                    session_id,
                    EventKind::EngineFailed {
                        level,
                        kind: FailureKind::Internal.to_string(),
                        detail: detail.clone(),
                    },
                );
                Err(TurnError::Panicked { level, detail })
            }
        }
    }

    fn run_turn(
        &self,
        session_id: Uuid,
        req: &TurnRequest,
    ) -> std::result::Result<TurnReply, TurnError> {
        let level = req.current_level;
        let Some(puzzle) = self.catalog.lookup(level) else {
            self.observer
                .record(session_id, EventKind::CatalogExhausted { level });
            return Ok(TurnReply {
                result: EngineResult::unsolved(CATALOG_EXHAUSTED_MESSAGE),
                source: ReplySource::CatalogExhausted,
            });
        };

        let instruction =
            compile_instruction(puzzle, &self.template).map_err(|err| TurnError::Instruction {
                level,
                detail: err.to_string(),
            })?;
        let engine_req = if req.is_init {
            EngineRequest::initialize(instruction)
        } else {
            EngineRequest::player(instruction, req.history.clone(), req.user_message.clone())
        };

        self.observer.record(
            session_id,
            EventKind::EngineCalled {
                level,
                initialize: req.is_init,
                history_len: engine_req.history.len(),
            },
        );
        let raw = self.engine.complete(&engine_req).inspect_err(|err| {
            self.observer.record(
                session_id,
                EventKind::EngineFailed {
                    level,
                    kind: err.kind().to_string(),
                    detail: err.to_string(),
                },
            );
        })?;

        let parsed = parse_reply(&raw);
        let source = if parsed.is_fallback() {
            self.observer.record(
                session_id,
                EventKind::ContractFallback {
                    level,
                    raw_len: raw.len(),
                },
            );
            self.observer
                .verbose_log(&format!("level {level}: engine reply was not structured"));
            ReplySource::Fallback
        } else {
            ReplySource::Structured
        };
        Ok(TurnReply {
            result: parsed.into_result(),
            source,
        })
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
