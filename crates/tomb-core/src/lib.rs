use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod catalog;
pub mod contract;
pub mod prompt;
pub mod scope;

pub use catalog::{PuzzleCatalog, PuzzleDefinition};
pub use contract::{ParsedReply, parse_reply};
pub use prompt::{OUTPUT_CONTRACT_CLAUSE, PUZZLE_PLACEHOLDER, PromptTemplate, compile_instruction};
pub use scope::scope_history;

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_API_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const GAME_TITLE: &str = "Tomb of the Silver King";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".tomb")
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Player,
    Engine,
    /// Game annotations (level complete, victory, failures). Never sent to the engine.
    Narrator,
}

impl Speaker {
    /// The conversational role of this speaker, if it takes part in the engine dialogue.
    pub fn conversational(self) -> Option<ConversationRole> {
        match self {
            Speaker::Player => Some(ConversationRole::Player),
            Speaker::Engine => Some(ConversationRole::Engine),
            Speaker::Narrator => None,
        }
    }
}

/// The subset of speakers the reasoning engine ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    Player,
    Engine,
}

impl From<ConversationRole> for Speaker {
    fn from(role: ConversationRole) -> Self {
        match role {
            ConversationRole::Player => Speaker::Player,
            ConversationRole::Engine => Speaker::Engine,
        }
    }
}

/// One recorded utterance, pinned to the level that was active when it was appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub level: u32,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>, level: u32) -> Self {
        Self {
            speaker,
            text: text.into(),
            level,
        }
    }
}

/// Append-only log of every turn in a session. Stale levels are kept but never resent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns appended after the first `offset` entries.
    pub fn since(&self, offset: usize) -> &[Turn] {
        self.turns.get(offset..).unwrap_or_default()
    }

    pub fn has_engine_turn(&self, level: u32) -> bool {
        self.turns
            .iter()
            .any(|turn| turn.level == level && turn.speaker == Speaker::Engine)
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

impl FromIterator<Turn> for Transcript {
    fn from_iter<I: IntoIterator<Item = Turn>>(iter: I) -> Self {
        Self {
            turns: iter.into_iter().collect(),
        }
    }
}

/// A `{speaker, text}` pair as it crosses the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speaker: ConversationRole,
    pub text: String,
}

/// Per-session progression record. `finished` is a one-way latch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub current_level: u32,
    pub finished: bool,
    pub busy: bool,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        if self.finished {
            Phase::GameFinished
        } else if self.busy {
            Phase::AwaitingEngine
        } else {
            Phase::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    AwaitingEngine,
    GameFinished,
}

pub fn is_valid_phase_transition(from: Phase, to: Phase) -> bool {
    if from == to {
        return true;
    }
    match from {
        Phase::Idle => matches!(to, Phase::AwaitingEngine),
        Phase::AwaitingEngine => matches!(to, Phase::Idle | Phase::GameFinished),
        Phase::GameFinished => false,
    }
}

/// The `{message, solved}` contract asserted on engine output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResult {
    pub message: String,
    pub solved: bool,
}

impl EngineResult {
    pub fn unsolved(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            solved: false,
        }
    }
}

/// Inbound turn request, as accepted from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    pub current_level: u32,
    #[serde(default)]
    pub is_init: bool,
}

impl TurnRequest {
    pub fn init(current_level: u32) -> Self {
        Self {
            user_message: String::new(),
            history: Vec::new(),
            current_level,
            is_init: true,
        }
    }

    pub fn player(
        current_level: u32,
        history: Vec<HistoryEntry>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            user_message: user_message.into(),
            history,
            current_level,
            is_init: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    TurnAppended {
        speaker: Speaker,
        level: u32,
    },
    EngineCalled {
        level: u32,
        initialize: bool,
        history_len: usize,
    },
    EngineFailed {
        level: u32,
        kind: String,
        detail: String,
    },
    ContractFallback {
        level: u32,
        raw_len: usize,
    },
    CatalogExhausted {
        level: u32,
    },
    LevelAdvanced {
        from: u32,
        to: u32,
    },
    GameFinished {
        level: u32,
    },
    InitSkipped {
        level: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub game: GameConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".tomb/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        Self::load_layers(workspace, Self::user_settings_path())
    }

    fn load_layers(workspace: &Path, user_settings: Option<PathBuf>) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: toml::Value = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = user_settings {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|err| anyhow::anyhow!("invalid settings in {}: {err}", path.display()))?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    /// Sent as `HTTP-Referer`; OpenRouter uses it for app attribution.
    pub referer: String,
    /// Sent as `X-Title`.
    pub title: String,
    pub json_response_format: bool,
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openrouter".to_string(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            timeout_seconds: 30,
            referer: "http://localhost:3000".to_string(),
            title: GAME_TITLE.to_string(),
            json_response_format: true,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub catalog_path: String,
    pub prompt_path: String,
    pub advance_delay_ms: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            catalog_path: "puzzles.json".to_string(),
            prompt_path: "DM_prompt.md".to_string(),
            advance_delay_ms: 1000,
        }
    }
}

impl GameConfig {
    pub fn catalog_path(&self, workspace: &Path) -> PathBuf {
        resolve_in(workspace, &self.catalog_path)
    }

    pub fn prompt_path(&self, workspace: &Path) -> PathBuf {
        resolve_in(workspace, &self.prompt_path)
    }
}

fn resolve_in(workspace: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub verbose: bool,
}
