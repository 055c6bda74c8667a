//! Validation of the engine's `{message, solved}` reply.
//!
//! The engine is asked for a bare JSON object but sometimes answers in prose or wraps
//! the object in a markdown fence. Parsing never fails: anything that does not match
//! the contract degrades to narration that does not advance the puzzle.

use crate::EngineResult;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedReply {
    Structured(EngineResult),
    Fallback { raw: String },
}

impl ParsedReply {
    pub fn is_fallback(&self) -> bool {
        matches!(self, ParsedReply::Fallback { .. })
    }

    pub fn into_result(self) -> EngineResult {
        match self {
            ParsedReply::Structured(result) => result,
            ParsedReply::Fallback { raw } => EngineResult::unsolved(raw),
        }
    }
}

#[derive(Deserialize)]
struct StrictReply {
    message: String,
    solved: bool,
}

pub fn parse_reply(raw: &str) -> ParsedReply {
    let candidate = strip_code_fence(raw.trim());
    match serde_json::from_str::<StrictReply>(candidate) {
        Ok(reply) => ParsedReply::Structured(EngineResult {
            message: reply.message,
            solved: reply.solved,
        }),
        Err(_) => ParsedReply::Fallback {
            raw: raw.to_string(),
        },
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the info string (`json`) on the opening line.
    match body.split_once('\n') {
        Some((info, inner)) if !info.trim_start().starts_with('{') => inner.trim(),
        _ => body.trim(),
    }
}
