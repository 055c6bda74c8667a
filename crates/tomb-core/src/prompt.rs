use crate::catalog::PuzzleDefinition;
use anyhow::{Result, anyhow, bail};
use std::fs;
use std::path::Path;

/// Substitution point in the dungeon-master template.
pub const PUZZLE_PLACEHOLDER: &str = "${current_puzzle_json}";

/// Appended to every compiled instruction so the reply can be parsed mechanically.
pub const OUTPUT_CONTRACT_CLAUSE: &str = r#"CRITICAL OUTPUT INSTRUCTION:
You must respond with a strict JSON object. Do not include markdown formatting (like ```json). The format must be:
{
  "message": "Your rich text response here...",
  "solved": boolean // true ONLY if the player has met the exit_condition.
}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    raw: String,
}

impl PromptTemplate {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if !raw.contains(PUZZLE_PLACEHOLDER) {
            bail!("prompt template is missing the {PUZZLE_PLACEHOLDER} placeholder");
        }
        Ok(Self { raw })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| anyhow!("failed to read prompt template {}: {err}", path.display()))?;
        Self::parse(raw).map_err(|err| anyhow!("{}: {err}", path.display()))
    }
}

/// Renders the system instruction for one puzzle. Pure string assembly.
pub fn compile_instruction(puzzle: &PuzzleDefinition, template: &PromptTemplate) -> Result<String> {
    let puzzle_json = serde_json::to_string_pretty(puzzle)?;
    let mut instruction = template.raw.replacen(PUZZLE_PLACEHOLDER, &puzzle_json, 1);
    instruction.push_str("\n\n");
    instruction.push_str(OUTPUT_CONTRACT_CLAUSE);
    Ok(instruction)
}
