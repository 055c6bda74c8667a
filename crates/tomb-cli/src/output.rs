use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tomb_core::{AppConfig, Speaker, Turn};

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    if let Some(llm) = value.get_mut("llm").and_then(|entry| entry.as_object_mut())
        && llm.get("api_key").is_some_and(|key| !key.is_null())
    {
        llm.insert("api_key".to_string(), json!("***REDACTED***"));
    }
    Ok(value)
}

pub(crate) fn render_turn(turn: &Turn) -> String {
    match turn.speaker {
        Speaker::Player => format!("> {}", turn.text),
        Speaker::Engine => format!("DM: {}", turn.text),
        Speaker::Narrator => turn.text.clone(),
    }
}
