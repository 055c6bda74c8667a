use anyhow::Result;
use serde_json::json;
use std::path::Path;
use tomb_core::{AppConfig, PuzzleCatalog};

use crate::output::{print_json, redact_config_for_display};

pub(crate) fn run_config(cwd: &Path, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let display_cfg = redact_config_for_display(&cfg)?;
    if json_mode {
        print_json(&display_cfg)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&display_cfg)?);
    }
    Ok(())
}

pub(crate) fn run_catalog(cwd: &Path, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let path = cfg.game.catalog_path(cwd);
    let catalog = PuzzleCatalog::load(&path)?;

    let levels: Vec<_> = catalog
        .levels()
        .iter()
        .enumerate()
        .map(|(level, puzzle)| {
            json!({
                "level": level,
                "id": puzzle.id,
                "description": puzzle.description,
            })
        })
        .collect();

    if json_mode {
        print_json(&json!({
            "path": path.display().to_string(),
            "count": catalog.level_count(),
            "levels": levels,
        }))?;
    } else {
        println!("{} levels in {}", catalog.level_count(), path.display());
        for puzzle in catalog.levels() {
            println!("  {:>2}. {}", puzzle.id, puzzle.description);
        }
    }
    Ok(())
}
