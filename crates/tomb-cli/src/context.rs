use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tomb_core::AppConfig;
use tomb_game::TurnService;
use tomb_llm::OpenRouterClient;
use tomb_observe::Observer;

/// Everything a hosting surface needs before it may accept a turn.
pub(crate) struct GameContext {
    pub service: Arc<TurnService>,
    pub advance_delay: Duration,
}

/// Resolves the engine credential first: without one no turn is ever accepted.
pub(crate) fn load_game(cwd: &Path, verbose: bool) -> Result<GameContext> {
    let cfg = AppConfig::load(cwd)?;
    let engine = OpenRouterClient::new(cfg.llm.clone())?;

    let observer = Observer::new(cwd)?;
    observer.set_verbose(verbose || cfg.log.verbose);
    observer.verbose_log(&format!(
        "engine model={} endpoint={} timeout={}s",
        cfg.llm.model, cfg.llm.endpoint, cfg.llm.timeout_seconds
    ));

    let service = TurnService::load(cwd, &cfg.game, Arc::new(engine), Arc::new(observer))?;
    service.observer().verbose_log(&format!(
        "loaded {} levels from {}",
        service.catalog().level_count(),
        cfg.game.catalog_path(cwd).display()
    ));
    Ok(GameContext {
        service: Arc::new(service),
        advance_delay: Duration::from_millis(cfg.game.advance_delay_ms),
    })
}
