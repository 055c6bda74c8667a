use anyhow::{Result, anyhow};
use clap::CommandFactory;
use clap_complete::generate;
use std::io;
use std::path::Path;

use crate::context::load_game;
use crate::{Cli, CompletionsArgs, ServeArgs};

pub(crate) fn run_completions(args: CompletionsArgs) -> Result<()> {
    let mut cmd = Cli::command();
    generate(args.shell, &mut cmd, "tomb", &mut io::stdout());
    Ok(())
}

pub(crate) fn run_serve(cwd: &Path, args: ServeArgs, json_mode: bool, verbose: bool) -> Result<()> {
    match args.transport.as_str() {
        "stdio" => {
            let game = load_game(cwd, verbose)?;
            if json_mode {
                println!(
                    "{}",
                    serde_json::json!({"status": "starting", "transport": "stdio"})
                );
            } else {
                eprintln!("tomb: starting JSON-RPC server on stdio...");
            }
            let handler = tomb_jsonrpc::GameRpcHandler::new(game.service, game.advance_delay);
            tomb_jsonrpc::run_stdio_server(&handler)
        }
        other => Err(anyhow!(
            "unsupported transport '{}' (supported: stdio)",
            other
        )),
    }
}
