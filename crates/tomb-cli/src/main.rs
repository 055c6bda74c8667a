use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::process::ExitCode;
use tomb_errors::ErrorHandler;

mod commands;
mod context;
mod output;

use commands::admin::{run_catalog, run_config};
use commands::play::run_play;
use commands::serve::{run_completions, run_serve};

#[derive(Parser)]
#[command(name = "tomb")]
#[command(about = "Tomb of the Silver King: an LLM dungeon master, one puzzle at a time", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Play interactively on stdin/stdout.
    Play(PlayArgs),
    /// Host game sessions over JSON-RPC.
    Serve(ServeArgs),
    /// List the levels in the puzzle catalog.
    Catalog,
    /// Show the merged configuration.
    Config,
    Completions(CompletionsArgs),
}

#[derive(Args, Default)]
struct PlayArgs {
    /// Skip the pause before a new level is described.
    #[arg(long)]
    no_delay: bool,
}

#[derive(Args)]
struct ServeArgs {
    /// Transport to use: stdio (default).
    #[arg(long, default_value = "stdio")]
    transport: String,
}

#[derive(Args)]
struct CompletionsArgs {
    /// Shell to generate completions for (bash, zsh, fish, powershell, elvish).
    #[arg(long)]
    shell: Shell,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let handler = ErrorHandler::new().verbose(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", handler.handle(&err));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let command = cli
        .command
        .unwrap_or(Commands::Play(PlayArgs::default()));

    match command {
        Commands::Play(args) => run_play(&cwd, args, cli.json, cli.verbose),
        Commands::Serve(args) => run_serve(&cwd, args, cli.json, cli.verbose),
        Commands::Catalog => run_catalog(&cwd, cli.json),
        Commands::Config => run_config(&cwd, cli.json),
        Commands::Completions(args) => run_completions(args),
    }
}
