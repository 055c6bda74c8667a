use anyhow::Result;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;
use tomb_core::{GAME_TITLE, Speaker};
use tomb_game::{GameSession, TurnOutcome};

use crate::PlayArgs;
use crate::context::load_game;
use crate::output::{print_json, render_turn};

pub(crate) fn run_play(cwd: &Path, args: PlayArgs, json_mode: bool, verbose: bool) -> Result<()> {
    let game = load_game(cwd, verbose)?;
    let delay = if args.no_delay {
        Duration::ZERO
    } else {
        game.advance_delay
    };
    let session = GameSession::new(game.service, delay);

    if !json_mode {
        println!("{GAME_TITLE}");
        println!("Type /quit to leave, /state to see where you are.\n");
    }
    session.initialize();
    let mut shown = print_new_turns(&session, 0, json_mode)?;

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut line = String::new();
    while !session.state().finished {
        if !json_mode {
            print!("> ");
            io::stdout().flush()?;
        }
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim_end_matches(['\r', '\n']);
        match input.trim() {
            "/quit" | "/exit" => break,
            "/state" => {
                print_state(&session, json_mode)?;
                continue;
            }
            _ => {}
        }

        let outcome = session.submit(input);
        if json_mode {
            print_json(&json!({ "outcome": outcome }))?;
        }
        shown = print_new_turns(&session, shown, json_mode)?;
        if let TurnOutcome::LevelAdvanced { .. } = outcome {
            session.wait_for_scheduled();
            shown = print_new_turns(&session, shown, json_mode)?;
        }
    }

    if json_mode {
        print_state(&session, true)?;
    } else if session.state().finished {
        println!("\nThe tomb falls silent. Thanks for playing.");
    }
    Ok(())
}

/// Prints turns appended since `shown` and returns the new transcript length.
fn print_new_turns(session: &GameSession, shown: usize, json_mode: bool) -> Result<usize> {
    let turns = session.turns_since(shown);
    for turn in &turns {
        if json_mode {
            print_json(&json!({ "turn": turn }))?;
        } else if turn.speaker != Speaker::Player {
            println!("{}\n", render_turn(turn));
        }
    }
    Ok(shown + turns.len())
}

fn print_state(session: &GameSession, json_mode: bool) -> Result<()> {
    let snapshot = session.snapshot();
    if json_mode {
        print_json(&json!({
            "session_id": snapshot.session_id.to_string(),
            "state": snapshot.state,
            "phase": snapshot.phase,
        }))?;
    } else {
        println!(
            "level {} ({:?}), {} turns so far",
            snapshot.state.current_level + 1,
            snapshot.phase,
            snapshot.transcript.len()
        );
    }
    Ok(())
}
