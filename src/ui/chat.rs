//! Console front-end for conversational mode.
//!
//! The loop renders from `DialogueEngine::snapshot()` and dispatches one
//! engine call per line of input. Ctrl-C during an oracle call resets the
//! session; `/reset` and `/quit` work at any prompt.

use std::error::Error;
use std::future::Future;

use crate::protocol::session::is_affirmative;
use crate::protocol::{
    DialogueEngine, DialogueSession, DialogueState, DialogueStep, MANUAL_OPTION, ProtocolError,
};
use crate::ui::util::{Input, describe_song, stdout_is_terminal, terminal_width, wrap_with_prefix};

const HELP: &str = "Think of a song. Describe it, quote a line, or say anything you remember. \
Answer with an option number or its text. /type writes your own answer, /reset starts over, \
/quit leaves.";

#[derive(Debug, PartialEq)]
enum Command {
    Quit,
    Reset,
    Type,
    Text(String),
}

fn parse_command(line: Option<String>) -> Command {
    match line {
        None => Command::Quit,
        Some(line) => match line.as_str() {
            "/quit" | "/exit" => Command::Quit,
            "/reset" => Command::Reset,
            "/type" => Command::Type,
            _ => Command::Text(line),
        },
    }
}

async fn read(input: &mut Input, prompt: &str) -> Result<Command, Box<dyn Error + Send + Sync>> {
    Ok(parse_command(input.prompt(prompt).await?))
}

/// Map "2" to the second option; anything else passes through.
fn pick_option(options: &[String], text: &str) -> String {
    text.parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| options.get(i))
        .cloned()
        .unwrap_or_else(|| text.to_string())
}

fn print_question(session: &DialogueSession) {
    let width = terminal_width();
    if let Some(question) = session.current_question() {
        for line in wrap_with_prefix("? ", question, width) {
            println!("{line}");
        }
    }
    let options: Vec<String> = session
        .options()
        .iter()
        .enumerate()
        .map(|(i, o)| format!("[{}] {o}", i + 1))
        .collect();
    if !options.is_empty() {
        println!("  {}", options.join("  "));
    }
}

/// Run one engine call, resetting the session if Ctrl-C arrives first.
async fn step<F>(engine: &DialogueEngine, call: F)
where
    F: Future<Output = Result<DialogueStep, ProtocolError>>,
{
    let outcome = tokio::select! {
        outcome = call => outcome,
        _ = tokio::signal::ctrl_c() => {
            engine.reset().await;
            Err(ProtocolError::Cancelled)
        }
    };
    match outcome {
        Ok(_) => {}
        Err(ProtocolError::Cancelled) => println!("Session reset."),
        Err(e) => println!("! {e}"),
    }
}

pub async fn run(
    engine: &DialogueEngine,
    mut first_clue: Option<String>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut input = Input::stdin();
    println!("{HELP}");

    loop {
        let session = engine.snapshot().await;
        match session.state() {
            DialogueState::AwaitingFirstClue => {
                let clue = match first_clue.take() {
                    Some(clue) => clue,
                    None => match read(&mut input, "\nYour clue> ").await? {
                        Command::Quit => break,
                        Command::Reset | Command::Type => continue,
                        Command::Text(clue) => clue,
                    },
                };
                step(engine, engine.start_session(&clue)).await;
            }
            DialogueState::AwaitingAnswer if session.current_question().is_none() => {
                match read(&mut input, "Press Enter to retry> ").await? {
                    Command::Quit => break,
                    Command::Reset => engine.reset().await,
                    Command::Type | Command::Text(_) => {
                        step(engine, engine.request_next_question()).await
                    }
                }
            }
            DialogueState::AwaitingAnswer | DialogueState::AwaitingFinalConfirmation => {
                print_question(&session);
                match read(&mut input, "> ").await? {
                    Command::Quit => break,
                    Command::Reset => engine.reset().await,
                    Command::Type => {
                        if let Err(e) = engine.enter_manual_override().await {
                            println!("! {e}");
                        }
                    }
                    Command::Text(text) if text.is_empty() => continue,
                    Command::Text(text) => {
                        let answer = pick_option(session.options(), &text);
                        step(engine, engine.answer(&answer)).await;
                    }
                }
            }
            DialogueState::ManualOverride => {
                let prompt = format!("Type your answer (/back to pick an option, not \"{MANUAL_OPTION}\")> ");
                match read(&mut input, &prompt).await? {
                    Command::Quit => break,
                    Command::Reset => engine.reset().await,
                    Command::Type => continue,
                    Command::Text(text) if text == "/back" => engine.cancel_manual_override().await?,
                    Command::Text(text) => step(engine, engine.manual_submit(&text)).await,
                }
            }
            DialogueState::Resolved => {
                if let Some(song) = session.resolved() {
                    println!();
                    for line in describe_song(song, stdout_is_terminal()) {
                        println!("{line}");
                    }
                }
                match read(&mut input, "Save it? [y/N] ").await? {
                    Command::Quit => break,
                    Command::Reset => engine.reset().await,
                    Command::Type => continue,
                    Command::Text(answer) if is_affirmative(&answer) => match engine.accept().await {
                        Ok(song) => println!("Saved \"{}\" by {}.", song.song, song.artist),
                        // Stays resolved, so the next pass asks again.
                        Err(e) => println!("! {e}"),
                    },
                    Command::Text(_) => engine.reject().await?,
                }
                if engine.snapshot().await.state() == DialogueState::AwaitingFirstClue {
                    match read(&mut input, "Play again? [y/N] ").await? {
                        Command::Text(answer) if is_affirmative(&answer) => continue,
                        _ => break,
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_pick_options() {
        let options = vec!["Yes".to_string(), "No".to_string(), "Other".to_string()];
        assert_eq!(pick_option(&options, "2"), "No");
        assert_eq!(pick_option(&options, "3"), "Other");
        assert_eq!(pick_option(&options, "0"), "0");
        assert_eq!(pick_option(&options, "7"), "7");
        assert_eq!(pick_option(&options, "maybe"), "maybe");
    }

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_command(None), Command::Quit);
        assert_eq!(parse_command(Some("/exit".into())), Command::Quit);
        assert_eq!(parse_command(Some("/reset".into())), Command::Reset);
        assert_eq!(parse_command(Some("/type".into())), Command::Type);
        assert_eq!(parse_command(Some("/back".into())), Command::Text("/back".into()));
    }
}
