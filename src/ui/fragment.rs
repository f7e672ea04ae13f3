//! Console front-end for fragment mode.

use std::error::Error;

use crate::protocol::session::is_affirmative;
use crate::protocol::{
    FragmentStatus, IdentificationEngine, LyricClue, ProtocolError, ResolvedSong,
};
use crate::ui::util::{Input, describe_song, stdout_is_terminal};

pub struct FragmentOptions {
    pub clue: LyricClue,
    /// Print the result as JSON and skip interactive prompts.
    pub json: bool,
    /// Save the result without asking.
    pub auto_accept: bool,
}

pub async fn run(
    engine: &IdentificationEngine,
    mut options: FragmentOptions,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut input = Input::stdin();

    if options.clue.is_empty() {
        println!("Enter the lyrics you remember, one fragment per line. Empty line to search.");
        while let Some(line) = input.prompt("fragment> ").await? {
            if line.is_empty() {
                break;
            }
            options.clue.push_fragment(line);
        }
    }

    if !options.json {
        println!("Searching for {} fragment(s)...", options.clue.fragments().len());
    }

    let outcome = tokio::select! {
        outcome = engine.identify(&options.clue) => outcome,
        _ = tokio::signal::ctrl_c() => {
            engine.reset().await;
            Err(ProtocolError::Cancelled)
        }
    };

    let resolved = match outcome {
        Ok(resolved) => resolved,
        Err(e) => {
            let status = engine.status().await;
            tracing::debug!(
                attempts = engine.attempt_count().await,
                status = status.describe(),
                "Search ended without a match"
            );
            if let Some(hint) = retry_hint(status) {
                eprintln!("{hint}");
            }
            return Err(e.into());
        }
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    } else {
        println!();
        for line in describe_song(&resolved, stdout_is_terminal()) {
            println!("{line}");
        }
        println!();
    }

    if options.auto_accept {
        return save(engine, &resolved, None).await;
    }
    if options.json {
        return Ok(());
    }
    match input.prompt("Is this your song? Save it? [y/N] ").await? {
        Some(answer) if is_affirmative(&answer) => save(engine, &resolved, Some(&mut input)).await,
        _ => {
            engine.reject().await?;
            println!("Discarded.");
            Ok(())
        }
    }
}

fn retry_hint(status: FragmentStatus) -> Option<&'static str> {
    match status {
        FragmentStatus::Exhausted => Some("Try different or longer fragments, or add a genre or year."),
        FragmentStatus::Failed => Some("Check GEMINI_API_KEY and your connection, then try again."),
        _ => None,
    }
}

/// Accept the result, offering a retry on failed writes when interactive.
async fn save(
    engine: &IdentificationEngine,
    resolved: &ResolvedSong,
    mut input: Option<&mut Input>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        match engine.accept().await {
            Ok(_) => {
                println!("Saved \"{}\" by {}.", resolved.song, resolved.artist);
                return Ok(());
            }
            Err(e @ ProtocolError::PersistenceFailure(_)) => {
                let Some(input) = input.as_deref_mut() else {
                    return Err(e.into());
                };
                println!("{e}");
                match input.prompt("Try again? [y/N] ").await? {
                    Some(answer) if is_affirmative(&answer) => continue,
                    _ => {
                        engine.reject().await?;
                        return Ok(());
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_only_follow_finished_searches() {
        assert!(retry_hint(FragmentStatus::Exhausted).is_some());
        assert!(retry_hint(FragmentStatus::Failed).is_some());
        assert_eq!(retry_hint(FragmentStatus::Idle), None);
        assert_eq!(retry_hint(FragmentStatus::Found), None);
    }
}
