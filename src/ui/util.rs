//! Terminal helpers shared by the console front-ends.
//!
//! Everything written here goes to stdout; diagnostics go through `tracing`
//! to stderr so piped output stays clean.

use crossterm::style::{Stylize, style};
use std::io::{self, IsTerminal};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::protocol::ResolvedSong;
use crate::protocol::matcher::{EMPHASIS_CLOSE, EMPHASIS_OPEN, emphasis_runs};

const FALLBACK_WIDTH: usize = 80;
const MAX_WIDTH: usize = 100;

/// Usable text width for the current terminal.
pub fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(w, _)| w as usize)
        .unwrap_or(FALLBACK_WIDTH)
        .clamp(20, MAX_WIDTH)
}

/// Wrap text to `width`, indenting continuation lines under the prefix.
pub fn wrap_with_prefix(prefix: &str, text: &str, width: usize) -> Vec<String> {
    let indent = " ".repeat(prefix.chars().count());
    let options = textwrap::Options::new(width)
        .initial_indent(prefix)
        .subsequent_indent(&indent);
    textwrap::wrap(text, options)
        .into_iter()
        .map(|line| line.into_owned())
        .collect()
}

/// Render an emphasized verse: bold on a terminal, markers kept otherwise.
pub fn render_verse(verse: &str, styled: bool) -> String {
    emphasis_runs(verse)
        .into_iter()
        .map(|(text, emphasized)| match (emphasized, styled) {
            (false, _) => text.to_string(),
            (true, true) => style(text).bold().to_string(),
            (true, false) => format!("{EMPHASIS_OPEN}{text}{EMPHASIS_CLOSE}"),
        })
        .collect()
}

/// Human-readable block describing a resolved song.
pub fn describe_song(song: &ResolvedSong, styled: bool) -> Vec<String> {
    let title = format!("{} by {}", song.song, song.artist);
    let mut lines = vec![if styled { style(title).bold().to_string() } else { title }];

    if let Some(verse) = &song.verse {
        lines.push(format!("  \u{201c}{}\u{201d}", render_verse(verse, styled)));
    }
    let meta = &song.metadata;
    if meta.is_empty() {
        lines.push("  No catalog details found.".to_string());
        return lines;
    }
    if let Some(album) = &meta.album_name {
        lines.push(format!("  Album:    {album}"));
    }
    if let Some(date) = &meta.release_date {
        lines.push(format!("  Released: {date}"));
    }
    if !meta.genres.is_empty() {
        lines.push(format!("  Genres:   {}", meta.genres.join(", ")));
    }
    if let Some(id) = &meta.catalog_id {
        lines.push(format!("  Spotify:  https://open.spotify.com/track/{id}"));
    }
    if let Some(image) = &meta.album_image {
        lines.push(format!("  Cover:    {image}"));
    }
    lines
}

pub fn stdout_is_terminal() -> bool {
    io::stdout().is_terminal()
}

/// Line reader over stdin. Ctrl-C while waiting for input reads as end of input.
pub struct Input {
    lines: Lines<BufReader<Stdin>>,
}

impl Input {
    pub fn stdin() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Print `prompt` and read one trimmed line; `None` at end of input.
    pub async fn prompt(&mut self, prompt: &str) -> io::Result<Option<String>> {
        use std::io::Write;
        print!("{prompt}");
        io::stdout().flush()?;
        tokio::select! {
            line = self.lines.next_line() => Ok(line?.map(|l| l.trim().to_string())),
            _ = tokio::signal::ctrl_c() => {
                println!();
                Ok(None)
            }
        }
    }
}
