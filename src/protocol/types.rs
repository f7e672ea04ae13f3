use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::TrackMetadata;
use crate::store::StoreError;

/// Engine tunables shared by both identification modes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    /// Oracle calls fragment mode may spend before giving up.
    pub max_attempts: u32,
    /// Upper bound on any single oracle, catalog or store call.
    pub call_timeout: Duration,
    /// Questions that must be asked before a guess is accepted.
    pub min_questions: usize,
    /// Oracle calls a single dialogue step may spend on unusable replies.
    pub max_reply_attempts: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            call_timeout: Duration::from_secs(30),
            min_questions: 3,
            max_reply_attempts: 3,
        }
    }
}

/// Opaque identity of the person running a session. Login lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserHandle(String);

impl UserHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional narrowing attributes sent alongside lyric fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClueFilters {
    pub genre: Option<String>,
    pub era: Option<String>,
    pub mood: Option<String>,
    pub vibe: Option<String>,
}

impl ClueFilters {
    /// Non-empty filters as `(label, value)` pairs in a stable order.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        [
            ("Genre", &self.genre),
            ("Era", &self.era),
            ("Mood", &self.mood),
            ("Vibe", &self.vibe),
        ]
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (label, v))
        })
        .collect()
    }
}

/// What the user remembers: lyric fragments plus optional filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LyricClue {
    fragments: Vec<String>,
    pub filters: ClueFilters,
}

impl LyricClue {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut clue = Self::default();
        for fragment in fragments {
            clue.push_fragment(fragment);
        }
        clue
    }

    pub fn with_filters(mut self, filters: ClueFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Appends a fragment; blank input is ignored.
    pub fn push_fragment(&mut self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        let trimmed = fragment.trim();
        if !trimmed.is_empty() {
            self.fragments.push(trimmed.to_string());
        }
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// A candidate proposed by the oracle. Never persisted unless verified.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub song: String,
    pub artist: String,
    pub verse: Option<String>,
}

impl Hypothesis {
    /// Same song and artist, ignoring case and surrounding whitespace.
    pub fn same_song(&self, song: &str, artist: &str) -> bool {
        same_text(&self.song, song) && same_text(&self.artist, artist)
    }
}

pub(crate) fn same_text(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
        }
    }
}

/// The guess awaiting a yes/no from the user in conversational mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingGuess {
    pub song: String,
    pub artist: String,
}

impl PendingGuess {
    pub fn confirmation_question(&self) -> String {
        format!("Is your song \"{}\" by \"{}\"?", self.song, self.artist)
    }

    pub fn same_as(&self, other: &PendingGuess) -> bool {
        same_text(&self.song, &other.song) && same_text(&self.artist, &other.artist)
    }
}

/// Verified, metadata-enriched terminal result of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSong {
    pub song: String,
    pub artist: String,
    /// Verse with the matched fragments emphasized (fragment mode only).
    pub verse: Option<String>,
    #[serde(flatten)]
    pub metadata: TrackMetadata,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("The song oracle could not be reached: {0}")]
    OracleUnavailable(String),
    #[error("The song oracle returned an unusable answer: {0}")]
    OracleMalformed(String),
    #[error("No verified match after {attempts} attempts; try different fragments")]
    NoVerifiedMatch { attempts: u32 },
    #[error("No catalog metadata found: {0}")]
    MetadataUnavailable(String),
    #[error("The song could not be saved: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("Enter at least one lyric fragment")]
    EmptyClue,
    #[error("Enter an answer before sending")]
    EmptyAnswer,
    #[error("Cannot {action} while {state}")]
    InvalidState { state: &'static str, action: &'static str },
    #[error("The session was reset before the request finished")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clue_ignores_blank_fragments() {
        let mut clue = LyricClue::new(["  walked alone ", "", "   "]);
        assert_eq!(clue.fragments(), ["walked alone"]);
        clue.push_fragment("in the rain");
        assert_eq!(clue.fragments().len(), 2);
        assert!(LyricClue::new(["", " "]).is_empty());
    }

    #[test]
    fn filters_skip_empty_values() {
        let filters = ClueFilters {
            genre: Some("Rock".into()),
            era: Some("  ".into()),
            mood: None,
            vibe: Some(" chill ".into()),
        };
        assert_eq!(filters.entries(), vec![("Genre", "Rock"), ("Vibe", "chill")]);
    }

    #[test]
    fn guesses_compare_case_insensitively() {
        let a = PendingGuess { song: "Yesterday".into(), artist: "The Beatles".into() };
        let b = PendingGuess { song: " yesterday".into(), artist: "the beatles ".into() };
        assert!(a.same_as(&b));
        assert_eq!(a.confirmation_question(), "Is your song \"Yesterday\" by \"The Beatles\"?");
    }
}
