//! Tolerant parsing of free-text oracle responses.
//!
//! The oracle is asked for JSON but regularly wraps it in code fences, adds
//! chatter around it, renames keys or falls back to a line-based layout.
//! Parsing never fails hard: callers get `ParseOutcome::Malformed` with a
//! reason and decide whether to retry the attempt or surface the problem.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::protocol::types::{Hypothesis, PendingGuess};

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    Malformed(String),
}

#[cfg(test)]
impl<T> ParseOutcome<T> {
    pub fn parsed(self) -> Option<T> {
        match self {
            ParseOutcome::Parsed(v) => Some(v),
            ParseOutcome::Malformed(_) => None,
        }
    }
}

/// One structured dialogue step: a question, optionally carrying a final guess.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueReply {
    pub question: String,
    pub options: Vec<String>,
    /// Present when the oracle declared `ready: true`.
    pub guess: Option<PendingGuess>,
}

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[A-Za-z]*").expect("valid fence regex"));

static LABELED_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*[*_]*(song|title|artist|verse|lyrics?)[*_]*\s*[:=\-]\s*(.+?)\s*$")
        .expect("valid labeled line regex")
});

static LEGACY_GUESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)is your song\s+["“](.+?)["”]\s+by\s+["“](.+?)["”]\s*\?"#)
        .expect("valid guess regex")
});

#[derive(Deserialize)]
struct RawHypothesis {
    #[serde(alias = "title", alias = "track")]
    song: Option<String>,
    artist: Option<String>,
    #[serde(alias = "lyrics", alias = "lyric", alias = "line")]
    verse: Option<String>,
}

#[derive(Deserialize)]
struct RawDialogueReply {
    question: Option<String>,
    options: Option<Vec<Value>>,
    #[serde(default)]
    ready: Value,
    #[serde(alias = "title")]
    song: Option<String>,
    artist: Option<String>,
}

/// Strips code fences and returns the outermost `{ ... }` span, if any.
fn extract_json_object(text: &str) -> Option<String> {
    let unfenced = CODE_FENCE_RE.replace_all(text, "");
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    (end > start).then(|| unfenced[start..=end].to_string())
}

/// Trims whitespace and stray quoting the oracle likes to add.
fn clean_field(value: Option<String>) -> Option<String> {
    let value = value?;
    let cleaned =
        value.trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '“' | '”' | '*'));
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

fn missing_fields(song: &Option<String>, artist: &Option<String>, verse: &Option<String>) -> String {
    let missing: Vec<&str> = [("song", song), ("artist", artist), ("verse", verse)]
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| name)
        .collect();
    format!("missing {}", missing.join(", "))
}

/// Parse a `{song, artist, verse}` hypothesis. All three fields are required.
pub fn parse_hypothesis(text: &str) -> ParseOutcome<Hypothesis> {
    let (song, artist, verse) = match extract_json_object(text)
        .and_then(|json| serde_json::from_str::<RawHypothesis>(&json).ok())
    {
        Some(raw) => (clean_field(raw.song), clean_field(raw.artist), clean_field(raw.verse)),
        None => {
            let mut song = None;
            let mut artist = None;
            let mut verse = None;
            for cap in LABELED_LINE_RE.captures_iter(text) {
                let value = Some(cap[2].to_string());
                match cap[1].to_lowercase().as_str() {
                    "song" | "title" => song = song.or(clean_field(value)),
                    "artist" => artist = artist.or(clean_field(value)),
                    _ => verse = verse.or(clean_field(value)),
                }
            }
            (song, artist, verse)
        }
    };

    match (song, artist, verse) {
        (Some(song), Some(artist), Some(verse)) => ParseOutcome::Parsed(Hypothesis {
            song,
            artist,
            verse: Some(verse),
        }),
        (song, artist, verse) => ParseOutcome::Malformed(missing_fields(&song, &artist, &verse)),
    }
}

fn ready_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Null => Some(false),
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn option_labels(options: &[Value]) -> Vec<String> {
    options
        .iter()
        .filter_map(|o| match o {
            Value::String(s) => Some(s.trim().to_string()),
            other => other.get("label").and_then(Value::as_str).map(|s| s.trim().to_string()),
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a dialogue step: `{question, options, ready}` plus `song`/`artist`
/// when `ready` is true.
pub fn parse_dialogue_reply(text: &str) -> ParseOutcome<DialogueReply> {
    if let Some(json) = extract_json_object(text) {
        let raw: RawDialogueReply = match serde_json::from_str(&json) {
            Ok(raw) => raw,
            Err(e) => return ParseOutcome::Malformed(format!("invalid JSON: {e}")),
        };
        let Some(ready) = ready_flag(&raw.ready) else {
            return ParseOutcome::Malformed(format!("unrecognised ready flag {}", raw.ready));
        };
        let question = clean_field(raw.question).unwrap_or_default();
        let options = option_labels(raw.options.as_deref().unwrap_or_default());
        if !ready {
            if question.is_empty() {
                return ParseOutcome::Malformed("missing question".to_string());
            }
            return ParseOutcome::Parsed(DialogueReply { question, options, guess: None });
        }
        return match (clean_field(raw.song), clean_field(raw.artist)) {
            (Some(song), Some(artist)) => ParseOutcome::Parsed(DialogueReply {
                question,
                options,
                guess: Some(PendingGuess { song, artist }),
            }),
            _ => ParseOutcome::Malformed("ready without song and artist".to_string()),
        };
    }

    if let Some(cap) = LEGACY_GUESS_RE.captures(text) {
        let guess = PendingGuess {
            song: cap[1].trim().to_string(),
            artist: cap[2].trim().to_string(),
        };
        return ParseOutcome::Parsed(DialogueReply {
            question: guess.confirmation_question(),
            options: Vec::new(),
            guess: Some(guess),
        });
    }

    // A lone question with no structure at all is still usable.
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    match lines.as_slice() {
        [line] if line.ends_with('?') => ParseOutcome::Parsed(DialogueReply {
            question: line.to_string(),
            options: Vec::new(),
            guess: None,
        }),
        [] => ParseOutcome::Malformed("empty response".to_string()),
        _ => ParseOutcome::Malformed("no JSON object or question found".to_string()),
    }
}
