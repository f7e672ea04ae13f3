//! Local verification of oracle-proposed verses against the user's fragments.
//!
//! Both operations are case-insensitive and ignore blank fragments. Matching
//! goes through `regex` with an escaped pattern so Unicode case folding and
//! byte offsets into the original verse stay consistent between `matches`
//! and `emphasize`.

use regex::{Regex, RegexBuilder};

pub const EMPHASIS_OPEN: &str = "«";
pub const EMPHASIS_CLOSE: &str = "»";

fn fragment_pattern(fragment: &str) -> Option<Regex> {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        return None;
    }
    match RegexBuilder::new(&regex::escape(fragment))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::debug!(fragment, error = %e, "Skipping fragment that cannot be compiled");
            None
        }
    }
}

/// True iff any non-empty fragment occurs in `verse`, ignoring case.
pub fn matches<S: AsRef<str>>(verse: &str, fragments: &[S]) -> bool {
    fragments
        .iter()
        .filter_map(|f| fragment_pattern(f.as_ref()))
        .any(|re| re.is_match(verse))
}

/// Wraps every occurrence of each fragment in emphasis markers.
///
/// Fragments are applied in the order given. When fragments overlap, a later
/// fragment may land inside or across markers inserted by an earlier one;
/// the output for overlapping fragments is unspecified.
pub fn emphasize<S: AsRef<str>>(verse: &str, fragments: &[S]) -> String {
    let replacement = format!("{EMPHASIS_OPEN}${{0}}{EMPHASIS_CLOSE}");
    fragments
        .iter()
        .filter_map(|f| fragment_pattern(f.as_ref()))
        .fold(verse.to_string(), |acc, re| {
            re.replace_all(&acc, replacement.as_str()).into_owned()
        })
}

/// Splits an emphasized verse into `(text, emphasized)` runs for rendering.
pub fn emphasis_runs(emphasized: &str) -> Vec<(&str, bool)> {
    let mut runs = Vec::new();
    let mut rest = emphasized;
    while let Some(open) = rest.find(EMPHASIS_OPEN) {
        let after_open = &rest[open + EMPHASIS_OPEN.len()..];
        let Some(close) = after_open.find(EMPHASIS_CLOSE) else {
            break;
        };
        if open > 0 {
            runs.push((&rest[..open], false));
        }
        runs.push((&after_open[..close], true));
        rest = &after_open[close + EMPHASIS_CLOSE.len()..];
    }
    if !rest.is_empty() {
        runs.push((rest, false));
    }
    runs
}
