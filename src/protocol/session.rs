//! Conversational-mode session state.
//!
//! `DialogueSession` is the synchronous state machine behind
//! `DialogueEngine`: every transition is a method that validates the current
//! state and mutates the owned session. No I/O happens here, so the rules
//! (deduplication, guess floor, confirmation handling, manual override) can
//! be exercised directly.
//!
//! ```text
//! AwaitingFirstClue ──begin──▶ AwaitingAnswer ◀──────────────┐
//!                                │   ▲    │                   │ "No"
//!                         "Other"│   │    │ ready guess       │
//!                                ▼   │    ▼                   │
//!                         ManualOverride  AwaitingFinalConfirmation
//!                                               │ "Yes"
//!                                               ▼
//!                                            Resolved
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;

use crate::catalog::TrackMetadata;
use crate::protocol::parse::DialogueReply;
use crate::protocol::types::{ConversationTurn, PendingGuess, ProtocolError, ResolvedSong};

/// Option that switches the session into free-text entry.
pub const MANUAL_OPTION: &str = "Other";
pub const DEFAULT_OPTIONS: [&str; 3] = ["Yes", "No", "Unsure"];
pub const CONFIRM_OPTIONS: [&str; 2] = ["Yes", "No"];

const AFFIRMATIVE: [&str; 7] = ["yes", "y", "yeah", "yep", "correct", "that's it", "thats it"];

static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DialogueState {
    #[default]
    AwaitingFirstClue,
    AwaitingAnswer,
    ManualOverride,
    AwaitingFinalConfirmation,
    Resolved,
}

impl DialogueState {
    pub fn describe(self) -> &'static str {
        match self {
            DialogueState::AwaitingFirstClue => "waiting for a first clue",
            DialogueState::AwaitingAnswer => "waiting for an answer",
            DialogueState::ManualOverride => "typing a manual answer",
            DialogueState::AwaitingFinalConfirmation => "waiting for a guess to be confirmed",
            DialogueState::Resolved => "the song is already identified",
        }
    }
}

/// Lowercase, punctuation stripped, whitespace collapsed.
fn normalize_question(question: &str) -> String {
    let lower = question.to_lowercase();
    let stripped = NON_WORD_RE.replace_all(&lower, " ");
    WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

/// Questions posed in the current session, in asking order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AskedQuestionSet {
    questions: Vec<String>,
    keys: HashSet<String>,
}

impl AskedQuestionSet {
    /// Records `question`; returns false if an equivalent one was already asked.
    pub fn insert(&mut self, question: &str) -> bool {
        if !self.keys.insert(normalize_question(question)) {
            return false;
        }
        self.questions.push(question.trim().to_string());
        true
    }

    pub fn as_slice(&self) -> &[String] {
        &self.questions
    }
}

/// Why a parsed oracle reply could not be applied to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyRejection {
    PrematureGuess { asked: usize, required: usize },
    DuplicateQuestion(String),
    RepeatedGuess(PendingGuess),
    MissingQuestion,
}

impl fmt::Display for ReplyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyRejection::PrematureGuess { asked, required } => write!(
                f,
                "guessed after {asked} questions; ask at least {required} questions before guessing"
            ),
            ReplyRejection::DuplicateQuestion(q) => {
                write!(f, "the question \"{q}\" was already asked; ask a different question")
            }
            ReplyRejection::RepeatedGuess(g) => write!(
                f,
                "\"{}\" by {} was already rejected; do not guess it again",
                g.song, g.artist
            ),
            ReplyRejection::MissingQuestion => write!(f, "the reply had no question"),
        }
    }
}

/// What the caller should present after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogueStep {
    Question { question: String, options: Vec<String> },
    Confirm { question: String, guess: PendingGuess },
    ManualEntry,
    Resolved(ResolvedSong),
}

/// Follow-up work an answer requires from the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEffect {
    /// Ask the oracle for the next question.
    NeedQuestion,
    /// The user confirmed the pending guess; resolve its metadata.
    Confirmed(PendingGuess),
    /// The user picked the manual option.
    ManualEntry,
}

pub fn is_affirmative(answer: &str) -> bool {
    let answer = answer.trim().trim_end_matches(['!', '.']).to_lowercase();
    AFFIRMATIVE.contains(&answer.as_str())
}

fn question_options(options: Vec<String>) -> Vec<String> {
    let mut options: Vec<String> = options
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if options.is_empty() {
        options = DEFAULT_OPTIONS.iter().map(|o| o.to_string()).collect();
    }
    if !options.iter().any(|o| o.eq_ignore_ascii_case(MANUAL_OPTION)) {
        options.push(MANUAL_OPTION.to_string());
    }
    options
}

#[derive(Debug, Clone, Default)]
pub struct DialogueSession {
    state: DialogueState,
    transcript: Vec<ConversationTurn>,
    asked: AskedQuestionSet,
    current_question: Option<String>,
    options: Vec<String>,
    pending: Option<PendingGuess>,
    rejected: Vec<PendingGuess>,
    resolved: Option<ResolvedSong>,
    last_error: Option<String>,
    epoch: u64,
}

impl DialogueSession {
    pub fn state(&self) -> DialogueState {
        self.state
    }

    pub fn transcript(&self) -> &[ConversationTurn] {
        &self.transcript
    }

    pub fn asked_questions(&self) -> &[String] {
        self.asked.as_slice()
    }

    pub fn rejected_guesses(&self) -> &[PendingGuess] {
        &self.rejected
    }

    pub fn pending_guess(&self) -> Option<&PendingGuess> {
        self.pending.as_ref()
    }

    pub fn current_question(&self) -> Option<&str> {
        self.current_question.as_deref()
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn resolved(&self) -> Option<&ResolvedSong> {
        self.resolved.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    /// Counter bumped by every reset. Results computed against an older
    /// epoch must be discarded.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn invalid(&self, action: &'static str) -> ProtocolError {
        ProtocolError::InvalidState {
            state: self.state.describe(),
            action,
        }
    }

    /// Record the opening clue. The first question is requested separately.
    pub fn begin(&mut self, first_clue: &str) -> Result<(), ProtocolError> {
        if self.state != DialogueState::AwaitingFirstClue {
            return Err(self.invalid("start a new session"));
        }
        let clue = first_clue.trim();
        if clue.is_empty() {
            return Err(ProtocolError::EmptyClue);
        }
        self.transcript.push(ConversationTurn::user(clue));
        self.state = DialogueState::AwaitingAnswer;
        self.current_question = None;
        self.last_error = None;
        Ok(())
    }

    /// A question may be requested only when none is outstanding.
    pub fn ensure_can_request(&self) -> Result<(), ProtocolError> {
        if self.state == DialogueState::AwaitingAnswer && self.current_question.is_none() {
            Ok(())
        } else if self.state == DialogueState::AwaitingAnswer {
            Err(ProtocolError::InvalidState {
                state: "a question is waiting for an answer",
                action: "request another question",
            })
        } else {
            Err(self.invalid("request a question"))
        }
    }

    /// Apply a parsed oracle reply, enforcing deduplication and the guess floor.
    pub fn apply_reply(
        &mut self,
        reply: DialogueReply,
        min_questions: usize,
    ) -> Result<DialogueStep, ReplyRejection> {
        match reply.guess {
            Some(guess) => self.record_guess(guess, min_questions),
            None => self.record_question(&reply.question, reply.options),
        }
    }

    pub fn record_question(
        &mut self,
        question: &str,
        options: Vec<String>,
    ) -> Result<DialogueStep, ReplyRejection> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ReplyRejection::MissingQuestion);
        }
        if !self.asked.insert(question) {
            return Err(ReplyRejection::DuplicateQuestion(question.to_string()));
        }
        let options = question_options(options);
        self.transcript.push(ConversationTurn::assistant(question));
        self.current_question = Some(question.to_string());
        self.options = options.clone();
        self.state = DialogueState::AwaitingAnswer;
        self.last_error = None;
        Ok(DialogueStep::Question {
            question: question.to_string(),
            options,
        })
    }

    fn record_guess(
        &mut self,
        guess: PendingGuess,
        min_questions: usize,
    ) -> Result<DialogueStep, ReplyRejection> {
        if self.asked.as_slice().len() < min_questions {
            return Err(ReplyRejection::PrematureGuess {
                asked: self.asked.as_slice().len(),
                required: min_questions,
            });
        }
        if self.rejected.iter().any(|r| r.same_as(&guess)) {
            return Err(ReplyRejection::RepeatedGuess(guess));
        }
        let question = guess.confirmation_question();
        if !self.asked.insert(&question) {
            return Err(ReplyRejection::DuplicateQuestion(question));
        }
        self.transcript.push(ConversationTurn::assistant(question.clone()));
        self.current_question = Some(question.clone());
        self.options = CONFIRM_OPTIONS.iter().map(|o| o.to_string()).collect();
        self.pending = Some(guess.clone());
        self.state = DialogueState::AwaitingFinalConfirmation;
        self.last_error = None;
        Ok(DialogueStep::Confirm { question, guess })
    }

    /// Record an answer to the outstanding question.
    pub fn record_answer(&mut self, answer: &str) -> Result<AnswerEffect, ProtocolError> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(ProtocolError::EmptyAnswer);
        }
        match self.state {
            DialogueState::AwaitingFinalConfirmation if self.current_question.is_some() => {
                self.transcript.push(ConversationTurn::user(answer));
                self.current_question = None;
                if is_affirmative(answer) {
                    return match self.pending.clone() {
                        Some(guess) => Ok(AnswerEffect::Confirmed(guess)),
                        None => Err(self.invalid("confirm a guess")),
                    };
                }
                if let Some(guess) = self.pending.take() {
                    self.rejected.push(guess);
                }
                self.options.clear();
                self.state = DialogueState::AwaitingAnswer;
                Ok(AnswerEffect::NeedQuestion)
            }
            DialogueState::AwaitingAnswer if self.current_question.is_some() => {
                if answer.eq_ignore_ascii_case(MANUAL_OPTION) {
                    self.state = DialogueState::ManualOverride;
                    return Ok(AnswerEffect::ManualEntry);
                }
                self.transcript.push(ConversationTurn::user(answer));
                self.current_question = None;
                self.options.clear();
                Ok(AnswerEffect::NeedQuestion)
            }
            _ => Err(self.invalid("answer")),
        }
    }

    pub fn enter_manual_override(&mut self) -> Result<(), ProtocolError> {
        if self.state != DialogueState::AwaitingAnswer || self.current_question.is_none() {
            return Err(self.invalid("type a manual answer"));
        }
        self.state = DialogueState::ManualOverride;
        Ok(())
    }

    pub fn cancel_manual_override(&mut self) -> Result<(), ProtocolError> {
        if self.state != DialogueState::ManualOverride {
            return Err(self.invalid("leave manual entry"));
        }
        self.state = DialogueState::AwaitingAnswer;
        Ok(())
    }

    /// Submit free text typed in manual entry in place of a fixed option.
    pub fn submit_manual(&mut self, text: &str) -> Result<AnswerEffect, ProtocolError> {
        if self.state != DialogueState::ManualOverride {
            return Err(self.invalid("submit a manual answer"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ProtocolError::EmptyAnswer);
        }
        self.transcript.push(ConversationTurn::user(text));
        self.current_question = None;
        self.options.clear();
        self.state = DialogueState::AwaitingAnswer;
        Ok(AnswerEffect::NeedQuestion)
    }

    /// Finish a confirmed guess with whatever metadata was found.
    pub fn resolve(&mut self, metadata: TrackMetadata) -> Result<ResolvedSong, ProtocolError> {
        if self.state != DialogueState::AwaitingFinalConfirmation {
            return Err(self.invalid("resolve a guess"));
        }
        let Some(guess) = self.pending.take() else {
            return Err(self.invalid("resolve a guess"));
        };
        let resolved = ResolvedSong {
            song: guess.song,
            artist: guess.artist,
            verse: None,
            metadata,
        };
        self.resolved = Some(resolved.clone());
        self.options.clear();
        self.state = DialogueState::Resolved;
        Ok(resolved)
    }

    /// Discard all session state. Idempotent apart from the epoch.
    pub fn reset(&mut self) {
        let epoch = self.epoch.wrapping_add(1);
        *self = Self {
            epoch,
            ..Self::default()
        };
    }
}
