//! Async driver for the conversational mode.
//!
//! `DialogueEngine` owns a `DialogueSession` behind a mutex and runs the
//! oracle calls the session's transitions ask for. The lock is never held
//! across an external call; after every await the session epoch is checked
//! so a reply that arrives after a reset is dropped.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::catalog::MetadataResolver;
use crate::oracle::HypothesisOracle;
use crate::protocol::calls::{ask_oracle, persist, resolve_metadata};
use crate::protocol::parse::{ParseOutcome, parse_dialogue_reply};
use crate::protocol::prompt::dialogue_request;
use crate::protocol::session::{AnswerEffect, DialogueSession, DialogueState, DialogueStep};
use crate::protocol::types::{ProtocolConfig, ProtocolError, ResolvedSong, UserHandle};
use crate::store::{ResultSink, SavedSong};

pub struct DialogueEngine {
    oracle: Arc<dyn HypothesisOracle>,
    resolver: Arc<dyn MetadataResolver>,
    sink: Arc<dyn ResultSink>,
    user: UserHandle,
    config: ProtocolConfig,
    session: Mutex<DialogueSession>,
}

impl DialogueEngine {
    pub fn new(
        oracle: Arc<dyn HypothesisOracle>,
        resolver: Arc<dyn MetadataResolver>,
        sink: Arc<dyn ResultSink>,
        user: UserHandle,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            oracle,
            resolver,
            sink,
            user,
            config,
            session: Mutex::new(DialogueSession::default()),
        }
    }

    /// Copy of the current session for rendering.
    pub async fn snapshot(&self) -> DialogueSession {
        self.session.lock().await.clone()
    }

    /// Record the opening clue and fetch the first question.
    pub async fn start_session(&self, first_clue: &str) -> Result<DialogueStep, ProtocolError> {
        self.session.lock().await.begin(first_clue)?;
        tracing::debug!("Dialogue session started");
        self.request_next_question().await
    }

    /// Ask the oracle for the next question or guess.
    ///
    /// Also the retry path after a failed step: transcript and asked
    /// questions are untouched by a failure, so calling this again repeats
    /// the same request.
    pub async fn request_next_question(&self) -> Result<DialogueStep, ProtocolError> {
        let epoch = {
            let session = self.session.lock().await;
            session.ensure_can_request()?;
            session.epoch()
        };
        match self.fetch_step(epoch).await {
            Ok(step) => Ok(step),
            Err(ProtocolError::Cancelled) => Err(ProtocolError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "Dialogue step failed");
                let mut session = self.session.lock().await;
                if session.epoch() == epoch {
                    session.set_error(e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn fetch_step(&self, epoch: u64) -> Result<DialogueStep, ProtocolError> {
        let min_questions = self.config.min_questions;
        let mut notice: Option<String> = None;
        let mut problem = String::from("no usable reply");

        for attempt in 1..=self.config.max_reply_attempts.max(1) {
            let request = {
                let session = self.session.lock().await;
                if session.epoch() != epoch {
                    return Err(ProtocolError::Cancelled);
                }
                dialogue_request(&session, min_questions, notice.as_deref())
            };

            let reply = ask_oracle(self.oracle.as_ref(), &request, self.config.call_timeout).await;
            if self.session.lock().await.epoch() != epoch {
                return Err(ProtocolError::Cancelled);
            }

            let text = match reply {
                Ok(text) => text,
                Err(ProtocolError::OracleMalformed(reason)) => {
                    tracing::debug!(attempt, reason = %reason, "Unusable dialogue reply");
                    problem = reason;
                    notice = None;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let reply = match parse_dialogue_reply(&text) {
                ParseOutcome::Parsed(reply) => reply,
                ParseOutcome::Malformed(reason) => {
                    tracing::debug!(attempt, reason = %reason, "Malformed dialogue reply");
                    notice = Some(format!(
                        "Your last reply could not be read ({reason}). Reply with only the JSON object."
                    ));
                    problem = reason;
                    continue;
                }
            };

            let mut session = self.session.lock().await;
            if session.epoch() != epoch {
                return Err(ProtocolError::Cancelled);
            }
            match session.apply_reply(reply, min_questions) {
                Ok(step) => return Ok(step),
                Err(rejection) => {
                    tracing::debug!(attempt, rejection = %rejection, "Refusing dialogue reply");
                    notice = Some(format!("Your last reply was refused: {rejection}."));
                    problem = rejection.to_string();
                }
            }
        }

        Err(ProtocolError::OracleMalformed(problem))
    }

    /// Answer the outstanding question with an option or free text.
    pub async fn answer(&self, answer: &str) -> Result<DialogueStep, ProtocolError> {
        let (effect, epoch) = {
            let mut session = self.session.lock().await;
            let effect = session.record_answer(answer)?;
            (effect, session.epoch())
        };
        self.follow(effect, epoch).await
    }

    /// Submit text typed in manual entry.
    pub async fn manual_submit(&self, text: &str) -> Result<DialogueStep, ProtocolError> {
        let (effect, epoch) = {
            let mut session = self.session.lock().await;
            let effect = session.submit_manual(text)?;
            (effect, session.epoch())
        };
        self.follow(effect, epoch).await
    }

    pub async fn enter_manual_override(&self) -> Result<(), ProtocolError> {
        self.session.lock().await.enter_manual_override()
    }

    pub async fn cancel_manual_override(&self) -> Result<(), ProtocolError> {
        self.session.lock().await.cancel_manual_override()
    }

    async fn follow(&self, effect: AnswerEffect, epoch: u64) -> Result<DialogueStep, ProtocolError> {
        match effect {
            AnswerEffect::NeedQuestion => self.request_next_question().await,
            AnswerEffect::ManualEntry => Ok(DialogueStep::ManualEntry),
            AnswerEffect::Confirmed(guess) => {
                let metadata = resolve_metadata(
                    self.resolver.as_ref(),
                    &guess.song,
                    &guess.artist,
                    self.config.call_timeout,
                )
                .await;
                let mut session = self.session.lock().await;
                if session.epoch() != epoch {
                    return Err(ProtocolError::Cancelled);
                }
                let resolved = session.resolve(metadata)?;
                tracing::info!(song = %resolved.song, artist = %resolved.artist, "Dialogue resolved");
                Ok(DialogueStep::Resolved(resolved))
            }
        }
    }

    /// Save the resolved song and start over. A failed write keeps the
    /// resolved state so the user can retry.
    pub async fn accept(&self) -> Result<ResolvedSong, ProtocolError> {
        let (epoch, resolved) = {
            let session = self.session.lock().await;
            match (session.state(), session.resolved()) {
                (DialogueState::Resolved, Some(resolved)) => (session.epoch(), resolved.clone()),
                (state, _) => {
                    return Err(ProtocolError::InvalidState {
                        state: state.describe(),
                        action: "accept a song",
                    });
                }
            }
        };

        let saved = SavedSong::from_resolved(&resolved);
        if let Err(e) = persist(
            self.config.call_timeout,
            self.sink.append_accepted(&self.user, &saved),
        )
        .await
        {
            tracing::warn!(song = %resolved.song, artist = %resolved.artist, error = %e, "Failed to save song");
            let mut session = self.session.lock().await;
            if session.epoch() == epoch {
                session.set_error(e.to_string());
            }
            return Err(e);
        }

        let mut session = self.session.lock().await;
        if session.epoch() == epoch {
            session.reset();
        }
        Ok(resolved)
    }

    /// Discard the resolved song and start over.
    pub async fn reject(&self) -> Result<(), ProtocolError> {
        let mut session = self.session.lock().await;
        if session.state() != DialogueState::Resolved {
            return Err(ProtocolError::InvalidState {
                state: session.state().describe(),
                action: "reject a song",
            });
        }
        session.reset();
        Ok(())
    }

    /// Clear the session and abandon any in-flight call.
    pub async fn reset(&self) {
        self.session.lock().await.reset();
        tracing::debug!("Dialogue session reset");
    }
}
