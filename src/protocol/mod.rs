//! Song identification protocol.
//!
//! Two modes share one data model and one error taxonomy:
//! - fragment mode (`IdentificationEngine`): the oracle proposes songs and
//!   each proposal is verified locally against the user's lyric fragments;
//! - conversational mode (`DialogueEngine`): the oracle asks questions until
//!   it is confident enough to guess, and the user confirms or rejects.
//!
//! Engines receive their collaborators (`HypothesisOracle`,
//! `MetadataResolver`, `ResultSink`) already built and never read
//! credentials themselves.

mod calls;
pub mod dialogue;
pub mod fragment;
pub mod matcher;
pub mod parse;
pub mod prompt;
pub mod session;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use dialogue::DialogueEngine;
pub use fragment::{FragmentStatus, IdentificationEngine};
pub use session::{DialogueSession, DialogueState, DialogueStep, MANUAL_OPTION};
pub use types::{
    ClueFilters, ConversationTurn, LyricClue, ProtocolConfig, ProtocolError, ResolvedSong,
    Speaker, UserHandle,
};
