//! Text-generation boundary. The protocol only ever sees `generate`.

pub mod gemini;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::ConversationTurn;

pub use gemini::GeminiOracle;

/// A single request to the oracle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleRequest {
    /// Standing instruction describing the task and the reply format.
    pub instruction: String,
    /// Prior conversation, oldest first.
    pub history: Vec<ConversationTurn>,
    /// The message this request is answering.
    pub message: String,
}

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Empty response")]
    Empty,
}

#[async_trait]
pub trait HypothesisOracle: Send + Sync {
    /// Send one request and return the raw text reply.
    async fn generate(&self, request: &OracleRequest) -> Result<String, OracleError>;
}
