//! Scripted collaborators for protocol tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::catalog::{CatalogError, MetadataResolver, TrackMetadata};
use crate::oracle::{HypothesisOracle, OracleError, OracleRequest};
use crate::protocol::UserHandle;
use crate::store::{RecentEntry, ResultSink, SavedSong, StoreError};

/// Replays canned replies in order; runs dry with an API error.
#[derive(Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let oracle = Self::default();
        for reply in replies {
            oracle.push(reply);
        }
        oracle
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.replies.lock().expect("replies").push_back(Ok(reply.into()));
    }

    /// Queue a transport failure.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.replies.lock().expect("replies").push_back(Err(message.into()));
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl HypothesisOracle for ScriptedOracle {
    async fn generate(&self, request: &OracleRequest) -> Result<String, OracleError> {
        self.requests.lock().expect("requests").push(request.clone());
        match self.replies.lock().expect("replies").pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(OracleError::Api(message)),
            None => Err(OracleError::Api("script exhausted".to_string())),
        }
    }
}

/// Oracle that blocks until released, for reset-during-request tests.
#[derive(Default)]
pub struct GatedOracle {
    pub started: Notify,
    pub release: Notify,
    pub reply: String,
}

impl GatedOracle {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl HypothesisOracle for GatedOracle {
    async fn generate(&self, _request: &OracleRequest) -> Result<String, OracleError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(self.reply.clone())
    }
}

/// Resolver returning fixed metadata, or nothing.
#[derive(Default)]
pub struct StaticResolver {
    pub metadata: Option<TrackMetadata>,
    pub fail: bool,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn with(metadata: TrackMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataResolver for StaticResolver {
    async fn search(&self, _song: &str, _artist: &str) -> Result<Option<TrackMetadata>, CatalogError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CatalogError::Api("catalog down".to_string()));
        }
        Ok(self.metadata.clone())
    }
}

/// In-memory sink that can be told to fail.
#[derive(Default)]
pub struct MemorySink {
    pub accepted: Mutex<Vec<SavedSong>>,
    pub recent: Mutex<Vec<RecentEntry>>,
    pub fail: bool,
    /// Recent-search writes never complete.
    pub hang_recent: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn hanging_recent() -> Self {
        Self {
            hang_recent: true,
            ..Self::default()
        }
    }

    pub fn accepted(&self) -> Vec<SavedSong> {
        self.accepted.lock().expect("accepted").clone()
    }

    pub fn recent(&self) -> Vec<RecentEntry> {
        self.recent.lock().expect("recent").clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn append_accepted(&self, _user: &UserHandle, song: &SavedSong) -> Result<(), StoreError> {
        self.check()?;
        self.accepted.lock().expect("accepted").push(song.clone());
        Ok(())
    }

    async fn append_recent(&self, _user: &UserHandle, entry: &RecentEntry) -> Result<(), StoreError> {
        if self.hang_recent {
            std::future::pending::<()>().await;
        }
        self.check()?;
        self.recent.lock().expect("recent").push(entry.clone());
        Ok(())
    }

    async fn remove(&self, _user: &UserHandle, song: &str, artist: &str) -> Result<(), StoreError> {
        self.check()?;
        self.accepted
            .lock()
            .expect("accepted")
            .retain(|s| !(s.song.eq_ignore_ascii_case(song) && s.artist.eq_ignore_ascii_case(artist)));
        Ok(())
    }
}

/// JSON reply for a fragment-mode hypothesis.
pub fn hypothesis_json(song: &str, artist: &str, verse: &str) -> String {
    serde_json::json!({ "song": song, "artist": artist, "verse": verse }).to_string()
}

/// JSON reply for a dialogue question.
pub fn question_json(question: &str) -> String {
    serde_json::json!({ "question": question, "options": ["Yes", "No", "Unsure"], "ready": false }).to_string()
}

/// JSON reply for a dialogue guess.
pub fn guess_json(song: &str, artist: &str) -> String {
    serde_json::json!({
        "question": format!("Is it {song} by {artist}?"),
        "options": ["Yes", "No"],
        "ready": true,
        "song": song,
        "artist": artist,
    })
    .to_string()
}
