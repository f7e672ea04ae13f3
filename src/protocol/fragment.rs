//! Fragment-mode identification.
//!
//! The engine asks the oracle for one `{song, artist, verse}` hypothesis at a
//! time and accepts the first whose verse really contains one of the user's
//! fragments. Attempts are strictly sequential and bounded by
//! `ProtocolConfig::max_attempts`; every oracle call counts against the
//! bound, whether it failed, was malformed, or proposed a wrong song.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::catalog::MetadataResolver;
use crate::oracle::HypothesisOracle;
use crate::protocol::calls::{ask_oracle, persist, resolve_metadata};
use crate::protocol::matcher;
use crate::protocol::parse::{ParseOutcome, parse_hypothesis};
use crate::protocol::prompt::hypothesis_request;
use crate::protocol::types::{
    Hypothesis, LyricClue, ProtocolConfig, ProtocolError, ResolvedSong, UserHandle,
};
use crate::store::{RecentEntry, ResultSink, SavedSong};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentStatus {
    #[default]
    Idle,
    Searching,
    Found,
    Exhausted,
    Failed,
}

impl FragmentStatus {
    pub fn describe(self) -> &'static str {
        match self {
            FragmentStatus::Idle => "no search has run",
            FragmentStatus::Searching => "a search is running",
            FragmentStatus::Found => "a song is waiting to be accepted",
            FragmentStatus::Exhausted => "the search ran out of attempts",
            FragmentStatus::Failed => "the oracle could not be reached",
        }
    }
}

#[derive(Debug, Default)]
struct FragmentSession {
    epoch: u64,
    attempt_count: u32,
    status: FragmentStatus,
    result: Option<ResolvedSong>,
}

impl FragmentSession {
    fn reset(&mut self) {
        let epoch = self.epoch.wrapping_add(1);
        *self = Self {
            epoch,
            ..Self::default()
        };
    }

    /// Put an abandoned search back to `Idle`.
    fn abandon(&mut self, epoch: u64) {
        if self.epoch == epoch && self.status == FragmentStatus::Searching {
            self.status = FragmentStatus::Idle;
        }
    }
}

/// Clears `Searching` if an `identify` future is dropped mid-search.
struct SearchGuard {
    session: Arc<Mutex<FragmentSession>>,
    epoch: u64,
}

impl Drop for SearchGuard {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock() {
            session.abandon(self.epoch);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            let epoch = self.epoch;
            handle.spawn(async move { session.lock().await.abandon(epoch) });
        }
    }
}

pub struct IdentificationEngine {
    oracle: Arc<dyn HypothesisOracle>,
    resolver: Arc<dyn MetadataResolver>,
    sink: Arc<dyn ResultSink>,
    user: UserHandle,
    config: ProtocolConfig,
    session: Arc<Mutex<FragmentSession>>,
}

impl IdentificationEngine {
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
            session: Arc::new(Mutex::new(FragmentSession::default())),
        }
    }

    pub async fn status(&self) -> FragmentStatus {
        self.session.lock().await.status
    }

    /// Oracle calls spent by the current or most recent search.
    pub async fn attempt_count(&self) -> u32 {
        self.session.lock().await.attempt_count
    }

    #[cfg(test)]
    pub async fn result(&self) -> Option<ResolvedSong> {
        self.session.lock().await.result.clone()
    }

    /// Discard any result and abandon an in-flight search.
    pub async fn reset(&self) {
        self.session.lock().await.reset();
        tracing::debug!("Fragment session reset");
    }

    /// Fail with `Cancelled` if a reset happened since `epoch` was taken.
    async fn ensure_current(&self, epoch: u64) -> Result<(), ProtocolError> {
        if self.session.lock().await.epoch != epoch {
            return Err(ProtocolError::Cancelled);
        }
        Ok(())
    }

    /// Search for a song whose real lyrics contain one of the clue's fragments.
    pub async fn identify(&self, clue: &LyricClue) -> Result<ResolvedSong, ProtocolError> {
        if clue.is_empty() {
            return Err(ProtocolError::EmptyClue);
        }
        let epoch = {
            let mut session = self.session.lock().await;
            if session.status == FragmentStatus::Searching {
                return Err(ProtocolError::InvalidState {
                    state: FragmentStatus::Searching.describe(),
                    action: "start another search",
                });
            }
            session.status = FragmentStatus::Searching;
            session.attempt_count = 0;
            session.result = None;
            session.epoch
        };
        let _guard = SearchGuard {
            session: self.session.clone(),
            epoch,
        };

        let max_attempts = self.config.max_attempts.max(1);
        let fragments = clue.fragments();
        let mut rejected: Vec<Hypothesis> = Vec::new();
        let mut transport_failures = 0u32;
        let mut verified = None;

        for attempt in 1..=max_attempts {
            {
                let mut session = self.session.lock().await;
                if session.epoch != epoch {
                    return Err(ProtocolError::Cancelled);
                }
                session.attempt_count = attempt;
            }

            let request = hypothesis_request(clue, &rejected);
            let reply = ask_oracle(self.oracle.as_ref(), &request, self.config.call_timeout).await;
            self.ensure_current(epoch).await?;

            let text = match reply {
                Ok(text) => text,
                Err(e @ ProtocolError::OracleUnavailable(_)) => {
                    transport_failures += 1;
                    tracing::warn!(attempt, error = %e, "Oracle call failed");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Skipping attempt");
                    continue;
                }
            };

            let hypothesis = match parse_hypothesis(&text) {
                ParseOutcome::Parsed(h) => h,
                ParseOutcome::Malformed(reason) => {
                    tracing::debug!(attempt, reason = %reason, "Skipping malformed hypothesis");
                    continue;
                }
            };

            let verse = hypothesis.verse.as_deref().unwrap_or_default();
            if matcher::matches(verse, fragments) {
                tracing::info!(
                    attempt,
                    song = %hypothesis.song,
                    artist = %hypothesis.artist,
                    "Verified hypothesis"
                );
                verified = Some(hypothesis);
                break;
            }

            if rejected
                .iter()
                .any(|r| r.same_song(&hypothesis.song, &hypothesis.artist))
            {
                tracing::debug!(
                    attempt,
                    song = %hypothesis.song,
                    artist = %hypothesis.artist,
                    "Repeated hypothesis still does not match"
                );
                continue;
            }

            tracing::debug!(
                attempt,
                song = %hypothesis.song,
                artist = %hypothesis.artist,
                "Verse does not contain any fragment"
            );
            rejected.push(hypothesis);
        }

        let Some(hypothesis) = verified else {
            let (status, err) = if transport_failures == max_attempts {
                (
                    FragmentStatus::Failed,
                    ProtocolError::OracleUnavailable(format!("all {max_attempts} oracle calls failed")),
                )
            } else {
                (
                    FragmentStatus::Exhausted,
                    ProtocolError::NoVerifiedMatch {
                        attempts: max_attempts,
                    },
                )
            };
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return Err(ProtocolError::Cancelled);
            }
            session.status = status;
            return Err(err);
        };

        let metadata = resolve_metadata(
            self.resolver.as_ref(),
            &hypothesis.song,
            &hypothesis.artist,
            self.config.call_timeout,
        )
        .await;

        let resolved = ResolvedSong {
            verse: hypothesis
                .verse
                .as_deref()
                .map(|v| matcher::emphasize(v, fragments)),
            song: hypothesis.song,
            artist: hypothesis.artist,
            metadata,
        };

        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            return Err(ProtocolError::Cancelled);
        }
        session.status = FragmentStatus::Found;
        session.result = Some(resolved.clone());
        self.record_recent(&resolved);
        Ok(resolved)
    }

    /// Write the recent-search entry in the background; failures are logged only.
    fn record_recent(&self, resolved: &ResolvedSong) {
        let sink = self.sink.clone();
        let user = self.user.clone();
        let limit = self.config.call_timeout;
        let entry = RecentEntry::new(&resolved.song, &resolved.artist);
        tokio::spawn(async move {
            if let Err(e) = persist(limit, sink.append_recent(&user, &entry)).await {
                tracing::warn!(error = %e, "Failed to record recent search");
            }
        });
    }

    /// Save the found song for the user and start over. On a failed write
    /// the result stays available so the user can retry.
    pub async fn accept(&self) -> Result<ResolvedSong, ProtocolError> {
        let (epoch, resolved) = {
            let session = self.session.lock().await;
            match (&session.status, &session.result) {
                (FragmentStatus::Found, Some(resolved)) => (session.epoch, resolved.clone()),
                _ => {
                    return Err(ProtocolError::InvalidState {
                        state: session.status.describe(),
                        action: "accept a result",
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
            return Err(e);
        }

        let mut session = self.session.lock().await;
        if session.epoch == epoch {
            session.reset();
        }
        Ok(resolved)
    }

    /// Throw the found song away and start over.
    pub async fn reject(&self) -> Result<(), ProtocolError> {
        let mut session = self.session.lock().await;
        if session.status != FragmentStatus::Found {
            return Err(ProtocolError::InvalidState {
                state: session.status.describe(),
                action: "reject a result",
            });
        }
        session.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TrackMetadata;
    use crate::protocol::testing::{
        GatedOracle, MemorySink, ScriptedOracle, StaticResolver, hypothesis_json,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Harness {
        oracle: Arc<ScriptedOracle>,
        resolver: Arc<StaticResolver>,
        sink: Arc<MemorySink>,
        engine: IdentificationEngine,
    }

    fn harness_with(oracle: ScriptedOracle, resolver: StaticResolver, sink: MemorySink) -> Harness {
        build(oracle, resolver, sink, ProtocolConfig::default())
    }

    fn harness_config(oracle: ScriptedOracle, config: ProtocolConfig) -> Harness {
        build(oracle, StaticResolver::default(), MemorySink::default(), config)
    }

    fn build(
        oracle: ScriptedOracle,
        resolver: StaticResolver,
        sink: MemorySink,
        config: ProtocolConfig,
    ) -> Harness {
        let oracle = Arc::new(oracle);
        let resolver = Arc::new(resolver);
        let sink = Arc::new(sink);
        let engine = IdentificationEngine::new(
            oracle.clone(),
            resolver.clone(),
            sink.clone(),
            UserHandle::new("tester"),
            config,
        );
        Harness {
            oracle,
            resolver,
            sink,
            engine,
        }
    }

    fn harness(oracle: ScriptedOracle) -> Harness {
        harness_with(oracle, StaticResolver::default(), MemorySink::default())
    }

    fn rain() -> LyricClue {
        LyricClue::new(["walked alone in the rain"])
    }

    /// Recent entries once the background write has had a chance to run.
    async fn recorded(sink: &MemorySink) -> Vec<RecentEntry> {
        for _ in 0..100 {
            if !sink.recent().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        sink.recent()
    }

    #[tokio::test]
    async fn verifies_on_second_attempt() {
        let h = harness(ScriptedOracle::new([
            hypothesis_json("X", "Y", "I laughed in the sun"),
            hypothesis_json("A", "B", "I walked alone in the rain last night"),
        ]));

        let resolved = h.engine.identify(&rain()).await.expect("match");

        assert_eq!(resolved.song, "A");
        assert_eq!(resolved.artist, "B");
        assert_eq!(
            resolved.verse.as_deref(),
            Some("I «walked alone in the rain» last night")
        );
        assert_eq!(h.oracle.calls(), 2);
        assert_eq!(h.engine.attempt_count().await, 2);
        assert_eq!(h.engine.status().await, FragmentStatus::Found);
    }

    #[tokio::test]
    async fn second_request_excludes_rejected_song() {
        let h = harness(ScriptedOracle::new([
            hypothesis_json("X", "Y", "I laughed in the sun"),
            hypothesis_json("A", "B", "walked alone in the rain"),
        ]));
        h.engine.identify(&rain()).await.expect("match");

        let requests = h.oracle.requests();
        assert!(!requests[0].message.contains("\"X\" by Y"));
        assert!(requests[1].message.contains("\"X\" by Y"));
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_attempts() {
        let oracle = ScriptedOracle::default();
        for i in 0..15 {
            oracle.push(hypothesis_json(&format!("Song {i}"), "Nobody", "nothing relevant"));
        }
        let h = harness(oracle);

        let err = h.engine.identify(&rain()).await.expect_err("exhausted");

        assert!(matches!(err, ProtocolError::NoVerifiedMatch { attempts: 10 }));
        assert_eq!(h.oracle.calls(), 10);
        assert_eq!(h.engine.status().await, FragmentStatus::Exhausted);
        assert!(h.sink.recent().is_empty());
    }

    #[tokio::test]
    async fn malformed_and_repeated_replies_count_toward_bound() {
        let oracle = ScriptedOracle::new([
            "I think it might be something by Queen".to_string(),
            hypothesis_json("X", "Y", "I laughed in the sun"),
            hypothesis_json("x", "y", "I laughed in the sun again"),
            r#"{"song": "A", "artist": "B"}"#.to_string(),
            hypothesis_json("A", "B", "Walked Alone In The Rain"),
        ]);
        let h = harness(oracle);

        let resolved = h.engine.identify(&rain()).await.expect("match");

        assert_eq!(resolved.song, "A");
        assert_eq!(h.oracle.calls(), 5);
        assert_eq!(
            resolved.verse.as_deref(),
            Some("«Walked Alone In The Rain»")
        );
        let last = h.oracle.requests().pop().expect("request");
        assert_eq!(last.message.matches("\"X\" by Y").count(), 1);
    }

    #[tokio::test]
    async fn earlier_miss_does_not_block_a_matching_verse() {
        let h = harness_config(
            ScriptedOracle::new([
                hypothesis_json("A", "B", "I laughed in the sun"),
                hypothesis_json("A", "B", "I walked alone in the rain last night"),
            ]),
            ProtocolConfig {
                max_attempts: 2,
                ..ProtocolConfig::default()
            },
        );

        let resolved = h.engine.identify(&rain()).await.expect("match");

        assert_eq!(resolved.song, "A");
        assert_eq!(h.oracle.calls(), 2);
        assert_eq!(h.engine.status().await, FragmentStatus::Found);
    }

    #[tokio::test]
    async fn verifies_on_the_last_allowed_attempt() {
        let oracle = ScriptedOracle::default();
        for i in 0..9 {
            oracle.push(hypothesis_json(&format!("Song {i}"), "Nobody", "nothing relevant"));
        }
        oracle.push(hypothesis_json("A", "B", "walked alone in the rain"));
        oracle.push(hypothesis_json("Never", "Asked", "walked alone in the rain"));
        let h = harness(oracle);

        let resolved = h.engine.identify(&rain()).await.expect("match");

        assert_eq!(resolved.song, "A");
        assert_eq!(h.oracle.calls(), 10);
        assert_eq!(h.engine.attempt_count().await, 10);
    }

    #[tokio::test]
    async fn all_transport_failures_report_unavailable() {
        let oracle = ScriptedOracle::default();
        for _ in 0..10 {
            oracle.push_failure("HTTP 503");
        }
        let h = harness(oracle);

        let err = h.engine.identify(&rain()).await.expect_err("unavailable");

        assert!(matches!(err, ProtocolError::OracleUnavailable(_)));
        assert_eq!(h.oracle.calls(), 10);
        assert_eq!(h.engine.status().await, FragmentStatus::Failed);
    }

    #[tokio::test]
    async fn mixed_failures_still_exhaust() {
        let oracle = ScriptedOracle::default();
        oracle.push("garbage");
        for _ in 0..9 {
            oracle.push_failure("HTTP 500");
        }
        let h = harness(oracle);

        let err = h.engine.identify(&rain()).await.expect_err("exhausted");
        assert!(matches!(err, ProtocolError::NoVerifiedMatch { attempts: 10 }));
    }

    #[tokio::test]
    async fn empty_clue_is_refused_without_calls() {
        let h = harness(ScriptedOracle::default());
        let err = h
            .engine
            .identify(&LyricClue::new(["   "]))
            .await
            .expect_err("empty");
        assert!(matches!(err, ProtocolError::EmptyClue));
        assert_eq!(h.oracle.calls(), 0);
        assert_eq!(h.engine.status().await, FragmentStatus::Idle);
    }

    #[tokio::test]
    async fn metadata_is_attached_when_found() {
        let metadata = TrackMetadata {
            album_name: Some("Rainy Days".into()),
            catalog_id: Some("abc123".into()),
            genres: vec!["rock".into()],
            ..Default::default()
        };
        let h = harness_with(
            ScriptedOracle::new([hypothesis_json("A", "B", "walked alone in the rain")]),
            StaticResolver::with(metadata.clone()),
            MemorySink::default(),
        );

        let resolved = h.engine.identify(&rain()).await.expect("match");

        assert_eq!(resolved.metadata, metadata);
        assert_eq!(h.resolver.lookups(), 1);
    }

    #[tokio::test]
    async fn catalog_failure_leaves_metadata_empty() {
        let h = harness_with(
            ScriptedOracle::new([hypothesis_json("A", "B", "walked alone in the rain")]),
            StaticResolver::failing(),
            MemorySink::default(),
        );

        let resolved = h.engine.identify(&rain()).await.expect("match");

        assert!(resolved.metadata.is_empty());
        assert_eq!(h.engine.status().await, FragmentStatus::Found);
    }

    #[tokio::test]
    async fn success_records_recent_entry() {
        let h = harness(ScriptedOracle::new([hypothesis_json(
            "A",
            "B",
            "walked alone in the rain",
        )]));
        h.engine.identify(&rain()).await.expect("match");

        let recent = recorded(&h.sink).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].song, "A");
        assert_eq!(recent[0].artist, "B");
    }

    #[tokio::test]
    async fn recent_write_failure_is_not_fatal() {
        let h = harness_with(
            ScriptedOracle::new([hypothesis_json("A", "B", "walked alone in the rain")]),
            StaticResolver::default(),
            MemorySink::failing(),
        );
        let resolved = h.engine.identify(&rain()).await.expect("match");
        assert_eq!(resolved.song, "A");
        assert_eq!(h.engine.status().await, FragmentStatus::Found);
    }

    #[tokio::test]
    async fn accept_saves_and_resets() {
        let h = harness(ScriptedOracle::new([hypothesis_json(
            "A",
            "B",
            "walked alone in the rain",
        )]));
        h.engine.identify(&rain()).await.expect("match");

        let accepted = h.engine.accept().await.expect("accept");

        assert_eq!(accepted.song, "A");
        let saved = h.sink.accepted();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].verse.as_deref(), Some("«walked alone in the rain»"));
        assert_eq!(h.engine.status().await, FragmentStatus::Idle);
        assert_eq!(h.engine.result().await, None);
    }

    #[tokio::test]
    async fn failed_save_keeps_result() {
        let h = harness_with(
            ScriptedOracle::new([hypothesis_json("A", "B", "walked alone in the rain")]),
            StaticResolver::default(),
            MemorySink::failing(),
        );
        h.engine.identify(&rain()).await.expect("match");

        let err = h.engine.accept().await.expect_err("save fails");

        assert!(matches!(err, ProtocolError::PersistenceFailure(_)));
        assert_eq!(h.engine.status().await, FragmentStatus::Found);
        assert!(h.engine.result().await.is_some());
    }

    #[tokio::test]
    async fn reject_discards_result() {
        let h = harness(ScriptedOracle::new([hypothesis_json(
            "A",
            "B",
            "walked alone in the rain",
        )]));
        h.engine.identify(&rain()).await.expect("match");

        h.engine.reject().await.expect("reject");

        assert_eq!(h.engine.status().await, FragmentStatus::Idle);
        assert!(h.sink.accepted().is_empty());
        assert!(matches!(
            h.engine.reject().await,
            Err(ProtocolError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn accept_without_result_is_refused() {
        let h = harness(ScriptedOracle::default());
        assert!(matches!(
            h.engine.accept().await,
            Err(ProtocolError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn reset_during_request_discards_reply() {
        let oracle = Arc::new(GatedOracle::new(hypothesis_json(
            "A",
            "B",
            "walked alone in the rain",
        )));
        let sink = Arc::new(MemorySink::default());
        let engine = Arc::new(IdentificationEngine::new(
            oracle.clone(),
            Arc::new(StaticResolver::default()),
            sink.clone(),
            UserHandle::new("tester"),
            ProtocolConfig::default(),
        ));

        let search = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.identify(&rain()).await })
        };
        oracle.started.notified().await;
        engine.reset().await;
        oracle.release.notify_one();

        let outcome = search.await.expect("join");
        assert!(matches!(outcome, Err(ProtocolError::Cancelled)));
        assert_eq!(engine.status().await, FragmentStatus::Idle);
        assert_eq!(engine.result().await, None);
        tokio::task::yield_now().await;
        assert!(sink.recent().is_empty());
    }

    #[tokio::test]
    async fn slow_recent_write_does_not_delay_result() {
        let h = harness_with(
            ScriptedOracle::new([hypothesis_json("A", "B", "walked alone in the rain")]),
            StaticResolver::default(),
            MemorySink::hanging_recent(),
        );

        let resolved = tokio::time::timeout(Duration::from_secs(1), h.engine.identify(&rain()))
            .await
            .expect("identify should not wait on the recent write")
            .expect("match");

        assert_eq!(resolved.song, "A");
        assert_eq!(h.engine.status().await, FragmentStatus::Found);
    }

    #[tokio::test]
    async fn dropped_search_returns_to_idle() {
        let oracle = Arc::new(GatedOracle::new(hypothesis_json(
            "A",
            "B",
            "walked alone in the rain",
        )));
        let engine = IdentificationEngine::new(
            oracle.clone(),
            Arc::new(StaticResolver::default()),
            Arc::new(MemorySink::default()),
            UserHandle::new("tester"),
            ProtocolConfig::default(),
        );

        let fragment = rain();
        tokio::select! {
            _ = engine.identify(&fragment) => panic!("gated oracle replied early"),
            _ = oracle.started.notified() => {}
        }

        assert_eq!(engine.status().await, FragmentStatus::Idle);
        assert_eq!(engine.result().await, None);
    }
}
