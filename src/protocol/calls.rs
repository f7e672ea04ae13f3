//! Bounded calls into the external collaborators.
//!
//! Every call is bounded by `call_timeout` and every failure is mapped onto
//! `ProtocolError`.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::catalog::{MetadataResolver, TrackMetadata};
use crate::oracle::{HypothesisOracle, OracleError, OracleRequest};
use crate::protocol::types::ProtocolError;
use crate::store::StoreError;

pub(crate) async fn ask_oracle(
    oracle: &dyn HypothesisOracle,
    request: &OracleRequest,
    limit: Duration,
) -> Result<String, ProtocolError> {
    match timeout(limit, oracle.generate(request)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(OracleError::Empty)) => Err(ProtocolError::OracleMalformed("empty response".to_string())),
        Ok(Err(OracleError::Serde(e))) => Err(ProtocolError::OracleMalformed(e.to_string())),
        Ok(Err(e)) => Err(ProtocolError::OracleUnavailable(e.to_string())),
        Err(_) => Err(ProtocolError::OracleUnavailable(format!(
            "no reply within {}s",
            limit.as_secs()
        ))),
    }
}

/// Look up catalog metadata. Misses and failures yield empty metadata.
pub(crate) async fn resolve_metadata(
    resolver: &dyn MetadataResolver,
    song: &str,
    artist: &str,
    limit: Duration,
) -> TrackMetadata {
    let miss = match timeout(limit, resolver.search(song, artist)).await {
        Ok(Ok(Some(metadata))) => return metadata,
        Ok(Ok(None)) => ProtocolError::MetadataUnavailable("no catalog match".to_string()),
        Ok(Err(e)) => ProtocolError::MetadataUnavailable(e.to_string()),
        Err(_) => ProtocolError::MetadataUnavailable("catalog lookup timed out".to_string()),
    };
    tracing::warn!(song, artist, error = %miss, "Continuing without metadata");
    TrackMetadata::default()
}

pub(crate) async fn persist<F>(limit: Duration, write: F) -> Result<(), ProtocolError>
where
    F: Future<Output = Result<(), StoreError>>,
{
    match timeout(limit, write).await {
        Ok(result) => result.map_err(ProtocolError::PersistenceFailure),
        Err(_) => Err(ProtocolError::PersistenceFailure(StoreError::Timeout(limit))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{ScriptedOracle, StaticResolver};

    #[tokio::test]
    async fn oracle_failures_map_to_protocol_errors() {
        let oracle = ScriptedOracle::default();
        oracle.push_failure("HTTP 503");
        let err = ask_oracle(&oracle, &OracleRequest::default(), Duration::from_secs(1))
            .await
            .expect_err("failure");
        assert!(matches!(err, ProtocolError::OracleUnavailable(msg) if msg.contains("503")));
    }

    #[tokio::test]
    async fn hung_oracle_times_out() {
        let oracle = crate::protocol::testing::GatedOracle::new("never");
        let err = ask_oracle(&oracle, &OracleRequest::default(), Duration::from_millis(50))
            .await
            .expect_err("timeout");
        assert!(matches!(err, ProtocolError::OracleUnavailable(msg) if msg.starts_with("no reply within")));
    }

    #[tokio::test]
    async fn metadata_misses_are_empty() {
        let limit = Duration::from_secs(1);
        assert!(resolve_metadata(&StaticResolver::default(), "A", "B", limit).await.is_empty());
        assert!(resolve_metadata(&StaticResolver::failing(), "A", "B", limit).await.is_empty());
        let found = TrackMetadata {
            album_name: Some("Album".into()),
            ..Default::default()
        };
        assert_eq!(
            resolve_metadata(&StaticResolver::with(found.clone()), "A", "B", limit).await,
            found
        );
    }

    #[tokio::test]
    async fn store_errors_become_persistence_failures() {
        let err = persist(Duration::from_secs(1), async {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        })
        .await
        .expect_err("failure");
        assert!(matches!(err, ProtocolError::PersistenceFailure(_)));
    }
}
