//! Visit ingestion.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::Instant;
use url::Url;
use visitstat_storage::{Metrics, Partition, Visit, VisitStore, VisitorId};

use crate::{
    error::{EngineError, EngineResult},
    identity,
    origin::OriginPolicy,
    readiness::ReadinessManager,
    timeout::bounded,
};

/// One page view as reported by a client.
///
/// ```
/// use visitstat_engine::VisitRequest;
///
/// let request = VisitRequest::builder()
///     .declared_url("https://blog.example.com/posts/1")
///     .client_address("203.0.113.7")
///     .origin("https://blog.example.com")
///     .build();
/// assert!(request.visitor_token.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct VisitRequest {
    /// `Origin` header of the request, if any.
    #[builder(into)]
    pub origin: Option<String>,
    /// Absolute URL of the visited page, as declared by the client.
    #[builder(into)]
    pub declared_url: String,
    /// User agent declared by the client.
    #[builder(into, default)]
    pub user_agent: String,
    /// Network address of the client.
    #[builder(into)]
    pub client_address: String,
    /// Referrer declared by the client.
    #[builder(into, default)]
    pub referrer: String,
    /// Visitor token previously handed to the client.
    #[builder(into)]
    pub visitor_token: Option<String>,
}

/// Result of recording a visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Token stored with the visit.
    pub visitor_id: VisitorId,
    /// `true` when the client should store `visitor_id` as a new token.
    pub is_new: bool,
    /// Origin to echo for CORS, when the request carried an allowed one.
    pub allow_origin: Option<String>,
    /// Partition the visit was stored in.
    pub partition: Partition,
    /// Path the visit was stored under.
    pub path: String,
}

/// Where a declared URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Location {
    pub(crate) origin: String,
    pub(crate) partition: Partition,
    pub(crate) path: String,
}

impl Location {
    /// Splits a declared URL into origin, partition and path.
    pub(crate) fn parse(declared_url: &str) -> EngineResult<Self> {
        let url = Url::parse(declared_url).map_err(|err| EngineError::invalid_url_with_source(declared_url, err))?;
        let Some(host) = url.host_str().filter(|h| !h.is_empty()) else {
            return Err(EngineError::invalid_url(declared_url, "missing host"));
        };
        let partition = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        Ok(Self {
            origin: format!("{}://{partition}", url.scheme()),
            partition: Partition::new(partition),
            path: url.path().to_owned(),
        })
    }
}

/// Validates and persists visits.
pub struct Ingestor<S: ?Sized> {
    store: Arc<S>,
    policy: Arc<dyn OriginPolicy>,
    readiness: Arc<ReadinessManager<S>>,
    timeout: Duration,
    metrics: Metrics,
}

impl<S: VisitStore + ?Sized + 'static> Ingestor<S> {
    /// Creates an ingestor bounding every insert by `timeout`.
    pub fn new(
        store: Arc<S>,
        policy: Arc<dyn OriginPolicy>,
        readiness: Arc<ReadinessManager<S>>,
        timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self { store, policy, readiness, timeout, metrics }
    }

    /// Records one visit.
    ///
    /// The visit is stored under the host (and explicit port) of the
    /// declared URL, after its `scheme://host[:port]` origin passed the
    /// policy. A successful insert asks the readiness manager to ensure the
    /// partition's indexes without waiting for it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidUrl`] if the declared URL has no host
    /// - [`EngineError::OriginRejected`] if the policy refuses the origin
    /// - [`EngineError::Persistence`] if the insert fails or times out;
    ///   it is not retried
    #[tracing::instrument(
        name = "record",
        skip_all,
        fields(partition = tracing::field::Empty, path = tracing::field::Empty, is_new = tracing::field::Empty)
    )]
    pub async fn record(&self, request: &VisitRequest) -> EngineResult<IngestOutcome> {
        let location = Location::parse(&request.declared_url)?;
        let span = tracing::Span::current();
        span.record("partition", location.partition.as_str());
        span.record("path", location.path.as_str());

        if !self.policy.is_allowed(&location.origin) {
            tracing::debug!(origin = %location.origin, "origin rejected");
            return Err(EngineError::origin_rejected(location.origin));
        }
        let allow_origin =
            request.origin.as_deref().filter(|o| !o.is_empty() && self.policy.is_allowed(o)).map(str::to_owned);

        let identity = identity::resolve(request.visitor_token.as_deref());
        span.record("is_new", identity.is_new);

        let visit = Visit {
            partition: location.partition.clone(),
            visitor_id: identity.visitor_id.clone(),
            path: location.path.clone(),
            client_address: request.client_address.clone(),
            user_agent: request.user_agent.clone(),
            referrer: request.referrer.clone(),
            occurred_at: Utc::now(),
        };

        let start = Instant::now();
        bounded(self.timeout, &self.metrics, self.store.insert(&visit)).await.map_err(EngineError::persistence)?;
        self.metrics.record_insert(start.elapsed());

        self.readiness.ensure_once(&location.partition);

        Ok(IngestOutcome {
            visitor_id: identity.visitor_id,
            is_new: identity.is_new,
            allow_origin,
            partition: location.partition,
            path: location.path,
        })
    }
}

impl<S: ?Sized> std::fmt::Debug for Ingestor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor").field("policy", &self.policy).field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use rstest::rstest;
    use visitstat_storage::{MemoryVisitStore, StorageError, testutil::FlakyStore};

    use super::*;
    use crate::{config::ReadinessConfig, origin::AllowList};

    fn ingestor<S: VisitStore + 'static>(store: S) -> Ingestor<S> {
        let store = Arc::new(store);
        let readiness = Arc::new(ReadinessManager::new(Arc::clone(&store), ReadinessConfig::default(), Metrics::new()));
        let policy = Arc::new(AllowList::new(true, ["https://blog.example.com", "http://127.0.0.1"]));
        Ingestor::new(store, policy, readiness, Duration::from_secs(10), Metrics::new())
    }

    fn request(url: &str) -> VisitRequest {
        VisitRequest::builder().declared_url(url).client_address("203.0.113.7").user_agent("test-agent").build()
    }

    #[rstest]
    #[case::plain("https://blog.example.com/posts/1", "https://blog.example.com", "blog.example.com", "/posts/1")]
    #[case::port("http://127.0.0.1:4000/a", "http://127.0.0.1:4000", "127.0.0.1:4000", "/a")]
    #[case::default_port_dropped("https://blog.example.com:443/", "https://blog.example.com", "blog.example.com", "/")]
    #[case::empty_path("https://blog.example.com", "https://blog.example.com", "blog.example.com", "/")]
    #[case::query_ignored("https://blog.example.com/p?utm=x#top", "https://blog.example.com", "blog.example.com", "/p")]
    fn test_location_parse(#[case] url: &str, #[case] origin: &str, #[case] partition: &str, #[case] path: &str) {
        let location = Location::parse(url).unwrap();
        assert_eq!(location.origin, origin);
        assert_eq!(location.partition.as_str(), partition);
        assert_eq!(location.path, path);
    }

    #[rstest]
    #[case::garbage("not a url")]
    #[case::relative("/posts/1")]
    #[case::no_host("mailto:someone@example.com")]
    fn test_location_rejects_invalid_urls(#[case] url: &str) {
        assert!(matches!(Location::parse(url), Err(EngineError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_record_persists_visit() {
        let store = MemoryVisitStore::new();
        let ingestor = ingestor(store.clone());

        let outcome = ingestor.record(&request("https://blog.example.com/posts/1")).await.unwrap();

        assert!(outcome.is_new);
        assert_eq!(outcome.partition, Partition::from("blog.example.com"));
        assert_eq!(outcome.path, "/posts/1");
        let count = store.count(&outcome.partition, Some("/posts/1")).await.unwrap();
        assert_eq!((count.pv, count.uv), (1, 1));
    }

    #[tokio::test]
    async fn test_existing_token_is_kept() {
        let ingestor = ingestor(MemoryVisitStore::new());
        let mut req = request("https://blog.example.com/");
        req.visitor_token = Some("known-visitor".to_owned());

        let outcome = ingestor.record(&req).await.unwrap();
        assert!(!outcome.is_new);
        assert_eq!(outcome.visitor_id.as_str(), "known-visitor");
    }

    #[tokio::test]
    async fn test_disallowed_origin_stores_nothing() {
        let store = MemoryVisitStore::new();
        let ingestor = ingestor(store.clone());

        let err = ingestor.record(&request("https://evil.example.org/")).await.expect_err("rejected");
        assert!(matches!(err, EngineError::OriginRejected { ref origin } if origin == "https://evil.example.org"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_allowed_request_origin_is_echoed() {
        let ingestor = ingestor(MemoryVisitStore::new());
        let mut req = request("https://blog.example.com/");
        req.origin = Some("https://blog.example.com".to_owned());
        assert_eq!(ingestor.record(&req).await.unwrap().allow_origin.as_deref(), Some("https://blog.example.com"));

        req.origin = Some("https://elsewhere.example".to_owned());
        assert_eq!(ingestor.record(&req).await.unwrap().allow_origin, None);
    }

    #[tokio::test]
    async fn test_insert_failure_is_persistence_error_without_retry() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        store.fail_inserts();
        let ingestor = ingestor(store.clone());

        let err = ingestor.record(&request("https://blog.example.com/")).await.expect_err("should fail");
        assert!(matches!(err, EngineError::Persistence { source: StorageError::Connection { .. } }));
        assert_eq!(store.insert_calls(), 1);
        assert_eq!(store.ensure_calls(), 0, "readiness is only requested after a successful insert");
    }

    #[tokio::test]
    async fn test_successful_insert_requests_readiness() {
        let store = FlakyStore::new(MemoryVisitStore::new());
        let ingestor = ingestor(store.clone());
        let mut events = ingestor.readiness.subscribe();

        ingestor.record(&request("https://blog.example.com/")).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.partition, Partition::from("blog.example.com"));
        assert_eq!(first.state, crate::readiness::ReadinessState::Ensuring);
    }
}
