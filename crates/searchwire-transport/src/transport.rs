//! Request orchestration across the connection pool.
//!
//! A [`Transport`] turns one logical request into a sequence of physical attempts:
//! pick a connection, send, classify the outcome, update node health, and retry on
//! another connection while the retry budget allows. It also drives resurrection and
//! sniffing. Cloning a transport is cheap; clones share one pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::TransportConfig;
use crate::connection::{ConnectionStatus, NodeDescriptor};
use crate::deadline::{bound_timeout, Deadline};
use crate::error::{Result, TransportError};
use crate::events::{
    EventBus, RequestEvent, RequestId, ResponseEvent, ResponseOutcome, TransportEvent,
};
use crate::http::ReqwestSender;
use crate::metrics::TransportMetrics;
use crate::pool::ConnectionPool;
use crate::request::{RequestOptions, RequestParams, Response, ResponseMeta, RetryableStatusCodes};
use crate::resurrect::{ResurrectContext, ResurrectStrategy, Resurrector, CLIENT_VERSION};
use crate::sender::{HttpSender, Method, OutgoingRequest, SendError, SendErrorKind};
use crate::sniffer::{SniffContext, SniffReason, Sniffer};

/// Cluster-aware request transport.
#[derive(Debug, Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    pool: ConnectionPool,
    sender: Arc<dyn HttpSender>,
    resurrector: Resurrector,
    sniffer: Sniffer,
    events: EventBus,
    metrics: TransportMetrics,
    retryable: Arc<RetryableStatusCodes>,
    default_headers: Vec<(String, String)>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.config.name)
            .field("pool", &self.pool.stats())
            .field("resurrect_strategy", &self.resurrector.strategy())
            .finish()
    }
}

/// Bookkeeping of one logical request.
struct Attempts {
    count: u32,
    tried: Vec<String>,
    last_connection: Option<String>,
    last_error: Option<TransportError>,
}

impl Transport {
    /// Builds a transport over `sender` using the system clock.
    pub fn new(config: TransportConfig, sender: Arc<dyn HttpSender>) -> Result<Self> {
        Self::with_clock(config, sender, Arc::new(SystemClock))
    }

    /// Builds a transport over the `reqwest` sender.
    pub fn with_reqwest(config: TransportConfig) -> Result<Self> {
        Self::new(config, Arc::new(ReqwestSender::new()?))
    }

    /// Builds a transport whose resurrect and sniff timing reads `clock`.
    pub fn with_clock(
        config: TransportConfig,
        sender: Arc<dyn HttpSender>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::with_clock(config.pool_config(), Arc::clone(&clock));
        pool.add_nodes(&config.nodes)?;

        let retryable = Arc::new(config.retryable());
        let resurrector = Resurrector::new(
            config.resurrect_strategy,
            config.ping_timeout(),
            Arc::clone(&retryable),
        );
        let sniffer = Sniffer::new(config.sniffer_config(), clock);

        let mut default_headers = vec![(
            "user-agent".to_string(),
            format!("{}/{}", config.name, CLIENT_VERSION),
        )];
        for (name, value) in &config.headers {
            set_header(&mut default_headers, name, value);
        }

        let inner = Arc::new(Inner {
            events: EventBus::new(config.event_capacity),
            config,
            pool,
            sender,
            resurrector,
            sniffer,
            metrics: TransportMetrics::new(),
            retryable,
            default_headers,
            next_request_id: AtomicU64::new(0),
        });
        let transport = Self { inner };

        if transport.inner.config.sniff_on_start {
            transport.spawn_sniff(SniffReason::Start);
        }
        Ok(transport)
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Configuration the transport was built with.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribes to transport events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Transport counters.
    pub fn metrics(&self) -> &TransportMetrics {
        &self.inner.metrics
    }

    /// Same as [`Transport::request`].
    pub async fn execute(&self, params: RequestParams, options: RequestOptions) -> Result<Response> {
        self.request(params, options).await
    }

    /// Performs one logical request, retrying on other connections on node faults.
    pub async fn request(&self, params: RequestParams, options: RequestOptions) -> Result<Response> {
        options.validate(&params)?;

        let inner = &self.inner;
        let request_id = inner.next_request_id();
        inner.metrics.inc_requests();
        if inner.sniffer.interval_due() {
            self.spawn_sniff(SniffReason::Interval);
        }

        let outgoing = inner.build_request(&params, &options);
        let mut attempts = Attempts {
            count: 0,
            tried: Vec::new(),
            last_connection: None,
            last_error: None,
        };
        let result = self
            .run_attempts(request_id, &params, &outgoing, &options, &mut attempts)
            .await;

        let outcome = match &result {
            Ok(response) => ResponseOutcome::Status(response.status()),
            Err(TransportError::Response(response)) => ResponseOutcome::Status(response.status()),
            Err(e) => ResponseOutcome::Failed(e.to_string()),
        };
        inner.events.publish(TransportEvent::Response(ResponseEvent {
            request_id,
            connection_id: attempts.last_connection.clone(),
            attempts: attempts.count,
            outcome,
        }));
        result
    }

    async fn run_attempts(
        &self,
        request_id: RequestId,
        params: &RequestParams,
        outgoing: &OutgoingRequest,
        options: &RequestOptions,
        attempts: &mut Attempts,
    ) -> Result<Response> {
        let inner = &self.inner;
        let filter = inner.config.node_filter;
        let max_retries = options.max_retries.unwrap_or(inner.config.max_retries);
        let request_timeout = options
            .request_timeout
            .unwrap_or_else(|| inner.config.request_timeout());
        let deadline = options.deadline.map(Deadline::after);
        let deadline_error = |count: u32| TransportError::Timeout {
            timeout_ms: deadline.map_or(0, |d| {
                u64::try_from(d.budget().as_millis()).unwrap_or(u64::MAX)
            }),
            attempts: count,
        };
        let expired = || deadline.as_ref().is_some_and(Deadline::is_expired);

        loop {
            if expired() {
                inner.metrics.inc_timeouts();
                return Err(deadline_error(attempts.count));
            }

            let ctx = inner.resurrect_context(request_id, deadline);
            inner.resurrector.resurrect_due(&ctx, &filter).await;
            if expired() {
                inner.metrics.inc_timeouts();
                return Err(deadline_error(attempts.count));
            }

            let selection = match inner.pool.get_connection(&filter, &attempts.tried) {
                Some(selection) => selection,
                None => {
                    return Err(match attempts.last_error.take() {
                        Some(source) => TransportError::RetriesExhausted {
                            attempts: attempts.count,
                            source: Box::new(source),
                        },
                        None => TransportError::NoLivingConnections,
                    });
                }
            };
            let connection = selection.connection;

            if selection.status == ConnectionStatus::Dead
                && inner.resurrector.strategy() != ResurrectStrategy::None
                && !inner.resurrector.evaluate(&ctx, Arc::clone(&connection)).await
            {
                attempts.tried.push(connection.id().to_string());
                continue;
            }
            if expired() {
                inner.metrics.inc_timeouts();
                return Err(deadline_error(attempts.count));
            }

            attempts.count += 1;
            let attempt = attempts.count;
            let connection_id = connection.id().to_string();
            attempts.tried.push(connection_id.clone());
            attempts.last_connection = Some(connection_id.clone());
            inner.metrics.inc_attempts(attempt);
            debug!(
                "{} {} {} attempt {} on {}",
                request_id, params.method, params.path, attempt, connection_id
            );
            inner.events.publish(TransportEvent::Request(RequestEvent {
                request_id,
                connection_id: connection_id.clone(),
                method: params.method,
                path: params.path.clone(),
                attempt,
            }));

            let (timeout, deadline_binding) = bound_timeout(deadline.as_ref(), request_timeout);
            let outcome = tokio::time::timeout(
                timeout,
                inner.sender.send(&connection, outgoing, timeout),
            )
            .await;

            let failure = match outcome {
                Err(_) if deadline_binding => {
                    inner.metrics.inc_timeouts();
                    return Err(deadline_error(attempt));
                }
                Ok(Err(e)) if e.kind == SendErrorKind::Timeout && deadline_binding => {
                    inner.metrics.inc_timeouts();
                    return Err(deadline_error(attempt));
                }
                Err(_) => {
                    inner.metrics.inc_transport_failures();
                    TransportError::Connection {
                        connection_id: connection_id.clone(),
                        source: SendError::timeout(timeout),
                    }
                }
                Ok(Err(source)) => {
                    inner.metrics.inc_transport_failures();
                    TransportError::Connection {
                        connection_id: connection_id.clone(),
                        source,
                    }
                }
                Ok(Ok(raw)) => {
                    let status = raw.status;
                    let ignored = options.ignore_status_codes.contains(&status)
                        || (params.method == Method::Head && status == 404);
                    if ignored || !inner.retryable.contains(status) {
                        inner.pool.mark_alive(&connection_id);
                        let meta = ResponseMeta {
                            request_id,
                            connection_id,
                            attempts: attempt,
                        };
                        let response = Response::from_raw(raw, meta);
                        for warning in response.warnings() {
                            warn!("{} {}: {}", params.method, params.path, warning);
                        }
                        inner.metrics.inc_responses();
                        if status >= 400 && !ignored {
                            inner.metrics.inc_response_errors();
                            return Err(TransportError::Response(Box::new(response)));
                        }
                        return Ok(response);
                    }
                    TransportError::NodeUnavailable {
                        connection_id: connection_id.clone(),
                        status,
                    }
                }
            };

            debug!("{} attempt {} failed: {}", request_id, attempt, failure);
            if failure.is_node_fault() {
                inner.pool.mark_dead(&connection_id);
                inner.metrics.inc_marked_dead();
                if inner.config.sniff_on_connection_fault && !inner.pool.has_alive() {
                    self.spawn_sniff(SniffReason::ConnectionFault);
                }
            }

            if attempt > max_retries {
                return Err(TransportError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(failure),
                });
            }
            attempts.last_error = Some(failure);

            let pause = inner.config.retry_backoff.delay(attempt - 1);
            if !pause.is_zero() {
                let (pause, _) = bound_timeout(deadline.as_ref(), pause);
                tokio::time::sleep(pause).await;
            }
        }
    }

    /// Discovers the cluster topology now and reconciles the pool.
    pub async fn sniff(&self) -> Result<Vec<NodeDescriptor>> {
        self.inner.sniff(SniffReason::Manual).await
    }

    /// Starts a sniff in the background. Does nothing outside a tokio runtime or while
    /// another sniff is running.
    pub fn spawn_sniff(&self, reason: SniffReason) {
        if self.inner.sniffer.is_sniffing() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No runtime, skipping {} sniff", reason);
                return;
            }
        };
        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            // failures are already logged and published
            let _ = inner.sniff(reason).await;
        });
    }

    /// Runs interval sniffing on a background task until every clone of the transport is
    /// dropped. Returns `None` when no interval is configured. Must be called within a
    /// tokio runtime.
    pub fn spawn_periodic_sniff(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.config.sniff_interval()?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Transport dropped, stopping periodic sniff");
                    break;
                };
                let _ = inner.sniff(SniffReason::Interval).await;
            }
        }))
    }
}

impl Inner {
    fn next_request_id(&self) -> RequestId {
        RequestId::from_raw(self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn resurrect_context(
        &self,
        request_id: RequestId,
        deadline: Option<Deadline>,
    ) -> ResurrectContext<'_> {
        ResurrectContext {
            pool: &self.pool,
            sender: self.sender.as_ref(),
            events: &self.events,
            metrics: &self.metrics,
            name: &self.config.name,
            request_id,
            deadline,
        }
    }

    async fn sniff(&self, reason: SniffReason) -> Result<Vec<NodeDescriptor>> {
        let ctx = SniffContext {
            pool: &self.pool,
            sender: self.sender.as_ref(),
            events: &self.events,
            metrics: &self.metrics,
            unavailable: &self.retryable,
        };
        self.sniffer.sniff(&ctx, reason).await
    }

    fn build_request(&self, params: &RequestParams, options: &RequestOptions) -> OutgoingRequest {
        let mut headers = self.default_headers.clone();
        for (name, value) in &options.headers {
            set_header(&mut headers, name, value);
        }
        if params.body.is_some() && !headers.iter().any(|(name, _)| name == "content-type") {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        if let Some(opaque_id) = &options.opaque_id {
            set_header(&mut headers, "x-opaque-id", opaque_id);
        }

        OutgoingRequest {
            method: params.method,
            path: params.path.clone(),
            querystring: params.encoded_querystring(),
            headers,
            body: params.body.clone(),
        }
    }
}

/// Sets `name` (lower-cased), replacing an existing value.
fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    let name = name.to_ascii_lowercase();
    match headers.iter_mut().find(|(existing, _)| *existing == name) {
        Some(slot) => slot.1 = value.to_string(),
        None => headers.push((name, value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connection::Connection;
    use crate::sender::RawResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    type Reply = std::result::Result<RawResponse, SendError>;

    /// Replies per connection id from a script, then falls back to `default`.
    struct ScriptedSender {
        scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        default: Reply,
        sent: Mutex<Vec<(String, OutgoingRequest)>>,
    }

    impl ScriptedSender {
        fn new(default: Reply) -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                default,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn script(self, id: &str, replies: Vec<Reply>) -> Self {
            self.scripts.lock().insert(id.to_string(), replies.into());
            self
        }

        fn sent(&self) -> Vec<(String, OutgoingRequest)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl HttpSender for ScriptedSender {
        async fn send(
            &self,
            connection: &Connection,
            request: &OutgoingRequest,
            _timeout: Duration,
        ) -> Reply {
            self.sent
                .lock()
                .push((connection.id().to_string(), request.clone()));
            let scripted = self
                .scripts
                .lock()
                .get_mut(connection.id())
                .and_then(VecDeque::pop_front);
            scripted.unwrap_or_else(|| self.default.clone())
        }
    }

    struct HangingSender;

    #[async_trait]
    impl HttpSender for HangingSender {
        async fn send(
            &self,
            _connection: &Connection,
            _request: &OutgoingRequest,
            _timeout: Duration,
        ) -> Reply {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(RawResponse::empty(200))
        }
    }

    fn refused() -> Reply {
        Err(SendError::new(SendErrorKind::ConnectionRefused, "refused"))
    }

    fn config(ids: &[&str]) -> TransportConfig {
        TransportConfig {
            nodes: ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    NodeDescriptor::new(format!("http://10.0.0.{}:9200", i + 1)).with_id(*id)
                })
                .collect(),
            ..TransportConfig::default()
        }
    }

    fn build(config: TransportConfig, sender: Arc<dyn HttpSender>) -> (Transport, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let transport = Transport::with_clock(config, sender, clock.clone()).unwrap();
        (transport, clock)
    }

    fn get(path: &str) -> RequestParams {
        RequestParams::new(Method::Get, path)
    }

    #[tokio::test]
    async fn test_success_marks_nothing_dead() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(200))));
        let (transport, _) = build(config(&["node0", "node1"]), sender.clone());

        let response = transport.request(get("/"), RequestOptions::new()).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.meta().attempts, 1);
        assert_eq!(transport.pool().stats().dead, 0);
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_retries_on_other_node() {
        let sender = Arc::new(
            ScriptedSender::new(Ok(RawResponse::empty(200))).script("node0", vec![refused()]),
        );
        let (transport, _) = build(config(&["node0", "node1"]), sender.clone());

        let response = transport.request(get("/"), RequestOptions::new()).await.unwrap();
        assert_eq!(response.meta().connection_id, "node1");
        assert_eq!(response.meta().attempts, 2);
        let snap = transport.pool().snapshot("node0").unwrap();
        assert_eq!(snap.status, ConnectionStatus::Dead);
        assert_eq!(snap.dead_count, 1);
        let metrics = transport.metrics().snapshot();
        assert_eq!(metrics.retries_total, 1);
        assert_eq!(metrics.transport_failures_total, 1);
    }

    #[tokio::test]
    async fn test_invalid_request_sends_nothing() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(200))));
        let (transport, _) = build(config(&["node0"]), sender.clone());

        let err = transport
            .request(get("no-slash"), RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_application_error_is_not_retried() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(400))));
        let (transport, _) = build(config(&["node0", "node1"]), sender.clone());

        let err = transport.request(get("/idx"), RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(matches!(err, TransportError::Response(_)));
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(transport.pool().stats().alive, 2);
    }

    #[tokio::test]
    async fn test_ignored_status_is_success() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(404))));
        let (transport, _) = build(config(&["node0"]), sender);

        let response = transport
            .request(get("/missing"), RequestOptions::new().ignore(404))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let head = transport
            .request(RequestParams::new(Method::Head, "/idx"), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(head.status(), 404);
    }

    #[tokio::test]
    async fn test_ignored_retryable_status_is_not_retried() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(503))));
        let (transport, _) = build(config(&["node0", "node1"]), sender.clone());

        let response = transport
            .request(get("/"), RequestOptions::new().ignore(503))
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(transport.pool().stats().dead, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted_on_budget() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(502))));
        let (transport, _) = build(config(&["node0", "node1", "node2"]), sender.clone());

        let err = transport
            .request(get("/"), RequestOptions::new().max_retries(1))
            .await
            .unwrap_err();
        match err {
            TransportError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, TransportError::NodeUnavailable { status: 502, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_no_living_connections() {
        let sender = Arc::new(ScriptedSender::new(refused()));
        let (transport, _) = build(config(&["node0"]), sender.clone());

        let first = transport.request(get("/"), RequestOptions::new()).await.unwrap_err();
        assert!(matches!(first, TransportError::RetriesExhausted { attempts: 1, .. }));

        let second = transport.request(get("/"), RequestOptions::new()).await.unwrap_err();
        assert!(matches!(second, TransportError::NoLivingConnections));
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_headers_and_querystring() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(200))));
        let mut cfg = config(&["node0"]);
        cfg.headers.insert("X-Team".to_string(), "search".to_string());
        let (transport, _) = build(cfg, sender.clone());

        let params = RequestParams::new(Method::Post, "/idx/_search")
            .query("q", "a b")
            .body(r#"{"query":{}}"#);
        let options = RequestOptions::new()
            .header("x-team", "ops")
            .opaque_id("trace-1");
        transport.request(params, options).await.unwrap();

        let (_, sent) = sender.sent().remove(0);
        let header = |name: &str| {
            sent.headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        assert!(header("user-agent").unwrap().starts_with("searchwire/"));
        assert_eq!(header("x-team").as_deref(), Some("ops"));
        assert_eq!(header("content-type").as_deref(), Some("application/json"));
        assert_eq!(header("x-opaque-id").as_deref(), Some("trace-1"));
        assert_eq!(sent.querystring.as_deref(), Some("q=a%20b"));
    }

    #[tokio::test]
    async fn test_events_share_request_id() {
        let sender = Arc::new(
            ScriptedSender::new(Ok(RawResponse::empty(200))).script("node0", vec![refused()]),
        );
        let (transport, _) = build(config(&["node0", "node1"]), sender);
        let mut rx = transport.subscribe();

        transport.request(get("/"), RequestOptions::new()).await.unwrap();

        let mut ids = Vec::new();
        let mut attempts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                TransportEvent::Request(e) => {
                    ids.push(e.request_id);
                    attempts.push(e.attempt);
                }
                TransportEvent::Response(e) => {
                    ids.push(e.request_id);
                    assert_eq!(e.attempts, 2);
                    assert_eq!(e.outcome, ResponseOutcome::Status(200));
                    assert_eq!(e.connection_id.as_deref(), Some("node1"));
                }
                _ => {}
            }
        }
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_timeout_without_health_change() {
        let (transport, _) = build(config(&["node0", "node1"]), Arc::new(HangingSender));

        let err = transport
            .request(get("/"), RequestOptions::new().deadline(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Timeout {
                timeout_ms: 100,
                attempts: 1
            }
        ));
        assert_eq!(transport.pool().stats().dead, 0);
        assert_eq!(transport.metrics().snapshot().timeouts_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_marks_dead() {
        let (transport, _) = build(config(&["node0"]), Arc::new(HangingSender));

        let err = transport
            .request(
                get("/"),
                RequestOptions::new().request_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        match err {
            TransportError::RetriesExhausted { source, .. } => match *source {
                TransportError::Connection { source, .. } => {
                    assert_eq!(source.kind, SendErrorKind::Timeout)
                }
                other => panic!("unexpected source {other:?}"),
            },
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(transport.pool().stats().dead, 1);
    }

    /// Refuses requests to node0 and never answers its pings; everyone else answers 200.
    struct StalledPingSender {
        gets: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpSender for StalledPingSender {
        async fn send(
            &self,
            connection: &Connection,
            request: &OutgoingRequest,
            _timeout: Duration,
        ) -> Reply {
            if request.method == Method::Head && connection.id() == "node0" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.gets.lock().push(connection.id().to_string());
            if connection.id() == "node0" {
                return refused();
            }
            Ok(RawResponse::empty(200))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_covers_resurrect_ping() {
        let sender = Arc::new(StalledPingSender {
            gets: Mutex::new(Vec::new()),
        });
        let (transport, clock) = build(config(&["node0", "node1"]), sender.clone());
        transport.request(get("/"), RequestOptions::new()).await.unwrap();
        assert_eq!(sender.gets.lock().clone(), vec!["node0", "node1"]);
        clock.advance(Duration::from_secs(61));

        let started = tokio::time::Instant::now();
        let err = transport
            .request(get("/"), RequestOptions::new().deadline(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(started.elapsed() <= Duration::from_millis(100));
        assert!(matches!(
            err,
            TransportError::Timeout {
                timeout_ms: 100,
                attempts: 0
            }
        ));
        // nothing was dispatched after the deadline
        assert_eq!(sender.gets.lock().len(), 2);
        assert_eq!(transport.pool().snapshot("node0").unwrap().dead_count, 1);
    }

    #[tokio::test]
    async fn test_failed_ping_keeps_request_on_alive_node() {
        // node0 dead and due, node1 answers; the ping to node0 fails
        let sender = Arc::new(
            ScriptedSender::new(Ok(RawResponse::empty(200)))
                .script("node0", vec![refused(), refused()]),
        );
        let (transport, clock) = build(config(&["node0", "node1"]), sender);
        transport.request(get("/"), RequestOptions::new()).await.unwrap();
        clock.advance(Duration::from_secs(61));

        let response = transport
            .request(get("/"), RequestOptions::new().max_retries(0))
            .await
            .unwrap();
        assert_eq!(response.meta().connection_id, "node1");
        assert_eq!(response.meta().attempts, 1);
        assert_eq!(transport.pool().snapshot("node0").unwrap().dead_count, 2);
    }

    #[tokio::test]
    async fn test_connection_fault_triggers_sniff() {
        let nodes = r#"{"nodes":{"n9":{"http":{"publish_address":"10.0.0.9:9200"}}}}"#;
        let sender = Arc::new(
            ScriptedSender::new(refused())
                .script("node0", vec![refused(), Ok(raw_json(nodes))]),
        );
        let mut cfg = config(&["node0"]);
        cfg.sniff_on_connection_fault = true;
        cfg.resurrect_strategy = ResurrectStrategy::None;
        let (transport, clock) = build(cfg, sender);
        let mut rx = transport.subscribe();

        let err = transport.request(get("/"), RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::RetriesExhausted { .. }));
        // the spawned sniff has not run yet; let node0's quarantine pass so it can answer
        clock.advance(Duration::from_secs(61));

        loop {
            match rx.recv().await {
                Ok(TransportEvent::Sniff(event)) => {
                    assert_eq!(event.reason, SniffReason::ConnectionFault);
                    assert!(event.result.is_ok());
                    break;
                }
                Ok(_) => continue,
                Err(e) => panic!("channel closed: {e}"),
            }
        }
        assert!(transport.pool().snapshot("n9").is_some());
        assert!(transport.pool().snapshot("node0").is_none());
    }

    fn raw_json(body: &'static str) -> RawResponse {
        RawResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: bytes::Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_manual_sniff_updates_pool() {
        let nodes = r#"{"nodes":{
            "node0":{"http":{"publish_address":"10.0.0.1:9200"}},
            "node5":{"roles":["data"],"http":{"publish_address":"10.0.0.5:9200"}}
        }}"#;
        let sender = Arc::new(
            ScriptedSender::new(Ok(RawResponse::empty(200)))
                .script("node0", vec![Ok(raw_json(nodes))]),
        );
        let (transport, _) = build(config(&["node0", "node1"]), sender);

        let discovered = transport.sniff().await.unwrap();
        assert_eq!(discovered.len(), 2);
        let ids: Vec<_> = transport
            .pool()
            .snapshots()
            .iter()
            .map(|s| s.connection.id().to_string())
            .collect();
        assert_eq!(ids, vec!["node0", "node5"]);
        assert_eq!(transport.metrics().snapshot().sniffs_total, 1);
    }

    #[tokio::test]
    async fn test_failed_sniff_keeps_membership() {
        let sender = Arc::new(ScriptedSender::new(Ok(RawResponse::empty(500))));
        let (transport, _) = build(config(&["node0", "node1"]), sender);

        let err = transport.sniff().await.unwrap_err();
        assert!(matches!(err, TransportError::Sniff(_)));
        assert_eq!(transport.pool().size(), 2);
        assert_eq!(transport.metrics().snapshot().sniff_failures_total, 1);
    }

    #[test]
    fn test_set_header_replaces_case_insensitively() {
        let mut headers = vec![("user-agent".to_string(), "a".to_string())];
        set_header(&mut headers, "User-Agent", "b");
        set_header(&mut headers, "X-New", "c");
        assert_eq!(
            headers,
            vec![
                ("user-agent".to_string(), "b".to_string()),
                ("x-new".to_string(), "c".to_string())
            ]
        );
    }
}
