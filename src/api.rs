use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ApiConfig;
use crate::error::{ApiError, Error, ErrorCategory};
use crate::session::SessionContext;

/// Connect timeout for the underlying HTTP client; the per-request deadline
/// is enforced separately with [`tokio::time::timeout`].
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifier for one submitted request, usable with [`ApiService::cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Successful API response: the status code and the decoded JSON body
/// (null when the body was empty or not JSON)
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    /// Deserialize the body into a typed value.
    ///
    /// A shape mismatch is reported as a non-retryable server error, since
    /// the server broke its response contract.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_value(self.body.clone()).map_err(|e| ApiError {
            category: ErrorCategory::Server,
            message: format!("unexpected response shape: {e}"),
            status_code: Some(self.status),
            retryable: false,
        })
    }
}

/// Handle for a request submitted with [`ApiService::dispatch`]
#[derive(Debug)]
pub struct ApiTicket {
    id: RequestId,
    outcome: oneshot::Receiver<Result<ApiResponse, ApiError>>,
}

impl ApiTicket {
    /// The identifier to pass to [`ApiService::cancel`]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the request to finish
    pub async fn outcome(self) -> Result<ApiResponse, ApiError> {
        self.outcome.await.unwrap_or_else(|_| Err(ApiError::cancelled()))
    }
}

/// Decrements the pending-request counter exactly once, even when the
/// owning future is dropped mid-flight.
struct PendingGuard {
    ctx: Arc<SessionContext>,
}

impl PendingGuard {
    fn new(ctx: &Arc<SessionContext>) -> Self {
        ctx.pending_inc();
        Self {
            ctx: Arc::clone(ctx),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.ctx.pending_dec();
    }
}

/// Registered waiters for one in-flight request key. Presence in the map
/// means a leader owns the network exchange.
struct InFlight {
    waiters: Vec<oneshot::Sender<Result<ApiResponse, ApiError>>>,
}

/// Removes a leader's cancellation-token and dedup entries exactly once,
/// even when the owning future is dropped mid-flight.
///
/// On a normal finish the waiters get a copy of the outcome; when the
/// leader's future is dropped instead, the waiter senders are dropped with
/// the guard and followers resolve as cancelled rather than hanging on an
/// entry nothing will ever complete.
struct LeaderGuard<'a> {
    service: &'a ApiService,
    id: RequestId,
    key: String,
    outcome: Option<Result<ApiResponse, ApiError>>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.service.in_flight.lock().remove(&self.id);
        let waiters = self
            .service
            .dedup
            .lock()
            .remove(&self.key)
            .map(|entry| entry.waiters)
            .unwrap_or_default();
        if let Some(outcome) = self.outcome.take() {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

/// HTTP API client with bounded retries, request deduplication, and
/// cooperative cancellation.
///
/// Every call validates the configured environment first, classifies
/// failures into [`ApiError`], retries transient ones with doubling delays
/// up to the configured attempt cap, and records everything it does in the
/// shared [`SessionContext`].
pub struct ApiService {
    config: ApiConfig,
    client: reqwest::Client,
    ctx: Arc<SessionContext>,
    next_id: AtomicU64,
    /// Parent of every per-request token; replaced on cancel_all
    root_token: RwLock<CancellationToken>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    dedup: Mutex<HashMap<String, InFlight>>,
}

impl ApiService {
    /// Fails only when the HTTP client itself cannot be built (TLS backend
    /// or resolver initialization).
    pub fn new(config: ApiConfig, ctx: Arc<SessionContext>) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            config,
            client,
            ctx,
            next_id: AtomicU64::new(0),
            root_token: RwLock::new(CancellationToken::new()),
            in_flight: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
        })
    }

    /// The session context this service reports into
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// GET a path relative to the configured base URL
    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, path, None::<&Value>).await
    }

    /// POST a JSON body to a path relative to the configured base URL
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Issue a request and wait for its final outcome.
    ///
    /// Identical concurrent calls (same method, path, and body) share one
    /// network exchange: followers await the leader's outcome, including its
    /// error.
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiResponse, ApiError> {
        let body = match encode_body(body) {
            Ok(body) => body,
            Err(err) => {
                self.ctx.record_api_error(&err, path, 0);
                return Err(err);
            }
        };
        let id = self.allocate_id();
        self.run_request(id, method, path, body).await
    }

    /// Submit a request in the background and get a cancellable handle.
    ///
    /// The returned ticket's id targets [`ApiService::cancel`]; its outcome
    /// resolves exactly like [`ApiService::request`] would.
    pub fn dispatch<B: Serialize + ?Sized>(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> ApiTicket {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();

        match encode_body(body) {
            Ok(body) => {
                let service = Arc::clone(self);
                let path = path.to_string();
                tokio::spawn(async move {
                    let outcome = service.run_request(id, method, &path, body).await;
                    let _ = tx.send(outcome);
                });
            }
            Err(err) => {
                self.ctx.record_api_error(&err, path, 0);
                let _ = tx.send(Err(err));
            }
        }

        ApiTicket { id, outcome: rx }
    }

    /// Cancel one in-flight request. Returns false when the id is unknown
    /// (already finished, never issued, or a deduplicated follower).
    pub fn cancel(&self, id: RequestId) -> bool {
        let token = self.in_flight.lock().get(&id).cloned();
        match token {
            Some(token) => {
                debug!(%id, "cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight request and return how many were affected.
    /// Requests issued afterwards are unaffected.
    pub fn cancel_all(&self) -> usize {
        let count = self.in_flight.lock().len();
        let mut root = self.root_token.write();
        root.cancel();
        *root = CancellationToken::new();
        debug!(count, "cancelled all in-flight requests");
        count
    }

    fn allocate_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn run_request(
        &self,
        id: RequestId,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse, ApiError> {
        // Environment problems short-circuit before any accounting
        let base = match self.config.validate_environment() {
            Ok(url) => {
                self.ctx.set_env_valid(true);
                url
            }
            Err(e) => {
                self.ctx.set_env_valid(false);
                let err = ApiError::from_error(&e);
                error!(%id, "environment validation failed: {e}");
                self.ctx.record_api_error(&err, path, 0);
                return Err(err);
            }
        };
        let url = join_url(&base, path);

        // Identical in-flight request? Await its outcome instead of issuing
        // a duplicate network call.
        let key = dedup_key(&method, &url, body.as_ref());
        let follower = {
            let mut dedup = self.dedup.lock();
            match dedup.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().waiters.push(tx);
                    Some(rx)
                }
                Entry::Vacant(entry) => {
                    entry.insert(InFlight {
                        waiters: Vec::new(),
                    });
                    None
                }
            }
        };
        if let Some(rx) = follower {
            debug!(%id, "identical request in flight, sharing its outcome");
            return rx.await.unwrap_or_else(|_| Err(ApiError::cancelled()));
        }

        let token = self.root_token.read().child_token();
        self.in_flight.lock().insert(id, token.clone());
        let _pending = PendingGuard::new(&self.ctx);
        let mut leader = LeaderGuard {
            service: self,
            id,
            key,
            outcome: None,
        };

        let outcome = self.execute(id, &method, &url, body.as_ref(), &token).await;

        // The guard's drop removes the map entries and wakes followers
        leader.outcome = Some(outcome.clone());
        outcome
    }

    /// Drive one request through its attempt/backoff sequence.
    async fn execute(
        &self,
        id: RequestId,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        token: &CancellationToken,
    ) -> Result<ApiResponse, ApiError> {
        let max_attempts = self.config.max_attempts;
        let mut delay = self.config.retry_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt_once(method, url, body, token).await {
                Ok(response) => {
                    debug!(%id, attempt, status = response.status, "request succeeded");
                    self.ctx.record_api_success();
                    return Ok(response);
                }
                Err(err) => err,
            };

            warn!(%id, attempt, category = ?err.category, "request failed: {}", err.message);
            self.ctx.record_api_error(&err, url, attempt);

            if !err.retryable || attempt >= max_attempts {
                return Err(err);
            }

            // Backoff stays cancellable so a cancelled request never
            // schedules another attempt
            tokio::select! {
                _ = token.cancelled() => {
                    let cancelled = ApiError::cancelled();
                    self.ctx.record_api_error(&cancelled, url, attempt);
                    return Err(cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay.saturating_mul(2);
        }
    }

    async fn attempt_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        token: &CancellationToken,
    ) -> Result<ApiResponse, ApiError> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(body);
        }

        // One deadline and one cancellation envelope cover the whole
        // exchange, send and body read together
        let deadline = self.config.request_timeout;
        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| ApiError::from_error(&Error::Http(e)))?;
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(ApiError::from_status(status));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ApiError::from_error(&Error::Http(e)))?;
            Ok((status, bytes))
        };

        let (status, bytes) = tokio::select! {
            _ = token.cancelled() => return Err(ApiError::cancelled()),
            outcome = timeout(deadline, exchange) => match outcome {
                Err(_) => return Err(ApiError::timeout(deadline)),
                Ok(result) => result?,
            }
        };

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    debug!("response body is not JSON: {e}");
                    Value::Null
                }
            }
        };

        Ok(ApiResponse { status, body })
    }
}

fn encode_body<B: Serialize + ?Sized>(body: Option<&B>) -> Result<Option<Value>, ApiError> {
    body.map(serde_json::to_value)
        .transpose()
        .map_err(|e| ApiError::config(format!("request body could not be serialized: {e}")))
}

fn join_url(base: &url::Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Requests are duplicates when method, resolved URL, and serialized body
/// all match.
fn dedup_key(method: &Method, url: &str, body: Option<&Value>) -> String {
    match body {
        Some(body) => format!("{method} {url} {body}"),
        None => format!("{method} {url}"),
    }
}
