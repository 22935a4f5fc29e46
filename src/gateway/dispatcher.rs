//! # Request Dispatcher
//!
//! The proxy pipeline for one inbound request:
//!
//! 1. Match a route by path prefix (404 with the configured prefixes on a miss)
//! 2. Enforce the service's rate limit (429) and authentication (401)
//! 3. Serve cacheable GETs from the response cache when fresh
//! 4. Select an instance, take a breaker permit, forward the request
//! 5. Classify the outcome, report it through the permit, run post-dispatch hooks
//! 6. Retry network failures and failure statuses up to the service's retry count,
//!    selecting afresh each time
//!
//! When no instance is eligible the request fails with 503 before any downstream
//! call and no breaker is touched.
//!
//! ## Rust Concepts Used
//!
//! - The breaker admission is an RAII [`CallPermit`]: if the inbound request is
//!   cancelled mid-call the permit is dropped and only its trial slot is released
//! - `Arc<dyn AuthProvider>` / `Arc<dyn DispatchHook>` keep collaborators pluggable
//! - reqwest 0.11 uses `http` 0.2 types while axum uses `http` 1.0, so methods,
//!   headers and statuses cross the boundary as strings and bytes

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, JwtAuthProvider};
use crate::caching::ResponseCache;
use crate::core::circuit_breaker::{CallPermit, Outcome};
use crate::core::config::{GatewayConfig, OutcomePolicy, ServiceDescriptor};
use crate::core::connection_pool::UpstreamClients;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{
    AuthContext, GatewayResponse, IncomingRequest, CACHE_STATUS_HEADER, CORRELATION_ID_HEADER,
    SERVED_BY_HEADER, USER_ID_HEADER, USER_ROLES_HEADER,
};
use crate::discovery::{ServiceInstance, ServiceRegistry};
use crate::gateway::hooks::{DispatchHook, DispatchOutcome, MetricsHook};
use crate::load_balancing::{create_load_balancer, InstanceSelector};
use crate::middleware::RateLimiter;
use crate::routing::{Route, RouteMatch, RouteTable};

/// Headers that describe one connection and are never forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Selections to try when a chosen instance loses its last trial slot to a
/// concurrent request
const MAX_ADMISSION_ATTEMPTS: usize = 3;

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Failure of one attempt before a response arrived
#[derive(Debug)]
enum AttemptError {
    Timeout,
    Unavailable(String),
}

impl From<reqwest::Error> for AttemptError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl AttemptError {
    fn describe(&self) -> String {
        match self {
            Self::Timeout => "timeout".to_string(),
            Self::Unavailable(reason) => reason.clone(),
        }
    }
}

/// Headers sent downstream for `request`
///
/// Hop-by-hop headers, `Host` and `Content-Length` are dropped, as are any
/// client-supplied identity and forwarding headers the gateway sets itself.
pub fn forward_headers(request: &IncomingRequest, auth: Option<&AuthContext>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in &request.headers {
        let lowered = name.as_str();
        if is_hop_by_hop(lowered)
            || lowered == "host"
            || lowered == "content-length"
            || lowered == USER_ID_HEADER
            || lowered == USER_ROLES_HEADER
            || lowered == CORRELATION_ID_HEADER
            || lowered == "x-forwarded-for"
            || lowered == "x-forwarded-host"
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut insert = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    };

    insert(CORRELATION_ID_HEADER, &request.correlation_id);

    let previous_hops = request.header("x-forwarded-for");
    let forwarded_for = match (previous_hops, request.remote_addr) {
        (Some(hops), Some(addr)) => Some(format!("{}, {}", hops, addr.ip())),
        (Some(hops), None) => Some(hops.to_string()),
        (None, Some(addr)) => Some(addr.ip().to_string()),
        (None, None) => None,
    };
    if let Some(value) = forwarded_for {
        insert("x-forwarded-for", &value);
    }
    if let Some(host) = request.header(header::HOST.as_str()) {
        insert("x-forwarded-host", host);
    }

    if let Some(context) = auth {
        insert(USER_ID_HEADER, &context.user_id);
        if !context.roles.is_empty() {
            insert(USER_ROLES_HEADER, &context.roles.join(","));
        }
    }

    headers
}

pub struct RequestDispatcher {
    routes: RouteTable,
    services: HashMap<String, Arc<ServiceDescriptor>>,
    selector: InstanceSelector,
    clients: UpstreamClients,
    rate_limiter: Arc<RateLimiter>,
    auth: Option<Arc<dyn AuthProvider>>,
    cache: Option<Arc<ResponseCache>>,
    default_cache_ttl: Duration,
    outcome_policy: OutcomePolicy,
    hooks: Vec<Arc<dyn DispatchHook>>,
}

impl RequestDispatcher {
    /// Build the dispatcher and its collaborators from a validated configuration
    pub fn from_config(
        config: &GatewayConfig,
        registry: Arc<ServiceRegistry>,
        clients: UpstreamClients,
    ) -> GatewayResult<Self> {
        let auth: Option<Arc<dyn AuthProvider>> = match config.auth.jwt_secret {
            Some(_) => Some(Arc::new(JwtAuthProvider::new(&config.auth)?)),
            None => None,
        };
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(config.cache.max_entries)));

        Ok(Self {
            routes: RouteTable::new(&config.effective_routes()),
            services: config
                .services
                .iter()
                .map(|s| (s.name.clone(), Arc::new(s.clone())))
                .collect(),
            selector: InstanceSelector::new(registry, create_load_balancer(&config.load_balancing)),
            clients,
            rate_limiter: Arc::new(RateLimiter::new()),
            auth,
            cache,
            default_cache_ttl: config.cache.default_ttl,
            outcome_policy: config.outcome_policy.clone(),
            hooks: vec![Arc::new(MetricsHook)],
        })
    }

    /// Replace the authentication collaborator
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    /// Add a post-dispatch hook; hooks run in registration order
    pub fn with_hook(mut self, hook: Arc<dyn DispatchHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn selector(&self) -> &InstanceSelector {
        &self.selector
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Service name a path routes to, if any
    pub fn service_for_path(&self, path: &str) -> Option<String> {
        self.routes.match_path(path).map(|m| m.route.service.clone())
    }

    /// Run the full pipeline for one request
    pub async fn dispatch(&self, request: &IncomingRequest) -> GatewayResult<GatewayResponse> {
        let route_match = self.routes.resolve(request.path())?;
        let route = Arc::clone(&route_match.route);
        let descriptor = self
            .services
            .get(&route.service)
            .cloned()
            .ok_or_else(|| {
                GatewayError::internal(format!("Route references unknown service '{}'", route.service))
            })?;

        self.check_rate_limit(&descriptor, request)?;
        let auth = self.authenticate(&descriptor, request).await?;

        let cache_key = self.cache_key(&route, request);
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(mut cached) = cache.get(key) {
                cached.set_header(CACHE_STATUS_HEADER, "HIT");
                cached.set_header(CORRELATION_ID_HEADER, &request.correlation_id);
                debug!(
                    correlation_id = %request.correlation_id,
                    service = %descriptor.name,
                    key = %key,
                    "Served from response cache"
                );
                return Ok(cached);
            }
        }

        let mut response = self
            .forward_with_retries(&descriptor, &route_match, request, auth.as_ref())
            .await?;
        response.set_header(CORRELATION_ID_HEADER, &request.correlation_id);

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            response.set_header(CACHE_STATUS_HEADER, "MISS");
            cache.insert(key, &response, route.cache_ttl.unwrap_or(self.default_cache_ttl));
        }

        Ok(response)
    }

    fn check_rate_limit(
        &self,
        descriptor: &ServiceDescriptor,
        request: &IncomingRequest,
    ) -> GatewayResult<()> {
        let Some(policy) = &descriptor.rate_limit else {
            return Ok(());
        };

        let result = self
            .rate_limiter
            .check(&descriptor.name, &request.client_ip(), policy);
        if result.allowed {
            Ok(())
        } else {
            Err(GatewayError::RateLimited {
                service: descriptor.name.clone(),
                retry_after_secs: result.retry_after_secs(),
            })
        }
    }

    async fn authenticate(
        &self,
        descriptor: &ServiceDescriptor,
        request: &IncomingRequest,
    ) -> GatewayResult<Option<AuthContext>> {
        if !descriptor.auth_required {
            return Ok(None);
        }

        let provider = self
            .auth
            .as_ref()
            .ok_or_else(|| GatewayError::unauthorized("No authentication provider configured"))?;

        match provider.authenticate(&request.headers).await {
            Ok(context) => Ok(Some(context)),
            Err(e) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    service = %descriptor.name,
                    error = %e,
                    "Authentication failed"
                );
                Err(e)
            }
        }
    }

    fn cache_key(&self, route: &Route, request: &IncomingRequest) -> Option<String> {
        (self.cache.is_some() && route.cacheable && request.method == Method::GET)
            .then(|| ResponseCache::key(request.path(), request.query()))
    }

    /// Pick an instance and take a breaker permit on it
    fn admit(&self, service: &str) -> Option<(Arc<ServiceInstance>, CallPermit)> {
        for _ in 0..MAX_ADMISSION_ATTEMPTS {
            let instance = self.selector.select_instance(service)?;
            match instance.breaker().try_acquire() {
                Ok(permit) => return Some((instance, permit)),
                Err(e) => debug!(
                    instance_id = %instance.id,
                    error = %e,
                    "Instance refused admission after selection, reselecting"
                ),
            }
        }
        None
    }

    async fn forward_with_retries(
        &self,
        descriptor: &ServiceDescriptor,
        route_match: &RouteMatch,
        request: &IncomingRequest,
        auth: Option<&AuthContext>,
    ) -> GatewayResult<GatewayResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes()).map_err(|e| {
            GatewayError::InvalidRequest {
                message: format!("Unsupported method: {}", e),
            }
        })?;
        let headers = forward_headers(request, auth);
        let attempts = descriptor.retries.saturating_add(1);
        let mut last: Option<Result<GatewayResponse, AttemptError>> = None;

        for attempt in 1..=attempts {
            let Some((instance, permit)) = self.admit(&descriptor.name) else {
                break;
            };

            let started = Instant::now();
            let result = self
                .forward(&instance, descriptor, route_match, request, method.clone(), &headers)
                .await;
            let latency = started.elapsed();

            let outcome = match &result {
                Ok(response) => self.outcome_policy.classify(response.status),
                Err(_) => Outcome::Failure,
            };
            permit.complete(outcome);

            let report = DispatchOutcome {
                correlation_id: request.correlation_id.clone(),
                service: descriptor.name.clone(),
                instance_id: instance.id.clone(),
                status: result.as_ref().ok().map(|r| r.status.as_u16()),
                latency,
                outcome,
                error: result.as_ref().err().map(AttemptError::describe),
            };
            for hook in &self.hooks {
                hook.after_dispatch(&instance, &report);
            }

            match result {
                Ok(mut response) => {
                    response.set_header(SERVED_BY_HEADER, &instance.id);
                    if outcome.is_success() {
                        info!(
                            correlation_id = %request.correlation_id,
                            service = %descriptor.name,
                            instance_id = %instance.id,
                            status = response.status.as_u16(),
                            latency_ms = latency.as_millis() as u64,
                            attempt,
                            "Request dispatched"
                        );
                        return Ok(response);
                    }
                    warn!(
                        correlation_id = %request.correlation_id,
                        service = %descriptor.name,
                        instance_id = %instance.id,
                        status = response.status.as_u16(),
                        attempt,
                        "Downstream returned failure status"
                    );
                    last = Some(Ok(response));
                }
                Err(e) => {
                    warn!(
                        correlation_id = %request.correlation_id,
                        service = %descriptor.name,
                        instance_id = %instance.id,
                        error = %e.describe(),
                        attempt,
                        "Downstream call failed"
                    );
                    last = Some(Err(e));
                }
            }
        }

        match last {
            Some(Ok(response)) => Ok(response),
            Some(Err(AttemptError::Timeout)) => Err(GatewayError::DownstreamTimeout {
                service: descriptor.name.clone(),
                timeout_ms: descriptor.timeout.as_millis() as u64,
            }),
            Some(Err(AttemptError::Unavailable(reason))) => {
                Err(GatewayError::unavailable(descriptor.name.clone(), reason))
            }
            None => {
                warn!(
                    correlation_id = %request.correlation_id,
                    service = %descriptor.name,
                    "No eligible instance"
                );
                Err(GatewayError::NoEligibleInstance {
                    service: descriptor.name.clone(),
                })
            }
        }
    }

    async fn forward(
        &self,
        instance: &ServiceInstance,
        descriptor: &ServiceDescriptor,
        route_match: &RouteMatch,
        request: &IncomingRequest,
        method: reqwest::Method,
        headers: &HeaderMap,
    ) -> Result<GatewayResponse, AttemptError> {
        let url = instance.target_url(&route_match.forward_path, request.query());
        let client = self.clients.for_protocol(descriptor.protocol_version);

        let mut builder = client
            .request(method, url.as_str())
            .timeout(descriptor.timeout);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| AttemptError::Unavailable(format!("Invalid downstream status: {}", e)))?;

        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            let name = name.as_str();
            if is_hop_by_hop(name) || name == "content-length" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }

        let body = response.bytes().await?;
        Ok(GatewayResponse::new(status, response_headers, body))
    }
}
