use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{BoxError, ConditionError, PollError, ProbeError};
use crate::metrics::metric_name;
use crate::poll::{poll_until, PollContext, PollPolicy};

/// Consecutive transport failures tolerated before a poll gives up.
pub const DEFAULT_TRANSPORT_ERROR_THRESHOLD: u32 = 10;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An immutable request description, replayed on every attempt.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl ProbeRequest {
    pub fn new(method: Method, url: &str) -> Result<Self, ProbeError> {
        let url = Url::parse(url)
            .map_err(|e| ProbeError::InvalidRequest(format!("Invalid url {url:?}: {e}")))?;
        if url.host_str().is_none() {
            return Err(ProbeError::InvalidRequest(format!("Url {url} has no host")));
        }
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, ProbeError> {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ProbeError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProbeError::InvalidRequest(format!("Invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProbeError::InvalidRequest(format!("Invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Snapshot of a fully read response.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ProbeResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Where requests for a logical URL are actually sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// The logical domain resolves; connect to it directly.
    Direct,
    /// The logical domain does not resolve; connect to the ingress
    /// (`host[:port]`) and carry the logical authority in the Host header.
    Ingress(String),
}

impl ProbeTarget {
    pub fn from_settings(settings: &Settings) -> Result<Self, ProbeError> {
        if settings.resolvable_domain {
            return Ok(ProbeTarget::Direct);
        }
        match settings.ingress_endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => {
                validate_ingress(endpoint)?;
                Ok(ProbeTarget::Ingress(endpoint.to_string()))
            }
            _ => Err(ProbeError::InvalidRequest(
                "ingress_endpoint is required when the domain is not resolvable".to_string(),
            )),
        }
    }

    /// Physical URL to connect to, plus the Host header override if any.
    pub fn route(&self, url: &Url) -> Result<(Url, Option<HeaderValue>), ProbeError> {
        let ingress = match self {
            ProbeTarget::Direct => return Ok((url.clone(), None)),
            ProbeTarget::Ingress(ingress) => ingress,
        };
        validate_ingress(ingress)?;

        let host = url
            .host_str()
            .ok_or_else(|| ProbeError::InvalidRequest(format!("Url {url} has no host")))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let ingress_url = Url::parse(&format!("{}://{ingress}/", url.scheme())).map_err(|e| {
            ProbeError::InvalidRequest(format!("Invalid ingress endpoint {ingress:?}: {e}"))
        })?;
        let mut routed = url.clone();
        routed
            .set_host(ingress_url.host_str())
            .map_err(|e| ProbeError::InvalidRequest(format!("Invalid ingress host: {e}")))?;
        routed
            .set_port(ingress_url.port())
            .map_err(|_| ProbeError::InvalidRequest(format!("Invalid ingress port: {ingress}")))?;

        let host_header = HeaderValue::from_str(&authority)
            .map_err(|e| ProbeError::InvalidRequest(format!("Invalid host {authority:?}: {e}")))?;
        Ok((routed, Some(host_header)))
    }
}

/// Ingress endpoints are bare `host[:port]`; a scheme is rejected rather
/// than stripped, since the scheme always comes from the probed URL.
pub fn validate_ingress(endpoint: &str) -> Result<(), ProbeError> {
    if endpoint.contains("://") || endpoint.contains('/') {
        return Err(ProbeError::InvalidRequest(format!(
            "Ingress endpoint {endpoint:?} must be host[:port] without a scheme or path"
        )));
    }
    Ok(())
}

/// HTTP client that polls an endpoint until its response satisfies a
/// predicate.
#[derive(Debug, Clone)]
pub struct EndpointProber {
    client: reqwest::Client,
    target: ProbeTarget,
    policy: PollPolicy,
    transport_error_threshold: u32,
}

impl EndpointProber {
    pub fn new(target: ProbeTarget, policy: PollPolicy) -> Result<Self, ProbeError> {
        Self::builder().target(target).policy(policy).build()
    }

    pub fn builder() -> EndpointProberBuilder {
        EndpointProberBuilder::default()
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ProbeError> {
        let policy = settings
            .probe
            .policy()
            .map_err(|e| ProbeError::InvalidRequest(e.to_string()))?;
        Self::builder()
            .target(ProbeTarget::from_settings(settings)?)
            .policy(policy)
            .transport_error_threshold(settings.probe.transport_error_threshold)
            .request_timeout(Duration::from_millis(settings.probe.request_timeout_ms))
            .build()
    }

    pub fn target(&self) -> &ProbeTarget {
        &self.target
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Physical URL and headers for one attempt at `request`. In ingress
    /// mode the logical authority replaces any caller-supplied Host header.
    fn prepare(&self, request: &ProbeRequest) -> Result<(Url, HeaderMap), ProbeError> {
        let (url, host) = self.target.route(&request.url)?;
        let mut headers = request.headers.clone();
        if let Some(host) = host {
            headers.insert(HOST, host);
        }
        Ok((url, headers))
    }

    /// Issue `request` once. Transport errors are returned as they are.
    pub async fn do_request(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let (url, headers) = self.prepare(request)?;

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(ProbeResponse {
            status,
            headers,
            body,
        })
    }

    /// Repeat `request` until `predicate` accepts a response.
    ///
    /// Transport errors are retried until `transport_error_threshold`
    /// consecutive failures. Errors returned by `predicate` stop the poll.
    pub async fn poll<P>(
        &self,
        ctx: &PollContext,
        request: &ProbeRequest,
        label: &str,
        predicate: P,
    ) -> Result<ProbeResponse, PollError>
    where
        P: FnMut(&ProbeResponse) -> Result<bool, BoxError> + Send,
    {
        let metric = metric_name("Poll", request.url.host_str().unwrap_or_default(), label);
        let predicate = Mutex::new(predicate);
        let predicate = &predicate;
        let transport_failures = AtomicU32::new(0);
        let transport_failures = &transport_failures;
        let threshold = self.transport_error_threshold;

        poll_until(ctx, &metric, &self.policy, || async move {
            let response = match self.do_request(request).await {
                Ok(response) => {
                    transport_failures.store(0, Ordering::SeqCst);
                    response
                }
                Err(e) if e.is_transport() => {
                    let failures = transport_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= threshold {
                        return Err(ConditionError::TransportExhausted {
                            attempts: failures,
                            source: Box::new(e),
                        });
                    }
                    log::debug!(
                        "[{}] {} {}: transport error {failures}/{threshold}: {e}",
                        ctx.test_name(),
                        request.method,
                        request.url
                    );
                    return Ok(None);
                }
                Err(e) => return Err(ConditionError::failed(e)),
            };

            log::trace!(
                "[{}] {} {} -> {}",
                ctx.test_name(),
                request.method,
                request.url,
                response.status
            );
            let mut accept = predicate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match accept(&response) {
                Ok(true) => Ok(Some(response)),
                Ok(false) => Ok(None),
                Err(e) => Err(ConditionError::Failed(e)),
            }
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct EndpointProberBuilder {
    target: ProbeTarget,
    policy: PollPolicy,
    transport_error_threshold: u32,
    request_timeout: Duration,
}

impl Default for EndpointProberBuilder {
    fn default() -> Self {
        Self {
            target: ProbeTarget::Direct,
            policy: PollPolicy::default(),
            transport_error_threshold: DEFAULT_TRANSPORT_ERROR_THRESHOLD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl EndpointProberBuilder {
    pub fn target(mut self, target: ProbeTarget) -> Self {
        self.target = target;
        self
    }

    pub fn policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn transport_error_threshold(mut self, threshold: u32) -> Self {
        self.transport_error_threshold = threshold.max(1);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<EndpointProber, ProbeError> {
        // No idle connections are pooled, so every attempt dials afresh.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(self.request_timeout)
            .timeout(self.request_timeout)
            .build()?;

        Ok(EndpointProber {
            client,
            target: self.target,
            policy: self.policy,
            transport_error_threshold: self.transport_error_threshold,
        })
    }
}

/// Boxed response predicate, for building lists of checks.
pub type ResponseChecker = Box<dyn Fn(&ProbeResponse) -> Result<bool, BoxError> + Send + Sync>;

/// Accepts a response whose status is one of `codes`; any other status
/// stops the poll.
pub fn is_one_of_status(
    codes: &[u16],
) -> impl Fn(&ProbeResponse) -> Result<bool, BoxError> + Send + Sync + Clone {
    let codes = codes.to_vec();
    move |response: &ProbeResponse| {
        if codes.contains(&response.status.as_u16()) {
            Ok(true)
        } else {
            Err(format!(
                "status = {}, want one of: {codes:?}, body = {}",
                response.status,
                response.text()
            )
            .into())
        }
    }
}

pub fn is_status_ok(response: &ProbeResponse) -> Result<bool, BoxError> {
    is_one_of_status(&[200])(response)
}

/// Accepts a response whose body contains `expected`; keeps polling
/// otherwise.
pub fn matches_body(
    expected: &str,
) -> impl Fn(&ProbeResponse) -> Result<bool, BoxError> + Send + Sync + Clone {
    let expected = expected.to_string();
    move |response: &ProbeResponse| Ok(response.text().contains(&expected))
}

/// Accepts a response only if every checker does. The first error wins.
pub fn matches_all_of(
    checkers: Vec<ResponseChecker>,
) -> impl Fn(&ProbeResponse) -> Result<bool, BoxError> + Send + Sync {
    move |response: &ProbeResponse| {
        for checker in &checkers {
            if !checker(response)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Keeps polling on 404 and 503, which a route reports while its traffic
/// configuration is still propagating; defers to `inner` otherwise.
pub fn retrying_route_inconsistency<F>(
    inner: F,
) -> impl Fn(&ProbeResponse) -> Result<bool, BoxError> + Send + Sync
where
    F: Fn(&ProbeResponse) -> Result<bool, BoxError> + Send + Sync,
{
    move |response: &ProbeResponse| match response.status {
        StatusCode::NOT_FOUND | StatusCode::SERVICE_UNAVAILABLE => Ok(false),
        _ => inner(response),
    }
}
