use std::{
    collections::BTreeMap,
    fmt,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use http::{HeaderMap, Method, Request};
use tower::Service;
use tower_layer::Layer;

use crate::http_injector;

/// Query parameter whose value never reaches the logs.
pub const REDACTED_QUERY_KEY: &str = "access_key";
/// Replacement for the value of [`REDACTED_QUERY_KEY`].
pub const REDACTION_MASK: &str = "*****";

/// Logs every incoming request once the inner service is done with it.
///
/// The record is emitted whether the inner service answers or fails. Panics
/// unwind past this layer; place a [`super::recovery::RecoveryLayer`] inside
/// of it to have those requests logged as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRequestsLayer;

impl<S> Layer<S> for LogRequestsLayer {
    type Service = LogRequestsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        LogRequestsService { service }
    }
}

#[derive(Debug, Clone)]
pub struct LogRequestsService<S> {
    service: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for LogRequestsService<S>
where
    S: Service<Request<ReqBody>>,
    S::Future: Send + 'static,
    S::Response: 'static,
    S::Error: 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let t0 = Instant::now();
        let access = AccessRecord::from_request(&request);
        let future = self.service.call(request);

        Box::pin(async move {
            let result = future.await;
            access.emit(t0.elapsed());
            result
        })
    }
}

/// What gets logged about a request, taken before the request moves on.
#[derive(Debug)]
struct AccessRecord {
    method: Method,
    scheme: String,
    host: String,
    path: String,
    query: QueryParams,
    content_length: i64,
    headers: HeaderMap,
}

impl AccessRecord {
    fn from_request<B>(request: &Request<B>) -> Self {
        let uri = request.uri();
        let content_length = request
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);

        AccessRecord {
            method: request.method().clone(),
            scheme: uri.scheme_str().unwrap_or_default().to_string(),
            host: http_injector::request_host(request)
                .unwrap_or_default()
                .to_string(),
            path: uri.path().to_string(),
            query: QueryParams::redacted(uri.query().unwrap_or_default()),
            content_length,
            headers: request.headers().clone(),
        }
    }

    fn emit(&self, elapsed: Duration) {
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        tracing::info!(
            http.request.duration_ms = duration_ms,
            http.request.method = %self.method,
            http.request.url.scheme = %self.scheme,
            http.request.url.host = %self.host,
            http.request.url.path = %self.path,
            http.request.url.query_params = %self.query,
            http.request.content_length = self.content_length,
            http.request.headers = ?self.headers,
            "inbound request"
        );
    }
}

/// Decoded query parameters, values grouped by key in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(BTreeMap<String, Vec<String>>);

impl QueryParams {
    pub fn parse(query: &str) -> Self {
        let mut params = BTreeMap::<String, Vec<String>>::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        QueryParams(params)
    }

    /// Parses `query` and masks the value of [`REDACTED_QUERY_KEY`].
    pub fn redacted(query: &str) -> Self {
        let mut params = Self::parse(query);
        if let Some(values) = params.0.get_mut(REDACTED_QUERY_KEY) {
            *values = vec![REDACTION_MASK.to_string()];
        }
        params
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }
}

/// Url-encoded form, keys sorted.
impl fmt::Display for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.0 {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
        f.write_str(&serializer.finish())
    }
}
