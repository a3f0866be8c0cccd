use http::Request;
use opentelemetry::{global, propagation::Extractor};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Constructs a [`opentelemetry::Context`] from [`Request`] headers
/// and assigns it as parent of the returned server [`Span`].
///
/// The span carries the request attributes known up front. The response
/// status is left empty for the caller to record once it is known.
#[track_caller]
pub fn extract_request_span<T>(service_name: &str, request: &Request<T>) -> Span {
    let context = global::get_text_map_propagator(|extractor| {
        extractor.extract(&RequestExtractor::new(request))
    });

    let method = request.method().as_str();
    let user_agent = request
        .headers()
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let span = tracing::info_span!(
        "request",
        otel.name = method,
        otel.kind = "server",
        otel.status_code = tracing::field::Empty,
        service.name = service_name,
        http.request.method = method,
        url.path = request.uri().path(),
        url.scheme = request.uri().scheme_str().unwrap_or_default(),
        server.address = request_host(request).unwrap_or_default(),
        user_agent.original = user_agent,
        http.response.status_code = tracing::field::Empty,
    );
    span.set_parent(context);

    span
}

/// Host the request was addressed to, from the uri authority or, for
/// origin-form requests, the `Host` header.
pub(crate) fn request_host<T>(request: &Request<T>) -> Option<&str> {
    request.uri().host().or_else(|| {
        request
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
    })
}

// "traceparent" => https://www.w3.org/TR/trace-context/#trace-context-http-headers-format

/// Extractor used via opentelemetry propagator to read the propagation
/// headers ("traceparent", "uber-trace-id") of an inbound request so the
/// request span joins the caller's trace.
struct RequestExtractor<'a, T> {
    request: &'a Request<T>,
}

impl<'a, T> RequestExtractor<'a, T> {
    pub fn new(request: &'a Request<T>) -> Self {
        RequestExtractor { request }
    }
}

impl<'a, T> Extractor for RequestExtractor<'a, T> {
    fn get(&self, key: &str) -> Option<&str> {
        self.request
            .headers()
            .get(key)
            .and_then(|h| h.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.request.headers().keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_prefers_uri_authority() {
        let request = Request::get("http://api.example.com/v1")
            .header("host", "other.example.com")
            .body(())
            .unwrap();

        assert_eq!(request_host(&request), Some("api.example.com"));
    }

    #[test]
    fn host_falls_back_to_header() {
        let request = Request::get("/v1")
            .header("host", "api.example.com")
            .body(())
            .unwrap();

        assert_eq!(request_host(&request), Some("api.example.com"));
    }

    #[test]
    fn extractor_reads_headers() {
        let request = Request::get("/")
            .header("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
            .body(())
            .unwrap();
        let extractor = RequestExtractor::new(&request);

        assert_eq!(
            extractor.get("traceparent"),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }
}
