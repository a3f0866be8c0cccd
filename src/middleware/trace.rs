use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use http::{Request, Response};
use tower::Service;
use tower_layer::Layer;
use tracing::Instrument;

use crate::http_injector;

/// Injects tracing data to route handlers.
///
/// Every request runs inside a `request` span that is parented to the trace
/// found in the request headers, if any. The span is closed when the response
/// is ready, the inner service fails, or the request future is dropped.
///
/// Generally, the middleware should be used on every http route, this usually
/// means that it can be registered globally and in the last position, to be the
/// first to run, even before general logging layers.
///
/// The `TraceRequestsLayer` will not log http requests. For that, see
/// [`super::log::LogRequestsLayer`].
///
/// ```ignore
/// let app = Router::new()
///     .route("/foo", get(|| async {}))
///     .route("/bar", get(|| async {}))
///     .layer(TraceRequestsLayer::new("my-service"));
/// ```
#[derive(Debug, Clone)]
pub struct TraceRequestsLayer {
    service_name: Arc<str>,
}

impl TraceRequestsLayer {
    pub fn new(service_name: impl Into<String>) -> Self {
        TraceRequestsLayer {
            service_name: service_name.into().into(),
        }
    }
}

impl<S> Layer<S> for TraceRequestsLayer {
    type Service = TraceRequestsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TraceRequestsService {
            service,
            service_name: self.service_name.clone(),
        }
    }
}

/// This service implements the TraceRequests behavior
#[derive(Debug, Clone)]
pub struct TraceRequestsService<S> {
    service: S,
    service_name: Arc<str>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TraceRequestsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
    ResBody: 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let span = http_injector::extract_request_span(&self.service_name, &request);
        let future = span.in_scope(|| self.service.call(request));

        let record = span.clone();
        Box::pin(
            async move {
                let result = future.await;
                match &result {
                    Ok(response) => {
                        let status = response.status();
                        record.record("http.response.status_code", status.as_u16());
                        if status.is_server_error() {
                            record.record("otel.status_code", "ERROR");
                        }
                    }
                    Err(_) => {
                        record.record("otel.status_code", "ERROR");
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}
