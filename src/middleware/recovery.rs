use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use tower::Service;
use tower_layer::Layer;

use crate::{
    callstack::{self, PanicReport},
    notify::{Notifier, SendMessageRequest},
};

/// Upper bound for reporting a panic before the response goes out.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Recovers from panics in route handlers.
///
/// A panic raised while calling the inner service or polling its response is
/// logged together with the call stack of the panic site, reported to
/// `report_chat` if a [`Notifier`] is configured, and answered with an empty
/// `500 Internal Server Error`. Reporting is best-effort: a failing, hanging
/// or panicking notifier does not change the response.
///
/// Install it inside [`super::log::LogRequestsLayer`] to have the resulting
/// `500`s logged; outside of it, panicking requests skip the access log.
#[derive(Clone)]
pub struct RecoveryLayer {
    notifier: Option<Arc<dyn Notifier>>,
    report_chat: i64,
    notify_timeout: Duration,
}

impl RecoveryLayer {
    pub fn new(notifier: Option<Arc<dyn Notifier>>, report_chat: i64) -> Self {
        callstack::install_hook();

        RecoveryLayer {
            notifier,
            report_chat,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RecoveryService {
            service,
            reporter: Reporter {
                notifier: self.notifier.clone(),
                report_chat: self.report_chat,
                notify_timeout: self.notify_timeout,
            },
        }
    }
}

#[derive(Clone)]
pub struct RecoveryService<S> {
    service: S,
    reporter: Reporter,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let reporter = self.reporter.clone();
        let called = callstack::catch_panic(|| self.service.call(request));

        Box::pin(async move {
            let outcome = match called {
                Ok(future) => CatchPanic::new(future).await,
                Err(report) => Err(report),
            };

            match outcome {
                Ok(result) => result,
                Err(report) => {
                    reporter.report(report).await;
                    let mut response = Response::new(ResBody::default());
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        })
    }
}

#[derive(Clone)]
struct Reporter {
    notifier: Option<Arc<dyn Notifier>>,
    report_chat: i64,
    notify_timeout: Duration,
}

impl Reporter {
    async fn report(&self, report: PanicReport) {
        tracing::error!(
            panic = %report.message,
            callstack = %report.callstack,
            "recovered from panic"
        );

        let Some(notifier) = &self.notifier else {
            return;
        };

        let request = SendMessageRequest::html(self.report_chat, panic_message(&report));
        let notify_timeout = self.notify_timeout;
        // Timer setup panics on runtimes without a time driver.
        let send = CatchPanic::new(async move {
            tokio::time::timeout(notify_timeout, notifier.send_message(request)).await
        });
        match send.await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => tracing::debug!(%err, "failed to report panic"),
            Ok(Err(_)) => tracing::debug!(
                timeout_ms = u64::try_from(notify_timeout.as_millis()).unwrap_or(u64::MAX),
                "timed out reporting panic"
            ),
            Err(report) => {
                tracing::debug!(panic = %report.message, "panicked while reporting panic")
            }
        }
    }
}

fn panic_message(report: &PanicReport) -> String {
    format!(
        "<b>Recovered from panic: {}</b>\n<code>{}</code>",
        html_escape::encode_text(&report.message),
        html_escape::encode_text(&report.callstack.to_string()),
    )
}

/// Polls a future inside a panic guard, resolving to the panic report if
/// polling panics.
struct CatchPanic<F> {
    inner: Pin<Box<F>>,
}

impl<F> CatchPanic<F> {
    fn new(inner: F) -> Self {
        CatchPanic {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, PanicReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match callstack::catch_panic(move || inner.poll(cx)) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(report) => Poll::Ready(Err(report)),
        }
    }
}
