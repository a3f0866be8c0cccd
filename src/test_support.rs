use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tracing::{
    field::{Field, Visit},
    span::{Attributes, Id, Record},
    subscriber::DefaultGuard,
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    util::SubscriberInitExt,
    Layer,
};

use crate::notify::{Notifier, NotifyError, SendMessageRequest};

/// An event or span seen by [`Capture`].
#[derive(Debug, Clone)]
pub struct Captured {
    pub name: String,
    pub level: Level,
    pub fields: HashMap<String, String>,
}

impl Captured {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.field("message")
    }
}

#[derive(Default)]
struct State {
    events: Vec<Captured>,
    open: HashMap<u64, Captured>,
    closed: Vec<Captured>,
}

/// Layer recording events and spans for assertions.
#[derive(Clone, Default)]
pub struct Capture {
    state: Arc<Mutex<State>>,
}

impl Capture {
    /// Installs a capturing subscriber for the current thread.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Capture::default();
        let guard = tracing_subscriber::registry()
            .with(capture.clone())
            .set_default();
        (capture, guard)
    }

    pub fn events(&self) -> Vec<Captured> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn events_at(&self, level: Level) -> Vec<Captured> {
        self.events()
            .into_iter()
            .filter(|event| event.level == level)
            .collect()
    }

    pub fn closed_spans(&self) -> Vec<Captured> {
        self.state.lock().unwrap().closed.clone()
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for Capture {
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        let mut span = Captured {
            name: attrs.metadata().name().to_string(),
            level: *attrs.metadata().level(),
            fields: HashMap::new(),
        };
        attrs.record(&mut FieldVisitor(&mut span.fields));
        self.state.lock().unwrap().open.insert(id.into_u64(), span);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut state = self.state.lock().unwrap();
        if let Some(span) = state.open.get_mut(&id.into_u64()) {
            values.record(&mut FieldVisitor(&mut span.fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = Captured {
            name: event.metadata().name().to_string(),
            level: *event.metadata().level(),
            fields: HashMap::new(),
        };
        event.record(&mut FieldVisitor(&mut captured.fields));
        self.state.lock().unwrap().events.push(captured);
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let mut state = self.state.lock().unwrap();
        if let Some(span) = state.open.remove(&id.into_u64()) {
            state.closed.push(span);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum Outcome {
    #[default]
    Deliver,
    Reject,
    Hang,
    Panic,
}

/// Notifier remembering every message it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    outcome: Outcome,
    sent: Mutex<Vec<SendMessageRequest>>,
}

impl RecordingNotifier {
    pub fn new(outcome: Outcome) -> Arc<Self> {
        Arc::new(RecordingNotifier {
            outcome,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_message(&self, request: SendMessageRequest) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(request);
        match self.outcome {
            Outcome::Deliver => Ok(()),
            Outcome::Reject => Err(NotifyError::Api {
                description: "Bad Request: chat not found".to_string(),
            }),
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Outcome::Panic => panic!("notifier exploded"),
        }
    }
}
