#![forbid(unsafe_code)]

//! Tracing capture for assertions on spans and events.
//!
//! [`with_captured_tracing`] installs a registry with a recording layer for
//! the duration of a closure. Span fields recorded after creation (such as
//! `exit_status` or `duration_us`) are merged into the captured span.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;

/// A span seen while capturing.
#[derive(Debug, Clone)]
pub struct CapturedSpan {
    pub name: String,
    pub fields: HashMap<String, String>,
}

/// An event seen while capturing.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: tracing::Level,
    pub target: String,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    /// The event's message, or an empty string.
    #[must_use]
    pub fn message(&self) -> &str {
        self.fields.get("message").map_or("", String::as_str)
    }
}

type Shared<T> = Arc<Mutex<Vec<T>>>;

fn snapshot<T: Clone>(items: &Shared<T>) -> Vec<T> {
    items.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Handle to everything captured.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    spans: Shared<CapturedSpan>,
    events: Shared<CapturedEvent>,
}

impl CaptureHandle {
    #[must_use]
    pub fn spans(&self) -> Vec<CapturedSpan> {
        snapshot(&self.spans)
    }

    #[must_use]
    pub fn events(&self) -> Vec<CapturedEvent> {
        snapshot(&self.events)
    }

    /// Spans called `name`, in creation order.
    #[must_use]
    pub fn spans_named(&self, name: &str) -> Vec<CapturedSpan> {
        self.spans().into_iter().filter(|s| s.name == name).collect()
    }

    /// Events emitted under `target`, in order.
    #[must_use]
    pub fn events_for(&self, target: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.target == target)
            .collect()
    }
}

struct SpanCapture {
    spans: Shared<CapturedSpan>,
    events: Shared<CapturedEvent>,
}

/// Index of a span in the capture list, stored in span extensions.
struct SpanIndex(usize);

struct FieldVisitor(Vec<(String, String)>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.push((field.name().to_string(), format!("{value:?}")));
    }
    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCapture
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        attrs.record(&mut visitor);
        let mut fields: HashMap<String, String> = visitor.0.into_iter().collect();
        for field in attrs.metadata().fields() {
            fields.entry(field.name().to_string()).or_default();
        }
        let mut spans = self.spans.lock().unwrap_or_else(PoisonError::into_inner);
        let index = spans.len();
        spans.push(CapturedSpan {
            name: attrs.metadata().name().to_string(),
            fields,
        });
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanIndex(index));
        }
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else { return };
        let Some(index) = span.extensions().get::<SpanIndex>().map(|i| i.0) else {
            return;
        };
        let mut visitor = FieldVisitor(Vec::new());
        values.record(&mut visitor);
        let mut spans = self.spans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(captured) = spans.get_mut(index) {
            captured.fields.extend(visitor.0);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = FieldVisitor(Vec::new());
        event.record(&mut visitor);
        let fields: HashMap<String, String> = visitor.0.into_iter().collect();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedEvent {
                level: *event.metadata().level(),
                target: event.metadata().target().to_string(),
                fields,
            });
    }
}

/// Run `f` with a capturing subscriber installed on this thread.
pub fn with_captured_tracing<F>(f: F) -> CaptureHandle
where
    F: FnOnce(),
{
    let spans: Shared<CapturedSpan> = Arc::new(Mutex::new(Vec::new()));
    let events: Shared<CapturedEvent> = Arc::new(Mutex::new(Vec::new()));
    let layer = SpanCapture {
        spans: spans.clone(),
        events: events.clone(),
    };
    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, f);
    CaptureHandle { spans, events }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_late_recorded_fields() {
        let handle = with_captured_tracing(|| {
            let span = tracing::debug_span!("fibra.test", status = tracing::field::Empty);
            span.record("status", "done");
            tracing::info!(target: "fibra.test", answer = 42, "hello");
        });
        let spans = handle.spans_named("fibra.test");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].fields.get("status").map(String::as_str), Some("done"));
        let events = handle.events_for("fibra.test");
        assert_eq!(events[0].message(), "hello");
        assert_eq!(events[0].fields.get("answer").map(String::as_str), Some("42"));
    }
}
