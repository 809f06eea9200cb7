//! Redirects build log events to the client whose build is running.
//!
//! Telemetry installs [`LogRouter::layer`] next to the local formatter.
//! [`LogRouter::redirect`] registers a sink and enters a `client_log_scope`
//! span on the calling thread. Only events raised inside that span, or inside
//! a span entered from it on another thread, are rendered into a
//! [`LogRecord`] and handed to the sink. Events from other connections and
//! from the daemon's own housekeeping stay local. Events raised while a sink
//! is emitting are not forwarded again.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use kiln_daemon_types::{DaemonMessage, LogRecord};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, EnteredSpan, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

use crate::connection::{Connection, DisconnectAwareConnection};

const SCOPE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::logging");
const SCOPE_SPAN: &str = "client_log_scope";

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Destination for redirected log records.
pub trait LogSink: Send + Sync {
    /// Receives one rendered record.
    fn emit(&self, record: LogRecord);
}

/// Process-wide switch deciding where client-visible logs go.
#[derive(Clone)]
pub struct LogRouter {
    shared: Arc<RouterState>,
}

struct RouterState {
    sinks: RwLock<HashMap<u64, Arc<dyn LogSink>>>,
    threshold: Level,
}

impl fmt::Debug for LogRouter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LogRouter")
            .field("threshold", &self.shared.threshold)
            .field("redirected", &self.is_redirected())
            .finish()
    }
}

impl LogRouter {
    /// Creates a router forwarding events at `threshold` or more severe.
    #[must_use]
    pub fn new(threshold: Level) -> Self {
        Self {
            shared: Arc::new(RouterState {
                sinks: RwLock::new(HashMap::new()),
                threshold,
            }),
        }
    }

    /// Least severe level forwarded to a sink.
    #[must_use]
    pub fn threshold(&self) -> Level {
        self.shared.threshold
    }

    /// Sends events raised in the current scope to `sink` until the guard is
    /// dropped.
    ///
    /// The guard enters the scope's span on this thread. Work handed to other
    /// threads stays in scope when those threads enter
    /// [`tracing::Span::current`] captured here.
    #[must_use = "dropping the guard ends the redirection immediately"]
    pub fn redirect(&self, sink: Arc<dyn LogSink>) -> LogRedirection {
        let scope = NEXT_SCOPE.fetch_add(1, Ordering::Relaxed);
        self.shared
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope, sink);
        let span = tracing::span!(target: SCOPE_TARGET, Level::ERROR, "client_log_scope", scope);
        LogRedirection {
            router: self.clone(),
            scope,
            _entered: span.entered(),
        }
    }

    /// Returns `true` while any sink is installed.
    #[must_use]
    pub fn is_redirected(&self) -> bool {
        !self
            .shared
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Tracing layer feeding this router.
    #[must_use]
    pub fn layer(&self) -> ClientLogLayer {
        ClientLogLayer {
            router: self.clone(),
        }
    }

    fn sink(&self, scope: u64) -> Option<Arc<dyn LogSink>> {
        self.shared
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&scope)
            .cloned()
    }

    fn release(&self, scope: u64) {
        self.shared
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&scope);
    }
}

/// Ends a redirection when dropped. Tied to the thread that created it.
pub struct LogRedirection {
    router: LogRouter,
    scope: u64,
    _entered: EnteredSpan,
}

impl Drop for LogRedirection {
    fn drop(&mut self) {
        self.router.release(self.scope);
    }
}

/// Marks a span as the root of a redirection.
struct RedirectScope(u64);

/// [`Layer`] forwarding events raised inside a redirection to its sink.
pub struct ClientLogLayer {
    router: LogRouter,
}

impl ClientLogLayer {
    fn sink_for<S>(&self, event: &Event<'_>, ctx: &Context<'_, S>) -> Option<Arc<dyn LogSink>>
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    {
        let scope = ctx.event_scope(event)?.find_map(|span| {
            span.extensions()
                .get::<RedirectScope>()
                .map(|RedirectScope(scope)| *scope)
        })?;
        self.router.sink(scope)
    }
}

impl<S> Layer<S> for ClientLogLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let metadata = attrs.metadata();
        if metadata.name() != SCOPE_SPAN || metadata.target() != SCOPE_TARGET {
            return;
        }
        let mut visitor = ScopeVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(scope), Some(span)) = (visitor.scope, ctx.span(id)) {
            span.extensions_mut().insert(RedirectScope(scope));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.router.shared.threshold {
            return;
        }
        let Some(sink) = self.sink_for(event, &ctx) else {
            return;
        };
        let Some(_reentry) = ReentryGuard::enter() else {
            return;
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        sink.emit(LogRecord {
            level: metadata.level().as_str().to_ascii_lowercase(),
            target: metadata.target().to_owned(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct ScopeVisitor {
    scope: Option<u64>,
}

impl Visit for ScopeVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "scope" {
            self.scope = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        FORWARDING.with(|flag| (!flag.replace(true)).then_some(Self))
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        FORWARDING.with(|flag| flag.set(false));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}

/// Sink writing records to a client connection as log frames.
pub struct ClientLogSink {
    connection: Arc<DisconnectAwareConnection>,
}

impl ClientLogSink {
    /// Creates a sink for `connection`.
    #[must_use]
    pub fn new(connection: Arc<DisconnectAwareConnection>) -> Self {
        Self { connection }
    }
}

impl LogSink for ClientLogSink {
    fn emit(&self, record: LogRecord) {
        // Delivery is best effort: a vanished client simply stops receiving.
        let _ = self.connection.dispatch(&DaemonMessage::Log(record));
    }
}
