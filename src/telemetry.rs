use std::collections::HashMap;
use std::error::Error as StdError;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::{Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use tracing::field::Empty;
use tracing::subscriber::set_global_default;
use tracing::{Span, Subscriber};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};
use uuid::Uuid;
use warp::hyper::body::HttpBody;
use warp::reply::Response;

use crate::config::{TraceSettings, DEFAULT_LOG_FILTER};

pub const SERVICE_NAME: &str = "ems-api";
pub const SERVICE_VERSION: &str = "1.0.0.0";
pub const INSTRUMENTATION_SCOPE: &str = "my-corp.ems.ems-api";
pub const TOKEN_HEADER: &str = "lightstep-access-token";

/// The span a request is currently running under.
///
/// Handlers build one from the HTTP span, narrow it to their own span and
/// hand it to every gateway call, so statement spans nest under the request
/// without relying on whatever span happens to be entered at the time.
#[derive(Debug, Clone)]
pub struct RequestContext {
    span: Span,
}

impl RequestContext {
    pub fn new(span: Span) -> RequestContext {
        RequestContext { span }
    }

    pub fn current() -> RequestContext {
        RequestContext::new(Span::current())
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

pub fn export_headers(token: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(TOKEN_HEADER.to_string(), token.to_string());
    headers
}

/// Builds the OTLP (protobuf over HTTP) exporter behind a batch processor.
/// Returns `None` when no access token is configured.
pub fn init_tracer_provider(settings: &TraceSettings) -> Result<Option<TracerProvider>> {
    let token = match &settings.access_token {
        Some(token) => token,
        None => return Ok(None),
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(settings.endpoint.as_str())
        .with_headers(export_headers(token))
        .build()
        .context("Failed to build OTLP span exporter")?;

    // Export runs on its own tokio task; a slow or missing collector only
    // costs dropped spans.
    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", SERVICE_VERSION),
        ]))
        .build();

    Ok(Some(provider))
}

pub fn tracer(provider: &TracerProvider) -> Tracer {
    provider.tracer(INSTRUMENTATION_SCOPE)
}

pub fn get_subscriber(
    name: String,
    env_filter: String,
    tracer: Option<Tracer>,
) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Spans go to the collector through this layer when export is enabled.
    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let formatting_layer = BunyanFormattingLayer::new(name, std::io::stdout);

    Registry::default()
        .with(env_filter)
        .with(otel_layer)
        .with(JsonStorageLayer)
        .with(formatting_layer)
}

pub fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> Result<()> {
    // Redirect all `log`'s events to our subscriber; the exporter's reqwest
    // client only speaks `log`.
    LogTracer::init().context("Failed to set logger")?;
    set_global_default(subscriber).context("Failed to set subscriber")?;

    Ok(())
}

pub fn request_span(info: warp::trace::Info) -> Span {
    tracing::info_span!(
        "HTTP request",
        otel.name = %format!("{} {}", info.method(), info.path()),
        otel.kind = "server",
        otel.status_code = Empty,
        service.version = SERVICE_VERSION,
        http.flavor = ?info.version(),
        http.method = %info.method(),
        http.target = %info.path(),
        http.status_code = Empty,
        http.response_content_length = Empty,
        request_id = %Uuid::new_v4(),
    )
}

/// Tags the current request span with what is going back to the caller.
pub fn record_response(response: Response) -> Response {
    let span = Span::current();
    let status = response.status();

    span.record("http.status_code", status.as_u16());
    if let Some(len) = response.body().size_hint().exact() {
        span.record("http.response_content_length", len);
    }
    if status.is_server_error() {
        span.record("otel.status_code", "ERROR");
    }

    response
}

pub fn record_exception(span: &Span, error: &(dyn StdError + 'static)) {
    let message = error_chain(error);

    span.record("otel.status_code", "ERROR");
    span.record("exception.message", message.as_str());
    tracing::error!(parent: span, exception.message = %message, "exception");
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fmt;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing::Event;
    use tracing_subscriber::layer::{Context as LayerContext, Layer};
    use tracing_subscriber::registry::LookupSpan;
    use warp::http::StatusCode;
    use warp::Reply;

    use crate::error::PersistenceError;

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedSpan {
        id: u64,
        pub(crate) name: String,
        /// Parent names, innermost first.
        pub(crate) ancestors: Vec<String>,
        pub(crate) fields: HashMap<String, String>,
    }

    impl RecordedSpan {
        pub(crate) fn field(&self, name: &str) -> Option<&str> {
            self.fields.get(name).map(String::as_str)
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedEvent {
        pub(crate) message: String,
        pub(crate) span: Option<String>,
    }

    /// Keeps every span, field update and event seen while installed.
    #[derive(Clone, Default)]
    pub(crate) struct Recorded {
        spans: Arc<Mutex<Vec<RecordedSpan>>>,
        events: Arc<Mutex<Vec<RecordedEvent>>>,
    }

    struct Fields<'a>(&'a mut HashMap<String, String>);

    impl Visit for Fields<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{:?}", value));
        }
    }

    impl<S> Layer<S> for Recorded
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: LayerContext<'_, S>) {
            let mut fields = HashMap::new();
            attrs.record(&mut Fields(&mut fields));

            let ancestors: Vec<String> = ctx
                .span(id)
                .map(|span| span.scope().skip(1).map(|s| s.name().to_string()).collect())
                .unwrap_or_default();

            self.spans.lock().unwrap().push(RecordedSpan {
                id: id.into_u64(),
                name: attrs.metadata().name().to_string(),
                ancestors,
                fields,
            });
        }

        fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: LayerContext<'_, S>) {
            let mut spans = self.spans.lock().unwrap();
            if let Some(span) = spans.iter_mut().rev().find(|s| s.id == id.into_u64()) {
                values.record(&mut Fields(&mut span.fields));
            }
        }

        fn on_event(&self, event: &Event<'_>, ctx: LayerContext<'_, S>) {
            let mut fields = HashMap::new();
            event.record(&mut Fields(&mut fields));

            self.events.lock().unwrap().push(RecordedEvent {
                message: fields.remove("message").unwrap_or_default(),
                span: ctx.event_span(event).map(|s| s.name().to_string()),
            });
        }
    }

    impl Recorded {
        pub(crate) fn span(&self, name: &str) -> Option<RecordedSpan> {
            self.spans
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|s| s.name == name)
                .cloned()
        }

        pub(crate) fn event(&self, message: &str) -> Option<RecordedEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.message == message)
                .cloned()
        }
    }

    fn response_span() -> Span {
        tracing::info_span!(
            "HTTP request",
            otel.status_code = Empty,
            http.status_code = Empty,
            http.response_content_length = Empty,
            exception.message = Empty,
        )
    }

    #[test]
    fn test_export_headers() {
        let headers = export_headers("abc123");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("lightstep-access-token").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_no_token_no_provider() -> Result<()> {
        let settings = TraceSettings {
            endpoint: "http://localhost:4318/v1/traces".to_string(),
            access_token: None,
        };
        assert!(init_tracer_provider(&settings)?.is_none());

        Ok(())
    }

    #[test]
    fn test_record_response() {
        let recorded = Recorded::default();
        let subscriber = Registry::default().with(recorded.clone());

        tracing::subscriber::with_default(subscriber, || {
            let span = response_span();
            let _guard = span.enter();

            let response = warp::reply::with_status(
                warp::reply::json(&vec![1, 2, 3]),
                StatusCode::CREATED,
            )
            .into_response();
            let response = record_response(response);

            assert_eq!(response.status(), StatusCode::CREATED);
        });

        let span = recorded.span("HTTP request").unwrap();
        assert_eq!(span.field("http.status_code"), Some("201"));
        assert_eq!(span.field("http.response_content_length"), Some("7"));
        assert_eq!(span.field("otel.status_code"), None);
    }

    #[test]
    fn test_record_server_error() {
        let recorded = Recorded::default();
        let subscriber = Registry::default().with(recorded.clone());

        tracing::subscriber::with_default(subscriber, || {
            let span = response_span();
            let _guard = span.enter();

            record_response(StatusCode::INTERNAL_SERVER_ERROR.into_response());
        });

        let span = recorded.span("HTTP request").unwrap();
        assert_eq!(span.field("http.status_code"), Some("500"));
        assert_eq!(span.field("otel.status_code"), Some("ERROR"));
    }

    #[test]
    fn test_record_exception() {
        let recorded = Recorded::default();
        let subscriber = Registry::default().with(recorded.clone());

        tracing::subscriber::with_default(subscriber, || {
            let span = response_span();
            let err = PersistenceError::from(sqlx::Error::PoolClosed);
            record_exception(&span, &err);
        });

        let span = recorded.span("HTTP request").unwrap();
        assert_eq!(span.field("otel.status_code"), Some("ERROR"));
        assert!(span
            .field("exception.message")
            .unwrap_or_default()
            .starts_with("persistence failure: "));

        let event = recorded.event("exception").unwrap();
        assert_eq!(event.span.as_deref(), Some("HTTP request"));
    }
}
