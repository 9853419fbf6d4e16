//! Tracing setup for the streaming layer.
//!
//! [`init_tracing`] installs the global subscriber in one of two modes:
//! - **JSON** (`json = true`): one object per line with nanosecond
//!   timestamps, for log shipping.
//! - **Pretty** (`json = false`): colored multi-line output for local runs.
//!
//! `RUST_LOG` controls filtering in both modes
//! (e.g. `RUST_LOG=cm_stream=debug,cm_stream::client=trace`).
//!
//! Stream URLs frequently carry credentials (listen keys, signed query
//! strings). Connection code logs them through [`redact_url`], and the
//! [`UrlCredentialGuard`] layer warns whenever an event still records a
//! field that looks like one.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global tracing subscriber.
///
/// Returns an error if a global subscriber is already installed, so tests and
/// embedding applications can call it more than once.
///
/// ```
/// let _ = cm_core::logging::init_tracing(false);
/// ```
pub fn init_tracing(json: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(UrlCredentialGuard);

    if json {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(NanosecondTimer)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE);

        registry.with(json_layer).try_init()
    } else {
        let pretty_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);

        registry.with(pretty_layer).try_init()
    }
}

/// RFC 3339 timer with nanosecond precision.
#[derive(Debug, Clone)]
struct NanosecondTimer;

impl tracing_subscriber::fmt::time::FormatTime for NanosecondTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let now = chrono::Utc::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.9fZ"))
    }
}

/// Strip credentials from a stream URL before it is logged.
///
/// The query string is replaced by `?[REDACTED]`, and any path segment that
/// looks like a listen key or token is masked.
///
/// ```
/// use cm_core::logging::redact_url;
/// assert_eq!(
///     redact_url("wss://stream.example.com/ws?listenKey=abc"),
///     "wss://stream.example.com/ws?[REDACTED]"
/// );
/// ```
pub fn redact_url(url: &str) -> String {
    let (base, has_query) = match url.split_once('?') {
        Some((base, _)) => (base, true),
        None => (url, false),
    };

    let (scheme, rest) = match base.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, base),
    };

    let mut segments = rest.split('/');
    let host = segments.next().unwrap_or_default();
    let mut out = String::with_capacity(url.len());
    if let Some(scheme) = scheme {
        out.push_str(scheme);
        out.push_str("://");
    }
    out.push_str(host);
    for segment in segments {
        out.push('/');
        if looks_like_credential(segment) {
            out.push_str("[REDACTED]");
        } else {
            out.push_str(segment);
        }
    }
    if has_query {
        out.push_str("?[REDACTED]");
    }
    out
}

/// Field names whose values are credentials regardless of content.
const CREDENTIAL_FIELDS: &[&str] = &[
    "api_key",
    "api_secret",
    "secret",
    "password",
    "passphrase",
    "signature",
    "listen_key",
    "token",
];

/// Long, high-entropy strings (listen keys, signatures, API keys).
fn looks_like_credential(value: &str) -> bool {
    if value.len() < 32 {
        return false;
    }
    if value.chars().all(|c| c.is_ascii_hexdigit()) {
        return value.len() >= 40;
    }
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_'))
        && value.chars().any(|c| c.is_ascii_digit())
        && value.chars().any(|c| c.is_ascii_alphabetic())
}

/// True if `value` is a URL whose query string or path still carries a
/// credential.
fn url_leaks_credential(value: &str) -> bool {
    if !(value.starts_with("ws://")
        || value.starts_with("wss://")
        || value.starts_with("http://")
        || value.starts_with("https://"))
    {
        return false;
    }
    redact_url(value) != value
}

/// Layer that warns when a span or event records something that looks like a
/// credential. It does not rewrite the output; callers are expected to pass
/// URLs through [`redact_url`].
#[derive(Debug, Clone)]
pub struct UrlCredentialGuard;

impl<S> Layer<S> for UrlCredentialGuard
where
    S: tracing::Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(
        &self,
        attrs: &span::Attributes<'_>,
        _id: &span::Id,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = CredentialVisitor::default();
        attrs.record(&mut visitor);
        if let Some(field) = visitor.offending {
            tracing::warn!(field, "span field looks like a credential, log it through redact_url");
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        // Our own warning would otherwise recurse.
        if event.metadata().target() == module_path!() {
            return;
        }
        let mut visitor = CredentialVisitor::default();
        event.record(&mut visitor);
        if let Some(field) = visitor.offending {
            tracing::warn!(field, "event field looks like a credential, log it through redact_url");
        }
    }
}

#[derive(Default)]
struct CredentialVisitor {
    offending: Option<&'static str>,
}

impl CredentialVisitor {
    fn check(&mut self, field: &Field, value: &str) {
        if self.offending.is_some() {
            return;
        }
        if CREDENTIAL_FIELDS.contains(&field.name())
            || url_leaks_credential(value)
            || looks_like_credential(value)
        {
            self.offending = Some(field.name());
        }
    }
}

impl Visit for CredentialVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if CREDENTIAL_FIELDS.contains(&field.name()) {
            self.offending.get_or_insert(field.name());
            return;
        }
        // `%url` and `?url` both arrive here.
        let rendered = format!("{value:?}");
        self.check(field, rendered.trim_matches('"'));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.check(field, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url_without_credentials_is_unchanged() {
        let url = "wss://stream.binance.com:9443/ws";
        assert_eq!(redact_url(url), url);
    }

    #[test]
    fn test_redact_url_masks_query() {
        assert_eq!(
            redact_url("wss://ws.example.com/private?apiKey=k&signature=s"),
            "wss://ws.example.com/private?[REDACTED]"
        );
    }

    #[test]
    fn test_redact_url_masks_listen_key_segment() {
        let url = "wss://fstream.binance.com/ws/pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1";
        assert_eq!(
            redact_url(url),
            "wss://fstream.binance.com/ws/[REDACTED]"
        );
    }

    #[test]
    fn test_redact_url_without_scheme() {
        assert_eq!(redact_url("localhost:8080/feed?x=1"), "localhost:8080/feed?[REDACTED]");
    }

    #[test]
    fn test_looks_like_credential() {
        assert!(!looks_like_credential("btcusdt@depth"));
        assert!(!looks_like_credential(
            "Connected to exchange WebSocket stream for BTCUSDT"
        ));
        assert!(looks_like_credential(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A"
        ));
        assert!(looks_like_credential("aabbccddee00112233445566778899aabbccddee00112233"));
    }

    #[test]
    fn test_url_leaks_credential() {
        assert!(url_leaks_credential("wss://x.example.com/ws?listenKey=abc"));
        assert!(!url_leaks_credential("wss://x.example.com/ws"));
        assert!(!url_leaks_credential("not a url ?"));
    }

    #[test]
    fn test_credential_field_names() {
        assert!(CREDENTIAL_FIELDS.contains(&"listen_key"));
        assert!(CREDENTIAL_FIELDS.contains(&"signature"));
        assert!(!CREDENTIAL_FIELDS.contains(&"url"));
    }
}
