//! Logging setup and per-request context.
//!
//! Handlers scope a request id and the client protocol around the proxy
//! future so that every log line emitted below them can be correlated.

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the wire protocol the client spoke
    /// (`openai`, `anthropic` or `gemini`).
    pub static PROTOCOL_CONTEXT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current client protocol from context, if set.
pub fn get_protocol_context() -> String {
    PROTOCOL_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Execute an async block with request context (request_id, protocol).
///
/// # Example
///
/// ```ignore
/// with_request_context!(request_id, "openai".to_string(), async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $protocol:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::PROTOCOL_CONTEXT
                    .scope($protocol, $body)
                    .await
            })
            .await
    };
    ($request_id:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID.scope($request_id, $body).await
    };
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Build the filter string. Noise suppression for the HTTP stack is always
/// appended, otherwise a bare `RUST_LOG=trace` would let hyper flood the output.
fn filter_directives(rust_log: Option<String>) -> String {
    let base_filter = rust_log.unwrap_or_else(|| "info,llm_gateway=debug".to_string());
    format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    )
}

/// Install the global tracing subscriber.
///
/// `NO_COLOR` disables ANSI output, `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter =
        tracing_subscriber::EnvFilter::new(filter_directives(std::env::var("RUST_LOG").ok()));
    let no_color = std::env::var("NO_COLOR").is_ok();
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(LocalTime)
                    .with_current_span(false),
            )
            .init();
    } else if no_color {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(false),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_id_get() {
        REQUEST_ID
            .scope("test-request-123".to_string(), async {
                assert_eq!(get_request_id(), "test-request-123");
            })
            .await;
    }

    #[tokio::test]
    async fn test_request_id_default() {
        assert_eq!(get_request_id(), "");
        assert_eq!(get_protocol_context(), "");
    }

    #[tokio::test]
    async fn test_request_id_isolation() {
        let task1 = tokio::spawn(async {
            REQUEST_ID
                .scope("request-1".to_string(), async {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    get_request_id()
                })
                .await
        });

        let task2 = tokio::spawn(async {
            REQUEST_ID
                .scope("request-2".to_string(), async {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    get_request_id()
                })
                .await
        });

        assert_eq!(task1.await.unwrap(), "request-1");
        assert_eq!(task2.await.unwrap(), "request-2");
    }

    #[tokio::test]
    async fn test_with_request_context_macro() {
        let seen = crate::with_request_context!(
            "req-9".to_string(),
            "anthropic".to_string(),
            async { (get_request_id(), get_protocol_context()) }
        );
        assert_eq!(seen, ("req-9".to_string(), "anthropic".to_string()));
    }

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();
        assert_eq!(id1.len(), 36);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(
            filter_directives(None),
            "info,llm_gateway=debug,hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn"
        );
        assert!(filter_directives(Some("trace".to_string())).starts_with("trace,hyper=warn"));
    }
}
