//! Per-invocation metadata and the handler-facing [`Context`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;

use crate::completion::{BackgroundFailures, TaskGuard, TaskTracker};
use crate::config::Config;
use crate::errors::{ReportableError, RuntimeErrorKind};
use crate::runtime_api::NextInvocation;

const DEADLINE_MS_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
const FUNCTION_ARN_HEADER: &str = "Lambda-Runtime-Invoked-Function-Arn";
const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
const TENANT_ID_HEADER: &str = "Lambda-Runtime-Aws-Tenant-Id";
const CLIENT_CONTEXT_HEADER: &str = "Lambda-Runtime-Client-Context";
const COGNITO_IDENTITY_HEADER: &str = "Lambda-Runtime-Cognito-Identity";

/// Fallback window when the control plane omits the deadline header.
pub const DEFAULT_DEADLINE_MS: u64 = 3_000;

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// One unit of work, built from a `/next` response. Immutable once
/// constructed; consumed by exactly one dispatch.
#[derive(Debug)]
pub struct Invocation {
    pub request_id: String,
    pub deadline_ms: u64,
    pub invoked_function_arn: String,
    pub trace_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_context: Option<Value>,
    pub cognito_identity: Option<Value>,
    pub content_type: String,
    pub body: Bytes,
}

impl Invocation {
    /// Parse the metadata headers of a `/next` response. Header lookup goes
    /// through `http::HeaderMap`, which keeps key matching case-insensitive.
    ///
    /// A malformed trust-context header fails the invocation (the error
    /// names the offending field) without failing the loop.
    pub fn parse(next: &NextInvocation) -> Result<Self, ReportableError> {
        let headers = &next.headers;

        let deadline_ms = header_str(headers, DEADLINE_MS_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_else(|| epoch_ms() + DEFAULT_DEADLINE_MS);

        Ok(Self {
            request_id: next.request_id.clone(),
            deadline_ms,
            invoked_function_arn: header_str(headers, FUNCTION_ARN_HEADER)
                .unwrap_or_default()
                .to_string(),
            trace_id: header_str(headers, TRACE_ID_HEADER).map(str::to_string),
            tenant_id: header_str(headers, TENANT_ID_HEADER).map(str::to_string),
            client_context: parse_json_header(headers, CLIENT_CONTEXT_HEADER)?,
            cognito_identity: parse_json_header(headers, COGNITO_IDENTITY_HEADER)?,
            content_type: header_str(headers, http::header::CONTENT_TYPE.as_str())
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            body: next.body.clone(),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_json_header(headers: &HeaderMap, name: &str) -> Result<Option<Value>, ReportableError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| ReportableError::new("Error", format!("header {name} is not valid UTF-8")))?;
    serde_json::from_str(text)
        .map(Some)
        .map_err(|err| ReportableError::new("Error", format!("unable to parse {name} as JSON: {err}")))
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handler-facing view of one invocation: metadata headers merged with the
/// environment-derived identity, plus the completion plumbing. Cheap to
/// clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    request_id: String,
    deadline_ms: u64,
    invoked_function_arn: String,
    trace_id: Option<String>,
    tenant_id: Option<String>,
    client_context: Option<Value>,
    cognito_identity: Option<Value>,
    function_name: Option<String>,
    function_version: Option<String>,
    memory_size_mb: Option<u32>,
    log_group_name: Option<String>,
    wait_for_empty: Arc<AtomicBool>,
    tasks: Arc<TaskTracker>,
    background: BackgroundFailures,
}

impl Context {
    pub(crate) fn new(
        invocation: &Invocation,
        config: &Config,
        wait_for_empty: Arc<AtomicBool>,
        tasks: Arc<TaskTracker>,
        background: BackgroundFailures,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id: invocation.request_id.clone(),
                deadline_ms: invocation.deadline_ms,
                invoked_function_arn: invocation.invoked_function_arn.clone(),
                trace_id: invocation.trace_id.clone(),
                tenant_id: invocation.tenant_id.clone(),
                client_context: invocation.client_context.clone(),
                cognito_identity: invocation.cognito_identity.clone(),
                function_name: config.function_name.clone(),
                function_version: config.function_version.clone(),
                memory_size_mb: config.memory_size_mb,
                log_group_name: config.log_group_name.clone(),
                wait_for_empty,
                tasks,
                background,
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    pub fn deadline_ms(&self) -> u64 {
        self.inner.deadline_ms
    }

    pub fn invoked_function_arn(&self) -> &str {
        &self.inner.invoked_function_arn
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.inner.trace_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.inner.tenant_id.as_deref()
    }

    pub fn client_context(&self) -> Option<&Value> {
        self.inner.client_context.as_ref()
    }

    pub fn cognito_identity(&self) -> Option<&Value> {
        self.inner.cognito_identity.as_ref()
    }

    pub fn function_name(&self) -> Option<&str> {
        self.inner.function_name.as_deref()
    }

    pub fn function_version(&self) -> Option<&str> {
        self.inner.function_version.as_deref()
    }

    pub fn memory_size_mb(&self) -> Option<u32> {
        self.inner.memory_size_mb
    }

    pub fn log_group_name(&self) -> Option<&str> {
        self.inner.log_group_name.as_deref()
    }

    /// Milliseconds until the deadline, recomputed on every call. Negative
    /// once the deadline has passed.
    pub fn remaining_time_millis(&self) -> i64 {
        self.inner.deadline_ms as i64 - epoch_ms() as i64
    }

    /// Whether the winning completion waits for background work to drain
    /// before reporting. Defaults to `true`.
    pub fn set_callback_waits_for_empty_event_loop(&self, wait: bool) {
        self.inner.wait_for_empty.store(wait, Ordering::SeqCst);
    }

    /// Register background work by hand. The report of a deferred completion
    /// waits until every guard is dropped.
    pub fn task_guard(&self) -> TaskGuard {
        self.inner.tasks.enter()
    }

    /// Spawn tracked background work. An `Err` or panic becomes an unhandled
    /// background failure, which terminates the process after the current
    /// invocation is handled.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<()>
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        use futures::FutureExt as _;

        let guard = self.inner.tasks.enter();
        let background = self.inner.background.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match std::panic::AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => background.record(
                    RuntimeErrorKind::UnhandledRejection(format!("{err:#}")).to_reportable(),
                ),
                Err(payload) => {
                    let panic = ReportableError::from_panic(payload.as_ref());
                    background.record(
                        RuntimeErrorKind::UnhandledRejection(panic.error_message).to_reportable(),
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    fn next(headers: HeaderMap) -> NextInvocation {
        NextInvocation {
            request_id: "id-1".to_string(),
            headers,
            body: Bytes::from_static(br#"{"n":1}"#),
        }
    }

    fn test_config() -> Config {
        Config {
            runtime_api: "127.0.0.1:9001".into(),
            function_name: Some("echo".into()),
            function_version: Some("$LATEST".into()),
            memory_size_mb: Some(128),
            log_group_name: None,
            stream_hwm: 16,
            no_global_hooks: false,
        }
    }

    #[test]
    fn parses_all_metadata_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("lambda-runtime-deadline-ms", HeaderValue::from_static("123456789"));
        headers.insert(
            "lambda-runtime-invoked-function-arn",
            HeaderValue::from_static("arn:aws:lambda:eu-west-1:1234:function:echo"),
        );
        headers.insert("lambda-runtime-trace-id", HeaderValue::from_static("Root=1-abc"));
        headers.insert("lambda-runtime-aws-tenant-id", HeaderValue::from_static("tenant-9"));
        headers.insert(
            "lambda-runtime-client-context",
            HeaderValue::from_static(r#"{"client":{"app_title":"t"}}"#),
        );
        headers.insert("content-type", HeaderValue::from_static("application/octet-stream"));

        let inv = Invocation::parse(&next(headers)).unwrap();
        assert_eq!(inv.request_id, "id-1");
        assert_eq!(inv.deadline_ms, 123_456_789);
        assert_eq!(inv.invoked_function_arn, "arn:aws:lambda:eu-west-1:1234:function:echo");
        assert_eq!(inv.trace_id.as_deref(), Some("Root=1-abc"));
        assert_eq!(inv.tenant_id.as_deref(), Some("tenant-9"));
        assert_eq!(inv.client_context.unwrap()["client"]["app_title"], "t");
        assert!(inv.cognito_identity.is_none());
        assert_eq!(inv.content_type, "application/octet-stream");
        assert_eq!(inv.body, Bytes::from_static(br#"{"n":1}"#));
    }

    #[test]
    fn header_names_match_case_insensitively() {
        let mut upper = HeaderMap::new();
        upper.insert(
            HeaderName::from_bytes(b"Lambda-Runtime-Deadline-Ms").unwrap(),
            HeaderValue::from_static("42"),
        );
        let mut lower = HeaderMap::new();
        lower.insert("lambda-runtime-deadline-ms", HeaderValue::from_static("42"));

        let from_upper = Invocation::parse(&next(upper)).unwrap();
        let from_lower = Invocation::parse(&next(lower)).unwrap();
        assert_eq!(from_upper.deadline_ms, 42);
        assert_eq!(from_upper.deadline_ms, from_lower.deadline_ms);
    }

    #[test]
    fn missing_deadline_defaults_to_three_seconds_out() {
        let before = epoch_ms();
        let inv = Invocation::parse(&next(HeaderMap::new())).unwrap();
        let after = epoch_ms();

        assert!(inv.deadline_ms >= before + DEFAULT_DEADLINE_MS);
        assert!(inv.deadline_ms <= after + DEFAULT_DEADLINE_MS);
        assert_eq!(inv.content_type, "application/json");
    }

    #[test]
    fn malformed_client_context_names_the_field() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "lambda-runtime-client-context",
            HeaderValue::from_static("{not json"),
        );

        let err = Invocation::parse(&next(headers)).unwrap_err();
        assert_eq!(err.error_type, "Error");
        assert!(err.error_message.contains("Lambda-Runtime-Client-Context"));
    }

    #[test]
    fn malformed_cognito_identity_names_the_field() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "lambda-runtime-cognito-identity",
            HeaderValue::from_static("[[["),
        );

        let err = Invocation::parse(&next(headers)).unwrap_err();
        assert!(err.error_message.contains("Lambda-Runtime-Cognito-Identity"));
    }

    #[test]
    fn remaining_time_decreases_between_calls() {
        let mut headers = HeaderMap::new();
        let deadline = epoch_ms() + 60_000;
        headers.insert(
            "lambda-runtime-deadline-ms",
            HeaderValue::from_str(&deadline.to_string()).unwrap(),
        );
        let inv = Invocation::parse(&next(headers)).unwrap();
        let ctx = Context::new(
            &inv,
            &test_config(),
            Arc::new(AtomicBool::new(true)),
            Arc::new(TaskTracker::new()),
            BackgroundFailures::default(),
        );

        let first = ctx.remaining_time_millis();
        std::thread::sleep(std::time::Duration::from_millis(25));
        let second = ctx.remaining_time_millis();
        assert!(second <= first - 20, "first={first} second={second}");
    }

    #[test]
    fn context_merges_env_identity() {
        let inv = Invocation::parse(&next(HeaderMap::new())).unwrap();
        let ctx = Context::new(
            &inv,
            &test_config(),
            Arc::new(AtomicBool::new(true)),
            Arc::new(TaskTracker::new()),
            BackgroundFailures::default(),
        );

        assert_eq!(ctx.request_id(), "id-1");
        assert_eq!(ctx.function_name(), Some("echo"));
        assert_eq!(ctx.function_version(), Some("$LATEST"));
        assert_eq!(ctx.memory_size_mb(), Some(128));
    }

    #[tokio::test]
    async fn spawned_failure_is_recorded_as_background_failure() {
        let inv = Invocation::parse(&next(HeaderMap::new())).unwrap();
        let background = BackgroundFailures::default();
        let tasks = Arc::new(TaskTracker::new());
        let ctx = Context::new(
            &inv,
            &test_config(),
            Arc::new(AtomicBool::new(true)),
            tasks.clone(),
            background.clone(),
        );

        ctx.spawn(async { anyhow::bail!("task exploded") });
        tasks.wait_idle().await;

        let failure = background.take().unwrap();
        assert_eq!(failure.error_type, "UnhandledPromiseRejection");
        assert!(failure.error_message.contains("task exploded"));
    }
}
