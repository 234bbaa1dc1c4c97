//! The poll/dispatch/report loop.
//!
//! One invocation is in flight at a time: fetch from `/next`, build the
//! metadata, dispatch to the handler in its mode, report exactly one outcome,
//! then schedule the next iteration. Anything that cannot be attributed to a
//! single invocation escalates as [`Fatal`] and terminates the process.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use futures::FutureExt as _;

use crate::completion::{
    BackgroundFailures, Completion, CompletionCell, DeferredSlot, Outcome, PendingReport,
    TaskTracker,
};
use crate::config::Config;
use crate::errors::{self, Fatal, ReportableError, RuntimeErrorKind};
use crate::handler::{BufferedHandler, Handler, StreamingHandler};
use crate::invocation::{Context, Invocation};
use crate::runtime_api::RuntimeApiClient;
use crate::stream::ResponseStream;

pub struct Runner {
    client: RuntimeApiClient,
    config: Config,
    handler: Handler,
    tasks: Arc<TaskTracker>,
    background: BackgroundFailures,
    deferred: DeferredSlot,
}

impl Runner {
    pub fn new(config: Config, handler: Handler) -> anyhow::Result<Self> {
        let client = RuntimeApiClient::new(config.base_url())?;
        Ok(Self::with_client(client, config, handler))
    }

    pub fn with_client(client: RuntimeApiClient, config: Config, handler: Handler) -> Self {
        Self {
            client,
            config,
            handler,
            tasks: Arc::new(TaskTracker::new()),
            background: BackgroundFailures::default(),
            deferred: DeferredSlot::default(),
        }
    }

    /// Drive the loop until a fatal condition occurs.
    pub async fn run(&self) -> Fatal {
        loop {
            if let Err(fatal) = self.iteration().await {
                return fatal;
            }
        }
    }

    async fn iteration(&self) -> Result<(), Fatal> {
        let next = match self.client.next_invocation().await {
            Ok(next) => next,
            Err(err) => {
                tracing::error!(error = %err, "/next failed");
                return Err(Fatal::uncaught(errors::to_reportable(&err)));
            }
        };
        tracing::info!(
            request_id = %next.request_id,
            mode = self.handler.mode().as_str(),
            body_len = next.body.len(),
            "received invocation"
        );

        let invocation = match Invocation::parse(&next) {
            Ok(invocation) => invocation,
            Err(report) => {
                tracing::warn!(
                    request_id = %next.request_id,
                    error_type = %report.error_type,
                    "invocation metadata rejected"
                );
                return self.report_error(&next.request_id, &report).await;
            }
        };

        match &self.handler {
            Handler::Buffered { handler, .. } => self.dispatch_buffered(handler, invocation).await,
            Handler::Streaming {
                handler,
                high_water_mark,
            } => {
                self.dispatch_streaming(handler, *high_water_mark, invocation)
                    .await
            }
        }
    }

    async fn dispatch_buffered(
        &self,
        handler: &Arc<dyn BufferedHandler>,
        invocation: Invocation,
    ) -> Result<(), Fatal> {
        let request_id = invocation.request_id.clone();
        let cell = Arc::new(CompletionCell::new());
        let deferral = Arc::new(AtomicBool::new(true));
        let completion = Completion::new(cell.clone(), deferral.clone());
        let ctx = Context::new(
            &invocation,
            &self.config,
            deferral,
            self.tasks.clone(),
            self.background.clone(),
        );

        let invoke = handler.invoke(invocation.body.clone(), ctx, completion.clone());
        match AssertUnwindSafe(invoke).catch_unwind().await {
            Ok(Ok(value)) => {
                completion.succeed(value);
            }
            Ok(Err(err)) => {
                completion.fail(errors::to_reportable(&err));
            }
            Err(payload) => {
                completion.fail(ReportableError::from_panic(payload.as_ref()));
            }
        }

        let Some(done) = cell.take() else {
            // One of the arms above always completes the cell.
            return Ok(());
        };

        let report = PendingReport {
            request_id: request_id.clone(),
            outcome: done.outcome,
        };
        let report = if done.deferred {
            self.deferred.register(report);
            self.tasks.wait_idle().await;
            match self.deferred.take() {
                Some(report) => report,
                None => return Ok(()),
            }
        } else {
            report
        };

        self.check_background(&request_id).await?;

        let posted = match &report.outcome {
            Outcome::Result(value) => {
                tracing::info!(request_id = %report.request_id, "posting result");
                self.client.post_result(&report.request_id, value).await
            }
            Outcome::Error(error) => {
                tracing::warn!(
                    request_id = %report.request_id,
                    error_type = %error.error_type,
                    "posting invocation error"
                );
                self.client
                    .post_invocation_error(&report.request_id, error)
                    .await
            }
        };
        cell.finish();

        match posted {
            Ok(()) => Ok(()),
            Err(err) => {
                // A completed invocation cannot be retried.
                tracing::error!(request_id = %request_id, error = %err, "report failed");
                Err(Fatal::uncaught(errors::to_reportable(&err)))
            }
        }
    }

    async fn dispatch_streaming(
        &self,
        handler: &Arc<dyn StreamingHandler>,
        high_water_mark: Option<usize>,
        invocation: Invocation,
    ) -> Result<(), Fatal> {
        let request_id = invocation.request_id.clone();
        let capacity = high_water_mark.unwrap_or(self.config.stream_hwm);
        let (tx, join) = self
            .client
            .start_streaming_response(request_id.clone(), capacity);
        let mut stream = ResponseStream::new(tx);

        let deferral = Arc::new(AtomicBool::new(true));
        let ctx = Context::new(
            &invocation,
            &self.config,
            deferral,
            self.tasks.clone(),
            self.background.clone(),
        );

        let invoke = handler.invoke(invocation.body.clone(), &mut stream, ctx);
        match AssertUnwindSafe(invoke).catch_unwind().await {
            Ok(Ok(())) => {
                if !stream.is_terminal() {
                    let report = RuntimeErrorKind::MalformedStreamingHandler(
                        "handler finished without ending the response stream".to_string(),
                    )
                    .to_reportable();
                    stream.error(&report).await;
                }
            }
            Ok(Err(err)) => {
                stream.error(&errors::to_reportable(&err)).await;
            }
            Err(payload) => {
                stream.error(&ReportableError::from_panic(payload.as_ref())).await;
            }
        }
        tracing::info!(
            request_id = %request_id,
            bytes = stream.bytes_written(),
            errored = stream.is_errored(),
            "response stream finalized"
        );
        drop(stream);

        match join.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(request_id = %request_id, error = %err, "streamed report failed");
                return Err(Fatal::uncaught(errors::to_reportable(&err)));
            }
            Err(err) => {
                tracing::error!(request_id = %request_id, error = %err, "streaming task failed");
                return Err(Fatal::uncaught(ReportableError::new(
                    "Error",
                    format!("streaming response task failed: {err}"),
                )));
            }
        }

        self.check_background(&request_id).await
    }

    /// Report a per-invocation error and keep the loop alive; a failed
    /// report escalates.
    async fn report_error(&self, request_id: &str, report: &ReportableError) -> Result<(), Fatal> {
        match self.client.post_invocation_error(request_id, report).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(request_id = %request_id, error = %err, "report failed");
                Err(Fatal::uncaught(errors::to_reportable(&err)))
            }
        }
    }

    /// An unhandled background failure cannot be attributed to future
    /// invocations: report it (best effort) and terminate.
    async fn check_background(&self, request_id: &str) -> Result<(), Fatal> {
        let Some(failure) = self.background.take() else {
            return Ok(());
        };
        tracing::error!(
            request_id = %request_id,
            error_type = %failure.error_type,
            "unhandled background failure"
        );
        if let Err(err) = self.client.post_invocation_error(request_id, &failure).await {
            tracing::error!(request_id = %request_id, error = %err, "report failed");
        }
        Err(Fatal::background(failure))
    }
}

/// Process entry point: load configuration, build the handler, run the loop,
/// and terminate with the exit code of whatever fatal condition ends it.
///
/// Handler construction failures are reported through `/init/error` before
/// the process exits.
pub async fn start<F>(factory: F) -> std::convert::Infallible
where
    F: FnOnce(&Config) -> Result<Handler, RuntimeErrorKind>,
{
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            // No endpoint to report to without configuration.
            tracing::error!(error = %err, "configuration failed");
            std::process::exit(Fatal::EXIT_UNCAUGHT);
        }
    };

    let client = match RuntimeApiClient::new(config.base_url()) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "http client init failed");
            std::process::exit(Fatal::EXIT_UNCAUGHT);
        }
    };

    if !config.no_global_hooks {
        install_panic_hook();
    }

    let handler = match factory(&config) {
        Ok(handler) => handler,
        Err(kind) => {
            let report = kind.to_reportable();
            tracing::error!(error_type = %report.error_type, "handler init failed");
            if let Err(err) = client.post_init_error(&report).await {
                tracing::error!(error = %err, "posting init error failed");
            }
            std::process::exit(Fatal::EXIT_UNCAUGHT);
        }
    };

    tracing::info!(
        mode = handler.mode().as_str(),
        runtime_api = %config.runtime_api,
        "runtime started"
    );

    let runner = Runner::with_client(client, config, handler);
    let fatal = runner.run().await;
    tracing::error!(
        error_type = %fatal.error.error_type,
        exit_code = fatal.exit_code,
        "fatal runtime condition"
    );
    std::process::exit(fatal.exit_code);
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("AWS_LAMBDA_LOG_FORMAT").unwrap_or_default();
    if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "panic");
        previous(info);
    }));
}
