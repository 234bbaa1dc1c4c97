//! `lambda-runtime-client` is a custom AWS Lambda runtime client.
//!
//! The client long-polls the Runtime API for invocations, dispatches each one
//! to an injected handler (buffered or response-streaming), and reports back
//! exactly one result or error per invocation. Failures that cannot be
//! attributed to a single invocation terminate the process with a
//! class-specific exit code.
//!
//! Core modules:
//! - [`config`]: environment contract (control-plane endpoint, identity, tuning)
//! - [`runtime_api`]: the Runtime API client (next/response/error/init-error)
//! - [`invocation`]: per-invocation metadata + the handler-facing [`Context`]
//! - [`completion`]: exactly-once completion, deferral, background-task tracking
//! - [`stream`]: response-streaming wire framer and sink
//! - [`handler`]: injected handler values (buffered or streaming)
//! - [`runner`]: the poll/dispatch/report loop and the process-exit contract

pub mod completion;
pub mod config;
pub mod errors;
pub mod handler;
pub mod invocation;
pub mod runner;
pub mod runtime_api;
pub mod stream;

pub use completion::Completion;
pub use config::Config;
pub use errors::{Fatal, ReportableError, RuntimeErrorKind};
pub use handler::{buffered_fn, BufferedHandler, Handler, Mode, StreamingHandler};
pub use invocation::Context;
pub use runner::{start, Runner};
pub use stream::{Chunk, Prelude, ResponseStream};
