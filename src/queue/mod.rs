//! Task queue: retry policy, recurrence rules, handlers, and the worker.

pub mod backoff;
pub mod callback;
pub mod handler;
pub mod recurrence;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use callback::{LlmCallbackHandler, LlmCallbackPayload, LLM_CALLBACK_TASK_TYPE};
pub use handler::{HandlerRegistry, TaskError, TaskHandler};
pub use recurrence::RecurrenceRule;
pub use worker::Worker;
