//! Durable persistence: task queue, conversation history, and notes.

pub mod libsql_backend;
pub mod migrations;
pub mod task;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use task::{NewTask, RetryDisposition, Task, TaskStatus};
pub use traits::{MessageOrigin, Note, Store};
