//! Steward: durable task engine and guarded conversation loop.

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod llm;
pub mod notify;
pub mod queue;
pub mod store;
pub mod tools;
