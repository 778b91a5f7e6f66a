//! The conversation engine: profiles, context, and the processing loop.

pub mod context;
pub mod processor;
pub mod profile;

pub use context::{ContextFragment, ContextProvider, ContextRequest};
pub use processor::{ProcessOutcome, Processor};
pub use profile::{ProcessingProfile, ProfileRegistry, TrustLevel};
