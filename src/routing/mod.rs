//! Moving messages through their procedure's steps.

pub mod ingest;
pub mod processor;
pub mod router;

pub use processor::{Processor, StepError, StepErrorKind};
pub use router::{Router, RouterConfig, RouterError, RouterState};
