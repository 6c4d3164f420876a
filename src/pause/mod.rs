//! Durable suspend/resume for human-in-the-loop and long-wait workflows.
//!
//! When the executor stops at a suspension point, the whole run — context,
//! graph snapshot, environment, input — is written as one self-contained
//! record. Resume reconstructs the run from that record alone, injects the
//! externally provided gate outcome, and hands it back to the executor,
//! which picks up exactly where traversal stopped.

pub mod service;
pub mod store;
pub mod wire;

pub use service::{PauseResumeService, ResumedExecution};
pub use store::{
    FilePausedStore, MemoryPausedStore, PauseError, PausedExecution, PausedExecutionStore,
};
pub use wire::SerializedContext;
