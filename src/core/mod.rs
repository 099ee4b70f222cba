//! Core dispatch logic.
//!
//! This module contains:
//! - Router: task kind → provider routing with sequential fallback
//! - AI: prompt building and dispatch through the router
//! - Policy: per-queue retry, backoff and retention
//! - Store / Journal: job storage, in memory or journaled to disk
//! - Orchestrator: workers, retries and lifecycle notifications

pub mod ai;
pub mod journal;
pub mod orchestrator;
pub mod policy;
pub mod router;
pub mod store;

// Re-export commonly used types
pub use ai::{system_prompt_for, AiDispatcher, Completion, Task};
pub use journal::{JournalChange, JournalEntry, JournalJobStore};
pub use orchestrator::{
    processor_fn, JobContext, JobOrchestrator, JobTransition, OrchestratorError, Processor,
    ProcessorFn, SubmitError,
};
pub use policy::{BackoffStrategy, PolicyError, PolicyTable, QueuePolicy};
pub use router::{
    AllProvidersExhausted, FallbackOrder, ProviderFailure, Resolution, RoutingError, RoutingTable,
    TaskCategory, TaskKind, TaskRouter,
};
pub use store::{JobStore, MemoryJobStore, QueueCounts, StoreError};
