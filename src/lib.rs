//! vidcore - AI task routing and job orchestration for creator tooling
//!
//! The asynchronous dispatch core of a YouTube-creator product: a caller
//! requests work, the core picks an executor, retries or falls back
//! according to policy, and tells subscribers what happened.
//!
//! # Architecture
//!
//! - Completion tasks are routed by kind to a primary provider and fall back
//!   sequentially through a single global provider order
//! - Jobs go to named queues, each with its own attempt limit, backoff,
//!   retention and concurrency; workers pull from a store with atomic claim
//! - Lifecycle changes are fanned out to rooms of authenticated connections
//!
//! # Modules
//!
//! - `adapters`: Completion providers (Claude, OpenAI, Gemini) and the registry
//! - `core`: Routing, AI dispatch, queue policies, job stores, orchestrator
//! - `domain`: Job records, payload contracts, real-time events
//! - `realtime`: Connection admission, rooms and broadcasting
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Which providers would a task try?
//! vidcore route generate_title
//!
//! # Run a completion
//! echo "Sourdough for beginners" | vidcore complete generate_title
//!
//! # Check a payload against a queue contract
//! vidcore validate video-process --file job.json
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod realtime;

// Re-export main types at crate root for convenience
pub use adapters::{CompletionOptions, ProviderError, ProviderId, ProviderRegistry};
pub use crate::core::{
    AiDispatcher, AllProvidersExhausted, JobOrchestrator, JobStore, JournalJobStore,
    MemoryJobStore, PolicyTable, Task, TaskKind, TaskRouter,
};
pub use domain::{EventKind, JobId, JobPayload, JobRecord, JobState, QueueName, RealtimeEvent};
pub use realtime::{Broadcaster, Connection, Handshake, Room};
