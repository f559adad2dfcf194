//! `flowbridge-engine` — the job orchestration core.
//!
//! The [`RunOrchestrator`] owns the run lifecycle (creation, payment,
//! launch, refresh, settlement, startup recovery); the [`PollingScheduler`]
//! drives all in-flight runs through `refresh` on a fixed cadence, in
//! prioritized rate-bounded batches. Both are plain instances wired at
//! process startup and injected where needed.

pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod scheduler;

pub use error::EngineError;
pub use orchestrator::RunOrchestrator;
pub use platform::{FlowPlatform, LivePlatform};
pub use scheduler::{CycleOutcome, PollingScheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
