//! Orchestration core: turns a streamed model reply into ordered, per-path
//! file builds for a plan branch.
//!
//! ```text
//! Orchestrator::start_tell
//!     |
//!     v
//! TellSession --chunks--> ChunkProcessor --Operation--> ActiveBuild
//!     |                                                    |
//!     |                                     Builder::queue_build (one worker per path)
//!     |                                                    |
//!     |                                       file build state machine --> PlanStore
//!     v                                                    |
//! StreamMessage channel <------------- BuildInfo ----------+
//! ```

pub mod active;
pub mod build;
pub mod config;
pub mod provider;
pub mod reply;
pub mod store;
pub mod stream;
pub mod tell;
pub mod tokens;

pub use active::{ActiveBuild, ActivePlan, ActivePlanRegistry, BuildKind, PlanKey, PlanSubscription};
pub use build::Builder;
pub use config::EngineConfig;
pub use reply::{ChunkProcessor, Operation, OperationKind};
pub use stream::{BuildInfo, BuildSummary, StreamMessage};
pub use tell::{Orchestrator, TellError, TellHandle, TellOutcome, TellRequest, TellStage};
