//! Scheduling for Hearth.
//!
//! Admission control keeps one build per project in flight, the dispatch
//! queue matches each stage's recipe to an execution service, and the
//! orchestrator ties both to the result tree.

pub mod orchestrator;
pub mod project_queue;
pub mod queue;
pub mod registry;

pub use orchestrator::{BuildAdmission, BuildOrchestrator, BuildPlanner, StagePlan};
pub use project_queue::{BuildRequest, ProjectBuildRequestQueue, ProjectQueueSnapshot};
pub use queue::{DispatchOutcome, DispatchRequest, RecipeDispatchQueue};
pub use registry::ServiceRegistry;
