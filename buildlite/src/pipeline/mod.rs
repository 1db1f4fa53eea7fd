//! Generic table-driven pipeline execution framework.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline → Stages → Tasks
//!
//! - Pipeline: Orchestrates execution of all stages, in order
//! - Stage: Named group of tasks with an execution mode (parallel/sequential)
//! - Task: Atomic unit of work that consumes and produces artifacts
//! ```
//!
//! Stages hand off work through artifacts. Each task declares what it
//! `requires()` and `produces()`, and [`ExecutionPlan::validate`] rejects a
//! plan where a task consumes an artifact that no earlier task produced. This
//! keeps the handoff protocol the same when stages are added (a lint or test
//! stage between builder and runtime, for example).
//!
//! ## Example
//!
//! ```ignore
//! use pipeline::{ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
//!
//! let plan = ExecutionPlan::new(vec![
//!     Stage::sequential("builder", vec![Box::new(StageInputsTask), Box::new(InstallEnvTask)]),
//!     Stage::sequential("runtime", vec![Box::new(AssembleRootfsTask)]),
//! ]);
//! plan.validate()?;
//!
//! let pipeline = PipelineBuilder::from_plan(plan);
//! let metrics = PipelineExecutor::execute(pipeline, ctx).await?;
//! println!("pipeline took {}ms", metrics.total_duration_ms);
//! ```

mod artifact;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use artifact::ArtifactKind;
pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
