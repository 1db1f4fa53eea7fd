//! Generic pipeline execution framework.
//!
//! Provides a table-driven pipeline executor that can run named stages
//! containing tasks in parallel or sequential mode.

use super::artifact::ArtifactKind;
use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    /// Names of the stages in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Check the artifact handoff contract.
    ///
    /// Every artifact a task requires must be produced by a task in an
    /// earlier stage, or by an earlier task of the same sequential stage.
    /// Tasks of a parallel stage cannot consume each other's artifacts.
    pub fn validate(&self) -> BuildliteResult<()> {
        let mut available: BTreeSet<ArtifactKind> = BTreeSet::new();
        let mut stage_names: BTreeSet<&str> = BTreeSet::new();

        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(BuildliteError::Config(format!(
                    "duplicate stage name '{}' in execution plan",
                    stage.name
                )));
            }

            let mut produced_here = Vec::new();
            for task in &stage.tasks {
                for required in task.requires() {
                    if !available.contains(required) {
                        return Err(BuildliteError::Config(format!(
                            "task '{}' in stage '{}' requires artifact '{}' which no earlier task produces",
                            task.name(),
                            stage.name,
                            required
                        )));
                    }
                }

                match stage.execution {
                    ExecutionMode::Sequential => available.extend(task.produces().iter().copied()),
                    ExecutionMode::Parallel => produced_here.extend(task.produces().iter().copied()),
                }
            }
            available.extend(produced_here);
        }

        Ok(())
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }
}

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.stages())
    }
}

/// Pipeline executor framework.
///
/// This provides the generic infrastructure for executing a table-driven pipeline.
/// The actual task execution logic is provided by task implementations.
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute a pipeline.
    ///
    /// Iterates through stages and executes their tasks according to the
    /// stage's execution mode. The first failing task aborts the pipeline;
    /// its error is tagged with the stage and task name.
    ///
    /// Generic over:
    /// - `Ctx`: Shared pipeline context (use interior mutability for writes)
    pub async fn execute<Ctx>(
        pipeline: Pipeline<Ctx>,
        ctx: Ctx,
    ) -> BuildliteResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in pipeline.stages.into_iter().enumerate() {
            let execution = stage.execution;
            let stage_name = stage.name;
            let stage_start = Instant::now();

            tracing::info!(stage = %stage_name, tasks = stage.tasks.len(), "Stage starting");

            let task_metrics = match execution {
                ExecutionMode::Parallel => {
                    let futures = stage.tasks.into_iter().map(|task| {
                        let ctx = ctx.clone();
                        let stage_name = stage_name.as_str();
                        async move {
                            let name = task.name().to_string();
                            let task_start = Instant::now();
                            task.run(ctx)
                                .await
                                .map_err(|e| e.in_stage(stage_name, &name))?;
                            Ok::<TaskMetrics, BuildliteError>(TaskMetrics {
                                name,
                                duration_ms: task_start.elapsed().as_millis(),
                            })
                        }
                    });
                    try_join_all(futures).await?
                }
                ExecutionMode::Sequential => {
                    let mut task_metrics = Vec::new();
                    for task in stage.tasks {
                        let name = task.name().to_string();
                        let task_start = Instant::now();
                        task.run(ctx.clone())
                            .await
                            .map_err(|e| e.in_stage(&stage_name, &name))?;
                        task_metrics.push(TaskMetrics {
                            name,
                            duration_ms: task_start.elapsed().as_millis(),
                        });
                    }
                    task_metrics
                }
            };

            stage_metrics.push(StageMetrics {
                index,
                name: stage_name,
                execution,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}
