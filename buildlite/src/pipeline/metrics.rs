use crate::pipeline::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub name: String,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter())
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }

    pub fn stage_duration_ms(&self, name: &str) -> Option<u128> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| stage.duration_ms)
    }

    /// Log a one-line summary per stage.
    pub fn log_stages(&self) {
        for stage in &self.stages {
            let tasks: Vec<String> = stage
                .tasks
                .iter()
                .map(|t| format!("{}={}ms", t.name, t.duration_ms))
                .collect();
            tracing::info!(
                stage = %stage.name,
                duration_ms = stage.duration_ms as u64,
                tasks = %tasks.join(" "),
                "Stage completed"
            );
        }
        tracing::info!(
            total_duration_ms = self.total_duration_ms as u64,
            "Pipeline completed"
        );
    }
}
