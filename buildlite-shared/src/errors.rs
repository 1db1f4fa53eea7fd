//! Error taxonomy for the build pipeline.
//!
//! Every failure aborts the step it occurred in. Nothing is downgraded to a
//! warning: a half-built environment must never be shipped as an image.

use thiserror::Error;

pub type BuildliteResult<T> = Result<T, BuildliteError>;

#[derive(Debug, Error)]
pub enum BuildliteError {
    /// Invalid build or launch configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Project manifest could not be read or is malformed.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Lockfile could not be read or is malformed.
    #[error("lockfile error: {0}")]
    Lockfile(String),

    /// Lockfile does not match the manifest.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A dependency could not be resolved from the lockfile or package index.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Installing the resolved environment failed.
    #[error("install error: {0}")]
    Install(String),

    /// Resolved environment or source tree missing/misplaced during assembly.
    #[error("layout error: {0}")]
    Layout(String),

    /// Image export or inspection failed.
    #[error("image error: {0}")]
    Image(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    /// The served process failed to start or become ready.
    #[error("startup error: {0}")]
    Startup(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Failure inside a named pipeline task.
    #[error("stage '{stage}' failed in task '{task}': {source}")]
    Stage {
        stage: String,
        task: String,
        #[source]
        source: Box<BuildliteError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BuildliteError {
    /// Wrap an error with the stage and task it occurred in.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost
    /// location is the one reported.
    pub fn in_stage(self, stage: &str, task: &str) -> Self {
        match self {
            err @ BuildliteError::Stage { .. } => err,
            other => BuildliteError::Stage {
                stage: stage.to_string(),
                task: task.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Name of the stage that failed, if known.
    pub fn stage(&self) -> Option<&str> {
        match self {
            BuildliteError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// The underlying error with stage annotations stripped.
    pub fn root(&self) -> &BuildliteError {
        match self {
            BuildliteError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}
