use reclink_model::ConfigurationError;

use crate::pipeline::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum LinkerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Failure reported by the execution backend, passed through unchanged.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("no input tables were given")]
    NoInputTables,

    #[error("input table `{0}` does not exist")]
    UnknownInputTable(String),

    #[error("blocking on `{0}` leaves no comparison to train")]
    NothingToTrain(String),

    #[error("blocking on `{0}` produced no candidate pairs to train on")]
    NoTrainingPairs(String),

    #[error("random sampling produced no record pairs")]
    EmptySample,

    #[error("unexpected result in `{table}`: {message}")]
    UnexpectedResult { table: String, message: String },
}

pub type Result<T, E = LinkerError> = std::result::Result<T, E>;
