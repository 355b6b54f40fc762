//! Reclink engine: SQL pipelines, caching, prediction and training
//!
//! ```text
//!   inputs ─► concat (+tf) ─► blocked pairs ─► comparison vectors ─┬─► match weight parts ─► predict
//!                                                                  └─► agreement patterns ─► EM
//! ```
//!
//! Every stage is plain SQL text generated from a [`reclink_model::Settings`]
//! model. Stages are chained into a [`SqlPipeline`] and executed through a
//! [`Backend`] by the [`Linker`], which memoises each result under a hash of
//! its SQL.
//!
//! The engine is single-threaded and synchronous: backend calls happen one
//! after another, and a training session works on its own copy of the model
//! until it is committed.

pub mod backend;
pub mod blocking;
pub mod concat;
pub mod em;
pub mod error;
pub mod label_training;
pub mod linker;
pub mod pipeline;
pub mod predict;
pub mod u_sampling;
pub mod vectors;

pub use backend::{Backend, Record, TableHandle, TableName};
pub use em::{
    AgreementPattern, EmTrainingSession, IterationSummary, NewParameters, ParameterChange,
    SessionState, TrainingOptions,
};
pub use error::{LinkerError, Result};
pub use linker::{hashed_table_name, Linker};
pub use pipeline::{PipelineError, SqlPipeline, SqlStage};
pub use predict::{PredictInput, PredictOptions};
