//! Fellegi-Sunter comparison model for Reclink
//!
//! ```text
//!   Settings ──owns──► Comparison ──owns──► ComparisonLevel
//!      │                   │                     │
//!      │                   ├─ gamma CASE         ├─ WHEN … THEN v
//!      │                   ├─ bf CASE            ├─ m / u / Bayes factor
//!      │                   └─ tf CASE            └─ trained history (median)
//!      └─ link type, blocking rules, λ, EM knobs
//! ```
//!
//! The model is built from a declarative [`SettingsSpec`] (serde / JSON) and
//! renders the SQL fragments the engine stitches into pipelines. Training
//! appends to each level's history; [`Settings::populate_m_u_from_trained_values`]
//! folds the history back into the live parameters.

pub mod comparison;
pub mod error;
pub mod level;
pub mod probability;
pub mod settings;

pub use comparison::{Comparison, ComparisonSpec};
pub use error::ConfigurationError;
pub use level::{ComparisonLevel, LevelSpec, ParameterEstimate, TrainedProbability};
pub use probability::{
    bayes_factor_to_prob, float_literal, prob_to_bayes_factor, Probability, ProbabilityKind,
    NOT_OBSERVED_EPSILON,
};
pub use reclink_sql::SqlDialect;
pub use settings::{LevelKey, LinkType, Settings, SettingsSpec};
