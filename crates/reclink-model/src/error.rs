use reclink_sql::DialectError;

use crate::probability::ProbabilityKind;

/// Fatal problems with the declared model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid SQL predicate `{sql}`: {source}")]
    InvalidSql {
        sql: String,
        #[source]
        source: DialectError,
    },

    #[error(
        "no exact match level found for term frequency column `{column}`; \
         a term frequency adjustment needs an exact match level on that column"
    )]
    MissingExactMatchLevel { column: String },

    #[error(
        "{count} exact match levels found for term frequency column `{column}`; \
         expected exactly one"
    )]
    AmbiguousExactMatchLevel { column: String, count: usize },

    #[error("cannot set the {kind} probability of null level `{level}` in comparison `{comparison}`")]
    NullLevelProbability {
        comparison: String,
        level: String,
        kind: ProbabilityKind,
    },

    #[error("{kind} probability {value} of level `{level}` must lie in [0, 1]")]
    InvalidProbability {
        level: String,
        kind: ProbabilityKind,
        value: f64,
    },

    #[error("probability_two_random_records_match must lie in (0, 1), got {0}")]
    InvalidMatchPrior(f64),

    #[error("tf_minimum_u_value of level `{level}` must be >= 0, got {value}")]
    InvalidTfMinimum { level: String, value: f64 },

    #[error("comparison `{0}` has no levels")]
    EmptyComparison(String),

    #[error("comparison `{0}` must end with an ELSE level")]
    MissingElseLevel(String),

    #[error("comparison `{0}` has an ELSE level that is not its last level")]
    MisplacedElseLevel(String),

    #[error("duplicate comparison output_column_name `{0}`")]
    DuplicateComparison(String),

    #[error("unknown comparison `{0}`")]
    UnknownComparison(String),

    #[error("comparison `{comparison}` has no level with comparison vector value {value}")]
    UnknownLevel { comparison: String, value: i32 },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl ConfigurationError {
    pub(crate) fn invalid_sql(sql: &str, source: DialectError) -> Self {
        ConfigurationError::InvalidSql {
            sql: sql.to_string(),
            source,
        }
    }
}
