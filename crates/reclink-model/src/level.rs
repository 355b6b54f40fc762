//! A single similarity gradation within a comparison.

use reclink_sql::DialectAdapter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigurationError;
use crate::probability::{
    default_m_values, default_u_values, float_literal, median, prob_to_match_weight, Probability,
    ProbabilityKind, NOT_OBSERVED_EPSILON,
};

fn default_tf_adjustment_weight() -> f64 {
    1.0
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_default_tf_weight(value: &f64) -> bool {
    *value == default_tf_adjustment_weight()
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

/// Declarative form of a comparison level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelSpec {
    /// Boolean predicate over `col_l` / `col_r`, or the literal `ELSE`.
    pub sql_condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_for_charts: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_null_level: bool,
    #[serde(default, skip_serializing_if = "Probability::is_unset")]
    pub m_probability: Probability,
    #[serde(default, skip_serializing_if = "Probability::is_unset")]
    pub u_probability: Probability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf_adjustment_column: Option<String>,
    #[serde(
        default = "default_tf_adjustment_weight",
        skip_serializing_if = "is_default_tf_weight"
    )]
    pub tf_adjustment_weight: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tf_minimum_u_value: f64,
}

impl LevelSpec {
    pub fn new(sql_condition: impl Into<String>) -> Self {
        Self {
            sql_condition: sql_condition.into(),
            label_for_charts: None,
            is_null_level: false,
            m_probability: Probability::Unset,
            u_probability: Probability::Unset,
            tf_adjustment_column: None,
            tf_adjustment_weight: default_tf_adjustment_weight(),
            tf_minimum_u_value: 0.0,
        }
    }

    pub fn else_level() -> Self {
        Self::new("ELSE").with_label("All other comparisons")
    }

    /// `col_l IS NULL OR col_r IS NULL`, marked as the null level.
    pub fn null_level(column: &str) -> Self {
        let mut spec = Self::new(format!("{column}_l IS NULL OR {column}_r IS NULL")).with_label("Null");
        spec.is_null_level = true;
        spec
    }

    pub fn exact_match(column: &str) -> Self {
        Self::new(format!("{column}_l = {column}_r")).with_label(format!("Exact match {column}"))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label_for_charts = Some(label.into());
        self
    }

    pub fn with_m(mut self, m: f64) -> Self {
        self.m_probability = Probability::Fixed(m);
        self
    }

    pub fn with_u(mut self, u: f64) -> Self {
        self.u_probability = Probability::Fixed(u);
        self
    }

    pub fn with_tf_adjustment(mut self, column: &str, weight: f64) -> Self {
        self.tf_adjustment_column = Some(column.to_string());
        self.tf_adjustment_weight = weight;
        self
    }

    pub fn with_tf_minimum_u_value(mut self, value: f64) -> Self {
        self.tf_minimum_u_value = value;
        self
    }
}

/// One entry of a level's append-only training history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainedProbability {
    pub probability: Probability,
    pub description: String,
}

/// Audit record for one trained value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterEstimate {
    pub comparison_name: String,
    pub comparison_vector_value: i32,
    pub label_for_charts: String,
    pub kind: ProbabilityKind,
    pub probability: f64,
    /// log2 odds of the estimate, absent at 0 and 1.
    pub log_odds: Option<f64>,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ComparisonLevel {
    sql_condition: String,
    label: Option<String>,
    is_null_level: bool,
    is_else_level: bool,
    m_probability: Probability,
    u_probability: Probability,
    tf_adjustment_column: Option<String>,
    tf_adjustment_weight: f64,
    tf_minimum_u_value: f64,
    exact_match_columns: Option<Vec<String>>,
    input_columns: Vec<String>,

    // Assigned once by the owning comparison.
    comparison_name: String,
    comparison_vector_value: i32,
    num_levels: usize,

    trained_m: Vec<TrainedProbability>,
    trained_u: Vec<TrainedProbability>,
    warned_m_not_observed: bool,
    warned_u_not_observed: bool,
}

impl ComparisonLevel {
    pub fn from_spec(
        spec: &LevelSpec,
        comparison_name: &str,
        adapter: &DialectAdapter,
    ) -> Result<Self, ConfigurationError> {
        let sql = spec.sql_condition.trim();
        let is_else_level = sql.eq_ignore_ascii_case("ELSE");

        let (exact_match_columns, input_columns) = if is_else_level {
            (None, Vec::new())
        } else {
            let canonical = adapter
                .canonicalize(sql)
                .map_err(|e| ConfigurationError::invalid_sql(sql, e))?;
            let used = adapter
                .columns_used(sql)
                .map_err(|e| ConfigurationError::invalid_sql(sql, e))?;
            (
                canonical.exact_match_columns(),
                reclink_sql::columns::base_columns(&used),
            )
        };

        let mut level = Self {
            sql_condition: sql.to_string(),
            label: spec.label_for_charts.clone(),
            is_null_level: spec.is_null_level,
            is_else_level,
            m_probability: Probability::Unset,
            u_probability: Probability::Unset,
            tf_adjustment_column: spec.tf_adjustment_column.clone(),
            tf_adjustment_weight: spec.tf_adjustment_weight,
            tf_minimum_u_value: spec.tf_minimum_u_value,
            exact_match_columns,
            input_columns,
            comparison_name: comparison_name.to_string(),
            comparison_vector_value: 0,
            num_levels: 0,
            trained_m: Vec::new(),
            trained_u: Vec::new(),
            warned_m_not_observed: false,
            warned_u_not_observed: false,
        };

        if !(spec.tf_minimum_u_value >= 0.0 && spec.tf_minimum_u_value.is_finite()) {
            return Err(ConfigurationError::InvalidTfMinimum {
                level: level.display_name(),
                value: spec.tf_minimum_u_value,
            });
        }
        if !spec.m_probability.is_unset() {
            level.set_m_probability(spec.m_probability)?;
        }
        if !spec.u_probability.is_unset() {
            level.set_u_probability(spec.u_probability)?;
        }
        Ok(level)
    }

    pub(crate) fn attach(&mut self, comparison_vector_value: i32, num_levels: usize) {
        self.comparison_vector_value = comparison_vector_value;
        self.num_levels = num_levels;
    }

    pub(crate) fn set_label(&mut self, label: String) {
        self.label = Some(label);
    }

    pub(crate) fn clear_tf_adjustment(&mut self) {
        self.tf_adjustment_column = None;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn sql_condition(&self) -> &str {
        &self.sql_condition
    }

    pub fn is_null_level(&self) -> bool {
        self.is_null_level
    }

    pub fn is_else_level(&self) -> bool {
        self.is_else_level
    }

    pub fn comparison_name(&self) -> &str {
        &self.comparison_name
    }

    pub fn comparison_vector_value(&self) -> i32 {
        self.comparison_vector_value
    }

    /// The declared label, or the comparison vector value when none was given.
    pub fn label_for_charts(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.comparison_vector_value.to_string())
    }

    pub fn has_label(&self) -> bool {
        self.label.is_some()
    }

    pub fn tf_adjustment_column(&self) -> Option<&str> {
        self.tf_adjustment_column.as_deref()
    }

    pub fn tf_adjustment_weight(&self) -> f64 {
        self.tf_adjustment_weight
    }

    pub fn tf_minimum_u_value(&self) -> f64 {
        self.tf_minimum_u_value
    }

    /// Base columns when the predicate is a conjunction of `col_l = col_r`.
    pub fn exact_match_columns(&self) -> Option<&[String]> {
        self.exact_match_columns.as_deref()
    }

    pub fn is_exact_match(&self) -> bool {
        self.exact_match_columns.is_some()
    }

    /// Base input columns the predicate reads.
    pub fn input_columns(&self) -> &[String] {
        &self.input_columns
    }

    fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.sql_condition.clone())
    }

    // ------------------------------------------------------------------------
    // Probabilities
    // ------------------------------------------------------------------------

    /// Effective m probability; `None` for the null level.
    pub fn m_probability(&self) -> Option<f64> {
        (!self.is_null_level).then(|| self.resolve(ProbabilityKind::M))
    }

    /// Effective u probability; `None` for the null level.
    pub fn u_probability(&self) -> Option<f64> {
        (!self.is_null_level).then(|| self.resolve(ProbabilityKind::U))
    }

    /// The stored m setting, before defaults are applied.
    pub fn m_probability_setting(&self) -> Probability {
        self.m_probability
    }

    pub fn u_probability_setting(&self) -> Probability {
        self.u_probability
    }

    fn resolve(&self, kind: ProbabilityKind) -> f64 {
        let (setting, defaults): (Probability, fn(usize) -> Vec<f64>) = match kind {
            ProbabilityKind::M => (self.m_probability, default_m_values),
            ProbabilityKind::U => (self.u_probability, default_u_values),
        };
        setting.value().unwrap_or_else(|| {
            usize::try_from(self.comparison_vector_value)
                .ok()
                .and_then(|idx| defaults(self.num_levels).get(idx).copied())
                .unwrap_or(1.0)
        })
    }

    pub fn set_m_probability(&mut self, value: Probability) -> Result<(), ConfigurationError> {
        self.set_probability(ProbabilityKind::M, value)
    }

    pub fn set_u_probability(&mut self, value: Probability) -> Result<(), ConfigurationError> {
        self.set_probability(ProbabilityKind::U, value)
    }

    fn set_probability(
        &mut self,
        kind: ProbabilityKind,
        value: Probability,
    ) -> Result<(), ConfigurationError> {
        if self.is_null_level {
            return Err(ConfigurationError::NullLevelProbability {
                comparison: self.comparison_name.clone(),
                level: self.display_name(),
                kind,
            });
        }
        if let Probability::Fixed(v) = value {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigurationError::InvalidProbability {
                    level: self.display_name(),
                    kind,
                    value: v,
                });
            }
        }
        if value == Probability::NotObserved {
            self.warn_not_observed(kind);
        }
        match kind {
            ProbabilityKind::M => self.m_probability = value,
            ProbabilityKind::U => self.u_probability = value,
        }
        Ok(())
    }

    /// Adopt the not-observed warnings already raised on `other`, a
    /// snapshot of this level, so they are not raised again.
    pub fn inherit_not_observed_warnings(&mut self, other: &ComparisonLevel) {
        self.warned_m_not_observed |= other.warned_m_not_observed;
        self.warned_u_not_observed |= other.warned_u_not_observed;
    }

    pub fn warned_not_observed(&self, kind: ProbabilityKind) -> bool {
        match kind {
            ProbabilityKind::M => self.warned_m_not_observed,
            ProbabilityKind::U => self.warned_u_not_observed,
        }
    }

    fn warn_not_observed(&mut self, kind: ProbabilityKind) {
        let warned = match kind {
            ProbabilityKind::M => &mut self.warned_m_not_observed,
            ProbabilityKind::U => &mut self.warned_u_not_observed,
        };
        if *warned {
            return;
        }
        *warned = true;
        warn!(
            comparison = %self.comparison_name,
            level = %self.label.as_deref().unwrap_or(&self.sql_condition),
            kind = %kind,
            epsilon = NOT_OBSERVED_EPSILON,
            "level was not observed in the training data; using a small probability instead"
        );
    }

    /// `m / u`; `+inf` when `u == 0`; always 1.0 for the null level.
    pub fn bayes_factor(&self) -> f64 {
        if self.is_null_level {
            return 1.0;
        }
        let (m, u) = (self.resolve(ProbabilityKind::M), self.resolve(ProbabilityKind::U));
        if u == 0.0 {
            f64::INFINITY
        } else {
            m / u
        }
    }

    pub fn log2_bayes_factor(&self) -> f64 {
        self.bayes_factor().log2()
    }

    pub fn bayes_factor_description(&self) -> String {
        let text = format!(
            "If comparison level is `{}` then comparison is",
            self.label_for_charts().to_lowercase()
        );
        let bf = self.bayes_factor();
        if bf.is_infinite() {
            format!("{text} certain to be a match")
        } else if bf == 0.0 {
            format!("{text} impossible to be a match")
        } else if bf >= 1.0 {
            format!("{text} {bf:.2} times more likely to be a match")
        } else {
            format!("{text} {:.2} times less likely to be a match", 1.0 / bf)
        }
    }

    pub fn m_probability_description(&self) -> Option<String> {
        self.m_probability().map(|m| {
            format!(
                "Amongst matching record comparisons, {:.2}% of records are in the {} comparison level",
                m * 100.0,
                self.label_for_charts().to_lowercase()
            )
        })
    }

    pub fn u_probability_description(&self) -> Option<String> {
        self.u_probability().map(|u| {
            format!(
                "Amongst non-matching record comparisons, {:.2}% of records are in the {} comparison level",
                u * 100.0,
                self.label_for_charts().to_lowercase()
            )
        })
    }

    // ------------------------------------------------------------------------
    // Training history
    // ------------------------------------------------------------------------

    pub fn add_trained_m_probability(
        &mut self,
        probability: Probability,
        description: impl Into<String>,
    ) -> Result<(), ConfigurationError> {
        self.add_trained(ProbabilityKind::M, probability, description.into())
    }

    pub fn add_trained_u_probability(
        &mut self,
        probability: Probability,
        description: impl Into<String>,
    ) -> Result<(), ConfigurationError> {
        self.add_trained(ProbabilityKind::U, probability, description.into())
    }

    fn add_trained(
        &mut self,
        kind: ProbabilityKind,
        probability: Probability,
        description: String,
    ) -> Result<(), ConfigurationError> {
        if self.is_null_level {
            return Err(ConfigurationError::NullLevelProbability {
                comparison: self.comparison_name.clone(),
                level: self.display_name(),
                kind,
            });
        }
        if probability == Probability::NotObserved {
            self.warn_not_observed(kind);
        }
        let entry = TrainedProbability {
            probability,
            description,
        };
        match kind {
            ProbabilityKind::M => self.trained_m.push(entry),
            ProbabilityKind::U => self.trained_u.push(entry),
        }
        Ok(())
    }

    pub fn trained_m_probabilities(&self) -> &[TrainedProbability] {
        &self.trained_m
    }

    pub fn trained_u_probabilities(&self) -> &[TrainedProbability] {
        &self.trained_u
    }

    /// Median of the numeric trained m values; not-observed entries are skipped.
    pub fn trained_m_median(&self) -> Option<f64> {
        trained_median(&self.trained_m)
    }

    pub fn trained_u_median(&self) -> Option<f64> {
        trained_median(&self.trained_u)
    }

    pub(crate) fn populate_from_trained_values(&mut self) {
        if let Some(m) = self.trained_m_median() {
            self.m_probability = Probability::Fixed(m);
        }
        if let Some(u) = self.trained_u_median() {
            self.u_probability = Probability::Fixed(u);
        }
    }

    pub fn parameter_estimates(&self) -> Vec<ParameterEstimate> {
        let m = self.trained_m.iter().map(|t| (ProbabilityKind::M, t));
        let u = self.trained_u.iter().map(|t| (ProbabilityKind::U, t));
        m.chain(u)
            .filter_map(|(kind, trained)| {
                let probability = trained.probability.fixed()?;
                Some(ParameterEstimate {
                    comparison_name: self.comparison_name.clone(),
                    comparison_vector_value: self.comparison_vector_value,
                    label_for_charts: self.label_for_charts(),
                    kind,
                    probability,
                    log_odds: prob_to_match_weight(probability),
                    description: trained.description.clone(),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // SQL
    // ------------------------------------------------------------------------

    /// This level's arm of the comparison vector `CASE`.
    pub fn when_then_sql(&self) -> String {
        if self.is_else_level {
            format!("ELSE {}", self.comparison_vector_value)
        } else {
            format!(
                "WHEN {} THEN {}",
                self.sql_condition, self.comparison_vector_value
            )
        }
    }

    pub fn bayes_factor_sql(&self, gamma_column: &str) -> String {
        let bf = self.bayes_factor();
        let value = if bf.is_infinite() {
            "'Infinity'".to_string()
        } else {
            float_literal(bf)
        };
        format!(
            "WHEN {gamma_column} = {} THEN cast({value} as float8)",
            self.comparison_vector_value
        )
    }

    /// This level's arm of the term-frequency adjustment `CASE`.
    ///
    /// `levels` must contain every level of the model; the u probability of
    /// the unique exact-match level on the adjustment column is the
    /// numerator of the adjustment.
    pub fn tf_adjustment_sql(
        &self,
        gamma_column: &str,
        levels: &[&ComparisonLevel],
    ) -> Result<String, ConfigurationError> {
        let cvv = self.comparison_vector_value;
        let column = match &self.tf_adjustment_column {
            Some(column)
                if cvv != -1
                    && !self.is_null_level
                    && !self.is_else_level
                    && self.tf_adjustment_weight != 0.0 =>
            {
                column
            }
            _ => return Ok(format!("WHEN {gamma_column} = {cvv} THEN cast(1 as float8)")),
        };

        let u_exact = exact_match_u_probability(column, levels)?;
        let a = format!("coalesce(tf_{column}_l, tf_{column}_r)");
        let b = format!("coalesce(tf_{column}_r, tf_{column}_l)");
        let divisor = if self.tf_minimum_u_value == 0.0 {
            format!("CASE WHEN {a} >= {b} THEN {a} ELSE {b} END")
        } else {
            let min = format!("cast({} as float8)", float_literal(self.tf_minimum_u_value));
            format!("CASE WHEN {a} >= {b} AND {a} > {min} THEN {a} WHEN {b} > {min} THEN {b} ELSE {min} END")
        };
        Ok(format!(
            "WHEN {gamma_column} = {cvv} THEN (CASE WHEN {a} IS NOT NULL THEN \
             POW(cast({} as float8) / ({divisor}), cast({} as float8)) \
             ELSE cast(1 as float8) END)",
            float_literal(u_exact),
            float_literal(self.tf_adjustment_weight),
        ))
    }

    pub fn to_spec(&self) -> LevelSpec {
        LevelSpec {
            sql_condition: self.sql_condition.clone(),
            label_for_charts: self.label.clone(),
            is_null_level: self.is_null_level,
            m_probability: self.m_probability,
            u_probability: self.u_probability,
            tf_adjustment_column: self.tf_adjustment_column.clone(),
            tf_adjustment_weight: self.tf_adjustment_weight,
            tf_minimum_u_value: self.tf_minimum_u_value,
        }
    }
}

fn trained_median(history: &[TrainedProbability]) -> Option<f64> {
    let values: Vec<f64> = history.iter().filter_map(|t| t.probability.fixed()).collect();
    median(&values)
}

/// u probability of the single exact-match level on `column`.
pub fn exact_match_u_probability(
    column: &str,
    levels: &[&ComparisonLevel],
) -> Result<f64, ConfigurationError> {
    let matches: Vec<&ComparisonLevel> = levels
        .iter()
        .copied()
        .filter(|level| !level.is_null_level)
        .filter(|level| match level.exact_match_columns() {
            Some([only]) => only.eq_ignore_ascii_case(column),
            _ => false,
        })
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.resolve(ProbabilityKind::U)),
        [] => Err(ConfigurationError::MissingExactMatchLevel {
            column: column.to_string(),
        }),
        many => Err(ConfigurationError::AmbiguousExactMatchLevel {
            column: column.to_string(),
            count: many.len(),
        }),
    }
}
