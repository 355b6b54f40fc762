//! An ordered set of comparison levels over one matching dimension.

use reclink_sql::DialectAdapter;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::level::{ComparisonLevel, LevelSpec};

/// Declarative form of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComparisonSpec {
    pub output_column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_description: Option<String>,
    pub comparison_levels: Vec<LevelSpec>,
}

impl ComparisonSpec {
    pub fn new(output_column_name: impl Into<String>, comparison_levels: Vec<LevelSpec>) -> Self {
        Self {
            output_column_name: output_column_name.into(),
            comparison_description: None,
            comparison_levels,
        }
    }

    /// Null level, exact match, else.
    pub fn exact_match(column: &str) -> Self {
        Self::new(
            column,
            vec![
                LevelSpec::null_level(column),
                LevelSpec::exact_match(column),
                LevelSpec::else_level(),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct Comparison {
    output_column_name: String,
    description: Option<String>,
    levels: Vec<ComparisonLevel>,
}

impl Comparison {
    /// Build the levels and assign comparison vector values: the first
    /// declared non-null level gets `n - 1`, each later one the next lower
    /// value, null levels get `-1`.
    pub fn from_spec(
        spec: &ComparisonSpec,
        adapter: &DialectAdapter,
    ) -> Result<Self, ConfigurationError> {
        let name = spec.output_column_name.as_str();
        if spec.comparison_levels.is_empty() {
            return Err(ConfigurationError::EmptyComparison(name.to_string()));
        }

        let mut levels = spec
            .comparison_levels
            .iter()
            .map(|level| ComparisonLevel::from_spec(level, name, adapter))
            .collect::<Result<Vec<_>, _>>()?;

        let else_positions: Vec<usize> = levels
            .iter()
            .enumerate()
            .filter(|(_, level)| level.is_else_level())
            .map(|(i, _)| i)
            .collect();
        match else_positions.as_slice() {
            [] => return Err(ConfigurationError::MissingElseLevel(name.to_string())),
            [pos] if *pos == levels.len() - 1 => {}
            _ => return Err(ConfigurationError::MisplacedElseLevel(name.to_string())),
        }

        let num_levels = levels.iter().filter(|l| !l.is_null_level()).count();
        let mut next = num_levels as i32 - 1;
        for level in levels.iter_mut() {
            if level.is_null_level() {
                level.attach(-1, num_levels);
            } else {
                level.attach(next, num_levels);
                next -= 1;
            }
        }

        let labels: Vec<String> = levels.iter().map(|l| l.label_for_charts()).collect();
        for level in levels.iter_mut() {
            let label = level.label_for_charts();
            if level.has_label() && labels.iter().filter(|l| **l == label).count() > 1 {
                level.set_label(format!("{}. {label}", level.comparison_vector_value()));
            }
        }

        Ok(Self {
            output_column_name: name.to_string(),
            description: spec.comparison_description.clone(),
            levels,
        })
    }

    pub fn output_column_name(&self) -> &str {
        &self.output_column_name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn levels(&self) -> &[ComparisonLevel] {
        &self.levels
    }

    pub(crate) fn levels_mut(&mut self) -> &mut [ComparisonLevel] {
        &mut self.levels
    }

    pub fn non_null_levels(&self) -> impl Iterator<Item = &ComparisonLevel> {
        self.levels.iter().filter(|l| !l.is_null_level())
    }

    /// Number of non-null levels.
    pub fn num_levels(&self) -> usize {
        self.non_null_levels().count()
    }

    pub fn level_by_vector_value(&self, value: i32) -> Option<&ComparisonLevel> {
        self.levels
            .iter()
            .find(|l| l.comparison_vector_value() == value)
    }

    pub fn level_by_vector_value_mut(&mut self, value: i32) -> Option<&mut ComparisonLevel> {
        self.levels
            .iter_mut()
            .find(|l| l.comparison_vector_value() == value)
    }

    pub fn gamma_column_name(&self) -> String {
        format!("gamma_{}", self.output_column_name)
    }

    pub fn bf_column_name(&self) -> String {
        format!("bf_{}", self.output_column_name)
    }

    pub fn bf_tf_adj_column_name(&self) -> String {
        format!("bf_tf_adj_{}", self.output_column_name)
    }

    pub fn has_tf_adjustments(&self) -> bool {
        self.levels.iter().any(|l| {
            l.tf_adjustment_column().is_some()
                && !l.is_null_level()
                && !l.is_else_level()
                && l.tf_adjustment_weight() != 0.0
        })
    }

    /// Base input columns read by any level, in order of first use.
    pub fn input_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for column in self.levels.iter().flat_map(|l| l.input_columns()) {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                columns.push(column.clone());
            }
        }
        columns
    }

    pub fn tf_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for column in self.levels.iter().filter_map(|l| l.tf_adjustment_column()) {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                columns.push(column.to_string());
            }
        }
        columns
    }

    /// `CASE WHEN … THEN v … ELSE 0 END as gamma_<name>`
    pub fn case_statement(&self) -> String {
        let arms: Vec<String> = self.levels.iter().map(|l| l.when_then_sql()).collect();
        format!("CASE {} END as {}", arms.join(" "), self.gamma_column_name())
    }

    pub fn bayes_factor_sql(&self) -> String {
        let gamma = self.gamma_column_name();
        let arms: Vec<String> = self.levels.iter().map(|l| l.bayes_factor_sql(&gamma)).collect();
        format!("CASE {} END as {}", arms.join(" "), self.bf_column_name())
    }

    pub fn tf_adjustment_sql(
        &self,
        model_levels: &[&ComparisonLevel],
    ) -> Result<String, ConfigurationError> {
        let gamma = self.gamma_column_name();
        let arms = self
            .levels
            .iter()
            .map(|l| l.tf_adjustment_sql(&gamma, model_levels))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!(
            "CASE {} END as {}",
            arms.join(" "),
            self.bf_tf_adj_column_name()
        ))
    }

    /// Vector values whose Bayes factor is infinite.
    pub fn infinite_bayes_factor_values(&self) -> Vec<i32> {
        self.levels
            .iter()
            .filter(|l| l.bayes_factor().is_infinite())
            .map(|l| l.comparison_vector_value())
            .collect()
    }

    pub fn to_spec(&self) -> ComparisonSpec {
        ComparisonSpec {
            output_column_name: self.output_column_name.clone(),
            comparison_description: self.description.clone(),
            comparison_levels: self.levels.iter().map(|l| l.to_spec()).collect(),
        }
    }
}
