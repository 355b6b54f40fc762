//! Model settings: declarative configuration and the live model built from it.

use reclink_sql::{DialectAdapter, SqlDialect};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::comparison::{Comparison, ComparisonSpec};
use crate::error::ConfigurationError;
use crate::level::{ComparisonLevel, ParameterEstimate};

// ============================================================================
// Declarative configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    DedupeOnly,
    LinkOnly,
    LinkAndDedupe,
}

fn default_unique_id_column_name() -> String {
    "unique_id".to_string()
}

fn default_source_dataset_column_name() -> String {
    "source_dataset".to_string()
}

fn default_probability_two_random_records_match() -> f64 {
    0.0001
}

fn default_em_convergence() -> f64 {
    0.0001
}

fn default_max_iterations() -> usize {
    25
}

fn default_true() -> bool {
    true
}

/// Settings as written by users (JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsSpec {
    pub link_type: LinkType,
    #[serde(default = "default_unique_id_column_name")]
    pub unique_id_column_name: String,
    #[serde(default = "default_source_dataset_column_name")]
    pub source_dataset_column_name: String,
    #[serde(default, alias = "blocking_rules_to_generate_predictions")]
    pub blocking_rules: Vec<String>,
    pub comparisons: Vec<ComparisonSpec>,
    #[serde(default = "default_probability_two_random_records_match")]
    pub probability_two_random_records_match: f64,
    #[serde(default)]
    pub additional_columns_to_retain: Vec<String>,
    #[serde(default = "default_true")]
    pub retain_matching_columns: bool,
    #[serde(default)]
    pub retain_intermediate_calculation_columns: bool,
    #[serde(default = "default_em_convergence")]
    pub em_convergence: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub sql_dialect: SqlDialect,
}

impl SettingsSpec {
    pub fn new(link_type: LinkType, comparisons: Vec<ComparisonSpec>) -> Self {
        Self {
            link_type,
            unique_id_column_name: default_unique_id_column_name(),
            source_dataset_column_name: default_source_dataset_column_name(),
            blocking_rules: Vec::new(),
            comparisons,
            probability_two_random_records_match: default_probability_two_random_records_match(),
            additional_columns_to_retain: Vec::new(),
            retain_matching_columns: true,
            retain_intermediate_calculation_columns: false,
            em_convergence: default_em_convergence(),
            max_iterations: default_max_iterations(),
            sql_dialect: SqlDialect::default(),
        }
    }

    pub fn with_blocking_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocking_rules = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.sql_dialect = dialect;
        self
    }
}

/// Identifies one level of the model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LevelKey {
    pub comparison: String,
    pub comparison_vector_value: i32,
}

// ============================================================================
// Live model
// ============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    link_type: LinkType,
    unique_id_column_name: String,
    source_dataset_column_name: String,
    blocking_rules: Vec<String>,
    comparisons: Vec<Comparison>,
    probability_two_random_records_match: f64,
    additional_columns_to_retain: Vec<String>,
    retain_matching_columns: bool,
    retain_intermediate_calculation_columns: bool,
    em_convergence: f64,
    max_iterations: usize,
    adapter: DialectAdapter,
}

impl Settings {
    pub fn from_spec(spec: SettingsSpec) -> Result<Self, ConfigurationError> {
        let adapter = DialectAdapter::new(spec.sql_dialect);

        if !(spec.em_convergence > 0.0 && spec.em_convergence.is_finite()) {
            return Err(ConfigurationError::InvalidSettings(format!(
                "em_convergence must be positive, got {}",
                spec.em_convergence
            )));
        }
        if spec.max_iterations == 0 {
            return Err(ConfigurationError::InvalidSettings(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let mut comparisons: Vec<Comparison> = Vec::with_capacity(spec.comparisons.len());
        for comparison_spec in &spec.comparisons {
            let comparison = Comparison::from_spec(comparison_spec, &adapter)?;
            if comparisons
                .iter()
                .any(|c| c.output_column_name() == comparison.output_column_name())
            {
                return Err(ConfigurationError::DuplicateComparison(
                    comparison.output_column_name().to_string(),
                ));
            }
            comparisons.push(comparison);
        }

        let mut settings = Self {
            link_type: spec.link_type,
            unique_id_column_name: spec.unique_id_column_name,
            source_dataset_column_name: spec.source_dataset_column_name,
            blocking_rules: Vec::new(),
            comparisons,
            probability_two_random_records_match: default_probability_two_random_records_match(),
            additional_columns_to_retain: spec.additional_columns_to_retain,
            retain_matching_columns: spec.retain_matching_columns,
            retain_intermediate_calculation_columns: spec.retain_intermediate_calculation_columns,
            em_convergence: spec.em_convergence,
            max_iterations: spec.max_iterations,
            adapter,
        };
        settings.set_blocking_rules(spec.blocking_rules)?;
        settings.set_probability_two_random_records_match(spec.probability_two_random_records_match)?;
        settings.check_tf_adjustments()?;
        Ok(settings)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let spec: SettingsSpec = serde_json::from_str(json)
            .map_err(|e| ConfigurationError::InvalidSettings(e.to_string()))?;
        Self::from_spec(spec)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::InvalidSettings(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Declarative form of the live model, including current m/u settings.
    pub fn to_spec(&self) -> SettingsSpec {
        SettingsSpec {
            link_type: self.link_type,
            unique_id_column_name: self.unique_id_column_name.clone(),
            source_dataset_column_name: self.source_dataset_column_name.clone(),
            blocking_rules: self.blocking_rules.clone(),
            comparisons: self.comparisons.iter().map(|c| c.to_spec()).collect(),
            probability_two_random_records_match: self.probability_two_random_records_match,
            additional_columns_to_retain: self.additional_columns_to_retain.clone(),
            retain_matching_columns: self.retain_matching_columns,
            retain_intermediate_calculation_columns: self.retain_intermediate_calculation_columns,
            em_convergence: self.em_convergence,
            max_iterations: self.max_iterations,
            sql_dialect: self.adapter.dialect(),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigurationError> {
        serde_json::to_string_pretty(&self.to_spec())
            .map_err(|e| ConfigurationError::InvalidSettings(e.to_string()))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn unique_id_column_name(&self) -> &str {
        &self.unique_id_column_name
    }

    pub fn source_dataset_column_name(&self) -> &str {
        &self.source_dataset_column_name
    }

    pub fn blocking_rules(&self) -> &[String] {
        &self.blocking_rules
    }

    pub fn set_blocking_rules(&mut self, rules: Vec<String>) -> Result<(), ConfigurationError> {
        for rule in &rules {
            self.adapter
                .validate(rule)
                .map_err(|e| ConfigurationError::invalid_sql(rule, e))?;
        }
        self.blocking_rules = rules;
        Ok(())
    }

    pub fn comparisons(&self) -> &[Comparison] {
        &self.comparisons
    }

    pub fn comparison(&self, name: &str) -> Option<&Comparison> {
        self.comparisons
            .iter()
            .find(|c| c.output_column_name() == name)
    }

    pub fn comparison_mut(&mut self, name: &str) -> Option<&mut Comparison> {
        self.comparisons
            .iter_mut()
            .find(|c| c.output_column_name() == name)
    }

    /// Keep only the comparisons for which `keep` returns true.
    pub fn retain_comparisons(&mut self, keep: impl FnMut(&Comparison) -> bool) {
        self.comparisons.retain(keep);
    }

    pub fn level(&self, key: &LevelKey) -> Option<&ComparisonLevel> {
        self.comparison(&key.comparison)?
            .level_by_vector_value(key.comparison_vector_value)
    }

    pub fn level_mut(&mut self, key: &LevelKey) -> Result<&mut ComparisonLevel, ConfigurationError> {
        self.comparison_mut(&key.comparison)
            .ok_or_else(|| ConfigurationError::UnknownComparison(key.comparison.clone()))?
            .level_by_vector_value_mut(key.comparison_vector_value)
            .ok_or_else(|| ConfigurationError::UnknownLevel {
                comparison: key.comparison.clone(),
                value: key.comparison_vector_value,
            })
    }

    /// Every level of every comparison.
    pub fn all_levels(&self) -> Vec<&ComparisonLevel> {
        self.comparisons.iter().flat_map(|c| c.levels()).collect()
    }

    pub fn probability_two_random_records_match(&self) -> f64 {
        self.probability_two_random_records_match
    }

    pub fn set_probability_two_random_records_match(
        &mut self,
        value: f64,
    ) -> Result<(), ConfigurationError> {
        if !(value > 0.0 && value < 1.0) {
            return Err(ConfigurationError::InvalidMatchPrior(value));
        }
        self.probability_two_random_records_match = value;
        Ok(())
    }

    pub fn additional_columns_to_retain(&self) -> &[String] {
        &self.additional_columns_to_retain
    }

    pub fn retain_matching_columns(&self) -> bool {
        self.retain_matching_columns
    }

    pub fn retain_intermediate_calculation_columns(&self) -> bool {
        self.retain_intermediate_calculation_columns
    }

    pub fn em_convergence(&self) -> f64 {
        self.em_convergence
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn adapter(&self) -> &DialectAdapter {
        &self.adapter
    }

    pub fn sql_dialect(&self) -> SqlDialect {
        self.adapter.dialect()
    }

    /// Input columns needed by comparisons plus the additional retained ones,
    /// excluding the unique id and source dataset columns.
    pub fn columns_to_retain(&self) -> Vec<String> {
        let reserved = [
            self.unique_id_column_name.as_str(),
            self.source_dataset_column_name.as_str(),
        ];
        let mut columns: Vec<String> = Vec::new();
        let candidates = self
            .comparisons
            .iter()
            .flat_map(|c| c.input_columns())
            .chain(self.additional_columns_to_retain.iter().cloned());
        for column in candidates {
            let taken = reserved.iter().any(|r| r.eq_ignore_ascii_case(&column))
                || columns.iter().any(|c| c.eq_ignore_ascii_case(&column));
            if !taken {
                columns.push(column);
            }
        }
        columns
    }

    /// Distinct term-frequency adjustment columns across the model.
    pub fn tf_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for column in self.comparisons.iter().flat_map(|c| c.tf_columns()) {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(&column)) {
                columns.push(column);
            }
        }
        columns
    }

    fn check_tf_adjustments(&self) -> Result<(), ConfigurationError> {
        let levels = self.all_levels();
        for comparison in self.comparisons.iter().filter(|c| c.has_tf_adjustments()) {
            comparison.tf_adjustment_sql(&levels)?;
        }
        Ok(())
    }

    /// Copy of the model with every term-frequency adjustment removed.
    pub fn without_tf_adjustments(&self) -> Settings {
        let mut copy = self.clone();
        for comparison in copy.comparisons.iter_mut() {
            for level in comparison.levels_mut() {
                level.clear_tf_adjustment();
            }
        }
        copy
    }

    // ------------------------------------------------------------------------
    // Training support
    // ------------------------------------------------------------------------

    /// Set m and u of every level to the median of its trained values,
    /// where any exist.
    pub fn populate_m_u_from_trained_values(&mut self) {
        for comparison in self.comparisons.iter_mut() {
            for level in comparison.levels_mut() {
                if !level.is_null_level() {
                    level.populate_from_trained_values();
                }
            }
        }
    }

    /// Levels whose outcome is forced by `blocking_rule`: per comparison, the
    /// exact-match level with the most columns, all of which the rule
    /// equality-joins. Ties go to the earlier declared level.
    pub fn levels_implied_by_blocking_rule(
        &self,
        blocking_rule: &str,
    ) -> Result<Vec<LevelKey>, ConfigurationError> {
        let equal = self
            .adapter
            .canonicalize(blocking_rule)
            .map_err(|e| ConfigurationError::invalid_sql(blocking_rule, e))?
            .equality_columns();

        let mut keys = Vec::new();
        for comparison in &self.comparisons {
            let mut best: Option<(&ComparisonLevel, usize)> = None;
            for level in comparison.non_null_levels() {
                let Some(columns) = level.exact_match_columns() else {
                    continue;
                };
                if !columns.iter().all(|c| equal.contains(c)) {
                    continue;
                }
                if best.map_or(true, |(_, n)| columns.len() > n) {
                    best = Some((level, columns.len()));
                }
            }
            if let Some((level, _)) = best {
                keys.push(LevelKey {
                    comparison: comparison.output_column_name().to_string(),
                    comparison_vector_value: level.comparison_vector_value(),
                });
            }
        }
        Ok(keys)
    }

    /// Every trained m/u value in the model, for audit.
    pub fn parameter_estimates(&self) -> Vec<ParameterEstimate> {
        self.comparisons
            .iter()
            .flat_map(|c| c.levels())
            .flat_map(|l| l.parameter_estimates())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::LevelSpec;
    use crate::probability::Probability;

    fn spec() -> SettingsSpec {
        SettingsSpec::new(
            LinkType::DedupeOnly,
            vec![
                ComparisonSpec::new(
                    "name",
                    vec![
                        LevelSpec::new("first_name_l = first_name_r AND surname_l = surname_r"),
                        LevelSpec::exact_match("surname")
                            .with_tf_adjustment("surname", 1.0),
                        LevelSpec::else_level(),
                    ],
                ),
                ComparisonSpec::exact_match("dob"),
                ComparisonSpec::exact_match("city"),
            ],
        )
        .with_blocking_rules(["l.surname = r.surname"])
    }

    #[test]
    fn json_defaults_are_applied() {
        let settings = Settings::from_json(
            r#"{
                "link_type": "link_and_dedupe",
                "comparisons": [{
                    "output_column_name": "email",
                    "comparison_levels": [
                        {"sql_condition": "email_l IS NULL OR email_r IS NULL", "is_null_level": true},
                        {"sql_condition": "email_l = email_r", "m_probability": 0.9, "u_probability": "level not observed"},
                        {"sql_condition": "ELSE"}
                    ]
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(settings.link_type(), LinkType::LinkAndDedupe);
        assert_eq!(settings.unique_id_column_name(), "unique_id");
        assert_eq!(settings.probability_two_random_records_match(), 0.0001);
        assert_eq!(settings.max_iterations(), 25);
        assert_eq!(settings.sql_dialect(), SqlDialect::DuckDb);
        let level = settings.comparison("email").unwrap().level_by_vector_value(1).unwrap();
        assert_eq!(level.u_probability_setting(), Probability::NotObserved);
    }

    #[test]
    fn unknown_fields_and_bad_sql_are_rejected() {
        assert!(matches!(
            Settings::from_json(r#"{"link_type": "dedupe_only", "comparisons": [], "colour": 1}"#),
            Err(ConfigurationError::InvalidSettings(_))
        ));
        let bad_rule = spec().with_blocking_rules(["l.surname = = r.surname"]);
        assert!(matches!(
            Settings::from_spec(bad_rule),
            Err(ConfigurationError::InvalidSql { .. })
        ));
    }

    #[test]
    fn duplicate_comparisons_are_rejected() {
        let mut s = spec();
        s.comparisons.push(ComparisonSpec::exact_match("dob"));
        assert!(matches!(
            Settings::from_spec(s),
            Err(ConfigurationError::DuplicateComparison(name)) if name == "dob"
        ));
    }

    #[test]
    fn tf_adjustment_without_exact_match_fails_at_construction() {
        let mut s = spec();
        s.comparisons[2].comparison_levels[1] =
            LevelSpec::exact_match("city").with_tf_adjustment("postcode", 1.0);
        assert!(matches!(
            Settings::from_spec(s),
            Err(ConfigurationError::MissingExactMatchLevel { column }) if column == "postcode"
        ));
    }

    #[test]
    fn setting_probabilities_on_null_level_fails() {
        let mut settings = Settings::from_spec(spec()).unwrap();
        let key = LevelKey {
            comparison: "dob".to_string(),
            comparison_vector_value: -1,
        };
        let err = settings
            .level_mut(&key)
            .unwrap()
            .set_m_probability(Probability::Fixed(0.5))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::NullLevelProbability { .. }));
    }

    #[test]
    fn retained_columns_skip_ids_and_duplicates() {
        let mut s = spec();
        s.additional_columns_to_retain = vec!["unique_id".into(), "email".into(), "dob".into()];
        let settings = Settings::from_spec(s).unwrap();
        assert_eq!(
            settings.columns_to_retain(),
            vec!["first_name", "surname", "dob", "city", "email"]
        );
        assert_eq!(settings.tf_columns(), vec!["surname"]);
        assert!(settings.without_tf_adjustments().tf_columns().is_empty());
    }

    #[test]
    fn blocking_rule_implies_best_exact_match_level_per_comparison() {
        let settings = Settings::from_spec(spec()).unwrap();
        let keys = settings
            .levels_implied_by_blocking_rule("l.surname = r.surname AND l.dob = r.dob")
            .unwrap();
        assert_eq!(
            keys,
            vec![
                LevelKey { comparison: "name".into(), comparison_vector_value: 1 },
                LevelKey { comparison: "dob".into(), comparison_vector_value: 1 },
            ]
        );

        let keys = settings
            .levels_implied_by_blocking_rule("l.first_name = r.first_name and l.surname = r.surname")
            .unwrap();
        assert_eq!(
            keys,
            vec![LevelKey { comparison: "name".into(), comparison_vector_value: 2 }]
        );

        assert!(settings
            .levels_implied_by_blocking_rule("substr(l.dob, 1, 4) = substr(r.dob, 1, 4)")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn to_spec_carries_trained_values() {
        let mut settings = Settings::from_spec(spec()).unwrap();
        let key = LevelKey {
            comparison: "city".into(),
            comparison_vector_value: 1,
        };
        let level = settings.level_mut(&key).unwrap();
        level.add_trained_u_probability(Probability::Fixed(0.125), "sampling").unwrap();
        level.add_trained_u_probability(Probability::Fixed(0.375), "sampling").unwrap();
        settings.populate_m_u_from_trained_values();

        let round_tripped = Settings::from_json(&settings.to_json_pretty().unwrap()).unwrap();
        let level = round_tripped.level(&key).unwrap();
        assert_eq!(level.u_probability_setting(), Probability::Fixed(0.25));
        assert_eq!(level.m_probability_setting(), Probability::Unset);
        assert_eq!(settings.parameter_estimates().len(), 2);
    }
}
