//! Match weights and probabilities from comparison vectors.
//!
//! Scoring runs in two stages: the first appends one Bayes factor column per
//! comparison (and one term-frequency multiplier where configured), the
//! second multiplies them with the prior odds and converts to a weight and a
//! probability.

use reclink_model::{float_literal, prob_to_bayes_factor, ConfigurationError, Settings};

use crate::vectors::{additional_columns, matching_columns, pair_columns};

pub const MATCH_WEIGHT_PARTS: &str = "__reclink__df_match_weight_parts";
pub const PREDICT: &str = "__reclink__df_predict";

/// What the scored rows look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictInput {
    /// One row per candidate pair, with ids and retained columns.
    ComparisonVectors,
    /// One row per gamma combination, with `match_count`.
    AgreementPatterns,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PredictOptions {
    pub threshold_match_probability: Option<f64>,
    pub threshold_match_weight: Option<f64>,
}

impl PredictOptions {
    pub fn with_threshold_match_probability(mut self, p: f64) -> Self {
        self.threshold_match_probability = Some(p);
        self
    }

    pub fn with_threshold_match_weight(mut self, w: f64) -> Self {
        self.threshold_match_weight = Some(w);
        self
    }
}

/// `select *, bf_…, bf_tf_adj_… from <input>`
pub fn match_weight_parts_sql(settings: &Settings, input: &str) -> Result<String, ConfigurationError> {
    let levels = settings.all_levels();
    let mut columns = vec!["*".to_string()];
    for comparison in settings.comparisons() {
        columns.push(comparison.bayes_factor_sql());
    }
    for comparison in settings.comparisons().iter().filter(|c| c.has_tf_adjustments()) {
        columns.push(comparison.tf_adjustment_sql(&levels)?);
    }
    Ok(format!("select {} from {input}", columns.join(", ")))
}

/// Product of the prior odds with every Bayes factor column.
fn bayes_factor_expr(settings: &Settings) -> String {
    let prior = prob_to_bayes_factor(settings.probability_two_random_records_match());
    let mut factors = vec![format!("cast({} as float8)", float_literal(prior))];
    for comparison in settings.comparisons() {
        factors.push(comparison.bf_column_name());
        if comparison.has_tf_adjustments() {
            factors.push(comparison.bf_tf_adj_column_name());
        }
    }
    factors.join(" * ")
}

/// Probability from the Bayes factor, short-circuiting levels whose factor
/// is infinite (where `bf / (1 + bf)` would be undefined).
fn probability_expr(settings: &Settings, bf: &str) -> String {
    let certain: Vec<String> = settings
        .comparisons()
        .iter()
        .flat_map(|c| {
            let gamma = c.gamma_column_name();
            c.infinite_bayes_factor_values()
                .into_iter()
                .map(move |v| format!("{gamma} = {v}"))
        })
        .collect();
    let ratio = format!("({bf})/(1+({bf}))");
    if certain.is_empty() {
        ratio
    } else {
        format!("CASE WHEN {} THEN 1.0 ELSE {ratio} END", certain.join(" OR "))
    }
}

fn output_columns(settings: &Settings, input: PredictInput) -> Vec<String> {
    let gammas = settings.comparisons().iter().map(|c| c.gamma_column_name());
    match input {
        PredictInput::AgreementPatterns => {
            let mut columns: Vec<String> = gammas.collect();
            columns.push("match_count".to_string());
            columns
        }
        PredictInput::ComparisonVectors => {
            let mut columns = pair_columns(&[
                settings.source_dataset_column_name().to_string(),
                settings.unique_id_column_name().to_string(),
            ]);
            if settings.retain_matching_columns() {
                columns.extend(pair_columns(&matching_columns(settings)));
            }
            columns.extend(gammas);
            if settings.retain_intermediate_calculation_columns() {
                let tf: Vec<String> =
                    settings.tf_columns().iter().map(|c| format!("tf_{c}")).collect();
                columns.extend(pair_columns(&tf));
                for comparison in settings.comparisons() {
                    columns.push(comparison.bf_column_name());
                    if comparison.has_tf_adjustments() {
                        columns.push(comparison.bf_tf_adj_column_name());
                    }
                }
            }
            columns.extend(pair_columns(&additional_columns(settings)));
            columns.push("match_key".to_string());
            columns
        }
    }
}

/// Final scoring stage over [`MATCH_WEIGHT_PARTS`].
pub fn predict_sql(settings: &Settings, input: PredictInput, options: &PredictOptions) -> String {
    let bf = bayes_factor_expr(settings);
    let probability = probability_expr(settings, &bf);

    let mut conditions = Vec::new();
    if let Some(p) = options.threshold_match_probability {
        conditions.push(format!("({probability}) >= {}", float_literal(p)));
    }
    if let Some(w) = options.threshold_match_weight {
        conditions.push(format!("log2({bf}) >= {}", float_literal(w)));
    }
    let filter = if conditions.is_empty() {
        String::new()
    } else {
        format!(" where {}", conditions.join(" AND "))
    };

    format!(
        "select log2({bf}) as match_weight, {probability} as match_probability, {} \
         from {MATCH_WEIGHT_PARTS}{filter}",
        output_columns(settings, input).join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclink_model::{ComparisonSpec, LevelSpec, LinkType, SettingsSpec};

    fn spec() -> SettingsSpec {
        SettingsSpec::new(
            LinkType::DedupeOnly,
            vec![
                ComparisonSpec::new(
                    "surname",
                    vec![
                        LevelSpec::null_level("surname"),
                        LevelSpec::exact_match("surname")
                            .with_m(0.9)
                            .with_u(0.1)
                            .with_tf_adjustment("surname", 1.0),
                        LevelSpec::else_level().with_m(0.1).with_u(0.9),
                    ],
                ),
                ComparisonSpec::exact_match("dob"),
            ],
        )
    }

    #[test]
    fn parts_add_bf_and_tf_columns() {
        let settings = Settings::from_spec(spec()).unwrap();
        let sql = match_weight_parts_sql(&settings, "__reclink__df_comparison_vectors").unwrap();
        assert!(sql.starts_with("select *, CASE WHEN gamma_surname = -1"));
        assert!(sql.contains("END as bf_surname, CASE WHEN gamma_dob"));
        assert!(sql.contains("END as bf_tf_adj_surname from __reclink__df_comparison_vectors"));
        assert!(!sql.contains("bf_tf_adj_dob"));
    }

    #[test]
    fn prior_odds_lead_the_product() {
        let settings = Settings::from_spec(spec()).unwrap();
        let sql = predict_sql(&settings, PredictInput::AgreementPatterns, &PredictOptions::default());
        let prior = float_literal(prob_to_bayes_factor(0.0001));
        assert_eq!(
            sql,
            format!(
                "select log2(cast({prior} as float8) * bf_surname * bf_tf_adj_surname * bf_dob) as match_weight, \
                 (cast({prior} as float8) * bf_surname * bf_tf_adj_surname * bf_dob)/\
                 (1+(cast({prior} as float8) * bf_surname * bf_tf_adj_surname * bf_dob)) as match_probability, \
                 gamma_surname, gamma_dob, match_count from __reclink__df_match_weight_parts"
            )
        );
    }

    #[test]
    fn infinite_levels_are_certain_matches() {
        let mut s = spec();
        s.comparisons[1].comparison_levels[1] = LevelSpec::exact_match("dob").with_m(0.9).with_u(0.0);
        let settings = Settings::from_spec(s).unwrap();
        let sql = predict_sql(&settings, PredictInput::ComparisonVectors, &PredictOptions::default());
        assert!(sql.contains("CASE WHEN gamma_dob = 1 THEN 1.0 ELSE ("));
    }

    #[test]
    fn thresholds_filter_on_probability_and_weight() {
        let settings = Settings::from_spec(spec()).unwrap();
        let options = PredictOptions::default()
            .with_threshold_match_probability(0.5)
            .with_threshold_match_weight(2.0);
        let sql = predict_sql(&settings, PredictInput::ComparisonVectors, &options);
        let (_, filter) = sql.split_once(" where ").unwrap();
        assert!(filter.contains(") >= 0.5 AND log2(cast("));
        assert!(filter.ends_with(">= 2.0"));
    }

    #[test]
    fn intermediate_columns_are_optional() {
        let mut s = spec();
        s.retain_intermediate_calculation_columns = true;
        let settings = Settings::from_spec(s).unwrap();
        let sql = predict_sql(&settings, PredictInput::ComparisonVectors, &PredictOptions::default());
        assert!(sql.contains(
            "gamma_surname, gamma_dob, tf_surname_l, tf_surname_r, bf_surname, bf_tf_adj_surname, bf_dob, match_key"
        ));

        let lean = Settings::from_spec(spec()).unwrap();
        let sql = predict_sql(&lean, PredictInput::ComparisonVectors, &PredictOptions::default());
        assert!(sql.contains("gamma_surname, gamma_dob, match_key from"));
    }
}
