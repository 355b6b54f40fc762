//! Expectation maximisation over agreement patterns.
//!
//! A session trains a private snapshot of the model on the pairs found by a
//! single blocking rule. Comparisons whose outcome the rule already forces
//! (the reversed levels) are switched off for the session, and their
//! influence is divided back out of the estimated match prior afterwards.
//!
//! ```text
//!   Initialized ─train─► Iterating{1} ─► … ─► Converged{n}
//!                                        └──► MaxIterationsReached{max}
//! ```
//!
//! The E-step and the parameter counts run as generated SQL over the
//! agreement pattern table; the M-step and the log-likelihood are computed
//! here from the returned rows.

use std::collections::HashMap;
use std::fmt;

use reclink_model::{
    bayes_factor_to_prob, prob_to_bayes_factor, ConfigurationError, LevelKey, Probability,
    ProbabilityKind, Settings,
};
use serde::Serialize;

use crate::backend::{get_f64, get_i64, get_str, Backend, Record, TableHandle, TableName};
use crate::blocking::{block_using_rules_sql, BLOCKED};
use crate::concat::CONCAT_WITH_TF;
use crate::error::{LinkerError, Result};
use crate::linker::Linker;
use crate::pipeline::SqlPipeline;
use crate::predict::{
    match_weight_parts_sql, predict_sql, PredictInput, PredictOptions, MATCH_WEIGHT_PARTS, PREDICT,
};
use crate::vectors::{
    agreement_pattern_counts_sql, compute_comparison_vectors_sql, AGREEMENT_PATTERNS,
    COMPARISON_VECTORS,
};

pub const M_U_COUNTS: &str = "__reclink__m_u_counts";

const MATCH_PRIOR_ROW: &str = "_probability_two_random_records_match";

/// Bounds for the match prior between iterations.
const MIN_MATCH_PRIOR: f64 = 1e-6;
const MAX_MATCH_PRIOR: f64 = 1.0 - 1e-6;

// ============================================================================
// Parameter counts
// ============================================================================

/// Posterior-weighted counts per comparison vector value, plus the mean
/// posterior as the match prior row.
pub fn compute_new_parameters_sql(settings: &Settings) -> String {
    let prior = format!(
        "select 0 as comparison_vector_value, \
         sum(match_probability * match_count) / sum(match_count) as m_count, \
         sum((1 - match_probability) * match_count) / sum(match_count) as u_count, \
         '{MATCH_PRIOR_ROW}' as output_column_name from {PREDICT}"
    );
    let per_comparison = settings.comparisons().iter().map(|c| {
        let gamma = c.gamma_column_name();
        format!(
            "select {gamma} as comparison_vector_value, \
             sum(match_probability * match_count) as m_count, \
             sum((1 - match_probability) * match_count) as u_count, \
             '{}' as output_column_name from {PREDICT} group by {gamma}",
            c.output_column_name()
        )
    });
    std::iter::once(prior)
        .chain(per_comparison)
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

/// Normalised estimates parsed from the [`M_U_COUNTS`] rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewParameters {
    pub probability_two_random_records_match: Option<f64>,
    m: HashMap<LevelKey, Probability>,
    u: HashMap<LevelKey, Probability>,
}

impl NewParameters {
    /// Proportions per comparison over its non-null vector values. A value
    /// with no weight, or missing from the rows, is `NotObserved`.
    pub fn from_records(records: &[Record], settings: &Settings, table: &str) -> Result<Self> {
        let mut prior = None;
        let mut counts: HashMap<&str, Vec<(i32, f64, f64)>> = HashMap::new();
        for record in records {
            let name = get_str(record, "output_column_name", table)?;
            let m = get_f64(record, "m_count", table)?;
            if name == MATCH_PRIOR_ROW {
                prior = m;
                continue;
            }
            let cvv = get_i64(record, "comparison_vector_value", table)?;
            let cvv = i32::try_from(cvv).map_err(|_| LinkerError::UnexpectedResult {
                table: table.to_string(),
                message: format!("comparison vector value {cvv} out of range"),
            })?;
            let u = get_f64(record, "u_count", table)?.unwrap_or(0.0);
            counts.entry(name).or_default().push((cvv, m.unwrap_or(0.0), u));
        }

        let mut params = NewParameters {
            probability_two_random_records_match: prior,
            ..Default::default()
        };
        for comparison in settings.comparisons() {
            let rows: &[(i32, f64, f64)] = counts
                .get(comparison.output_column_name())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let observed = rows.iter().filter(|(cvv, _, _)| *cvv != -1);
            let (m_total, u_total) = observed.fold((0.0, 0.0), |(m, u), (_, rm, ru)| (m + rm, u + ru));

            for level in comparison.non_null_levels() {
                let cvv = level.comparison_vector_value();
                let (m, u) = rows
                    .iter()
                    .find(|(v, _, _)| *v == cvv)
                    .map(|(_, m, u)| (*m, *u))
                    .unwrap_or((0.0, 0.0));
                let key = LevelKey {
                    comparison: comparison.output_column_name().to_string(),
                    comparison_vector_value: cvv,
                };
                params.m.insert(key.clone(), proportion(m, m_total));
                params.u.insert(key, proportion(u, u_total));
            }
        }
        Ok(params)
    }

    pub fn get(&self, kind: ProbabilityKind, key: &LevelKey) -> Probability {
        let map = match kind {
            ProbabilityKind::M => &self.m,
            ProbabilityKind::U => &self.u,
        };
        map.get(key).copied().unwrap_or(Probability::NotObserved)
    }
}

fn proportion(count: f64, total: f64) -> Probability {
    if count > 0.0 && total > 0.0 {
        Probability::Fixed((count / total).min(1.0))
    } else {
        Probability::NotObserved
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingOptions {
    pub fix_u_probabilities: bool,
    pub fix_m_probabilities: bool,
    pub fix_probability_two_random_records_match: bool,
    /// Comparisons to leave out in addition to those the rule forces.
    pub comparisons_to_deactivate: Vec<String>,
}

/// u fixed (it is better estimated by random sampling), m and λ trained.
impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            fix_u_probabilities: true,
            fix_m_probabilities: false,
            fix_probability_two_random_records_match: false,
            comparisons_to_deactivate: Vec::new(),
        }
    }
}

impl TrainingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix_m(mut self, fix: bool) -> Self {
        self.fix_m_probabilities = fix;
        self
    }

    pub fn fix_u(mut self, fix: bool) -> Self {
        self.fix_u_probabilities = fix;
        self
    }

    pub fn fix_match_prior(mut self, fix: bool) -> Self {
        self.fix_probability_two_random_records_match = fix;
        self
    }

    pub fn deactivate(mut self, comparison: impl Into<String>) -> Self {
        self.comparisons_to_deactivate.push(comparison.into());
        self
    }

    fn is_fixed(&self, kind: ProbabilityKind) -> bool {
        match kind {
            ProbabilityKind::M => self.fix_m_probabilities,
            ProbabilityKind::U => self.fix_u_probabilities,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Initialized,
    Iterating { iteration: usize },
    Converged { iterations: usize },
    MaxIterationsReached { iterations: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterChange {
    pub comparison: String,
    pub comparison_vector_value: i32,
    pub kind: ProbabilityKind,
    pub previous: f64,
    pub current: f64,
}

impl ParameterChange {
    pub fn magnitude(&self) -> f64 {
        (self.current - self.previous).abs()
    }
}

impl fmt::Display for ParameterChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of `{}` level {} moved {:.6} -> {:.6}",
            self.kind, self.comparison, self.comparison_vector_value, self.previous, self.current
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationSummary {
    pub iteration: usize,
    /// Match prior after the iteration's update.
    pub probability_two_random_records_match: f64,
    pub max_change: Option<ParameterChange>,
    /// Log-likelihood of the training pairs under the parameters the
    /// iteration started from.
    pub log_likelihood: f64,
}

/// Gamma values (aligned with the session's comparisons) and their count.
#[derive(Debug, Clone, PartialEq)]
pub struct AgreementPattern {
    pub gammas: Vec<i32>,
    pub count: f64,
}

impl AgreementPattern {
    fn load(table: &impl TableHandle, settings: &Settings) -> Result<Vec<Self>> {
        let name = table.physical_name().to_string();
        table
            .as_records(None)?
            .iter()
            .map(|record| {
                let gammas = settings
                    .comparisons()
                    .iter()
                    .map(|c| {
                        let g = get_i64(record, &c.gamma_column_name(), &name)?;
                        i32::try_from(g).map_err(|_| LinkerError::UnexpectedResult {
                            table: name.clone(),
                            message: format!("gamma value {g} out of range"),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let count = get_f64(record, "match_count", &name)?.unwrap_or(0.0);
                Ok(AgreementPattern { gammas, count })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct EmTrainingSession {
    blocking_rule: String,
    options: TrainingOptions,
    settings: Settings,
    reversed_levels: Vec<LevelKey>,
    deactivated_comparisons: Vec<String>,
    state: SessionState,
    iterations: Vec<IterationSummary>,
}

impl EmTrainingSession {
    /// Snapshot `model` for training on pairs matched by `blocking_rule`.
    pub fn new(model: &Settings, blocking_rule: &str, options: TrainingOptions) -> Result<Self> {
        let reversed_levels = model.levels_implied_by_blocking_rule(blocking_rule)?;

        for name in &options.comparisons_to_deactivate {
            if model.comparison(name).is_none() {
                return Err(ConfigurationError::UnknownComparison(name.clone()).into());
            }
        }

        let mut deactivated_comparisons = Vec::new();
        for comparison in model.comparisons() {
            let name = comparison.output_column_name();
            let reversed = reversed_levels.iter().any(|k| k.comparison == name);
            let requested = options.comparisons_to_deactivate.iter().any(|c| c == name);
            let trainable = comparison.num_levels() >= 2;
            if !trainable && !reversed && !requested {
                tracing::warn!(
                    comparison = name,
                    "comparison has fewer than two non-null levels and cannot be trained; skipping"
                );
            }
            if reversed || requested || !trainable {
                deactivated_comparisons.push(name.to_string());
            }
        }

        let mut settings = model.without_tf_adjustments();
        settings.retain_comparisons(|c| !deactivated_comparisons.iter().any(|d| d == c.output_column_name()));
        if settings.comparisons().is_empty() {
            return Err(LinkerError::NothingToTrain(blocking_rule.to_string()));
        }

        tracing::info!(
            blocking_rule,
            deactivated = ?deactivated_comparisons,
            "starting EM training session"
        );

        Ok(Self {
            blocking_rule: blocking_rule.to_string(),
            options,
            settings,
            reversed_levels,
            deactivated_comparisons,
            state: SessionState::Initialized,
            iterations: Vec::new(),
        })
    }

    pub fn blocking_rule(&self) -> &str {
        &self.blocking_rule
    }

    pub fn options(&self) -> &TrainingOptions {
        &self.options
    }

    /// The session's private copy of the model.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn reversed_levels(&self) -> &[LevelKey] {
        &self.reversed_levels
    }

    pub fn deactivated_comparisons(&self) -> &[String] {
        &self.deactivated_comparisons
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn iterations(&self) -> &[IterationSummary] {
        &self.iterations
    }

    pub fn probability_two_random_records_match(&self) -> f64 {
        self.settings.probability_two_random_records_match()
    }

    /// Run EM until convergence or the iteration limit.
    pub fn train<B: Backend>(&mut self, linker: &Linker<B>) -> Result<()> {
        let concat = linker.initialise_concat_with_tf()?;
        let rules = [self.blocking_rule.clone()];
        let setup = SqlPipeline::new()
            .enqueue(block_using_rules_sql(&self.settings, &rules, CONCAT_WITH_TF), BLOCKED)
            .enqueue(compute_comparison_vectors_sql(&self.settings), COMPARISON_VECTORS)
            .enqueue(agreement_pattern_counts_sql(&self.settings), AGREEMENT_PATTERNS);
        let patterns_table = linker.flush(setup, &[concat.name().clone()], true)?;
        let patterns = AgreementPattern::load(&patterns_table, &self.settings)?;
        if patterns.is_empty() {
            return Err(LinkerError::NoTrainingPairs(self.blocking_rule.clone()));
        }
        let inputs = [TableName::new(AGREEMENT_PATTERNS, patterns_table.physical_name())];

        let max_iterations = self.settings.max_iterations();
        let convergence = self.settings.em_convergence();
        for iteration in 1..=max_iterations {
            self.state = SessionState::Iterating { iteration };
            let log_likelihood = self.log_likelihood(&patterns)?;

            let plan = SqlPipeline::new()
                .enqueue(match_weight_parts_sql(&self.settings, AGREEMENT_PATTERNS)?, MATCH_WEIGHT_PARTS)
                .enqueue(
                    predict_sql(&self.settings, PredictInput::AgreementPatterns, &PredictOptions::default()),
                    PREDICT,
                )
                .enqueue(compute_new_parameters_sql(&self.settings), M_U_COUNTS);
            let counts = linker.flush(plan, &inputs, true)?;
            let records = counts.as_records(None)?;
            let new = NewParameters::from_records(&records, &self.settings, counts.physical_name())?;
            let max_change = self.maximise(&new)?;

            tracing::info!(
                iteration,
                probability_two_random_records_match = self.probability_two_random_records_match(),
                log_likelihood,
                max_change = max_change.as_ref().map_or(0.0, ParameterChange::magnitude),
                "EM iteration complete"
            );
            if let Some(change) = &max_change {
                tracing::debug!(%change, "largest parameter change");
            }

            let converged = max_change.as_ref().map_or(true, |c| c.magnitude() < convergence);
            self.iterations.push(IterationSummary {
                iteration,
                probability_two_random_records_match: self.probability_two_random_records_match(),
                max_change,
                log_likelihood,
            });
            if converged {
                self.state = SessionState::Converged { iterations: iteration };
                tracing::info!(iterations = iteration, blocking_rule = %self.blocking_rule, "EM converged");
                return Ok(());
            }
        }

        self.state = SessionState::MaxIterationsReached {
            iterations: max_iterations,
        };
        tracing::warn!(
            max_iterations,
            blocking_rule = %self.blocking_rule,
            "EM stopped at the iteration limit before converging; estimates are kept"
        );
        Ok(())
    }

    /// `Σ count · ln(λ·Πm + (1-λ)·Πu)` over the patterns; null levels are
    /// neutral.
    pub fn log_likelihood(&self, patterns: &[AgreementPattern]) -> Result<f64> {
        let lambda = self.probability_two_random_records_match();
        let comparisons = self.settings.comparisons();
        let mut total = 0.0;
        for pattern in patterns {
            let (mut pm, mut pu) = (lambda, 1.0 - lambda);
            for (comparison, &gamma) in comparisons.iter().zip(&pattern.gammas) {
                if gamma == -1 {
                    continue;
                }
                let level = comparison.level_by_vector_value(gamma).ok_or_else(|| {
                    ConfigurationError::UnknownLevel {
                        comparison: comparison.output_column_name().to_string(),
                        value: gamma,
                    }
                })?;
                pm *= level.m_probability().unwrap_or(1.0);
                pu *= level.u_probability().unwrap_or(1.0);
            }
            total += pattern.count * (pm + pu).ln();
        }
        Ok(total)
    }

    /// Replace every non-fixed parameter with its new estimate and report
    /// the largest move.
    fn maximise(&mut self, new: &NewParameters) -> Result<Option<ParameterChange>> {
        if !self.options.fix_probability_two_random_records_match {
            if let Some(lambda) = new.probability_two_random_records_match {
                self.settings
                    .set_probability_two_random_records_match(lambda.clamp(MIN_MATCH_PRIOR, MAX_MATCH_PRIOR))?;
            }
        }

        let keys: Vec<LevelKey> = self
            .settings
            .comparisons()
            .iter()
            .flat_map(|c| {
                c.non_null_levels().map(|l| LevelKey {
                    comparison: c.output_column_name().to_string(),
                    comparison_vector_value: l.comparison_vector_value(),
                })
            })
            .collect();

        let mut largest: Option<ParameterChange> = None;
        for key in keys {
            for kind in [ProbabilityKind::M, ProbabilityKind::U] {
                if self.options.is_fixed(kind) {
                    continue;
                }
                let estimate = new.get(kind, &key);
                let level = self.settings.level_mut(&key)?;
                let previous = match kind {
                    ProbabilityKind::M => level.m_probability(),
                    ProbabilityKind::U => level.u_probability(),
                };
                match kind {
                    ProbabilityKind::M => level.set_m_probability(estimate)?,
                    ProbabilityKind::U => level.set_u_probability(estimate)?,
                }
                let (Some(previous), Some(current)) = (previous, estimate.value()) else {
                    continue;
                };
                let change = ParameterChange {
                    comparison: key.comparison.clone(),
                    comparison_vector_value: key.comparison_vector_value,
                    kind,
                    previous,
                    current,
                };
                if largest.as_ref().map_or(true, |c| change.magnitude() > c.magnitude()) {
                    largest = Some(change);
                }
            }
        }
        Ok(largest)
    }

    /// Append the trained values to `model`'s level histories and refresh
    /// its live m and u.
    pub(crate) fn commit(&self, model: &mut Settings) -> Result<()> {
        if self.iterations.is_empty() {
            return Ok(());
        }
        let description = format!("EM, blocked on: {}", self.blocking_rule);
        for comparison in self.settings.comparisons() {
            for level in comparison.non_null_levels() {
                let key = LevelKey {
                    comparison: comparison.output_column_name().to_string(),
                    comparison_vector_value: level.comparison_vector_value(),
                };
                let target = model.level_mut(&key)?;
                target.inherit_not_observed_warnings(level);
                if !self.options.fix_m_probabilities {
                    target.add_trained_m_probability(level.m_probability_setting(), description.as_str())?;
                }
                if !self.options.fix_u_probabilities {
                    target.add_trained_u_probability(level.u_probability_setting(), description.as_str())?;
                }
            }
        }
        model.populate_m_u_from_trained_values();
        Ok(())
    }

    /// The session's match prior with the reversed levels' evidence divided
    /// back out, using `model`'s current Bayes factors.
    pub fn match_prior_estimate(&self, model: &Settings) -> Option<f64> {
        if self.options.fix_probability_two_random_records_match || self.iterations.is_empty() {
            return None;
        }
        let mut bf = prob_to_bayes_factor(self.probability_two_random_records_match());
        for key in &self.reversed_levels {
            if let Some(level) = model.level(key) {
                bf /= level.bayes_factor();
            }
        }
        let estimate = bayes_factor_to_prob(bf);
        if estimate.is_finite() && estimate > 0.0 && estimate < 1.0 {
            Some(estimate)
        } else {
            tracing::warn!(
                blocking_rule = %self.blocking_rule,
                estimate,
                "match prior from this session is unusable and is ignored"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use reclink_model::{ComparisonSpec, LevelSpec, LinkType, SettingsSpec};
    use serde_json::json;

    fn model() -> Settings {
        let spec = SettingsSpec::new(
            LinkType::DedupeOnly,
            vec![
                ComparisonSpec::exact_match("first_name"),
                ComparisonSpec::exact_match("surname"),
                ComparisonSpec::new("dob", vec![LevelSpec::else_level()]),
            ],
        );
        Settings::from_spec(spec).unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parameter_sql_has_prior_row_then_one_branch_per_comparison() {
        let settings = model();
        let sql = compute_new_parameters_sql(&settings);
        let branches: Vec<&str> = sql.split(" UNION ALL ").collect();
        assert_eq!(branches.len(), 4);
        assert!(branches[0].contains("sum(match_probability * match_count) / sum(match_count) as m_count"));
        assert!(branches[0].contains("'_probability_two_random_records_match' as output_column_name"));
        assert!(branches[1].ends_with("'first_name' as output_column_name from __reclink__df_predict group by gamma_first_name"));
    }

    #[test]
    fn rule_forced_and_untrainable_comparisons_are_deactivated() {
        let session =
            EmTrainingSession::new(&model(), "l.surname = r.surname", TrainingOptions::new()).unwrap();
        assert_eq!(session.deactivated_comparisons(), ["surname", "dob"]);
        assert_eq!(
            session.reversed_levels(),
            [LevelKey { comparison: "surname".into(), comparison_vector_value: 1 }]
        );
        let active: Vec<&str> = session
            .settings()
            .comparisons()
            .iter()
            .map(|c| c.output_column_name())
            .collect();
        assert_eq!(active, ["first_name"]);
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[test]
    fn nothing_left_to_train_is_an_error() {
        let options = TrainingOptions::new().deactivate("first_name");
        assert!(matches!(
            EmTrainingSession::new(&model(), "l.surname = r.surname", options),
            Err(LinkerError::NothingToTrain(_))
        ));
        let unknown = TrainingOptions::new().deactivate("postcode");
        assert!(matches!(
            EmTrainingSession::new(&model(), "l.surname = r.surname", unknown),
            Err(LinkerError::Configuration(ConfigurationError::UnknownComparison(_)))
        ));
    }

    #[test]
    fn counts_are_normalised_without_the_null_level() {
        let settings = model();
        let records = vec![
            record(json!({"comparison_vector_value": 0, "m_count": 0.25, "u_count": 0.75,
                          "output_column_name": "_probability_two_random_records_match"})),
            record(json!({"comparison_vector_value": 1, "m_count": 3.0, "u_count": 1.0,
                          "output_column_name": "first_name"})),
            record(json!({"comparison_vector_value": 0, "m_count": 1.0, "u_count": 3.0,
                          "output_column_name": "first_name"})),
            record(json!({"comparison_vector_value": -1, "m_count": 50.0, "u_count": 50.0,
                          "output_column_name": "first_name"})),
            record(json!({"comparison_vector_value": 0, "m_count": 2.0, "u_count": 0.0,
                          "output_column_name": "surname"})),
        ];
        let params = NewParameters::from_records(&records, &settings, "t").unwrap();
        assert_eq!(params.probability_two_random_records_match, Some(0.25));

        let key = |c: &str, v: i32| LevelKey { comparison: c.into(), comparison_vector_value: v };
        assert_eq!(params.get(ProbabilityKind::M, &key("first_name", 1)), Probability::Fixed(0.75));
        assert_eq!(params.get(ProbabilityKind::U, &key("first_name", 0)), Probability::Fixed(0.75));
        assert_eq!(params.get(ProbabilityKind::M, &key("surname", 0)), Probability::Fixed(1.0));
        assert_eq!(params.get(ProbabilityKind::M, &key("surname", 1)), Probability::NotObserved);
        assert_eq!(params.get(ProbabilityKind::U, &key("surname", 0)), Probability::NotObserved);
    }

    #[test]
    fn log_likelihood_skips_null_gammas() {
        let session =
            EmTrainingSession::new(&model(), "l.surname = r.surname", TrainingOptions::new()).unwrap();
        let lambda = session.probability_two_random_records_match();
        let level = session.settings().comparisons()[0].level_by_vector_value(1).unwrap();
        let (m, u) = (level.m_probability().unwrap(), level.u_probability().unwrap());

        let patterns = vec![
            AgreementPattern { gammas: vec![1], count: 2.0 },
            AgreementPattern { gammas: vec![-1], count: 3.0 },
        ];
        let expected = 2.0 * (lambda * m + (1.0 - lambda) * u).ln() + 3.0 * 1f64.ln();
        assert_relative_eq!(session.log_likelihood(&patterns).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn match_prior_divides_out_reversed_levels() {
        let base = model();
        let mut session =
            EmTrainingSession::new(&base, "l.surname = r.surname", TrainingOptions::new()).unwrap();
        session.settings.set_probability_two_random_records_match(0.5).unwrap();
        session.iterations.push(IterationSummary {
            iteration: 1,
            probability_two_random_records_match: 0.5,
            max_change: None,
            log_likelihood: 0.0,
        });
        let reversed_bf = base.comparison("surname").unwrap().level_by_vector_value(1).unwrap().bayes_factor();
        let estimate = session.match_prior_estimate(&base).unwrap();
        assert_relative_eq!(estimate, bayes_factor_to_prob(1.0 / reversed_bf), epsilon = 1e-15);

        session.options.fix_probability_two_random_records_match = true;
        assert_eq!(session.match_prior_estimate(&base), None);
    }

    #[test]
    fn commit_carries_not_observed_warnings_into_the_model() {
        let mut base = model();
        let mut session =
            EmTrainingSession::new(&base, "l.surname = r.surname", TrainingOptions::new()).unwrap();
        let key = LevelKey { comparison: "first_name".into(), comparison_vector_value: 1 };
        session
            .settings
            .level_mut(&key)
            .unwrap()
            .set_m_probability(Probability::NotObserved)
            .unwrap();
        session.iterations.push(IterationSummary {
            iteration: 1,
            probability_two_random_records_match: 0.01,
            max_change: None,
            log_likelihood: 0.0,
        });

        session.commit(&mut base).unwrap();
        let level = base.level(&key).unwrap();
        assert!(level.warned_not_observed(ProbabilityKind::M));
        assert!(!level.warned_not_observed(ProbabilityKind::U));
        assert_eq!(level.trained_m_probabilities()[0].probability, Probability::NotObserved);

        let next =
            EmTrainingSession::new(&base, "l.surname = r.surname", TrainingOptions::new()).unwrap();
        assert!(next.settings().level(&key).unwrap().warned_not_observed(ProbabilityKind::M));
    }
}
