//! The linker: a model, a backend and the input tables it links.
//!
//! Every operation builds a [`SqlPipeline`] and hands it to [`Linker::flush`],
//! which memoises results by the SHA-256 of the rendered SQL. Because the
//! SQL embeds the current parameters, a changed model never reads a stale
//! table. Nothing is ever invalidated or dropped.

use reclink_model::probability::median;
use reclink_model::{ConfigurationError, LevelKey, ProbabilityKind, Settings};
use sha2::{Digest, Sha256};

use crate::backend::{get_i64, Backend, TableHandle, TableName};
use crate::blocking::{block_new_records_sql, block_using_rules_sql, BLOCKED};
use crate::concat::{
    concat_sql, concat_with_tf_sql, join_tf_sql, term_frequency_sql, tf_table_name, InputColumns,
    CONCAT, CONCAT_WITH_TF, NEW_RECORDS, NEW_RECORDS_WITH_TF,
};
use crate::em::{compute_new_parameters_sql, EmTrainingSession, NewParameters, TrainingOptions, M_U_COUNTS};
use crate::error::{LinkerError, Result};
use crate::label_training::{self, certain_match_scores_sql, label_blocking_rule};
use crate::pipeline::{PipelineError, SqlPipeline};
use crate::predict::{
    match_weight_parts_sql, predict_sql, PredictInput, PredictOptions, MATCH_WEIGHT_PARTS, PREDICT,
};
use crate::u_sampling::{
    self, count_rows_sql, non_match_scores_sql, sample_proportion, sample_sql, CONCAT_COUNT,
    CONCAT_SAMPLE,
};
use crate::vectors::{compute_comparison_vectors_sql, COMPARISON_VECTORS};

/// Prefix of every table the engine creates.
pub const TABLE_PREFIX: &str = "__reclink__";

/// `__reclink__` followed by the first 7 hex digits of SHA-256(`sql`).
pub fn hashed_table_name(sql: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(sql.as_bytes()));
    format!("{TABLE_PREFIX}{}", &digest[..7])
}

pub struct Linker<B: Backend> {
    backend: B,
    settings: Settings,
    input_tables: Vec<TableName>,
    training_sessions: Vec<EmTrainingSession>,
}

impl<B: Backend> Linker<B> {
    /// Link the named tables, which must already exist in `backend`.
    pub fn new<S: AsRef<str>>(backend: B, settings: Settings, input_tables: &[S]) -> Result<Self> {
        if input_tables.is_empty() {
            return Err(LinkerError::NoInputTables);
        }
        let mut tables = Vec::with_capacity(input_tables.len());
        for name in input_tables {
            let name = name.as_ref();
            if !backend.table_exists(name)? {
                return Err(LinkerError::UnknownInputTable(name.to_string()));
            }
            tables.push(TableName::logical(name));
        }
        Ok(Self {
            backend,
            settings,
            input_tables: tables,
            training_sessions: Vec::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }

    pub fn input_tables(&self) -> &[TableName] {
        &self.input_tables
    }

    pub fn training_sessions(&self) -> &[EmTrainingSession] {
        &self.training_sessions
    }

    // ========================================================================
    // Execution and caching
    // ========================================================================

    /// Render and execute `pipeline`; the result takes the last stage's name.
    pub fn flush(
        &self,
        pipeline: SqlPipeline,
        inputs: &[TableName],
        materialise_as_hash: bool,
    ) -> Result<B::Table> {
        let sql = pipeline.render(inputs)?;
        let name = pipeline.output_table_name().ok_or(PipelineError::Empty)?;
        self.sql_to_table(&sql, name, materialise_as_hash)
    }

    /// Reuse a table holding the result of `sql` if there is one, otherwise
    /// materialise it.
    pub fn sql_to_table(
        &self,
        sql: &str,
        templated_name: &str,
        materialise_as_hash: bool,
    ) -> Result<B::Table> {
        if self.backend.table_exists(templated_name)? {
            tracing::debug!(table = templated_name, "reusing table materialised by name");
            return Ok(self.backend.table(templated_name, templated_name)?);
        }

        let hashed = hashed_table_name(sql);
        if self.backend.table_exists(&hashed)? {
            tracing::debug!(table = templated_name, physical = %hashed, "reusing cached result");
            return Ok(self.backend.table(templated_name, &hashed)?);
        }

        let physical = if materialise_as_hash {
            hashed.as_str()
        } else {
            templated_name
        };
        let transpile = self.settings.sql_dialect() != self.backend.dialect();
        tracing::info!(table = templated_name, physical, transpile, "executing SQL");
        tracing::debug!(sql, "SQL text");
        Ok(self
            .backend
            .execute_sql(sql, templated_name, physical, transpile)?)
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    fn input_columns(&self) -> Result<Vec<InputColumns>> {
        self.input_tables
            .iter()
            .map(|table| {
                let columns = self
                    .backend
                    .table(&table.templated, &table.physical)?
                    .columns()?;
                Ok(InputColumns {
                    table: table.clone(),
                    columns,
                })
            })
            .collect()
    }

    fn concat_pipeline(&self) -> Result<SqlPipeline> {
        let inputs = self.input_columns()?;
        let sql = concat_sql(&inputs, self.settings.source_dataset_column_name());
        Ok(SqlPipeline::new().enqueue(sql, CONCAT))
    }

    /// The concatenated inputs with a `tf_<col>` column per adjustment
    /// column, materialised once under its logical name.
    pub fn initialise_concat_with_tf(&self) -> Result<B::Table> {
        if self.backend.table_exists(CONCAT_WITH_TF)? {
            return Ok(self.backend.table(CONCAT_WITH_TF, CONCAT_WITH_TF)?);
        }
        let tf_columns = self.settings.tf_columns();
        let mut plan = self.concat_pipeline()?;
        for column in &tf_columns {
            let tf = tf_table_name(column);
            if !self.backend.table_exists(&tf)? {
                plan = plan.enqueue(term_frequency_sql(column), tf);
            }
        }
        plan = plan.enqueue(concat_with_tf_sql(&tf_columns), CONCAT_WITH_TF);
        self.flush(plan, &self.input_tables, false)
    }

    /// Materialise the term-frequency table of one column.
    pub fn compute_tf_table(&self, column: &str) -> Result<B::Table> {
        let plan = self
            .concat_pipeline()?
            .enqueue(term_frequency_sql(column), tf_table_name(column));
        self.flush(plan, &self.input_tables, false)
    }

    // ========================================================================
    // Linking
    // ========================================================================

    /// Candidate pairs under the model's blocking rules, unscored.
    pub fn deterministic_link(&self) -> Result<B::Table> {
        let concat = self.initialise_concat_with_tf()?;
        let plan = SqlPipeline::new().enqueue(
            block_using_rules_sql(&self.settings, self.settings.blocking_rules(), CONCAT_WITH_TF),
            BLOCKED,
        );
        self.flush(plan, &[concat.name().clone()], true)
    }

    /// Score every candidate pair.
    pub fn predict(&self, options: &PredictOptions) -> Result<B::Table> {
        let concat = self.initialise_concat_with_tf()?;
        let settings = &self.settings;
        let plan = SqlPipeline::new()
            .enqueue(
                block_using_rules_sql(settings, settings.blocking_rules(), CONCAT_WITH_TF),
                BLOCKED,
            )
            .enqueue(compute_comparison_vectors_sql(settings), COMPARISON_VECTORS)
            .enqueue(match_weight_parts_sql(settings, COMPARISON_VECTORS)?, MATCH_WEIGHT_PARTS)
            .enqueue(
                predict_sql(settings, PredictInput::ComparisonVectors, options),
                PREDICT,
            );
        self.flush(plan, &[concat.name().clone()], true)
    }

    /// Score the records of `new_records` against the linked inputs.
    ///
    /// Only pairs of one existing and one new record are produced, under the
    /// model's blocking rules. Term frequencies come from the existing
    /// inputs. Results are cached by SQL text, so a table whose contents
    /// change needs a new name.
    pub fn incremental_link(&self, new_records: &str, options: &PredictOptions) -> Result<B::Table> {
        if !self.backend.table_exists(new_records)? {
            return Err(LinkerError::UnknownInputTable(new_records.to_string()));
        }
        let concat = self.initialise_concat_with_tf()?;
        let tf_columns = self.settings.tf_columns();

        let mut inputs = vec![concat.name().clone(), TableName::logical(new_records)];
        for column in &tf_columns {
            inputs.push(self.compute_tf_table(column)?.name().clone());
        }
        let incoming = InputColumns {
            table: TableName::logical(new_records),
            columns: self.backend.table(new_records, new_records)?.columns()?,
        };

        let settings = &self.settings;
        let plan = SqlPipeline::new()
            .enqueue(
                concat_sql(&[incoming], settings.source_dataset_column_name()),
                NEW_RECORDS,
            )
            .enqueue(join_tf_sql(NEW_RECORDS, &tf_columns), NEW_RECORDS_WITH_TF)
            .enqueue(
                block_new_records_sql(
                    settings,
                    settings.blocking_rules(),
                    CONCAT_WITH_TF,
                    NEW_RECORDS_WITH_TF,
                ),
                BLOCKED,
            )
            .enqueue(compute_comparison_vectors_sql(settings), COMPARISON_VECTORS)
            .enqueue(match_weight_parts_sql(settings, COMPARISON_VECTORS)?, MATCH_WEIGHT_PARTS)
            .enqueue(
                predict_sql(settings, PredictInput::ComparisonVectors, options),
                PREDICT,
            );
        tracing::info!(new_records, "linking new records against the inputs");
        self.flush(plan, &inputs, true)
    }

    // ========================================================================
    // Training
    // ========================================================================

    /// Estimate u from the comparison vectors of a random sample sized to
    /// give about `max_pairs` pairs. Term-frequency adjustments are ignored.
    pub fn estimate_u_using_random_sampling(&mut self, max_pairs: f64) -> Result<()> {
        if !(max_pairs.is_finite() && max_pairs >= 1.0) {
            return Err(ConfigurationError::InvalidSettings(format!(
                "max_pairs must be at least 1, got {max_pairs}"
            ))
            .into());
        }
        self.initialise_concat_with_tf()?;

        let count_table = self.sql_to_table(&count_rows_sql(), CONCAT_COUNT, true)?;
        let row_count = match count_table.as_records(Some(1))?.first() {
            Some(record) => get_i64(record, "count", count_table.physical_name())?,
            None => 0,
        };
        let proportion =
            sample_proportion(self.settings.link_type(), max_pairs, row_count.max(0) as u64);
        let sampling_clause = self.backend.random_sample_sql(proportion);
        let sample = self.sql_to_table(&sample_sql(&sampling_clause), CONCAT_SAMPLE, true)?;
        tracing::info!(row_count, proportion, max_pairs, "sampled records for u estimation");

        let training = self.settings.without_tf_adjustments();
        let plan = SqlPipeline::new()
            .enqueue(block_using_rules_sql(&training, &[], CONCAT_WITH_TF), BLOCKED)
            .enqueue(compute_comparison_vectors_sql(&training), COMPARISON_VECTORS)
            .enqueue(non_match_scores_sql(), PREDICT)
            .enqueue(compute_new_parameters_sql(&training), M_U_COUNTS);
        let inputs = [TableName::new(CONCAT_WITH_TF, sample.physical_name())];
        let counts = self.flush(plan, &inputs, true)?;
        let records = counts.as_records(None)?;
        let params = NewParameters::from_records(&records, &training, counts.physical_name())?;
        if params.probability_two_random_records_match.is_none() {
            return Err(LinkerError::EmptySample);
        }

        self.add_trained_values(&training, &params, ProbabilityKind::U, u_sampling::DESCRIPTION)
    }

    /// Estimate m from the pairs of records sharing a value of
    /// `label_column`, every one of which is taken to be a match.
    /// Term-frequency adjustments are ignored.
    pub fn estimate_m_from_label_column(&mut self, label_column: &str) -> Result<()> {
        for input in self.input_columns()? {
            if !input.columns.iter().any(|c| c.eq_ignore_ascii_case(label_column)) {
                return Err(ConfigurationError::InvalidSettings(format!(
                    "label column `{label_column}` is missing from input table `{}`",
                    input.table.templated
                ))
                .into());
            }
        }
        let concat = self.initialise_concat_with_tf()?;

        let rule = label_blocking_rule(label_column);
        let training = self.settings.without_tf_adjustments();
        let plan = SqlPipeline::new()
            .enqueue(
                block_using_rules_sql(&training, std::slice::from_ref(&rule), CONCAT_WITH_TF),
                BLOCKED,
            )
            .enqueue(compute_comparison_vectors_sql(&training), COMPARISON_VECTORS)
            .enqueue(certain_match_scores_sql(), PREDICT)
            .enqueue(compute_new_parameters_sql(&training), M_U_COUNTS);
        let counts = self.flush(plan, &[concat.name().clone()], true)?;
        let records = counts.as_records(None)?;
        let params = NewParameters::from_records(&records, &training, counts.physical_name())?;
        if params.probability_two_random_records_match.is_none() {
            return Err(LinkerError::NoTrainingPairs(rule));
        }
        tracing::info!(label_column, "estimated m from labelled pairs");

        self.add_trained_values(&training, &params, ProbabilityKind::M, label_training::DESCRIPTION)
    }

    /// Append one `kind` estimate per non-null level of `training` to the
    /// model's histories, then refresh its live m and u.
    fn add_trained_values(
        &mut self,
        training: &Settings,
        params: &NewParameters,
        kind: ProbabilityKind,
        description: &str,
    ) -> Result<()> {
        for comparison in training.comparisons() {
            for level in comparison.non_null_levels() {
                let key = LevelKey {
                    comparison: comparison.output_column_name().to_string(),
                    comparison_vector_value: level.comparison_vector_value(),
                };
                let estimate = params.get(kind, &key);
                let target = self.settings.level_mut(&key)?;
                match kind {
                    ProbabilityKind::M => target.add_trained_m_probability(estimate, description)?,
                    ProbabilityKind::U => target.add_trained_u_probability(estimate, description)?,
                }
            }
        }
        self.settings.populate_m_u_from_trained_values();
        Ok(())
    }

    /// Train m (and λ) by EM on the pairs matched by `blocking_rule`, fold
    /// the estimates into the model and keep the session.
    pub fn estimate_parameters_using_expectation_maximisation(
        &mut self,
        blocking_rule: &str,
        options: TrainingOptions,
    ) -> Result<&EmTrainingSession> {
        let mut session = EmTrainingSession::new(&self.settings, blocking_rule, options)?;
        session.train(self)?;
        session.commit(&mut self.settings)?;

        let index = self.training_sessions.len();
        self.training_sessions.push(session);
        self.populate_probability_two_random_records_match_from_trained_values()?;
        Ok(&self.training_sessions[index])
    }

    /// Set λ to the median of the sessions' estimates, if any session
    /// trained it.
    fn populate_probability_two_random_records_match_from_trained_values(&mut self) -> Result<()> {
        let trainable = self
            .training_sessions
            .iter()
            .filter(|s| !s.options().fix_probability_two_random_records_match)
            .count();
        let estimates: Vec<f64> = self
            .training_sessions
            .iter()
            .filter_map(|s| s.match_prior_estimate(&self.settings))
            .collect();
        if estimates.len() < trainable {
            tracing::warn!(
                usable = estimates.len(),
                sessions = trainable,
                "some training sessions gave no usable match prior"
            );
        }
        if let Some(lambda) = median(&estimates) {
            self.settings
                .set_probability_two_random_records_match(lambda)?;
            tracing::info!(
                probability_two_random_records_match = lambda,
                sessions = estimates.len(),
                "updated match prior from training sessions"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Record;
    use reclink_model::{ComparisonSpec, LinkType, SettingsSpec, SqlDialect};
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeTable {
        name: TableName,
        columns: Vec<String>,
    }

    impl TableHandle for FakeTable {
        fn name(&self) -> &TableName {
            &self.name
        }

        fn columns(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.columns.clone())
        }

        fn as_records(&self, _limit: Option<usize>) -> anyhow::Result<Vec<Record>> {
            Ok(Vec::new())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Execution {
        sql: String,
        templated: String,
        physical: String,
        transpile: bool,
    }

    struct RecordingBackend {
        dialect: SqlDialect,
        tables: RefCell<HashMap<String, Vec<String>>>,
        executed: RefCell<Vec<Execution>>,
    }

    impl RecordingBackend {
        fn new(dialect: SqlDialect) -> Self {
            let mut tables = HashMap::new();
            tables.insert(
                "people".to_string(),
                vec!["unique_id".to_string(), "surname".to_string()],
            );
            Self {
                dialect,
                tables: RefCell::new(tables),
                executed: RefCell::new(Vec::new()),
            }
        }

        fn executions(&self) -> Vec<Execution> {
            self.executed.borrow().clone()
        }
    }

    impl Backend for RecordingBackend {
        type Table = FakeTable;

        fn dialect(&self) -> SqlDialect {
            self.dialect
        }

        fn execute_sql(
            &self,
            sql: &str,
            templated_name: &str,
            physical_name: &str,
            transpile: bool,
        ) -> anyhow::Result<FakeTable> {
            self.executed.borrow_mut().push(Execution {
                sql: sql.to_string(),
                templated: templated_name.to_string(),
                physical: physical_name.to_string(),
                transpile,
            });
            self.tables
                .borrow_mut()
                .insert(physical_name.to_string(), Vec::new());
            self.table(templated_name, physical_name)
        }

        fn table_exists(&self, name: &str) -> anyhow::Result<bool> {
            Ok(self.tables.borrow().contains_key(name))
        }

        fn table(&self, templated_name: &str, physical_name: &str) -> anyhow::Result<FakeTable> {
            let columns = self
                .tables
                .borrow()
                .get(physical_name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such table: {physical_name}"))?;
            Ok(FakeTable {
                name: TableName::new(templated_name, physical_name),
                columns,
            })
        }

        fn random_sample_sql(&self, proportion: f64) -> String {
            format!("USING SAMPLE {}%", proportion * 100.0)
        }
    }

    fn linker(dialect: SqlDialect) -> Linker<RecordingBackend> {
        let spec = SettingsSpec::new(LinkType::DedupeOnly, vec![ComparisonSpec::exact_match("surname")])
            .with_blocking_rules(["l.surname = r.surname"])
            .with_dialect(SqlDialect::DuckDb);
        let settings = Settings::from_spec(spec).unwrap();
        Linker::new(RecordingBackend::new(dialect), settings, &["people"]).unwrap()
    }

    #[test]
    fn hashed_names_are_short_and_stable() {
        let a = hashed_table_name("select 1");
        assert_eq!(a, hashed_table_name("select 1"));
        assert_ne!(a, hashed_table_name("select 2"));
        assert!(a.starts_with("__reclink__"));
        assert_eq!(a.len(), "__reclink__".len() + 7);
        assert!(a["__reclink__".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_sql_is_executed_once() {
        let linker = linker(SqlDialect::DuckDb);
        let first = linker.sql_to_table("select 1 as x", "__reclink__one", true).unwrap();
        let second = linker.sql_to_table("select 1 as x", "__reclink__one", true).unwrap();
        assert_eq!(first.name(), second.name());
        assert_eq!(first.physical_name(), hashed_table_name("select 1 as x"));
        assert_eq!(first.templated_name(), "__reclink__one");
        assert_eq!(linker.backend().executions().len(), 1);
        assert!(!linker.backend().executions()[0].transpile);
    }

    #[test]
    fn tables_materialised_by_name_win_over_new_sql() {
        let linker = linker(SqlDialect::DuckDb);
        let table = linker.sql_to_table("select 1 as x", "__reclink__named", false).unwrap();
        assert_eq!(table.physical_name(), "__reclink__named");
        let again = linker.sql_to_table("select 2 as x", "__reclink__named", false).unwrap();
        assert_eq!(again.physical_name(), "__reclink__named");
        assert_eq!(linker.backend().executions().len(), 1);
    }

    #[test]
    fn differing_dialects_request_transpilation() {
        let linker = linker(SqlDialect::Sqlite);
        linker.sql_to_table("select 1 as x", "__reclink__one", true).unwrap();
        assert!(linker.backend().executions()[0].transpile);
    }

    #[test]
    fn missing_inputs_are_rejected() {
        let settings = linker(SqlDialect::DuckDb).into_settings();
        let backend = RecordingBackend::new(SqlDialect::DuckDb);
        assert!(matches!(
            Linker::new(backend, settings.clone(), &["ghosts"]),
            Err(LinkerError::UnknownInputTable(name)) if name == "ghosts"
        ));
        let backend = RecordingBackend::new(SqlDialect::DuckDb);
        let none: [&str; 0] = [];
        assert!(matches!(
            Linker::new(backend, settings, &none),
            Err(LinkerError::NoInputTables)
        ));
    }

    #[test]
    fn concat_with_tf_is_materialised_once_by_name() {
        let linker = linker(SqlDialect::DuckDb);
        let table = linker.initialise_concat_with_tf().unwrap();
        assert_eq!(table.physical_name(), CONCAT_WITH_TF);
        linker.initialise_concat_with_tf().unwrap();

        let executions = linker.backend().executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(
            executions[0].sql,
            "WITH __reclink__df_concat as (select 'people' as source_dataset, unique_id, surname from people) \
             select * from __reclink__df_concat"
        );
    }

    #[test]
    fn deterministic_link_blocks_the_concatenation() {
        let linker = linker(SqlDialect::DuckDb);
        let pairs = linker.deterministic_link().unwrap();
        assert_eq!(pairs.templated_name(), BLOCKED);
        let executions = linker.backend().executions();
        assert_eq!(executions.len(), 2);
        assert!(executions[1]
            .sql
            .starts_with("select l.source_dataset as source_dataset_l"));
        assert!(executions[1]
            .sql
            .contains("from __reclink__df_concat_with_tf as l inner join __reclink__df_concat_with_tf as r"));
        assert_eq!(executions[1].physical, hashed_table_name(&executions[1].sql));

        linker.deterministic_link().unwrap();
        assert_eq!(linker.backend().executions().len(), 2);
    }

    #[test]
    fn predict_renders_every_stage() {
        let linker = linker(SqlDialect::DuckDb);
        let scored = linker.predict(&PredictOptions::default()).unwrap();
        assert_eq!(scored.templated_name(), PREDICT);
        let sql = &linker.backend().executions()[1].sql;
        assert!(sql.starts_with("WITH __reclink__df_blocked as (select"));
        assert!(sql.contains("), __reclink__df_comparison_vectors as (select"));
        assert!(sql.contains("), __reclink__df_match_weight_parts as (select *, CASE"));
        assert!(sql.contains("select log2("));
    }
}
