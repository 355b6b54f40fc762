//! Staged SQL plans rendered as a single `WITH` statement.
//!
//! A plan is an ordered list of named stages. Every stage may refer to the
//! names of earlier stages and to the templated names of the input tables;
//! rendering turns all but the last stage into CTEs and selects from the
//! last one. Plans are values: `enqueue` hands back a new plan, and flushing
//! consumes it.

use crate::backend::TableName;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("cannot render an empty SQL pipeline")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStage {
    pub sql: String,
    pub output_table_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlPipeline {
    stages: Vec<SqlStage>,
}

impl SqlPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enqueue(mut self, sql: impl Into<String>, output_table_name: impl Into<String>) -> Self {
        self.stages.push(SqlStage {
            sql: sql.into(),
            output_table_name: output_table_name.into(),
        });
        self
    }

    pub fn stages(&self) -> &[SqlStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Logical name of the final stage.
    pub fn output_table_name(&self) -> Option<&str> {
        self.stages.last().map(|s| s.output_table_name.as_str())
    }

    /// Render the plan. Inputs stored under a different physical name get a
    /// leading `<templated> as (select * from <physical>)` alias.
    pub fn render(&self, inputs: &[TableName]) -> Result<String, PipelineError> {
        let (last, earlier) = self.stages.split_last().ok_or(PipelineError::Empty)?;

        let aliases = inputs
            .iter()
            .filter(|t| t.templated != t.physical)
            .map(|t| format!("{} as (select * from {})", t.templated, t.physical));
        let ctes = earlier
            .iter()
            .map(|s| format!("{} as ({})", s.output_table_name, s.sql));
        let with: Vec<String> = aliases.chain(ctes).collect();

        if with.is_empty() {
            Ok(last.sql.clone())
        } else {
            Ok(format!("WITH {} {}", with.join(", "), last.sql))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stage_renders_bare() {
        let plan = SqlPipeline::new().enqueue("select 1 as x", "one");
        assert_eq!(plan.render(&[]).unwrap(), "select 1 as x");
        assert_eq!(plan.output_table_name(), Some("one"));
    }

    #[test]
    fn earlier_stages_become_ctes_in_order() {
        let plan = SqlPipeline::new()
            .enqueue("select * from people", "a")
            .enqueue("select * from a where x > 1", "b")
            .enqueue("select count(*) from b", "c");
        assert_eq!(
            plan.render(&[]).unwrap(),
            "WITH a as (select * from people), b as (select * from a where x > 1) select count(*) from b"
        );
    }

    #[test]
    fn renamed_inputs_are_aliased_first() {
        let plan = SqlPipeline::new().enqueue("select * from concat", "out");
        let inputs = [
            TableName::new("concat", "__reclink__abc1234"),
            TableName::logical("untouched"),
        ];
        assert_eq!(
            plan.render(&inputs).unwrap(),
            "WITH concat as (select * from __reclink__abc1234) select * from concat"
        );
    }

    #[test]
    fn empty_plan_is_an_error() {
        assert_eq!(SqlPipeline::new().render(&[]), Err(PipelineError::Empty));
    }
}
