//! Vertical concatenation of the input tables and term-frequency lookups.

use crate::backend::TableName;

pub const CONCAT: &str = "__reclink__df_concat";
pub const CONCAT_WITH_TF: &str = "__reclink__df_concat_with_tf";
pub const NEW_RECORDS: &str = "__reclink__df_new_records";
pub const NEW_RECORDS_WITH_TF: &str = "__reclink__df_new_records_with_tf";

pub fn tf_table_name(column: &str) -> String {
    format!("__reclink__df_tf_{column}")
}

/// One input table together with the columns it exposes.
#[derive(Debug, Clone)]
pub struct InputColumns {
    pub table: TableName,
    pub columns: Vec<String>,
}

impl InputColumns {
    fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(name))
    }
}

/// `UNION ALL` of every input with a leading source dataset column.
///
/// Column order comes from the first table. Inputs without the source
/// dataset column get their templated name as a literal.
pub fn concat_sql(inputs: &[InputColumns], source_dataset_column: &str) -> String {
    let Some(first) = inputs.first() else {
        return String::new();
    };
    let columns: Vec<&str> = first
        .columns
        .iter()
        .map(String::as_str)
        .filter(|c| !c.eq_ignore_ascii_case(source_dataset_column))
        .collect();

    inputs
        .iter()
        .map(|input| {
            let source = if input.has_column(source_dataset_column) {
                source_dataset_column.to_string()
            } else {
                format!("'{}' as {source_dataset_column}", input.table.templated)
            };
            let mut select = vec![source];
            select.extend(columns.iter().map(|c| c.to_string()));
            format!("select {} from {}", select.join(", "), input.table.templated)
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

/// Relative frequency of each non-null value of `column`.
pub fn term_frequency_sql(column: &str) -> String {
    format!(
        "select {column}, cast(count(*) as float8) / \
         (select cast(count({column}) as float8) from {CONCAT}) as tf_{column} \
         from {CONCAT} where {column} is not null group by {column}"
    )
}

/// Left-join every term-frequency table onto the concatenation.
pub fn concat_with_tf_sql(tf_columns: &[String]) -> String {
    join_tf_sql(CONCAT, tf_columns)
}

/// Left-join every term-frequency table onto `table`.
pub fn join_tf_sql(table: &str, tf_columns: &[String]) -> String {
    if tf_columns.is_empty() {
        return format!("select * from {table}");
    }
    let selects: Vec<String> = std::iter::once(format!("{table}.*"))
        .chain(
            tf_columns
                .iter()
                .map(|c| format!("{}.tf_{c}", tf_table_name(c))),
        )
        .collect();
    let joins: Vec<String> = tf_columns
        .iter()
        .map(|c| {
            let tf = tf_table_name(c);
            format!("left join {tf} on {table}.{c} = {tf}.{c}")
        })
        .collect();
    format!("select {} from {table} {}", selects.join(", "), joins.join(" "))
}
