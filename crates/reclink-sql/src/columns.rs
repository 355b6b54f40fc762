//! Column discovery for pair predicates.

use sqlparser::ast::{visit_expressions, Expr};
use std::ops::ControlFlow;

use crate::canonical::ColumnRef;

/// Every side-qualified column referenced anywhere in `expr`, in order of
/// first appearance. Spelling of the first occurrence is preserved.
pub fn columns_used(expr: &Expr) -> Vec<ColumnRef> {
    let mut found: Vec<ColumnRef> = Vec::new();
    let _ = visit_expressions(expr, |e| {
        if let Some(column) = ColumnRef::from_expr(e) {
            let seen = found
                .iter()
                .any(|c| c.side == column.side && c.name.eq_ignore_ascii_case(&column.name));
            if !seen {
                found.push(column);
            }
        }
        ControlFlow::<()>::Continue(())
    });
    found
}

/// Base column names used on either side, deduplicated case-insensitively.
pub fn base_columns(columns: &[ColumnRef]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for column in columns {
        if !names.iter().any(|n| n.eq_ignore_ascii_case(&column.name)) {
            names.push(column.name.clone());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Side;
    use crate::{DialectAdapter, SqlDialect};

    #[test]
    fn finds_columns_inside_function_calls() {
        let adapter = DialectAdapter::new(SqlDialect::DuckDb);
        let cols = adapter
            .columns_used("jaro_winkler_similarity(first_name_l, first_name_r) >= 0.9 AND l.dob = r.dob")
            .unwrap();
        assert_eq!(
            cols,
            vec![
                ColumnRef { name: "first_name".into(), side: Side::Left },
                ColumnRef { name: "first_name".into(), side: Side::Right },
                ColumnRef { name: "dob".into(), side: Side::Left },
                ColumnRef { name: "dob".into(), side: Side::Right },
            ]
        );
        assert_eq!(base_columns(&cols), vec!["first_name".to_string(), "dob".to_string()]);
    }

    #[test]
    fn unsided_identifiers_are_ignored() {
        let adapter = DialectAdapter::new(SqlDialect::Generic);
        let cols = adapter.columns_used("city = 'London' AND city_l IS NULL").unwrap();
        assert_eq!(base_columns(&cols), vec!["city".to_string()]);
        assert_eq!(cols.len(), 1);
    }
}
