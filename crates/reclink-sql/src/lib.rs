//! SQL dialect adapter for Reclink
//!
//! Everything the linkage model needs to know about SQL text goes through
//! this crate:
//! - validation of boolean pair predicates in a named dialect
//! - canonicalisation to conjunctive normal form (exact-match detection)
//! - discovery of the `_l` / `_r` columns a predicate reads
//! - transpilation of generated statements between dialects
//!
//! Parsing is delegated to `sqlparser`; no SQL is executed here.

pub mod canonical;
pub mod columns;
pub mod dialect;

pub use canonical::{CanonicalExpr, Clause, ColumnRef, Literal, Side};
pub use dialect::SqlDialect;

use sqlparser::ast::Expr;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialectError {
    #[error("invalid {dialect} SQL `{sql}`: {message}")]
    Parse {
        sql: String,
        dialect: SqlDialect,
        message: String,
    },

    #[error("`{sql}` is not a single expression (unexpected `{trailing}`)")]
    TrailingInput { sql: String, trailing: String },

    #[error("unknown SQL dialect `{0}`")]
    UnknownDialect(String),

    #[error("predicate is too complex to canonicalise (more than {limit} clauses)")]
    TooComplex { limit: usize },
}

/// Dialect-bound SQL services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DialectAdapter {
    dialect: SqlDialect,
}

impl DialectAdapter {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Parse a single SQL expression, rejecting trailing tokens.
    pub fn parse_expr(&self, sql: &str) -> Result<Expr, DialectError> {
        let dialect = self.dialect.parser_dialect();
        let mut parser = Parser::new(dialect.as_ref())
            .try_with_sql(sql)
            .map_err(|e| self.parse_error(sql, e))?;
        let expr = parser.parse_expr().map_err(|e| self.parse_error(sql, e))?;
        let next = parser.peek_token();
        if next.token != Token::EOF {
            return Err(DialectError::TrailingInput {
                sql: sql.to_string(),
                trailing: next.token.to_string(),
            });
        }
        Ok(expr)
    }

    pub fn validate(&self, sql: &str) -> Result<(), DialectError> {
        self.parse_expr(sql).map(|_| ())
    }

    pub fn canonicalize(&self, sql: &str) -> Result<CanonicalExpr, DialectError> {
        CanonicalExpr::from_expr(self.parse_expr(sql)?)
    }

    /// Base columns of `sql` when it is an exact match (`col_l = col_r`
    /// conjuncts only), otherwise `None`.
    pub fn exact_match_columns(&self, sql: &str) -> Result<Option<Vec<String>>, DialectError> {
        Ok(self.canonicalize(sql)?.exact_match_columns())
    }

    pub fn columns_used(&self, sql: &str) -> Result<Vec<ColumnRef>, DialectError> {
        Ok(columns::columns_used(&self.parse_expr(sql)?))
    }

    pub fn transpile_to(&self, sql: &str, to: SqlDialect) -> Result<String, DialectError> {
        transpile(sql, self.dialect, to)
    }

    fn parse_error(&self, sql: &str, err: sqlparser::parser::ParserError) -> DialectError {
        DialectError::Parse {
            sql: sql.to_string(),
            dialect: self.dialect,
            message: err.to_string(),
        }
    }
}

/// Re-render statements written in `from` so that `to` accepts them.
///
/// Statements are parsed with the source grammar and printed back in
/// sqlparser's normalised form, which is then checked against the target
/// grammar. Function names are passed through unchanged.
pub fn transpile(sql: &str, from: SqlDialect, to: SqlDialect) -> Result<String, DialectError> {
    let source = from.parser_dialect();
    let statements =
        Parser::parse_sql(source.as_ref(), sql).map_err(|e| DialectError::Parse {
            sql: sql.to_string(),
            dialect: from,
            message: e.to_string(),
        })?;
    let rendered = statements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";\n");

    if from != to {
        let target = to.parser_dialect();
        Parser::parse_sql(target.as_ref(), &rendered).map_err(|e| DialectError::Parse {
            sql: rendered.clone(),
            dialect: to,
            message: e.to_string(),
        })?;
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_predicates_and_rejects_garbage() {
        let adapter = DialectAdapter::new(SqlDialect::DuckDb);
        assert!(adapter.validate("first_name_l = first_name_r").is_ok());
        assert!(adapter
            .validate("levenshtein(surname_l, surname_r) <= 2 AND dob_l IS NOT NULL")
            .is_ok());
        assert!(matches!(
            adapter.validate("first_name_l = = first_name_r"),
            Err(DialectError::Parse { .. })
        ));
    }

    #[test]
    fn validate_rejects_trailing_tokens() {
        let adapter = DialectAdapter::new(SqlDialect::Generic);
        assert!(matches!(
            adapter.validate("a_l = a_r b_l"),
            Err(DialectError::TrailingInput { .. })
        ));
    }

    #[test]
    fn transpile_preserves_query_shape() {
        let out = transpile(
            "select l.id as id_l, '0' as match_key from t as l cross join t as r where l.id < r.id",
            SqlDialect::DuckDb,
            SqlDialect::Sqlite,
        )
        .unwrap();
        let lower = out.to_lowercase();
        assert!(lower.contains("cross join"));
        assert!(lower.contains("'0' as match_key"));
    }
}
