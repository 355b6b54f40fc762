//! Named SQL dialects and their parser counterparts.

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    Dialect, DuckDbDialect, GenericDialect, HiveDialect, PostgreSqlDialect, SQLiteDialect,
};
use std::fmt;
use std::str::FromStr;

use crate::DialectError;

/// SQL dialects the generated SQL can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Generic,
    #[default]
    DuckDb,
    Spark,
    #[serde(alias = "postgresql")]
    Postgres,
    Sqlite,
}

impl SqlDialect {
    pub const ALL: [SqlDialect; 5] = [
        SqlDialect::Generic,
        SqlDialect::DuckDb,
        SqlDialect::Spark,
        SqlDialect::Postgres,
        SqlDialect::Sqlite,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::Generic => "generic",
            SqlDialect::DuckDb => "duckdb",
            SqlDialect::Spark => "spark",
            SqlDialect::Postgres => "postgres",
            SqlDialect::Sqlite => "sqlite",
        }
    }

    /// Parser dialect used to read SQL written in this dialect.
    ///
    /// Spark SQL has no dedicated parser dialect; Hive is its closest
    /// grammar (backtick quoting, `ifnull`, `concat`).
    pub(crate) fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Generic => Box::new(GenericDialect {}),
            SqlDialect::DuckDb => Box::new(DuckDbDialect {}),
            SqlDialect::Spark => Box::new(HiveDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SqlDialect {
    type Err = DialectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" => Ok(SqlDialect::Generic),
            "duckdb" => Ok(SqlDialect::DuckDb),
            "spark" => Ok(SqlDialect::Spark),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(DialectError::UnknownDialect(other.to_string())),
        }
    }
}
