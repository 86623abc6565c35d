//! SQL dialects and the syntax that differs between them

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::Datatype;
use crate::error::{MetricsLayerError, Result};

/// Warehouse the generated SQL targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Snowflake,
    #[serde(rename = "bigquery")]
    BigQuery,
    Redshift,
    Postgres,
    Druid,
    SqlServer,
    #[serde(alias = "duckdb")]
    DuckDb,
    Databricks,
    AzureSynapse,
    Trino,
    #[serde(rename = "mysql")]
    MySql,
}

impl Dialect {
    pub const ALL: [Dialect; 11] = [
        Dialect::Snowflake,
        Dialect::BigQuery,
        Dialect::Redshift,
        Dialect::Postgres,
        Dialect::Druid,
        Dialect::SqlServer,
        Dialect::DuckDb,
        Dialect::Databricks,
        Dialect::AzureSynapse,
        Dialect::Trino,
        Dialect::MySql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Snowflake => "snowflake",
            Dialect::BigQuery => "bigquery",
            Dialect::Redshift => "redshift",
            Dialect::Postgres => "postgres",
            Dialect::Druid => "druid",
            Dialect::SqlServer => "sql_server",
            Dialect::DuckDb => "duck_db",
            Dialect::Databricks => "databricks",
            Dialect::AzureSynapse => "azure_synapse",
            Dialect::Trino => "trino",
            Dialect::MySql => "mysql",
        }
    }

    /// T-SQL flavours
    pub fn is_tsql(&self) -> bool {
        matches!(self, Dialect::SqlServer | Dialect::AzureSynapse)
    }

    pub fn supports_semicolon(&self) -> bool {
        !matches!(self, Dialect::Druid | Dialect::Trino)
    }

    pub fn supports_nulls_last(&self) -> bool {
        matches!(
            self,
            Dialect::Snowflake
                | Dialect::BigQuery
                | Dialect::Redshift
                | Dialect::Postgres
                | Dialect::DuckDb
                | Dialect::Databricks
                | Dialect::Trino
        )
    }

    /// Dialects that get a deterministic ORDER BY when none is requested
    pub fn orders_by_default(&self) -> bool {
        matches!(self, Dialect::Snowflake | Dialect::Redshift | Dialect::DuckDb)
    }

    /// Limits are written as `SELECT TOP n` instead of a trailing LIMIT
    pub fn uses_top(&self) -> bool {
        self.is_tsql()
    }

    /// GROUP BY references select aliases instead of repeating expressions
    pub fn groups_by_alias(&self) -> bool {
        matches!(self, Dialect::BigQuery)
    }

    pub fn supports_median(&self) -> bool {
        !matches!(
            self,
            Dialect::Druid | Dialect::Postgres | Dialect::BigQuery | Dialect::SqlServer | Dialect::AzureSynapse
        )
    }

    /// Null-coalescing function used when merging result sets
    pub fn if_null_function(&self) -> &'static str {
        match self {
            Dialect::Snowflake | Dialect::BigQuery | Dialect::MySql => "ifnull",
            Dialect::Redshift | Dialect::Druid => "nvl",
            Dialect::Postgres | Dialect::Databricks | Dialect::DuckDb | Dialect::Trino => "coalesce",
            Dialect::SqlServer | Dialect::AzureSynapse => "isnull",
        }
    }

    /// Merged queries without join keys use a cross join on this dialect
    pub fn cross_joins_without_keys(&self) -> bool {
        matches!(self, Dialect::Redshift)
    }

    pub fn current_date_sql(&self) -> &'static str {
        match self {
            Dialect::Snowflake => "current_date()",
            Dialect::BigQuery | Dialect::Databricks | Dialect::MySql => "CURRENT_DATE()",
            Dialect::SqlServer | Dialect::AzureSynapse => "CAST(GETDATE() AS DATE)",
            _ => "CURRENT_DATE",
        }
    }

    /// One row per day from 2000-01-01 through roughly 2040, in a column named `date`
    pub fn date_spine_sql(&self) -> Result<String> {
        let sql = match self {
            Dialect::Snowflake | Dialect::Redshift => {
                "select dateadd(day, seq4(), '2000-01-01') as date from table(generator(rowcount => 365*40))"
            }
            Dialect::BigQuery => {
                "select date from unnest(generate_date_array('2000-01-01', '2040-01-01')) as date"
            }
            Dialect::Postgres | Dialect::DuckDb => {
                "select CAST(date AS DATE) as date from generate_series('2000-01-01'::date, '2040-01-01'::date, interval '1 day') as t(date)"
            }
            Dialect::Databricks => {
                "select explode(sequence(to_date('2000-01-01'), to_date('2040-01-01'), interval 1 day)) as date"
            }
            Dialect::Trino => {
                "select date from unnest(sequence(DATE '2000-01-01', DATE '2040-01-01', INTERVAL '1' DAY)) as t(date)"
            }
            Dialect::SqlServer | Dialect::AzureSynapse => {
                "select DATEADD(DAY, value, CAST('2000-01-01' AS DATE)) as date from generate_series(0, 365*40)"
            }
            Dialect::Druid | Dialect::MySql => {
                return Err(MetricsLayerError::Query(format!(
                    "Cumulative metrics are not supported for the {} dialect",
                    self.as_str()
                )))
            }
        };
        Ok(sql.to_string())
    }

    /// Literal for a date or timestamp value compared against a time column
    pub fn datetime_literal(&self, value: &str, datatype: Datatype) -> String {
        match (self, datatype) {
            (Dialect::BigQuery, Datatype::Timestamp) => format!("TIMESTAMP('{value}')"),
            (Dialect::BigQuery, Datatype::Date) => format!("DATE('{value}')"),
            (Dialect::BigQuery, Datatype::Datetime) => format!("DATETIME('{value}')"),
            _ => format!("'{value}'"),
        }
    }

    /// Whole-unit difference between two timestamps, used for funnel windows
    pub fn date_diff_sql(&self, unit: &str, start: &str, end: &str) -> String {
        let unit = unit.to_uppercase();
        match self {
            Dialect::BigQuery => format!("DATE_DIFF(CAST({end} AS DATE), CAST({start} AS DATE), {unit})"),
            Dialect::Druid | Dialect::MySql => format!("TIMESTAMPDIFF({unit}, {start}, {end})"),
            Dialect::Postgres => format!("DATE_PART('{unit}', AGE({end}, {start}))"),
            Dialect::Trino | Dialect::DuckDb => format!("DATE_DIFF('{unit}', {start}, {end})"),
            Dialect::SqlServer | Dialect::AzureSynapse | Dialect::Databricks => {
                format!("DATEDIFF({unit}, {start}, {end})")
            }
            Dialect::Snowflake | Dialect::Redshift => format!("DATEDIFF('{unit}', {start}, {end})"),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = MetricsLayerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        if normalized == "duckdb" {
            return Ok(Dialect::DuckDb);
        }
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == normalized)
            .ok_or_else(|| {
                let supported: Vec<&str> = Self::ALL.iter().map(Dialect::as_str).collect();
                MetricsLayerError::Query(format!(
                    "Unknown query type {s}. Supported query types are: {}",
                    supported.join(", ")
                ))
            })
    }
}
