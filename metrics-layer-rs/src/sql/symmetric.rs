//! Symmetric aggregates: fan-out safe SUM, COUNT and AVG
//!
//! Each row's value is offset by a large hash of its primary key so that
//! `SUM(DISTINCT ...)` collapses duplicated rows. Subtracting the distinct sum
//! of the hashes leaves the true total.

use super::dialect::Dialect;
use crate::error::{MetricsLayerError, Result};

/// Scale applied to values before the hash offset is added
pub const SYMMETRIC_FACTOR: u64 = 1_000_000;

/// Returns true if the dialect has the hashing primitives symmetric aggregates need
pub fn supports_symmetric_aggregates(dialect: Dialect) -> bool {
    matches!(
        dialect,
        Dialect::Snowflake | Dialect::Redshift | Dialect::Postgres | Dialect::DuckDb | Dialect::BigQuery
    )
}

pub fn symmetric_sum(sql: &str, pk_sql: &str, dialect: Dialect) -> Result<String> {
    let factor = SYMMETRIC_FACTOR;
    match dialect {
        Dialect::Snowflake | Dialect::Redshift | Dialect::Postgres | Dialect::DuckDb => {
            let adjusted = format!("(CAST(FLOOR(COALESCE({sql}, 0) * ({factor} * 1.0)) AS DECIMAL(38,0)))");
            let pk_sum = format!(
                "(TO_NUMBER(MD5({pk_sql}), 'XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX') % 1.0e27)::NUMERIC(38, 0)"
            );
            Ok(format!(
                "COALESCE(CAST((SUM(DISTINCT {adjusted} + {pk_sum}) - SUM(DISTINCT {pk_sum})) AS DOUBLE PRECISION) \
/ CAST(({factor}*1.0) AS DOUBLE PRECISION), 0)"
            ))
        }
        Dialect::BigQuery => {
            let adjusted = format!("(CAST(FLOOR(COALESCE({sql}, 0) * ({factor} * 1.0)) AS FLOAT64))");
            let pk_sum = format!("CAST(FARM_FINGERPRINT(CAST({pk_sql} AS STRING)) AS BIGNUMERIC)");
            Ok(format!(
                "COALESCE(CAST((SUM(DISTINCT {adjusted} + {pk_sum}) - SUM(DISTINCT {pk_sum})) AS FLOAT64) \
/ CAST(({factor}*1.0) AS FLOAT64), 0)"
            ))
        }
        other => Err(unsupported(other)),
    }
}

/// Distinct count of keys whose row has a non-null value
pub fn symmetric_count(sql: &str, pk_sql: &str) -> String {
    format!("NULLIF(COUNT(DISTINCT CASE WHEN {sql} IS NOT NULL THEN {pk_sql} ELSE NULL END),0)")
}

pub fn symmetric_average(sql: &str, pk_sql: &str, dialect: Dialect) -> Result<String> {
    let sum = symmetric_sum(sql, pk_sql, dialect)?;
    Ok(format!("({sum} / {})", symmetric_count(sql, pk_sql)))
}

fn unsupported(dialect: Dialect) -> MetricsLayerError {
    MetricsLayerError::Query(format!(
        "Symmetric aggregates are not supported in {dialect}. Use the 'sum' or 'average' type \
instead of 'sum_distinct' or 'average_distinct'."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_count() {
        assert_eq!(
            symmetric_count("orders.id", "orders.id"),
            "NULLIF(COUNT(DISTINCT CASE WHEN orders.id IS NOT NULL THEN orders.id ELSE NULL END),0)"
        );
    }

    #[test]
    fn test_symmetric_sum_snowflake() {
        let sql = symmetric_sum("orders.revenue", "orders.id", Dialect::Snowflake).unwrap();
        assert!(sql.starts_with("COALESCE(CAST((SUM(DISTINCT (CAST(FLOOR(COALESCE(orders.revenue, 0)"));
        assert!(sql.contains("TO_NUMBER(MD5(orders.id), 'XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX') % 1.0e27"));
        assert!(sql.ends_with("/ CAST((1000000*1.0) AS DOUBLE PRECISION), 0)"));
    }

    #[test]
    fn test_symmetric_sum_bigquery() {
        let sql = symmetric_sum("orders.revenue", "orders.id", Dialect::BigQuery).unwrap();
        assert!(sql.contains("FARM_FINGERPRINT(CAST(orders.id AS STRING)) AS BIGNUMERIC"));
        assert!(sql.contains("AS FLOAT64"));
    }

    #[test]
    fn test_unsupported_dialects() {
        assert!(!supports_symmetric_aggregates(Dialect::Druid));
        assert!(symmetric_sum("x", "id", Dialect::Druid).is_err());
        assert!(symmetric_average("x", "id", Dialect::SqlServer).is_err());
    }

    #[test]
    fn test_symmetric_average() {
        let sql = symmetric_average("o.v", "o.id", Dialect::Postgres).unwrap();
        assert!(sql.starts_with("(COALESCE("));
        assert!(sql.ends_with("ELSE NULL END),0))"));
    }
}
