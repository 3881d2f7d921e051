//! Filter-to-SQL translator.
//!
//! Converts an [`ExtractionFilter`] into a WHERE fragment for one table,
//! using the table's column metadata to decide how literals are written.

use tracing::debug;

use crate::error::{ExtractionError, ExtractionResult};
use crate::filter::{
    ColumnMetadata, CriterionOperator, ExtractionFilter, FilterCriterion, LogicalOp,
};

/// Trait for converting filter nodes to SQL.
pub trait ToSql {
    /// Convert this node to a SQL string.
    fn to_sql(&self) -> String;
}

impl ToSql for CriterionOperator {
    fn to_sql(&self) -> String {
        match self {
            CriterionOperator::Equals => "=",
            CriterionOperator::NotEquals => "!=",
            CriterionOperator::In => "IN",
            CriterionOperator::NotIn => "NOT IN",
            CriterionOperator::LessThan => "<",
            CriterionOperator::LessThanOrEquals => "<=",
            CriterionOperator::GreaterThan => ">",
            CriterionOperator::GreaterThanOrEquals => ">=",
            CriterionOperator::Between => "BETWEEN",
        }
        .to_string()
    }
}

impl ToSql for LogicalOp {
    fn to_sql(&self) -> String {
        match self {
            LogicalOp::And => "AND".to_string(),
            LogicalOp::Or => "OR".to_string(),
        }
    }
}

/// Quote a string literal, doubling embedded single quotes.
///
/// Every caller-supplied string that ends up in rendered SQL goes through
/// this function.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render `raw` as a literal for `column`: unquoted for numeric columns
/// (which must hold a plain number), quoted otherwise.
pub fn literal(column: &ColumnMetadata, raw: &str) -> ExtractionResult<String> {
    if column.is_numeric() {
        let trimmed = raw.trim();
        if is_number(trimmed) {
            Ok(trimmed.to_string())
        } else {
            Err(ExtractionError::criterion(
                &column.name,
                format!("'{}' is not a number (column type {})", raw, column.sql_type),
            ))
        }
    } else {
        Ok(quote_literal(raw))
    }
}

fn is_number(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
        && s.parse::<f64>().is_ok()
}

/// Render one criterion against a resolved column.
pub fn criterion_sql(
    column: &ColumnMetadata,
    criterion: &FilterCriterion,
    alias: Option<&str>,
) -> ExtractionResult<String> {
    let col = match alias {
        Some(alias) => format!("{}.{}", alias, column.name),
        None => column.name.clone(),
    };
    let op = criterion.operator;
    let value = criterion.single_value();
    let values = &criterion.values;

    match op {
        CriterionOperator::In | CriterionOperator::NotIn => {
            let items: Vec<&str> = if !values.is_empty() {
                values.iter().map(String::as_str).collect()
            } else if let Some(v) = value {
                vec![v]
            } else {
                return Err(ExtractionError::criterion(
                    &criterion.name,
                    format!("{} requires at least one value", op),
                ));
            };
            let literals = items
                .into_iter()
                .map(|v| literal(column, v))
                .collect::<ExtractionResult<Vec<_>>>()?;
            Ok(format!("{} {} ({})", col, op.to_sql(), literals.join(",")))
        }
        _ if value.is_none() && values.is_empty() => match op {
            CriterionOperator::NotEquals => Ok(format!("{} IS NOT NULL", col)),
            _ => Ok(format!("{} IS NULL", col)),
        },
        CriterionOperator::Between => {
            if values.len() != 2 {
                return Err(ExtractionError::criterion(
                    &criterion.name,
                    format!("BETWEEN requires exactly two values, got {}", values.len()),
                ));
            }
            Ok(format!(
                "{} BETWEEN {} AND {}",
                col,
                literal(column, &values[0])?,
                literal(column, &values[1])?
            ))
        }
        _ => {
            let raw = value.or_else(|| values.first().map(String::as_str)).unwrap_or_default();
            Ok(format!("{} {} {}", col, op.to_sql(), literal(column, raw)?))
        }
    }
}

/// Render the criteria of `filter` that apply to `sheet`, joined by the
/// filter's single logical operator. Empty when nothing applies.
///
/// Column names match case-insensitively. A criterion whose column is
/// missing from `columns` is skipped, unless it is scoped to a sheet, in
/// which case the table must have the column.
pub fn condition(
    columns: &[ColumnMetadata],
    filter: &ExtractionFilter,
    sheet: Option<&str>,
    alias: Option<&str>,
) -> ExtractionResult<String> {
    let mut parts = Vec::new();

    for criterion in filter.criteria_for(sheet) {
        let column = columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&criterion.name));
        let column = match column {
            Some(column) => column,
            None if criterion.sheet_name.is_some() => {
                return Err(ExtractionError::criterion(
                    &criterion.name,
                    format!(
                        "no such column in sheet {}",
                        criterion.sheet_name.as_deref().unwrap_or_default()
                    ),
                ));
            }
            None => {
                debug!("Skipping criterion on unknown column '{}'", criterion.name);
                continue;
            }
        };
        parts.push(criterion_sql(column, criterion, alias)?);
    }

    let joiner = format!(" {} ", filter.joiner().to_sql());
    Ok(parts.join(&joiner))
}

/// Like [`condition`], prefixed with ` WHERE ` when not empty.
pub fn where_clause(
    columns: &[ColumnMetadata],
    filter: &ExtractionFilter,
    sheet: Option<&str>,
    alias: Option<&str>,
) -> ExtractionResult<String> {
    let condition = condition(columns, filter, sheet, alias)?;
    if condition.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!(" WHERE {}", condition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SqlType;
    use pretty_assertions::assert_eq;

    fn columns() -> Vec<ColumnMetadata> {
        vec![
            ColumnMetadata::new("id", SqlType::Integer),
            ColumnMetadata::new("sex", SqlType::Varchar),
            ColumnMetadata::new("weight", SqlType::Double),
        ]
    }

    fn crit(name: &str, op: &str) -> FilterCriterion {
        FilterCriterion::new(name, op.parse().unwrap())
    }

    fn render(criterion: FilterCriterion) -> ExtractionResult<String> {
        condition(&columns(), &ExtractionFilter::new().criterion(criterion), None, None)
    }

    #[test]
    fn test_numeric_literal_unquoted() {
        assert_eq!(render(crit("id", "=").value("5")).unwrap(), "id = 5");
    }

    #[test]
    fn test_string_literal_quoted() {
        assert_eq!(render(crit("sex", "=").value("M")).unwrap(), "sex = 'M'");
    }

    #[test]
    fn test_where_clause_with_alias() {
        let filter: ExtractionFilter = serde_json::from_str(
            r#"{"criteria":[{"name":"id","operator":">=","value":"10"}],"operator":"AND"}"#,
        )
        .unwrap();
        let clause = where_clause(&columns()[..2], &filter, None, Some("t")).unwrap();
        assert_eq!(clause, " WHERE t.id >= 10");
    }

    #[test]
    fn test_empty_where_clause() {
        assert_eq!(where_clause(&columns(), &ExtractionFilter::new(), None, None).unwrap(), "");
    }

    #[test]
    fn test_missing_value_renders_null_checks() {
        assert_eq!(render(crit("sex", "=")).unwrap(), "sex IS NULL");
        assert_eq!(render(crit("sex", "!=")).unwrap(), "sex IS NOT NULL");
        assert_eq!(render(crit("id", ">")).unwrap(), "id IS NULL");
    }

    #[test]
    fn test_in_lists() {
        assert_eq!(
            render(crit("sex", "IN").values(["M", "F"])).unwrap(),
            "sex IN ('M','F')"
        );
        assert_eq!(render(crit("id", "NOT IN").values(["1", "2"])).unwrap(), "id NOT IN (1,2)");
        assert_eq!(render(crit("id", "IN").value("7")).unwrap(), "id IN (7)");
    }

    #[test]
    fn test_in_without_values_is_invalid() {
        let err = render(crit("id", "IN")).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidCriterion { .. }));
        let err = render(crit("id", "NOT_IN")).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidCriterion { .. }));
    }

    #[test]
    fn test_between() {
        assert_eq!(
            render(crit("weight", "BETWEEN").values(["1.5", "3"])).unwrap(),
            "weight BETWEEN 1.5 AND 3"
        );
        let err = render(crit("weight", "BETWEEN").values(["1.5"])).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidCriterion { .. }));
    }

    #[test]
    fn test_comparison_falls_back_to_first_value() {
        assert_eq!(render(crit("id", "<").values(["3"])).unwrap(), "id < 3");
    }

    #[test]
    fn test_non_numeric_value_for_numeric_column() {
        let err = render(crit("id", "=").value("1 OR 1=1")).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidCriterion { .. }));
        assert!(render(crit("id", "=").value("NaN")).is_err());
    }

    #[test]
    fn test_quotes_are_escaped() {
        assert_eq!(
            render(crit("sex", "=").value("x' OR '1'='1")).unwrap(),
            "sex = 'x'' OR ''1''=''1'"
        );
    }

    #[test]
    fn test_uniform_joiner_preserves_order() {
        let filter = ExtractionFilter::new()
            .criterion(crit("sex", "=").value("F"))
            .criterion(crit("id", ">").value("3"))
            .criterion(crit("weight", "<").value("10"))
            .operator(LogicalOp::Or);
        assert_eq!(
            condition(&columns(), &filter, None, None).unwrap(),
            "sex = 'F' OR id > 3 OR weight < 10"
        );
    }

    #[test]
    fn test_sheet_scoping_and_unknown_columns() {
        let filter = ExtractionFilter::new()
            .criterion(crit("vessel_type", "=").value("1"))
            .criterion(crit("id", "=").value("1").sheet("TR"))
            .criterion(crit("sex", "=").value("M").sheet("HL"))
            .criterion(crit("ID", "!=").value("2"));

        assert_eq!(
            condition(&columns(), &filter, Some("HL"), None).unwrap(),
            "sex = 'M' AND id != 2"
        );
        assert_eq!(
            condition(&columns(), &filter, None, None).unwrap(),
            "id != 2"
        );
    }

    #[test]
    fn test_scoped_unknown_column_is_invalid() {
        let filter =
            ExtractionFilter::new().criterion(crit("length_class", "=").value("10").sheet("HL"));
        let err = condition(&columns(), &filter, Some("HL"), None).unwrap_err();
        assert!(err.to_string().contains("length_class"));
        // Scoped to another sheet: not applicable, not an error.
        assert_eq!(condition(&columns(), &filter, Some("TR"), None).unwrap(), "");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("M"), "'M'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(""), "''");
    }
}
