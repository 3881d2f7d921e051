//! Filter model: generic criteria, column metadata and the trip filter.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::template::TemplateQuery;
use crate::transpiler::quote_literal;

/// Comparison operator of a single criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CriterionOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    LessThan,
    LessThanOrEquals,
    GreaterThan,
    GreaterThanOrEquals,
    Between,
}

impl CriterionOperator {
    /// Canonical name, as used in JSON output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Equals => "EQUALS",
            Self::NotEquals => "NOT_EQUALS",
            Self::In => "IN",
            Self::NotIn => "NOT_IN",
            Self::LessThan => "LESS_THAN",
            Self::LessThanOrEquals => "LESS_THAN_OR_EQUALS",
            Self::GreaterThan => "GREATER_THAN",
            Self::GreaterThanOrEquals => "GREATER_THAN_OR_EQUALS",
            Self::Between => "BETWEEN",
        }
    }
}

impl FromStr for CriterionOperator {
    type Err = String;

    /// Accepts symbols (`>=`) as well as names (`GREATER_THAN_OR_EQUALS`,
    /// `not in`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_ascii_uppercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_");
        let op = match normalized.as_str() {
            "=" | "==" | "EQUALS" | "EQ" => Self::Equals,
            "!=" | "<>" | "NOT_EQUALS" | "NE" => Self::NotEquals,
            "IN" => Self::In,
            "NOT_IN" => Self::NotIn,
            "<" | "LESS_THAN" | "LT" => Self::LessThan,
            "<=" | "LESS_THAN_OR_EQUALS" | "LTE" => Self::LessThanOrEquals,
            ">" | "GREATER_THAN" | "GT" => Self::GreaterThan,
            ">=" | "GREATER_THAN_OR_EQUALS" | "GTE" => Self::GreaterThanOrEquals,
            "BETWEEN" => Self::Between,
            _ => return Err(format!("Invalid operator: '{}'", s)),
        };
        Ok(op)
    }
}

impl TryFrom<String> for CriterionOperator {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CriterionOperator> for String {
    fn from(op: CriterionOperator) -> Self {
        op.name().to_string()
    }
}

impl fmt::Display for CriterionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator joining successive criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogicalOp {
    #[default]
    And,
    Or,
}

impl FromStr for LogicalOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" | "&&" => Ok(Self::And),
            "OR" | "||" => Ok(Self::Or),
            _ => Err(format!("Invalid logical operator: '{}'", s)),
        }
    }
}

impl TryFrom<String> for LogicalOp {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogicalOp> for String {
    fn from(op: LogicalOp) -> Self {
        match op {
            LogicalOp::And => "AND".to_string(),
            LogicalOp::Or => "OR".to_string(),
        }
    }
}

/// One condition on a named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriterion {
    pub name: String,
    pub operator: CriterionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    /// Restrict the criterion to one sheet. Unscoped criteria apply to
    /// every sheet that has the column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
}

impl FilterCriterion {
    pub fn new(name: impl Into<String>, operator: CriterionOperator) -> Self {
        Self {
            name: name.into(),
            operator,
            value: None,
            values: Vec::new(),
            sheet_name: None,
        }
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn sheet(mut self, sheet: impl Into<String>) -> Self {
        self.sheet_name = Some(sheet.into());
        self
    }

    /// The single value, ignoring blank strings.
    pub fn single_value(&self) -> Option<&str> {
        self.value.as_deref().filter(|v| !v.trim().is_empty())
    }

    /// Whether this criterion participates when filtering `sheet`.
    pub fn applies_to(&self, sheet: Option<&str>) -> bool {
        match (&self.sheet_name, sheet) {
            (None, _) => true,
            (Some(own), Some(requested)) => own.eq_ignore_ascii_case(requested),
            (Some(_), None) => false,
        }
    }
}

/// Criteria joined by one logical operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionFilter {
    #[serde(default)]
    pub criteria: Vec<FilterCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<LogicalOp>,
    /// Sheet the caller wants to read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_name: Option<String>,
    /// Stop the pipeline as soon as `sheet_name` is available.
    #[serde(default)]
    pub preview: bool,
}

impl ExtractionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn criterion(mut self, criterion: FilterCriterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn operator(mut self, operator: LogicalOp) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn preview(mut self, sheet: impl Into<String>) -> Self {
        self.sheet_name = Some(sheet.into());
        self.preview = true;
        self
    }

    /// The operator applied between every pair of rendered criteria.
    pub fn joiner(&self) -> LogicalOp {
        self.operator.unwrap_or_default()
    }

    /// Criteria that apply to `sheet`, in filter order.
    pub fn criteria_for<'a>(
        &'a self,
        sheet: Option<&'a str>,
    ) -> impl Iterator<Item = &'a FilterCriterion> + 'a {
        self.criteria.iter().filter(move |c| c.applies_to(sheet))
    }

    /// The sheet to stop at, when running as a preview.
    pub fn preview_sheet(&self) -> Option<&str> {
        if self.preview {
            self.sheet_name.as_deref()
        } else {
            None
        }
    }
}

/// Column type as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Numeric,
    Real,
    Float,
    Double,
    Boolean,
    Char,
    Varchar,
    Text,
    Date,
    Timestamp,
    Other(String),
}

impl SqlType {
    /// Map a database type name (`int4`, `VARCHAR(40)`, `double precision`).
    pub fn from_name(name: &str) -> Self {
        let base = name
            .split('(')
            .next()
            .unwrap_or(name)
            .trim()
            .to_ascii_uppercase();
        match base.as_str() {
            "INT2" | "SMALLINT" | "TINYINT" => Self::SmallInt,
            "INT" | "INT4" | "INTEGER" | "SERIAL" | "MEDIUMINT" => Self::Integer,
            "INT8" | "BIGINT" | "BIGSERIAL" => Self::BigInt,
            "DECIMAL" => Self::Decimal,
            "NUMERIC" | "NUMBER" | "NUM" => Self::Numeric,
            "REAL" | "FLOAT4" => Self::Real,
            "FLOAT" | "FLOAT8" => Self::Float,
            "DOUBLE" | "DOUBLE PRECISION" => Self::Double,
            "BOOL" | "BOOLEAN" => Self::Boolean,
            "CHAR" | "CHARACTER" | "BPCHAR" => Self::Char,
            "VARCHAR" | "CHARACTER VARYING" | "VARCHAR2" | "NVARCHAR" => Self::Varchar,
            "TEXT" | "CLOB" => Self::Text,
            "DATE" => Self::Date,
            "TIMESTAMP"
            | "TIMESTAMPTZ"
            | "DATETIME"
            | "TIMESTAMP WITHOUT TIME ZONE"
            | "TIMESTAMP WITH TIME ZONE" => Self::Timestamp,
            _ => Self::Other(name.trim().to_string()),
        }
    }

    /// Numeric literals are rendered unquoted.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::SmallInt
                | Self::Integer
                | Self::BigInt
                | Self::Decimal
                | Self::Numeric
                | Self::Real
                | Self::Float
                | Self::Double
        )
    }
}

impl From<String> for SqlType {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<SqlType> for String {
    fn from(ty: SqlType) -> Self {
        ty.to_string()
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SmallInt => "SMALLINT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Decimal => "DECIMAL",
            Self::Numeric => "NUMERIC",
            Self::Real => "REAL",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Boolean => "BOOLEAN",
            Self::Char => "CHAR",
            Self::Varchar => "VARCHAR",
            Self::Text => "TEXT",
            Self::Date => "DATE",
            Self::Timestamp => "TIMESTAMP",
            Self::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// A column of a materialized table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    pub sql_type: SqlType,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.sql_type.is_numeric()
    }
}

/// Filter on the source trips, applied inside the step templates through
/// group toggles and binds rather than by deleting rows afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripFilter {
    #[serde(default)]
    pub program_label: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Shorthand for a start/end date covering one calendar year.
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub location_ids: Vec<i64>,
    #[serde(default)]
    pub vessel_ids: Vec<i64>,
    #[serde(default)]
    pub trip_ids: Vec<i64>,
    #[serde(default)]
    pub recorder_department_id: Option<i64>,
}

impl TripFilter {
    fn start(&self) -> Option<NaiveDate> {
        self.start_date
            .or_else(|| self.year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)))
    }

    /// Last included day.
    fn end(&self) -> Option<NaiveDate> {
        self.end_date
            .or_else(|| self.year.and_then(|y| NaiveDate::from_ymd_opt(y, 12, 31)))
    }

    /// Toggle the filter groups and bind their values. Each group is
    /// enabled only when the matching field is set, so templates can
    /// reference the binds inside their groups only.
    ///
    /// `&endDate` is bound to the day after the last included day, to be
    /// used as an exclusive upper bound.
    pub fn apply(&self, query: TemplateQuery) -> TemplateQuery {
        let mut query = query
            .set_group("programFilter", self.program_label.is_some())
            .set_group("startDateFilter", self.start().is_some())
            .set_group("endDateFilter", self.end().is_some())
            .set_group("locationFilter", !self.location_ids.is_empty())
            .set_group("vesselFilter", !self.vessel_ids.is_empty())
            .set_group("tripFilter", !self.trip_ids.is_empty())
            .set_group("departmentFilter", self.recorder_department_id.is_some());

        if let Some(label) = &self.program_label {
            query = query.bind("progLabel", quote_literal(label));
        }
        if let Some(start) = self.start() {
            query = query.bind("startDate", quote_literal(&start.to_string()));
        }
        if let Some(end) = self.end() {
            let exclusive = end.succ_opt().unwrap_or(end);
            query = query.bind("endDate", quote_literal(&exclusive.to_string()));
        }
        if !self.location_ids.is_empty() {
            query = query.bind("locationIds", join_ids(&self.location_ids));
        }
        if !self.vessel_ids.is_empty() {
            query = query.bind("vesselIds", join_ids(&self.vessel_ids));
        }
        if !self.trip_ids.is_empty() {
            query = query.bind("tripIds", join_ids(&self.trip_ids));
        }
        if let Some(department) = self.recorder_department_id {
            query = query.bind("recDepId", department.to_string());
        }
        query
    }

    /// The calendar year covered, when the filter spans exactly one.
    pub fn single_year(&self) -> Option<i32> {
        match (self.start(), self.end()) {
            (Some(start), Some(end)) if start.year() == end.year() => Some(start.year()),
            _ => None,
        }
    }
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}
