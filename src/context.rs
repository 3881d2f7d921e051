//! Extraction context: what one pipeline run produced.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::format::FormatKey;

/// A registered sheet and the table holding its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetTable {
    pub sheet_name: String,
    pub table_name: String,
    pub visible_columns: Vec<String>,
    pub hidden_columns: Vec<String>,
    pub distinct: bool,
    pub row_count: u64,
}

/// Final state of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum StepState {
    Registered,
    Skipped(String),
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub sheet_name: String,
    pub state: StepState,
    /// Rows inserted before filtering.
    pub inserted: u64,
    /// Rows deleted by the generic filter.
    pub removed: u64,
    pub elapsed_ms: u64,
}

/// Registry built over one run.
///
/// Every table the run creates is recorded here as soon as it exists,
/// registered or not, so an external cleanup job can drop them even when
/// the run fails half-way.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionContext {
    id: i64,
    format: Option<FormatKey>,
    sheets: Vec<SheetTable>,
    created_tables: Vec<String>,
    steps: Vec<StepReport>,
}

impl ExtractionContext {
    /// `id` keys the temporary table names; concurrent runs must use
    /// distinct ids.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            format: None,
            sheets: Vec::new(),
            created_tables: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// A context keyed by the current time in milliseconds, bumped past
    /// the last id handed out in this process.
    pub fn now() -> Self {
        static LAST_ID: AtomicI64 = AtomicI64::new(0);
        let millis = chrono::Utc::now().timestamp_millis();
        let previous = LAST_ID
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(millis.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        Self::new(millis.max(previous + 1))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn format(&self) -> Option<&FormatKey> {
        self.format.as_ref()
    }

    pub fn set_format(&mut self, format: FormatKey) {
        self.format = Some(format);
    }

    /// Temporary table name for a step prefix.
    pub fn table_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.id).to_ascii_lowercase()
    }

    pub(crate) fn record_created(&mut self, table: &str) {
        if !self.created_tables.iter().any(|t| t == table) {
            self.created_tables.push(table.to_string());
        }
    }

    pub(crate) fn record_step(&mut self, report: StepReport) {
        self.steps.push(report);
    }

    /// Register (or replace) a sheet.
    pub fn register(&mut self, sheet: SheetTable) {
        match self.sheets.iter_mut().find(|s| s.sheet_name == sheet.sheet_name) {
            Some(existing) => *existing = sheet,
            None => self.sheets.push(sheet),
        }
    }

    pub fn sheet(&self, name: &str) -> Option<&SheetTable> {
        self.sheets.iter().find(|s| s.sheet_name.eq_ignore_ascii_case(name))
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.sheet(name).is_some()
    }

    pub fn sheets(&self) -> &[SheetTable] {
        &self.sheets
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.sheet_name.as_str()).collect()
    }

    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    /// Every table created by the run, in creation order.
    pub fn table_names(&self) -> &[String] {
        &self.created_tables
    }

    /// Tables that were created but not registered under a sheet.
    pub fn unregistered_tables(&self) -> Vec<&str> {
        self.created_tables
            .iter()
            .filter(|t| !self.sheets.iter().any(|s| &s.table_name == *t))
            .map(String::as_str)
            .collect()
    }

    /// Forget a table once the cleanup collaborator has dropped it.
    pub fn forget_table(&mut self, table: &str) {
        self.created_tables.retain(|t| t != table);
        self.sheets.retain(|s| s.table_name != table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(name: &str, table: &str) -> SheetTable {
        SheetTable {
            sheet_name: name.to_string(),
            table_name: table.to_string(),
            visible_columns: vec!["trip_code".to_string()],
            hidden_columns: Vec::new(),
            distinct: false,
            row_count: 3,
        }
    }

    #[test]
    fn test_table_names_are_keyed_by_id() {
        let ctx = ExtractionContext::new(1700000000123);
        assert_eq!(ctx.table_name("EXT_TR"), "ext_tr_1700000000123");
    }

    #[test]
    fn test_now_ids_are_unique() {
        let first = ExtractionContext::now();
        let second = ExtractionContext::now();
        assert!(second.id() > first.id());
        assert_ne!(first.table_name("ext_tr"), second.table_name("ext_tr"));
    }

    #[test]
    fn test_register_and_lookup() {
        let mut ctx = ExtractionContext::new(7);
        ctx.record_created("ext_tr_7");
        ctx.register(sheet("TR", "ext_tr_7"));
        assert!(ctx.has_sheet("tr"));
        assert_eq!(ctx.sheet_names(), vec!["TR"]);

        let mut replaced = sheet("TR", "ext_tr_7");
        replaced.row_count = 1;
        ctx.register(replaced);
        assert_eq!(ctx.sheets().len(), 1);
        assert_eq!(ctx.sheet("TR").unwrap().row_count, 1);
    }

    #[test]
    fn test_unregistered_tables_are_tracked() {
        let mut ctx = ExtractionContext::new(7);
        ctx.record_created("ext_tr_7");
        ctx.record_created("ext_hh_7");
        ctx.record_created("ext_hh_7");
        ctx.register(sheet("TR", "ext_tr_7"));

        assert_eq!(ctx.table_names(), ["ext_tr_7", "ext_hh_7"]);
        assert_eq!(ctx.unregistered_tables(), vec!["ext_hh_7"]);

        ctx.forget_table("ext_tr_7");
        assert!(!ctx.has_sheet("TR"));
        assert_eq!(ctx.table_names(), ["ext_hh_7"]);
    }

    #[test]
    fn test_context_serializes_to_json() {
        let mut ctx = ExtractionContext::new(1);
        ctx.register(sheet("TR", "ext_tr_1"));
        ctx.record_step(StepReport {
            sheet_name: "HH".to_string(),
            state: StepState::Skipped("no rows".to_string()),
            inserted: 0,
            removed: 0,
            elapsed_ms: 2,
        });
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["sheets"][0]["tableName"], "ext_tr_1");
        assert_eq!(json["steps"][0]["state"]["state"], "skipped");
        assert_eq!(json["steps"][0]["state"]["reason"], "no rows");
    }
}
