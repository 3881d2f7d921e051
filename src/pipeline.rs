//! Table materialization pipeline.
//!
//! Runs the steps of a format one after the other. Each step renders its
//! template, creates `<prefix>_<contextId>` from it, counts the rows,
//! deletes the rows rejected by the generic filter and registers the table
//! under its sheet name.
//!
//! Every step is compiled before the first statement runs, so template
//! errors never leave tables behind.
//!
//! A failing statement aborts the run. Tables created so far stay in the
//! database and are listed by [`ExtractionContext::table_names`], for the
//! caller to drop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::context::{ExtractionContext, SheetTable, StepReport, StepState};
use crate::engine::{ColumnCatalog, StatementExecutor};
use crate::error::{ExtractionError, ExtractionResult, StoreError};
use crate::filter::{ExtractionFilter, TripFilter};
use crate::format::{FormatKey, FormatRegistry, ResolvedFormat, StepSpec};
use crate::loader::TemplateLoader;
use crate::template::{CompiledQuery, Compiler, TemplateQuery};
use crate::transpiler;

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builds and renders step queries, without touching the store.
pub struct Planner<'a, L> {
    registry: &'a FormatRegistry,
    compiler: Compiler<L>,
    trip_filter: TripFilter,
}

impl<'a, L: TemplateLoader> Planner<'a, L> {
    pub fn new(registry: &'a FormatRegistry, loader: L) -> Self {
        Self {
            registry,
            compiler: Compiler::new(loader),
            trip_filter: TripFilter::default(),
        }
    }

    /// Restrict the source trips read by every step template.
    pub fn with_trip_filter(mut self, trip_filter: TripFilter) -> Self {
        self.trip_filter = trip_filter;
        self
    }

    pub fn registry(&self) -> &FormatRegistry {
        self.registry
    }

    pub fn compiler(&self) -> &Compiler<L> {
        &self.compiler
    }

    /// Build the template query of one step, with every format override,
    /// the trip filter and the tables of `upstream` steps bound in.
    pub fn step_query(
        &self,
        format: &ResolvedFormat,
        step: &StepSpec,
        upstream: &BTreeMap<String, String>,
    ) -> ExtractionResult<TemplateQuery> {
        let mut query = format.template_query(&step.query)?;
        for (group, enabled) in &format.groups {
            query = query.set_group(group.clone(), *enabled);
        }
        for (name, value) in format.binds.iter().chain(upstream) {
            query = query.bind(name.clone(), value.clone());
        }
        Ok(self.trip_filter.apply(query))
    }

    /// Render the SQL of one step, assuming every earlier step produced
    /// its table.
    pub fn render_step(
        &self,
        context: &ExtractionContext,
        format: &FormatKey,
        sheet: &str,
    ) -> ExtractionResult<CompiledQuery> {
        let format = self.registry.format(format)?;
        let step = format.step(sheet).ok_or_else(|| {
            ExtractionError::config(format!("Format {} has no sheet {}", format.key, sheet))
        })?;
        let upstream = earlier_tables(context, format, step);
        let query = self.step_query(format, step, &upstream)?;
        Ok(self.compiler.compile(&query)?)
    }

    /// Compile every step of `format`, each with the tables of all earlier
    /// steps bound in. Fails on the first template, anchor or bind error.
    pub fn plan(
        &self,
        context: &ExtractionContext,
        format: &ResolvedFormat,
    ) -> ExtractionResult<Vec<PlannedStep>> {
        format
            .steps
            .iter()
            .map(|step| {
                let upstream = earlier_tables(context, format, step);
                let query = self.step_query(format, step, &upstream)?;
                let compiled = self.compiler.compile(&query)?;
                Ok(PlannedStep { upstream, compiled })
            })
            .collect()
    }
}

/// A step compiled ahead of the run.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// Upstream table binds the step was compiled with.
    pub upstream: BTreeMap<String, String>,
    pub compiled: CompiledQuery,
}

fn earlier_tables(
    context: &ExtractionContext,
    format: &ResolvedFormat,
    step: &StepSpec,
) -> BTreeMap<String, String> {
    format
        .steps
        .iter()
        .take_while(|s| s.sheet != step.sheet)
        .map(|s| (s.bind.clone(), context.table_name(&s.table)))
        .collect()
}

/// Runs format steps against a store.
pub struct Pipeline<'a, S, L> {
    store: &'a S,
    planner: Planner<'a, L>,
    cancel: CancelFlag,
}

impl<'a, S, L> Pipeline<'a, S, L>
where
    S: StatementExecutor + ColumnCatalog,
    L: TemplateLoader,
{
    pub fn new(store: &'a S, registry: &'a FormatRegistry, loader: L) -> Self {
        Self {
            store,
            planner: Planner::new(registry, loader),
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_trip_filter(mut self, trip_filter: TripFilter) -> Self {
        self.planner = self.planner.with_trip_filter(trip_filter);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn planner(&self) -> &Planner<'a, L> {
        &self.planner
    }

    /// Run every step of `format`, registering sheets into `context`.
    pub async fn run(
        &self,
        context: &mut ExtractionContext,
        filter: &ExtractionFilter,
        format: &FormatKey,
    ) -> ExtractionResult<()> {
        let format = self.planner.registry.format(format)?;
        let plan = self.planner.plan(context, format)?;
        context.set_format(format.key.clone());
        let preview = filter.preview_sheet();
        let started = Instant::now();

        info!("Extraction #{} - format {}", context.id(), format.key);

        let mut upstream: BTreeMap<String, String> = BTreeMap::new();
        for (step, planned) in format.steps.iter().zip(plan) {
            if let Some(sheet) = preview {
                if context.has_sheet(sheet) {
                    info!("Preview sheet {} ready, skipping remaining steps", sheet);
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                warn!("Extraction #{} cancelled before sheet {}", context.id(), step.sheet);
                return Err(ExtractionError::Cancelled {
                    sheet: step.sheet.clone(),
                });
            }

            if let Some(dependency) = &step.depends_on {
                if !context.has_sheet(dependency) {
                    let reason = format!("upstream sheet {} not available", dependency);
                    warn!("{} skipped: {}", step.sheet, reason);
                    context.record_step(StepReport {
                        sheet_name: step.sheet.clone(),
                        state: StepState::Skipped(reason),
                        inserted: 0,
                        removed: 0,
                        elapsed_ms: 0,
                    });
                    continue;
                }
            }

            let compiled = if planned.upstream == upstream {
                planned.compiled
            } else {
                let query = self.planner.step_query(format, step, &upstream)?;
                self.planner.compiler.compile(&query)?
            };
            let report = self.run_step(context, step, compiled, filter).await?;
            if report.state == StepState::Registered {
                upstream.insert(step.bind.clone(), context.table_name(&step.table));
            }
            context.record_step(report);
        }

        info!(
            "Extraction #{} finished: sheets {:?} (in {} ms)",
            context.id(),
            context.sheet_names(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn run_step(
        &self,
        context: &mut ExtractionContext,
        step: &StepSpec,
        compiled: CompiledQuery,
        filter: &ExtractionFilter,
    ) -> ExtractionResult<StepReport> {
        let started = Instant::now();
        let table = context.table_name(&step.table);
        let fail = |e: StoreError| ExtractionError::SqlExecution {
            sheet: step.sheet.clone(),
            template: compiled.template.clone(),
            message: e.to_string(),
        };

        let create = format!("CREATE TABLE {} AS {}", table, compiled.sql.trim());
        debug!("{} SQL: {}", step.sheet, create);
        self.store.execute_update(&create).await.map_err(fail)?;
        context.record_created(&table);

        let inserted = self
            .store
            .query_count(&format!("SELECT COUNT(*) FROM {}", table))
            .await
            .map_err(fail)?;

        let mut columns = None;
        let mut removed = 0;
        if inserted > 0 && !filter.criteria.is_empty() {
            let table_columns = self.store.columns(&table).await.map_err(fail)?;
            let condition = transpiler::condition(&table_columns, filter, Some(&step.sheet), None)?;
            if !condition.is_empty() {
                let delete = format!(
                    "DELETE FROM {} WHERE CASE WHEN {} THEN 0 ELSE 1 END = 1",
                    table, condition
                );
                removed = self.store.execute_update(&delete).await.map_err(fail)?;
            }
            columns = Some(table_columns);
        }
        let rows = inserted.saturating_sub(removed);

        info!(
            "{} table: {} rows inserted, {} removed by filter (in {} ms)",
            step.sheet,
            inserted,
            removed,
            started.elapsed().as_millis()
        );

        let state = if rows > 0 || step.keep_empty {
            let names = match columns {
                Some(columns) => columns.into_iter().map(|c| c.name).collect(),
                None => self.store.column_names(&table).await.map_err(fail)?,
            };
            let visible_columns = names
                .into_iter()
                .filter(|name| {
                    !compiled
                        .hidden_columns
                        .iter()
                        .any(|hidden| hidden.eq_ignore_ascii_case(name))
                })
                .collect();
            context.register(SheetTable {
                sheet_name: step.sheet.clone(),
                table_name: table,
                visible_columns,
                hidden_columns: compiled.hidden_columns.clone(),
                distinct: compiled.has_distinct,
                row_count: rows,
            });
            StepState::Registered
        } else {
            warn!("{} skipped: no rows", step.sheet);
            StepState::Skipped("no rows".to_string())
        };

        Ok(StepReport {
            sheet_name: step.sheet.clone(),
            state,
            inserted,
            removed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
