//! SQL template compiler.
//!
//! Turns a [`TemplateQuery`] (template path, binds, group toggles and
//! injections) into final SQL text plus the list of columns hidden by
//! disabled groups.
//!
//! # Example
//!
//! ```
//! use extraction::loader::MemoryLoader;
//! use extraction::template::{Compiler, TemplateQuery};
//!
//! let loader = MemoryLoader::new()
//!     .with("trip", "SELECT T.id[[group:vessel columns=vessel]], V.name AS vessel[[/group]] FROM &tripTable T");
//! let compiler = Compiler::new(loader);
//!
//! let query = TemplateQuery::new("trip")
//!     .bind("tripTable", "ext_tr_1")
//!     .set_group("vessel", false);
//! let compiled = compiler.compile(&query).unwrap();
//! assert_eq!(compiled.sql, "SELECT T.id FROM ext_tr_1 T");
//! assert_eq!(compiled.hidden_columns, vec!["vessel"]);
//! ```

use std::collections::BTreeMap;

use crate::ast::{Node, Template};
use crate::error::TemplateError;
use crate::loader::TemplateLoader;
use crate::parser;

/// A template reference with everything needed to render it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemplateQuery {
    path: String,
    binds: BTreeMap<String, String>,
    groups: BTreeMap<String, bool>,
    injections: Vec<Injection>,
}

/// Another template spliced into a parent, at the end or before an anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub query: TemplateQuery,
    pub anchor: Option<String>,
}

/// The rendered SQL of a template tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    /// Path of the root template.
    pub template: String,
    pub sql: String,
    /// Columns contributed by disabled groups, in document order.
    pub hidden_columns: Vec<String>,
    /// Whether the root template rendered a `[[distinct]]` marker.
    pub has_distinct: bool,
}

impl TemplateQuery {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Substitute every `&name` with `value`, verbatim.
    ///
    /// The value is not escaped: quote literals with
    /// [`crate::transpiler::quote_literal`] before binding them.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.binds.insert(name.into(), value.into());
        self
    }

    /// Enable or disable a group. Names the template does not declare are
    /// ignored.
    pub fn set_group(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.groups.insert(name.into(), enabled);
        self
    }

    /// Append the compiled SQL of `query` at the end of this template.
    pub fn inject_query(mut self, query: TemplateQuery) -> Self {
        self.injections.push(Injection {
            query,
            anchor: None,
        });
        self
    }

    /// Splice the compiled SQL of `query` immediately before `anchor`.
    pub fn inject_query_at(mut self, query: TemplateQuery, anchor: impl Into<String>) -> Self {
        self.injections.push(Injection {
            query,
            anchor: Some(anchor.into()),
        });
        self
    }

    pub fn binds(&self) -> &BTreeMap<String, String> {
        &self.binds
    }

    pub fn groups(&self) -> &BTreeMap<String, bool> {
        &self.groups
    }

    pub fn injections(&self) -> &[Injection] {
        &self.injections
    }
}

/// Compiles template queries using a loader.
///
/// Compilation is pure: every call re-reads and re-parses the templates it
/// touches and shares no state with other calls.
#[derive(Debug, Clone)]
pub struct Compiler<L> {
    loader: L,
}

impl<L: TemplateLoader> Compiler<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Load and parse a single template.
    pub fn template(&self, path: &str) -> Result<Template, TemplateError> {
        let text = self.loader.load(path)?;
        parser::parse(path, &text)
    }

    /// Render `query` and all of its injections.
    pub fn compile(&self, query: &TemplateQuery) -> Result<CompiledQuery, TemplateError> {
        let fragment = self.fragment(query, &BTreeMap::new(), &BTreeMap::new())?;
        Ok(CompiledQuery {
            template: query.path.clone(),
            sql: fragment.render(),
            hidden_columns: fragment.hidden,
            has_distinct: fragment.distinct,
        })
    }

    /// Render one template of the tree. Groups and binds set on a parent
    /// apply to its injections unless the injection overrides them.
    fn fragment(
        &self,
        query: &TemplateQuery,
        parent_groups: &BTreeMap<String, bool>,
        parent_binds: &BTreeMap<String, String>,
    ) -> Result<Fragment, TemplateError> {
        let template = self.template(&query.path)?;

        let mut groups = parent_groups.clone();
        groups.extend(query.groups.iter().map(|(k, v)| (k.clone(), *v)));
        let mut binds = parent_binds.clone();
        binds.extend(query.binds.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut fragment = Fragment::default();
        let scope = Scope {
            path: &template.path,
            groups: &groups,
            binds: &binds,
        };
        scope.render(&template.nodes, &mut fragment)?;

        for injection in &query.injections {
            let injected = self.fragment(&injection.query, &groups, &binds)?;
            fragment.splice(injected, injection, &query.path)?;
        }

        Ok(fragment)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Sql(String),
    Anchor(String),
}

#[derive(Debug, Default)]
struct Fragment {
    pieces: Vec<Piece>,
    hidden: Vec<String>,
    distinct: bool,
}

impl Fragment {
    fn hide(&mut self, column: &str) {
        if !self.hidden.iter().any(|c| c == column) {
            self.hidden.push(column.to_string());
        }
    }

    fn splice(
        &mut self,
        injected: Fragment,
        injection: &Injection,
        path: &str,
    ) -> Result<(), TemplateError> {
        match &injection.anchor {
            None => self.pieces.extend(injected.pieces),
            Some(anchor) => {
                let at = self
                    .pieces
                    .iter()
                    .position(|p| matches!(p, Piece::Anchor(a) if a == anchor))
                    .ok_or_else(|| TemplateError::MissingAnchor {
                        path: path.to_string(),
                        anchor: anchor.clone(),
                        injected: injection.query.path.clone(),
                    })?;
                let tail = self.pieces.split_off(at);
                self.pieces.extend(injected.pieces);
                self.pieces.extend(tail);
            }
        }
        for column in &injected.hidden {
            self.hide(column);
        }
        Ok(())
    }

    fn render(&self) -> String {
        self.pieces
            .iter()
            .filter_map(|p| match p {
                Piece::Sql(sql) => Some(sql.as_str()),
                Piece::Anchor(_) => None,
            })
            .collect()
    }
}

struct Scope<'a> {
    path: &'a str,
    groups: &'a BTreeMap<String, bool>,
    binds: &'a BTreeMap<String, String>,
}

impl Scope<'_> {
    fn render(&self, nodes: &[Node], out: &mut Fragment) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(text) => out.pieces.push(Piece::Sql(text.clone())),
                Node::Bind(name) => {
                    let value =
                        self.binds
                            .get(name)
                            .ok_or_else(|| TemplateError::UnboundPlaceholder {
                                path: self.path.to_string(),
                                name: name.clone(),
                            })?;
                    out.pieces.push(Piece::Sql(value.clone()));
                }
                Node::Anchor(name) => out.pieces.push(Piece::Anchor(name.clone())),
                Node::Distinct => {
                    out.distinct = true;
                    out.pieces.push(Piece::Sql("DISTINCT".to_string()));
                }
                Node::Group(group) => {
                    let enabled = self.groups.get(&group.name).copied().unwrap_or(group.enabled);
                    if enabled {
                        self.render(&group.children, out)?;
                    } else {
                        for column in group.all_columns() {
                            out.hide(column);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;
    use pretty_assertions::assert_eq;

    const STATION: &str = "SELECT S.id AS station_number,\n\
        [[group:gearType columns=gearType]]  G.label AS gear_type,\n[[/group]]\
        [[anchor:beforeLengthCode]]  S.length_code AS length_code\n\
        FROM &stationSource S";

    fn compiler() -> Compiler<MemoryLoader> {
        Compiler::new(
            MemoryLoader::new()
                .with("rdb/station", STATION)
                .with("cost/station", "  S.mesh_size AS mesh_size,\n[[anchor:afterMesh]]")
                .with("cost/selection", "  S.selection_device AS selection_device,\n")
                .with("pmfm/trailer", "\nWHERE S.program = &program"),
        )
    }

    fn station() -> TemplateQuery {
        TemplateQuery::new("rdb/station").bind("stationSource", "operation")
    }

    #[test]
    fn test_default_render_is_idempotent() {
        let compiler = compiler();
        let first = compiler.compile(&station()).unwrap();
        let second = compiler.compile(&station()).unwrap();
        assert_eq!(first, second);
        assert!(first.sql.contains("G.label AS gear_type"));
        assert!(first.hidden_columns.is_empty());
        assert!(!first.has_distinct);
    }

    #[test]
    fn test_disabling_group_hides_columns() {
        let compiled = compiler()
            .compile(&station().set_group("gearType", false))
            .unwrap();
        assert!(!compiled.sql.contains("gear_type"));
        assert_eq!(compiled.hidden_columns, vec!["gearType"]);
    }

    #[test]
    fn test_toggle_round_trip_restores_sql() {
        let compiler = compiler();
        let original = compiler.compile(&station()).unwrap();
        let toggled = compiler
            .compile(&station().set_group("gearType", false).set_group("gearType", true))
            .unwrap();
        assert_eq!(toggled.sql, original.sql);
        assert!(!toggled.hidden_columns.contains(&"gearType".to_string()));
    }

    #[test]
    fn test_unknown_group_is_ignored() {
        let compiler = compiler();
        let compiled = compiler
            .compile(&station().set_group("survivalTest", false))
            .unwrap();
        assert_eq!(compiled, compiler.compile(&station()).unwrap());
    }

    #[test]
    fn test_injection_before_anchor() {
        let compiled = compiler()
            .compile(
                &station()
                    .set_group("gearType", false)
                    .inject_query_at(TemplateQuery::new("cost/station"), "beforeLengthCode"),
            )
            .unwrap();

        assert!(!compiled.sql.contains("gear_type"));
        let mesh = compiled.sql.find("S.mesh_size").unwrap();
        let length = compiled.sql.find("S.length_code").unwrap();
        assert!(mesh < length);
        assert_eq!(compiled.hidden_columns, vec!["gearType"]);
    }

    #[test]
    fn test_injection_appends_without_anchor() {
        let compiled = compiler()
            .compile(
                &station()
                    .bind("program", "'SIH-OBSMER'")
                    .inject_query(TemplateQuery::new("pmfm/trailer")),
            )
            .unwrap();
        assert!(compiled.sql.ends_with("FROM operation S\nWHERE S.program = 'SIH-OBSMER'"));
    }

    #[test]
    fn test_injection_is_transitive() {
        let nested = TemplateQuery::new("cost/station")
            .inject_query_at(TemplateQuery::new("cost/selection"), "afterMesh");
        let compiled = compiler()
            .compile(&station().inject_query_at(nested, "beforeLengthCode"))
            .unwrap();
        let mesh = compiled.sql.find("mesh_size").unwrap();
        let selection = compiled.sql.find("selection_device").unwrap();
        let length = compiled.sql.find("length_code").unwrap();
        assert!(mesh < selection && selection < length);
    }

    #[test]
    fn test_injected_anchor_is_usable_by_later_injection() {
        let compiled = compiler()
            .compile(
                &station()
                    .inject_query_at(TemplateQuery::new("cost/station"), "beforeLengthCode")
                    .inject_query_at(TemplateQuery::new("cost/selection"), "afterMesh"),
            )
            .unwrap();
        assert!(
            compiled.sql.find("mesh_size").unwrap() < compiled.sql.find("selection_device").unwrap()
        );
    }

    #[test]
    fn test_injection_inherits_and_overrides_binds() {
        let compiler = compiler();
        let inherited = compiler
            .compile(
                &station()
                    .bind("program", "'A'")
                    .inject_query(TemplateQuery::new("pmfm/trailer")),
            )
            .unwrap();
        assert!(inherited.sql.ends_with("= 'A'"));

        let overridden = compiler
            .compile(
                &station()
                    .bind("program", "'A'")
                    .inject_query(TemplateQuery::new("pmfm/trailer").bind("program", "'B'")),
            )
            .unwrap();
        assert!(overridden.sql.ends_with("= 'B'"));
    }

    #[test]
    fn test_missing_anchor_is_an_error() {
        let err = compiler()
            .compile(&station().inject_query_at(TemplateQuery::new("cost/station"), "nowhere"))
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingAnchor {
                path: "rdb/station".to_string(),
                anchor: "nowhere".to_string(),
                injected: "cost/station".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_injection_template_fails_compile() {
        let err = compiler()
            .compile(&station().inject_query(TemplateQuery::new("free2/missing")))
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::NotFound {
                path: "free2/missing".to_string()
            }
        );
    }

    #[test]
    fn test_unbound_placeholder() {
        let err = compiler()
            .compile(&TemplateQuery::new("rdb/station"))
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnboundPlaceholder {
                path: "rdb/station".to_string(),
                name: "stationSource".to_string(),
            }
        );
    }

    #[test]
    fn test_placeholder_in_disabled_group_needs_no_value() {
        let compiler = Compiler::new(
            MemoryLoader::new().with("t", "SELECT 1[[group:prog off]] WHERE p = &progLabel[[/group]]"),
        );
        let compiled = compiler.compile(&TemplateQuery::new("t")).unwrap();
        assert_eq!(compiled.sql, "SELECT 1");
        assert!(compiled.hidden_columns.is_empty());
    }

    #[test]
    fn test_nested_disabled_group_hides_inner_columns() {
        let compiler = Compiler::new(MemoryLoader::new().with(
            "t",
            "SELECT [[group:vessel columns=vessel_type]]V.type AS vessel_type, [[group:size columns=vessel_size]]V.size AS vessel_size, [[/group]][[/group]]T.id",
        ));
        let compiled = compiler
            .compile(&TemplateQuery::new("t").set_group("vessel", false))
            .unwrap();
        assert_eq!(compiled.sql, "SELECT T.id");
        assert_eq!(compiled.hidden_columns, vec!["vessel_type", "vessel_size"]);
    }

    #[test]
    fn test_distinct_flag() {
        let compiler = Compiler::new(
            MemoryLoader::new().with("t", "SELECT [[group:d]][[distinct]] [[/group]]a FROM b"),
        );
        let compiled = compiler.compile(&TemplateQuery::new("t")).unwrap();
        assert_eq!(compiled.sql, "SELECT DISTINCT a FROM b");
        assert!(compiled.has_distinct);

        let plain = compiler
            .compile(&TemplateQuery::new("t").set_group("d", false))
            .unwrap();
        assert_eq!(plain.sql, "SELECT a FROM b");
        assert!(!plain.has_distinct);
    }
}
