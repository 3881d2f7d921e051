//! Format catalog and override-then-delegate template resolution.
//!
//! Each export variant is a [`FormatSpec`]: a (name, version) pair, an
//! optional parent, and only the pieces it changes. The
//! [`FormatRegistry`] flattens every chain into an explicit lookup table
//! keyed by `(format, version, query)` when it is built, so a format whose
//! queries cannot be resolved is rejected at startup.
//!
//! ```toml
//! [[format]]
//! name = "RJB"
//! version = "1.0"
//! parent = { name = "RDB", version = "1.3" }
//!
//! [format.queries]
//! injectionTripTable = "rjb/v1_0/injectionTripTable"
//!
//! [[format.injections]]
//! into = "createTripTable"
//! query = "injectionTripTable"
//! anchor = "afterVesselIdentifier"
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExtractionError, ExtractionResult};
use crate::loader::TemplateLoader;
use crate::parser;
use crate::template::TemplateQuery;

/// Identity of one format version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatKey {
    pub name: String,
    pub version: String,
}

impl FormatKey {
    /// Format names are case-insensitive and stored upper-case.
    pub fn new(name: impl AsRef<str>, version: impl Into<String>) -> Self {
        Self {
            name: name.as_ref().to_ascii_uppercase(),
            version: version.into(),
        }
    }
}

impl fmt::Display for FormatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Declarative description of one format version, relative to its parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub parent: Option<FormatKey>,
    #[serde(default)]
    pub description: Option<String>,
    /// Logical query name to template path.
    #[serde(default)]
    pub queries: BTreeMap<String, String>,
    /// Group toggles applied to every step.
    #[serde(default)]
    pub groups: BTreeMap<String, bool>,
    /// Binds applied to every step.
    #[serde(default)]
    pub binds: BTreeMap<String, String>,
    #[serde(default)]
    pub injections: Vec<InjectionDirective>,
    /// New sheets, or replacements for inherited sheets of the same name.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl FormatSpec {
    pub fn key(&self) -> FormatKey {
        FormatKey::new(&self.name, self.version.clone())
    }
}

/// Splice the template of `query` into the template of `into`.
///
/// `into` is a step query or the query of another injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionDirective {
    pub into: String,
    pub query: String,
    #[serde(default)]
    pub anchor: Option<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, bool>,
    #[serde(default)]
    pub binds: BTreeMap<String, String>,
}

/// One materialized sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Sheet name (`TR`, `HH`, ...).
    pub sheet: String,
    /// Logical query producing the rows.
    pub query: String,
    /// Table name prefix; the run id is appended.
    pub table: String,
    /// Placeholder under which downstream templates see this table.
    pub bind: String,
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Register the table even when it ends up empty.
    #[serde(default)]
    pub keep_empty: bool,
}

/// Where a query name resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedQuery {
    pub path: String,
    /// The format in the chain that declared the path.
    pub declared_by: FormatKey,
}

/// A format with its whole parent chain folded in.
#[derive(Debug, Clone)]
pub struct ResolvedFormat {
    pub key: FormatKey,
    pub description: Option<String>,
    /// From this format up to the root.
    pub chain: Vec<FormatKey>,
    pub queries: BTreeMap<String, ResolvedQuery>,
    pub groups: BTreeMap<String, bool>,
    pub binds: BTreeMap<String, String>,
    pub injections: Vec<InjectionDirective>,
    pub steps: Vec<StepSpec>,
}

impl ResolvedFormat {
    /// Resolve a logical query name to its template.
    pub fn query(&self, name: &str) -> ExtractionResult<&ResolvedQuery> {
        self.queries
            .get(name)
            .ok_or_else(|| ExtractionError::TemplateResolution {
                format: self.key.name.clone(),
                version: self.key.version.clone(),
                query: name.to_string(),
            })
    }

    pub fn step(&self, sheet: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.sheet.eq_ignore_ascii_case(sheet))
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.sheet.as_str()).collect()
    }

    /// Build the template query for `name` with every injection directive
    /// that targets it, recursively. Format-wide groups and binds are not
    /// included; the pipeline sets them on the root query.
    pub fn template_query(&self, name: &str) -> ExtractionResult<TemplateQuery> {
        let mut query = TemplateQuery::new(self.query(name)?.path.clone());
        for directive in self.injections.iter().filter(|d| d.into == name) {
            let mut injected = self.template_query(&directive.query)?;
            for (group, enabled) in &directive.groups {
                injected = injected.set_group(group.clone(), *enabled);
            }
            for (bind, value) in &directive.binds {
                injected = injected.bind(bind.clone(), value.clone());
            }
            query = match &directive.anchor {
                Some(anchor) => query.inject_query_at(injected, anchor.clone()),
                None => query.inject_query(injected),
            };
        }
        Ok(query)
    }

    /// Every template path this format can touch.
    pub fn template_paths(&self) -> BTreeSet<&str> {
        let mut used: BTreeSet<&str> = self.steps.iter().map(|s| s.query.as_str()).collect();
        used.extend(self.injections.iter().map(|d| d.query.as_str()));
        used.into_iter()
            .filter_map(|name| self.queries.get(name).map(|q| q.path.as_str()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(rename = "format", default)]
    formats: Vec<FormatSpec>,
}

/// All known formats, resolved and validated.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    specs: BTreeMap<FormatKey, FormatSpec>,
    resolved: BTreeMap<FormatKey, ResolvedFormat>,
}

impl FormatRegistry {
    /// Parse a TOML catalog of `[[format]]` tables.
    pub fn from_toml(text: &str) -> ExtractionResult<Self> {
        let catalog: Catalog = toml::from_str(text)
            .map_err(|e| ExtractionError::config(format!("Invalid format catalog: {}", e)))?;
        Self::new(catalog.formats)
    }

    /// Build and validate the registry.
    pub fn new(specs: Vec<FormatSpec>) -> ExtractionResult<Self> {
        let mut registry = Self::default();
        for spec in specs {
            let key = spec.key();
            if registry.specs.insert(key.clone(), spec).is_some() {
                return Err(ExtractionError::config(format!("Format {} declared twice", key)));
            }
        }

        let keys: Vec<FormatKey> = registry.specs.keys().cloned().collect();
        for key in keys {
            let resolved = registry.fold(&key)?;
            validate(&resolved)?;
            debug!(
                "Format {}: {} queries, sheets {:?}",
                key,
                resolved.queries.len(),
                resolved.sheet_names()
            );
            registry.resolved.insert(key, resolved);
        }
        Ok(registry)
    }

    /// Resolve a query name for a format version.
    pub fn resolve(&self, key: &FormatKey, query: &str) -> ExtractionResult<&ResolvedQuery> {
        self.format(key)?.query(query)
    }

    pub fn format(&self, key: &FormatKey) -> ExtractionResult<&ResolvedFormat> {
        self.resolved.get(key).ok_or_else(|| {
            let known = self.versions(&key.name);
            if known.is_empty() {
                ExtractionError::config(format!("Unknown format {}", key.name))
            } else {
                ExtractionError::config(format!(
                    "Unknown version {} of format {} (known: {})",
                    key.version,
                    key.name,
                    known.join(", ")
                ))
            }
        })
    }

    /// The declaration of a format, as written in the catalog.
    pub fn spec(&self, key: &FormatKey) -> Option<&FormatSpec> {
        self.specs.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &FormatKey> {
        self.resolved.keys()
    }

    pub fn versions(&self, name: &str) -> Vec<&str> {
        self.specs
            .keys()
            .filter(|k| k.name.eq_ignore_ascii_case(name))
            .map(|k| k.version.as_str())
            .collect()
    }

    /// The flattened `(format, query) -> template` table.
    pub fn lookup_table(&self) -> Vec<(&FormatKey, &str, &ResolvedQuery)> {
        self.resolved
            .iter()
            .flat_map(|(key, format)| {
                format
                    .queries
                    .iter()
                    .map(move |(name, resolved)| (key, name.as_str(), resolved))
            })
            .collect()
    }

    /// Check that every template reachable from every format loads and
    /// parses.
    pub fn validate_templates<L: TemplateLoader>(&self, loader: &L) -> ExtractionResult<()> {
        let mut checked = HashSet::new();
        for format in self.resolved.values() {
            for path in format.template_paths() {
                if checked.insert(path) {
                    let text = loader.load(path)?;
                    parser::parse(path, &text)?;
                }
            }
        }
        Ok(())
    }

    /// Follow a format's parents up to the root.
    fn chain(&self, key: &FormatKey) -> ExtractionResult<Vec<&FormatSpec>> {
        let mut chain: Vec<&FormatSpec> = Vec::new();
        let mut current = Some(key.clone());
        while let Some(key) = current {
            let spec = self.specs.get(&key).ok_or_else(|| {
                ExtractionError::config(format!("Unknown parent format {}", key))
            })?;
            if chain.iter().any(|s| s.key() == key) {
                return Err(ExtractionError::config(format!(
                    "Inheritance cycle through format {}",
                    key
                )));
            }
            chain.push(spec);
            current = spec.parent.as_ref().map(|p| FormatKey::new(&p.name, p.version.clone()));
        }
        Ok(chain)
    }

    /// Look a query up on the format itself, then delegate to each parent.
    fn lookup(chain: &[&FormatSpec], query: &str) -> Option<ResolvedQuery> {
        chain.iter().find_map(|spec| {
            spec.queries.get(query).map(|path| ResolvedQuery {
                path: path.clone(),
                declared_by: spec.key(),
            })
        })
    }

    fn fold(&self, key: &FormatKey) -> ExtractionResult<ResolvedFormat> {
        let chain = self.chain(key)?;
        let leaf = chain[0];

        let names: BTreeSet<&String> = chain.iter().flat_map(|s| s.queries.keys()).collect();
        let queries = names
            .into_iter()
            .filter_map(|name| Self::lookup(&chain, name).map(|q| (name.clone(), q)))
            .collect();

        let mut groups = BTreeMap::new();
        let mut binds = BTreeMap::new();
        let mut injections: Vec<InjectionDirective> = Vec::new();
        let mut steps: Vec<StepSpec> = Vec::new();

        // Root first, so children override.
        for spec in chain.iter().rev() {
            groups.extend(spec.groups.clone());
            binds.extend(spec.binds.clone());
            for directive in &spec.injections {
                match injections
                    .iter_mut()
                    .find(|d| d.into == directive.into && d.query == directive.query)
                {
                    Some(existing) => *existing = directive.clone(),
                    None => injections.push(directive.clone()),
                }
            }
            for step in &spec.steps {
                match steps.iter_mut().find(|s| s.sheet == step.sheet) {
                    Some(existing) => *existing = step.clone(),
                    None => steps.push(step.clone()),
                }
            }
        }

        Ok(ResolvedFormat {
            key: key.clone(),
            description: leaf.description.clone(),
            chain: chain.iter().map(|s| s.key()).collect(),
            queries,
            groups,
            binds,
            injections,
            steps,
        })
    }
}

fn validate(format: &ResolvedFormat) -> ExtractionResult<()> {
    let fail = |message: String| {
        Err(ExtractionError::config(format!("Format {}: {}", format.key, message)))
    };

    if format.steps.is_empty() {
        return fail("declares no steps".to_string());
    }

    let mut seen_sheets: Vec<&str> = Vec::new();
    for step in &format.steps {
        if format.query(&step.query).is_err() {
            return fail(format!("no template for query '{}' of sheet {}", step.query, step.sheet));
        }
        if let Some(upstream) = &step.depends_on {
            if !seen_sheets.contains(&upstream.as_str()) {
                return fail(format!(
                    "sheet {} depends on {}, which is not an earlier sheet",
                    step.sheet, upstream
                ));
            }
        }
        seen_sheets.push(&step.sheet);
    }

    let step_queries: HashSet<&str> = format.steps.iter().map(|s| s.query.as_str()).collect();
    let injected: HashSet<&str> = format.injections.iter().map(|d| d.query.as_str()).collect();
    for directive in &format.injections {
        if format.query(&directive.query).is_err() {
            return fail(format!("no template for injected query '{}'", directive.query));
        }
        if !step_queries.contains(directive.into.as_str())
            && !injected.contains(directive.into.as_str())
        {
            return fail(format!(
                "injection of '{}' targets '{}', which is neither a step nor an injected query",
                directive.query, directive.into
            ));
        }
    }

    for directive in &format.injections {
        let mut path = vec![directive.into.as_str()];
        if reaches(format, &directive.query, &mut path) {
            return fail(format!("injection cycle {}", path.join(" -> ")));
        }
    }
    Ok(())
}

/// Depth-first walk of the injection graph; true when a query on `path`
/// is reached again.
fn reaches<'a>(format: &'a ResolvedFormat, query: &'a str, path: &mut Vec<&'a str>) -> bool {
    if path.contains(&query) {
        path.push(query);
        return true;
    }
    path.push(query);
    for directive in format.injections.iter().filter(|d| d.into == query) {
        if reaches(format, &directive.query, path) {
            return true;
        }
    }
    path.pop();
    false
}
