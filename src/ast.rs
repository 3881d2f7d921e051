//! Template AST.
//!
//! A template is plain SQL interleaved with three primitives: toggle-able
//! groups, injection anchors and bind placeholders.

/// A parsed SQL template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    /// The loader path the template was read from.
    pub path: String,
    pub nodes: Vec<Node>,
}

/// One element of a template body.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal SQL text, emitted as-is.
    Text(String),
    /// `&name`, replaced by the bound value.
    Bind(String),
    /// `[[anchor:name]]`, a splice point for injections. Renders to nothing.
    Anchor(String),
    /// `[[distinct]]`, renders `DISTINCT` and flags the query.
    Distinct,
    /// `[[group:name]] ... [[/group]]`
    Group(Group),
}

/// A toggle-able fragment of SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    /// State used when no override is given.
    pub enabled: bool,
    /// Output columns the fragment contributes; reported as hidden when
    /// the group is disabled.
    pub columns: Vec<String>,
    pub children: Vec<Node>,
}

impl Template {
    /// Names of every anchor, including those nested in groups.
    pub fn anchors(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect(&self.nodes, &mut |node| {
            if let Node::Anchor(name) = node {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Names of every group, in document order.
    pub fn groups(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect(&self.nodes, &mut |node| {
            if let Node::Group(group) = node {
                out.push(group.name.as_str());
            }
        });
        out
    }

    /// Distinct placeholder names, in order of first appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        collect(&self.nodes, &mut |node| {
            if let Node::Bind(name) = node {
                if !out.contains(&name.as_str()) {
                    out.push(name.as_str());
                }
            }
        });
        out
    }
}

impl Group {
    /// Columns of this group and of every group nested inside it.
    pub fn all_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        collect(&self.children, &mut |node| {
            if let Node::Group(inner) = node {
                out.extend(inner.columns.iter().map(String::as_str));
            }
        });
        out
    }
}

fn collect<'a>(nodes: &'a [Node], visit: &mut impl FnMut(&'a Node)) {
    for node in nodes {
        visit(node);
        if let Node::Group(group) = node {
            collect(&group.children, visit);
        }
    }
}
