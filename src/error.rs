//! Error types for the extraction engine.

use thiserror::Error;

/// Failures raised while loading, parsing or compiling a SQL template.
///
/// All of them happen before any statement reaches the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The loader has no template under this path.
    #[error("Template not found: '{path}'")]
    NotFound { path: String },

    /// The template markup is malformed.
    #[error("Syntax error in template '{path}' at line {line}: {message}")]
    Syntax {
        path: String,
        line: usize,
        message: String,
    },

    /// An injection targets an anchor the template does not declare.
    #[error("Anchor '{anchor}' not found while injecting '{injected}' into '{path}'")]
    MissingAnchor {
        path: String,
        anchor: String,
        injected: String,
    },

    /// A placeholder is rendered but no value was bound for it.
    #[error("No value bound for placeholder '&{name}' in template '{path}'")]
    UnboundPlaceholder { path: String, name: String },
}

/// The main error type for extraction operations.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Template loading or compilation failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// No format in the chain declares the requested query.
    #[error("No template for query '{query}' in format {format} (version {version})")]
    TemplateResolution {
        format: String,
        version: String,
        query: String,
    },

    /// A filter criterion cannot be rendered.
    #[error("Invalid criterion '{criterion}': {reason}")]
    InvalidCriterion { criterion: String, reason: String },

    /// The store rejected a rendered statement.
    #[error("SQL execution failed for sheet {sheet} (template '{template}'): {message}")]
    SqlExecution {
        sheet: String,
        template: String,
        message: String,
    },

    /// The run was cancelled before the given sheet was scheduled.
    #[error("Extraction cancelled before sheet {sheet}")]
    Cancelled { sheet: String },

    /// Format catalog or configuration problem.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractionError {
    /// Create an invalid criterion error.
    pub fn criterion(criterion: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCriterion {
            criterion: criterion.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for the pre-execution "nothing to render" category: a missing
    /// template file or an unresolvable (format, version, query) triple.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Self::TemplateResolution { .. } | Self::Template(TemplateError::NotFound { .. })
        )
    }
}

/// Error reported by a statement executor or column catalog.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not reach the database.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The database rejected the statement.
    #[error("{0}")]
    Statement(String),
}

/// Result type alias for extraction operations.
pub type ExtractionResult<T> = Result<T, ExtractionError>;
