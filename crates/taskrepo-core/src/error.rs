//! Core domain errors.

use thiserror::Error;

/// Validation errors for task records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The document has no `---` delimited front matter block.
    #[error("Missing front matter block")]
    MissingFrontMatter,

    /// The front matter is not valid YAML or has the wrong shape.
    #[error("Invalid front matter: {0}")]
    InvalidFrontMatter(String),

    /// A required field is absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A field holds a value that cannot be interpreted.
    #[error("Invalid value for '{field}': {value}")]
    InvalidField { field: &'static str, value: String },

    /// A set field lists the same entry twice.
    #[error("Duplicate entry in '{field}': {value}")]
    DuplicateEntry { field: &'static str, value: String },

    /// `modified` is earlier than `created`.
    #[error("Modified timestamp {modified} is before created timestamp {created}")]
    ModifiedBeforeCreated { created: String, modified: String },

    /// Invalid display identifier (must be a positive integer).
    #[error("Invalid display id: {0}")]
    InvalidDisplayId(String),
}
