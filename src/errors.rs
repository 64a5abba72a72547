//! Error types for model construction, compilation and sampling.

use thiserror::Error;

/// Errors raised while building or querying a [`DataTable`](crate::data::DataTable).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    /// The requested column does not exist.
    #[error("column `{0}` not found in data")]
    MissingColumn(String),

    /// A column was added whose length differs from the table's row count.
    #[error("column `{column}` has {found} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    /// A text column was requested where numeric values are required.
    #[error("column `{0}` is not numeric")]
    NotNumeric(String),
}

/// Errors raised by a [`Runtime`](crate::graph::Runtime) while creating or updating nodes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// A distribution kind requires a parent that was not bound.
    #[error("node `{node}` is missing parent `{parent}`")]
    MissingParent { node: String, parent: String },

    /// A parent was bound that the distribution kind does not know about.
    #[error("node `{node}` got unexpected parent `{parent}`")]
    UnexpectedParent { node: String, parent: String },

    /// A parent refers to a node id that does not exist in this runtime.
    #[error("node `{node}` refers to unknown node id {id}")]
    UnknownNode { node: String, id: usize },

    /// Observed nodes carry data and can not be reassigned.
    #[error("node `{0}` is observed and its value can not be set")]
    Observed(String),
}

/// Which end of the slice interval was being stepped out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Hard failures of a single slice-sampling update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SliceError {
    #[error("step-out procedure failed ({side} side, {iterations} iterations)")]
    StepOut { side: Side, iterations: usize },

    #[error("shrink-in procedure failed after {iterations} iterations")]
    ShrinkIn { iterations: usize },
}

/// Top-level error of the model compiler.
///
/// Configuration variants are only ever produced by [`Hierarchical::new`]; compilation itself
/// can only fail with [`ModelError::Unresolved`], [`ModelError::ZeroProbability`] or errors
/// forwarded from the runtime and the user-supplied likelihood.
///
/// [`Hierarchical::new`]: crate::hierarchical::Hierarchical::new
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("column `{column}` named in depends_on for `{param}` not found in data")]
    MissingColumn { param: String, column: String },

    #[error("unknown parameter `{0}`")]
    UnknownParam(String),

    #[error("an invalid key ({key}) was found in update_params for parameter `{param}`")]
    InvalidOverrideKey { param: String, key: String },

    #[error("invalid value for `{key}` in update_params for parameter `{param}`: expected {expected}")]
    InvalidOverrideValue {
        param: String,
        key: String,
        expected: &'static str,
    },

    #[error("group models require a `{0}` column in the input data")]
    MissingSubjectColumn(String),

    #[error("optional parameter `{0}` has no default value")]
    MissingDefault(String),

    #[error("parameter `{param}`: {reason}")]
    InvalidTemplate { param: String, reason: String },

    /// A parent binding that the dependency declarations promise does not exist.
    #[error("no node for parameter `{param}` at tag `{tag}`{}", subject_suffix(.subject))]
    Unresolved {
        param: String,
        tag: String,
        subject: Option<usize>,
    },

    #[error("node `{node}` has zero probability under its initial value")]
    ZeroProbability { node: String },

    #[error("subject-by-subject initialisation requires a group model")]
    NotGroupModel,

    #[error("optimizer failed: {0}")]
    Optimizer(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Slice(#[from] SliceError),
}

fn subject_suffix(subject: &Option<usize>) -> String {
    subject
        .map(|s| format!(" for subject {s}"))
        .unwrap_or_default()
}

impl ModelError {
    /// Whether the error stems from the model's configuration rather than from compilation.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ModelError::MissingColumn { .. }
                | ModelError::UnknownParam(_)
                | ModelError::InvalidOverrideKey { .. }
                | ModelError::InvalidOverrideValue { .. }
                | ModelError::MissingSubjectColumn(_)
                | ModelError::MissingDefault(_)
                | ModelError::InvalidTemplate { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_message_mentions_subject() {
        let err = ModelError::Unresolved {
            param: "v".to_string(),
            tag: "easy".to_string(),
            subject: Some(3),
        };
        assert_eq!(
            err.to_string(),
            "no node for parameter `v` at tag `easy` for subject 3"
        );
        let err = ModelError::Unresolved {
            param: "v".to_string(),
            tag: String::new(),
            subject: None,
        };
        assert_eq!(err.to_string(), "no node for parameter `v` at tag ``");
    }

    #[test]
    fn slice_errors_keep_their_wording() {
        let err = SliceError::StepOut {
            side: Side::Left,
            iterations: 1,
        };
        assert!(err.to_string().starts_with("step-out procedure failed"));
        let err: ModelError = SliceError::ShrinkIn { iterations: 5 }.into();
        assert!(err.to_string().starts_with("shrink-in procedure failed"));
        assert!(!err.is_config());
    }
}
