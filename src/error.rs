use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use thiserror::Error;

use crate::schema::{EntityKind, RegistryError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("configuration file not found in '{0}'")]
    NotFound(PathBuf),
    #[error("invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProblemReason {
    Missing,
    WrongType { expected: &'static str },
    MalformedId { value: String },
    /// `_id` is assigned by the engine and never written by callers.
    EngineAssignedId,
    UnknownOpRef { index: usize },
    Unresolved { target: EntityKind, id: String },
    StillReferenced { by: EntityKind, count: usize },
    Duplicate { value: String },
    /// Embedded entities are written through their root document.
    EmbeddedWrite { root: EntityKind },
    /// Update keys name top-level fields only.
    NestedPath,
    InvalidPipeline { message: String },
}

impl Display for ProblemReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProblemReason::Missing => write!(f, "required field is missing"),
            ProblemReason::WrongType { expected } => write!(f, "expected {}", expected),
            ProblemReason::MalformedId { value } => write!(f, "'{}' is not a valid object id", value),
            ProblemReason::EngineAssignedId => write!(f, "ids are assigned by the engine"),
            ProblemReason::UnknownOpRef { index } => {
                write!(f, "ops[{}] is not an insert of this batch", index)
            }
            ProblemReason::Unresolved { target, id } => {
                write!(f, "no {} with id {}", target, id)
            }
            ProblemReason::StillReferenced { by, count } => {
                write!(f, "still referenced by {} {} record(s)", count, by)
            }
            ProblemReason::Duplicate { value } => write!(f, "value '{}' is already taken", value),
            ProblemReason::EmbeddedWrite { root } => {
                write!(f, "embedded entity, write the enclosing {} instead", root)
            }
            ProblemReason::NestedPath => {
                write!(f, "dotted paths can't be updated, replace the top-level field")
            }
            ProblemReason::InvalidPipeline { message } => write!(f, "{}", message),
        }
    }
}

/// One reason a request was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldProblem {
    /// Index of the offending op in the batch, if any.
    pub op: Option<usize>,
    pub entity: Option<EntityKind>,
    pub field: String,
    pub reason: ProblemReason,
}

impl FieldProblem {
    pub fn new(
        op: Option<usize>,
        entity: Option<EntityKind>,
        field: impl Into<String>,
        reason: ProblemReason,
    ) -> FieldProblem {
        FieldProblem {
            op,
            entity,
            field: field.into(),
            reason,
        }
    }
}

impl Display for FieldProblem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(op) = self.op {
            write!(f, "ops[{}] ", op)?;
        }
        if let Some(entity) = self.entity {
            write!(f, "{}.", entity)?;
        }
        write!(f, "{}: {}", self.field, self.reason)
    }
}

fn summarize(problems: &[FieldProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {}", summarize(.0))]
    Validation(Vec<FieldProblem>),

    #[error("conflicting write: {reason}")]
    Conflict { reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },

    #[error("store unavailable: {reason}")]
    TransientStore { reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl EngineError {
    #[inline]
    pub fn validation(problem: FieldProblem) -> EngineError {
        EngineError::Validation(vec![problem])
    }

    #[inline]
    pub fn not_found(entity: EntityKind, id: impl ToString) -> EngineError {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::TransientStore { .. }
        )
    }

    pub fn problems(&self) -> &[FieldProblem] {
        match self {
            EngineError::Validation(problems) => problems,
            _ => &[],
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriteConflict(reason) => EngineError::Conflict { reason },
            StoreError::DuplicateKey {
                collection,
                field,
                value,
            } => EngineError::validation(FieldProblem::new(
                None,
                collection.parse().ok(),
                field,
                ProblemReason::Duplicate { value },
            )),
            StoreError::InvalidPipeline(message) | StoreError::InvalidFilter(message) => {
                EngineError::validation(FieldProblem::new(
                    None,
                    None,
                    "pipeline",
                    ProblemReason::InvalidPipeline { message },
                ))
            }
            other @ (StoreError::Unavailable(_)
            | StoreError::TransactionClosed
            | StoreError::Other(_)) => EngineError::TransientStore {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RegistryError> for BackendError {
    fn from(err: RegistryError) -> Self {
        BackendError::Engine(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_classified() {
        let conflict: EngineError = StoreError::WriteConflict("user".into()).into();
        assert!(conflict.is_retryable());

        let down: EngineError = StoreError::Unavailable("no primary".into()).into();
        assert!(matches!(down, EngineError::TransientStore { .. }));
        assert!(down.is_retryable());

        let dup: EngineError = StoreError::DuplicateKey {
            collection: "user".into(),
            field: "email".into(),
            value: "a@b.c".into(),
        }
        .into();
        assert!(!dup.is_retryable());
        assert_eq!(
            dup.problems(),
            &[FieldProblem::new(
                None,
                Some(EntityKind::User),
                "email",
                ProblemReason::Duplicate {
                    value: "a@b.c".into()
                }
            )]
        );
    }

    #[test]
    fn validation_message_lists_problems() {
        let err = EngineError::Validation(vec![
            FieldProblem::new(Some(0), Some(EntityKind::User), "email", ProblemReason::Missing),
            FieldProblem::new(
                Some(2),
                Some(EntityKind::Section),
                "classroom_id",
                ProblemReason::UnknownOpRef { index: 7 },
            ),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: ops[0] user.email: required field is missing; \
             ops[2] section.classroom_id: ops[7] is not an insert of this batch"
        );
        assert!(!EngineError::not_found(EntityKind::Classroom, "x").is_retryable());
    }
}
