//! Error contexts raised by the store.
//!
//! Operations return the coarse contexts (`InsertionError`, `QueryError`,
//! `UpdateError`, `DeletionError`, `StoreError`); the specific condition a
//! caller may want to branch on travels in the report's context chain and is
//! recovered with [`error_kind`].

use error_stack::Report;
pub use twin_validation::ValidationFailed;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("the store encountered an error")]
#[must_use]
pub struct StoreError;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("could not insert into the store")]
#[must_use]
pub struct InsertionError;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("could not query from the store")]
#[must_use]
pub struct QueryError;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("could not update the store")]
#[must_use]
pub struct UpdateError;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("could not delete from the store")]
#[must_use]
pub struct DeletionError;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("{message}")]
#[must_use]
pub struct ArgumentError {
    pub message: String,
}

impl ArgumentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("could not resolve model dependencies: {}", unresolved.join(", "))]
#[must_use]
pub struct ResolutionError {
    pub unresolved: Vec<String>,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("model `{id}` already exists")]
#[must_use]
pub struct ModelAlreadyExists {
    pub id: String,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("model `{id}` does not exist")]
#[must_use]
pub struct ModelNotFound {
    pub id: String,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("the `extends` set of model `{id}` cannot be changed by a replace")]
#[must_use]
pub struct ModelExtendsChanged {
    pub id: String,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("replacing model `{id}` would conflict with contents of its descendants: {}", conflicts.join(", "))]
#[must_use]
pub struct ModelUpdateValidationError {
    pub id: String,
    pub conflicts: Vec<String>,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("model `{id}` is still referenced by other models or twins")]
#[must_use]
pub struct ModelReferencesNotDeleted {
    pub id: String,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("digital twin `{id}` does not exist")]
#[must_use]
pub struct DigitalTwinNotFound {
    pub id: String,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("relationship `{id}` on twin `{source_id}` does not exist")]
#[must_use]
pub struct RelationshipNotFound {
    pub source_id: String,
    pub id: String,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("`{name}` is not a component on the twin's model")]
#[must_use]
pub struct ComponentNotFound {
    pub name: String,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("the supplied entity tag did not match")]
#[must_use]
pub struct PreconditionFailed;

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("{message}")]
#[must_use]
pub struct InvalidOperation {
    pub message: String,
}

impl InvalidOperation {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("the operation was cancelled")]
#[must_use]
pub struct Cancelled;

/// The condition classes a hosting layer maps onto its wire protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Validation,
    Resolution,
    ModelAlreadyExists,
    ModelExtendsChanged,
    ModelUpdateValidation,
    ModelReferencesNotDeleted,
    NotFound,
    PreconditionFailed,
    InvalidOperation,
    Cancelled,
    Store,
}

/// Classifies a report by the most specific condition in its context chain.
#[must_use]
pub fn error_kind<C>(report: &Report<C>) -> ErrorKind {
    if report.contains::<ArgumentError>() {
        ErrorKind::Argument
    } else if report.contains::<ValidationFailed>() {
        ErrorKind::Validation
    } else if report.contains::<ResolutionError>() {
        ErrorKind::Resolution
    } else if report.contains::<ModelAlreadyExists>() {
        ErrorKind::ModelAlreadyExists
    } else if report.contains::<ModelExtendsChanged>() {
        ErrorKind::ModelExtendsChanged
    } else if report.contains::<ModelUpdateValidationError>() {
        ErrorKind::ModelUpdateValidation
    } else if report.contains::<ModelReferencesNotDeleted>() {
        ErrorKind::ModelReferencesNotDeleted
    } else if report.contains::<ModelNotFound>()
        || report.contains::<DigitalTwinNotFound>()
        || report.contains::<RelationshipNotFound>()
        || report.contains::<ComponentNotFound>()
    {
        ErrorKind::NotFound
    } else if report.contains::<PreconditionFailed>() {
        ErrorKind::PreconditionFailed
    } else if report.contains::<InvalidOperation>() {
        ErrorKind::InvalidOperation
    } else if report.contains::<Cancelled>() {
        ErrorKind::Cancelled
    } else {
        ErrorKind::Store
    }
}
