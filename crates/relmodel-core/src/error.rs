//! Error types for relmodel operations.

use crate::key::EntityKey;
use std::fmt;

/// The primary error type for all relmodel operations.
#[derive(Debug)]
pub enum Error {
    /// A required key component was unresolved when a write needed it
    IncompleteKey(IncompleteKeyError),
    /// Two writable associations claim the same physical column
    OwnershipConflict(ColumnOwnershipConflictError),
    /// Lookup by key found no row
    NotFound(NotFoundError),
    /// Flush/commit failed and the transaction was rolled back
    Persistence(PersistenceFailure),
    /// Mapping declaration or mapping-driven planning errors
    Mapping(MappingError),
    /// Two different instances of one identity in the same cascade pass
    IdentityConflict(IdentityConflictError),
    /// Datastore statement errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

/// A key component is unset (directly or inside an embedded key).
#[derive(Debug, Clone)]
pub struct IncompleteKeyError {
    /// Entity whose key could not be resolved.
    pub entity: &'static str,
    /// Dotted path to the missing component (e.g. `"parent.value"`).
    pub component: String,
}

#[derive(Debug, Clone)]
pub struct ColumnOwnershipConflictError {
    pub table: &'static str,
    pub column: &'static str,
    /// Description of the writer that registered first.
    pub first: String,
    /// Description of the conflicting writer.
    pub second: String,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub entity: &'static str,
    pub key: EntityKey,
}

/// A flush or commit failed; the datastore transaction was rolled back.
#[derive(Debug)]
pub struct PersistenceFailure {
    pub message: String,
    /// Whether the rollback itself succeeded.
    pub rolled_back: bool,
    pub source: Box<Error>,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub entity: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Referenced entity type is not registered
    UnknownEntity,
    /// Column is not part of the referenced table
    UnknownColumn,
    /// Association name is not declared on the entity
    UnknownAssociation,
    /// Table, column or entity name is not a valid identifier
    InvalidIdentifier,
    /// Entity, table, column or association declared twice
    Duplicate,
    /// Key draft or embedded key does not match the declared key shape
    KeyShape,
    /// Association kind does not match the value stored on the entity
    AssociationShape,
    /// Two writers produced different values for one column of one row
    ColumnValueConflict,
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub entity: &'static str,
    pub key: EntityKey,
}

#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub table: Option<String>,
    pub sql: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Primary key / unique constraint violated
    UniqueViolation,
    /// Foreign key constraint violated
    ForeignKeyViolation,
    /// Table does not exist
    MissingTable,
    /// Column does not exist
    MissingColumn,
    /// Other datastore error
    Database,
}

#[derive(Debug, Clone)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open
    AlreadyActive,
    /// No transaction is open
    NotActive,
}

impl Error {
    /// Is this a `find` miss?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Is this an unresolved key?
    pub fn is_incomplete_key(&self) -> bool {
        matches!(self, Error::IncompleteKey(_))
    }

    /// Is this (or the cause of a persistence failure) a constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::UniqueViolation | QueryErrorKind::ForeignKeyViolation
            ),
            Error::Persistence(p) => p.source.is_constraint_violation(),
            _ => false,
        }
    }

    pub(crate) fn mapping(
        kind: MappingErrorKind,
        entity: Option<&'static str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError {
            kind,
            entity,
            message: message.into(),
        })
    }
}

impl MappingError {
    /// Build a mapping error for `entity`.
    pub fn new(kind: MappingErrorKind, entity: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: Some(entity),
            message: message.into(),
        }
    }
}

impl QueryError {
    /// Build a query error against `table`.
    pub fn new(kind: QueryErrorKind, table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: Some(table.into()),
            sql: None,
            message: message.into(),
        }
    }

    /// Attach the rendered SQL of the failing statement.
    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IncompleteKey(e) => write!(f, "Incomplete key: {}", e),
            Error::OwnershipConflict(e) => write!(f, "Column ownership conflict: {}", e),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::Persistence(e) => write!(f, "Persistence failure: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::IdentityConflict(e) => write!(f, "Identity conflict: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persistence(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for IncompleteKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entity '{}' has no value for key component '{}'",
            self.entity, self.component
        )
    }
}

impl fmt::Display for ColumnOwnershipConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "column '{}.{}' is writable by both {} and {}",
            self.table, self.column, self.first, self.second
        )
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no '{}' with key {}", self.entity, self.key)
    }
}

impl fmt::Display for PersistenceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.source)?;
        if !self.rolled_back {
            write!(f, " (rollback failed)")?;
        }
        Ok(())
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity {
            Some(entity) => write!(f, "{} (entity '{}')", self.message, entity),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "two different '{}' instances share key {}",
            self.entity, self.key
        )
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{} (table '{}')", self.message, table),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<IncompleteKeyError> for Error {
    fn from(err: IncompleteKeyError) -> Self {
        Error::IncompleteKey(err)
    }
}

impl From<ColumnOwnershipConflictError> for Error {
    fn from(err: ColumnOwnershipConflictError) -> Self {
        Error::OwnershipConflict(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

/// Result type alias for relmodel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn constraint_violation_looks_through_persistence_failure() {
        let cause = Error::Query(QueryError::new(
            QueryErrorKind::ForeignKeyViolation,
            "child",
            "missing parent row",
        ));
        assert!(cause.is_constraint_violation());

        let failure = Error::Persistence(PersistenceFailure {
            message: "commit failed".to_string(),
            rolled_back: true,
            source: Box::new(cause),
        });
        assert!(failure.is_constraint_violation());
        assert!(std::error::Error::source(&failure).is_some());
    }

    #[test]
    fn not_found_display_includes_key() {
        let err = Error::NotFound(NotFoundError {
            entity: "parent",
            key: EntityKey::simple(Value::from("SOME_PARENT")),
        });
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: no 'parent' with key SOME_PARENT");
    }

    #[test]
    fn incomplete_key_display_names_component() {
        let err = Error::from(IncompleteKeyError {
            entity: "child",
            component: "parent.value".to_string(),
        });
        assert!(err.is_incomplete_key());
        assert!(err.to_string().contains("parent.value"));
    }

    #[test]
    fn rollback_failure_is_reported() {
        let failure = PersistenceFailure {
            message: "commit failed".to_string(),
            rolled_back: false,
            source: Box::new(Error::Cancelled),
        };
        assert!(failure.to_string().ends_with("(rollback failed)"));
    }
}
