use thiserror::Error;

use crate::Value;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("schema violation: {0}")]
    SchemaViolation(#[from] SchemaViolation),

    #[error("key {key} not found in table {table}")]
    KeyNotFound { table: String, key: Value },

    #[error("table {0} is unknown or not queryable")]
    UnknownTable(String),

    #[error("prioritization policy of table {table} was called without candidates")]
    EmptyCandidateSet { table: String },

    #[error("prioritization policy of table {table} chose key {key} which is not pending")]
    InvalidChoice { table: String, key: Value },

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("name {0} is already in use")]
    DuplicateName(String),

    #[error("table {0} is derived and only accepts records from its parents")]
    NotASource(String),

    #[error("the table graph can't be changed while the engine is running")]
    EngineRunning,

    #[error("unable to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker for {0} panicked")]
    WorkerPanicked(String),

    #[error("source feeding table {table} failed: {source}")]
    Source {
        table: String,
        #[source]
        source: BoxError,
    },
}

/// A record, or a schema declaration, doesn't line up with the schema it was
/// checked against
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("primary key {0} is not a declared column")]
    MissingPrimaryKey(String),

    #[error("column {0} is declared more than once")]
    DuplicateColumn(String),

    #[error("column {0} is missing a value")]
    MissingField(String),

    #[error("field {0} is not a declared column")]
    UnknownField(String),

    #[error("field {field} expected a {expected} value, found {found}")]
    TypeMismatch {
        field: String,
        expected: crate::ValueType,
        found: crate::ValueType,
    },
}

/// An operator failed for a single key. The update is dropped and scheduling
/// carries on with other keys
#[derive(Debug, Error)]
#[error("operator for table {table} failed on key {key}: {source}")]
pub struct ProcessingError {
    pub table: String,
    pub key: Value,
    #[source]
    pub source: BoxError,
}

impl EngineError {
    /// Fatal errors stop the worker that hit them, everything else is
    /// contained to a single key
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyCandidateSet { .. }
                | EngineError::InvalidChoice { .. }
                | EngineError::WorkerPanicked(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
