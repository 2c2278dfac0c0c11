//! Error taxonomy shared by the filter engine and the interpretation workflow.

use std::process::{ExitCode, Termination};

/// Result type used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Payload or filter-config failed validation, or an enum value is out of range.
    #[error("validation error: {0}")]
    Validation(String),
    /// A presented id does not match the current record, or a partial-unique
    /// index was violated by a racing transaction.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    /// Referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    /// The filter-config requirements do not hold for the analysis.
    #[error("filter config {filterconfig_id} is not applicable: {reason}")]
    RequirementMismatch { filterconfig_id: i64, reason: String },
    /// A filter primitive received a config it cannot work with.
    #[error("invalid filter configuration: {0}")]
    FilterConfiguration(String),
    /// A trigger or CHECK constraint rejected a write.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// The requested workflow action is not allowed in the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    /// The interpretation is owned by another user.
    #[error("interpretation {interpretation_id} is owned by user {owner:?}, not by user {user_id}")]
    NotOwner {
        interpretation_id: i64,
        owner: Option<i64>,
        user_id: i64,
    },
    /// Failure of a single filter step, carries the step name for blame.
    #[error("filter {name:?} failed: {source}")]
    Filter {
        name: String,
        #[source]
        source: Box<Error>,
    },
    /// Driver failure without constraint meaning.
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shortcut for `Error::NotFound`.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Wrap `self` so it is attributed to the filter step `name`.
    pub fn in_filter(self, name: &str) -> Self {
        match self {
            err @ Error::Filter { .. } => err,
            err => Error::Filter {
                name: name.to_string(),
                source: Box::new(err),
            },
        }
    }

    /// The innermost error, unwrapping filter attribution.
    pub fn root(&self) -> &Error {
        match self {
            Error::Filter { source, .. } => source.root(),
            err => err,
        }
    }
}

/// SQLite result codes that signal lock contention.
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Whether `code` is SQLITE_CONSTRAINT or one of its extended codes.
fn is_constraint_code(code: &str) -> bool {
    code.parse::<u32>().map(|c| c & 0xff) == Ok(19)
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound {
                kind: "row",
                id: String::from("?"),
            },
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                if db_err.is_unique_violation() {
                    return Error::ConcurrencyConflict(message);
                }
                if db_err.is_check_violation()
                    || db_err.is_foreign_key_violation()
                    || matches!(db_err.kind(), sqlx::error::ErrorKind::NotNullViolation)
                {
                    return Error::Integrity(message);
                }
                let code = db_err.code().map(|code| code.into_owned());
                match code.as_deref() {
                    Some(code) if SQLITE_BUSY_CODES.contains(&code) => {
                        Error::ConcurrencyConflict(message)
                    }
                    // SQLITE_CONSTRAINT and extended codes, includes RAISE(ABORT) in triggers
                    Some(code) if is_constraint_code(code) => Error::Integrity(message),
                    _ => Error::Database(sqlx::Error::Database(db_err)),
                }
            }
            err => Error::Database(err),
        }
    }
}

impl Termination for Error {
    fn report(self) -> ExitCode {
        match self.root() {
            Error::Validation(_) | Error::FilterConfiguration(_) => ExitCode::from(2),
            Error::NotFound { .. } => ExitCode::from(3),
            Error::RequirementMismatch { .. } => ExitCode::from(4),
            Error::ConcurrencyConflict(_) => ExitCode::from(5),
            _ => ExitCode::from(1),
        }
    }
}
