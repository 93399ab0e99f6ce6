// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::value::EntityValue;

/// Errors surfaced by the query core.
///
/// Driver-layer failures keep the raw driver message so constraint
/// violations stay debuggable; everything else is a distinct kind that the
/// repository layer can match on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error["entity `{0}` is not registered"]]
    EntityNotRegistered(String),
    #[error["entity `{entity}` has no property or relation `{property}`"]]
    PropertyNotFound { entity: String, property: String },
    #[error["no `{entity}` matched the query"]]
    ResultNotFound { entity: String },
    #[error["refusing to emit a SQL literal containing a NUL byte"]]
    InjectionDetected,
    #[error["driver used before connect() completed"]]
    DriverNotInitialized,
    #[error["`{property}` is not a relation of `{entity}`; relations are: {}", .valid.join(", ")]]
    InvalidRelationUsage {
        entity: String,
        property: String,
        valid: Vec<String>,
    },
    #[error["constraint violation: {0}"]]
    ConstraintViolation(String),
    #[error["invalid metadata for `{entity}`: {message}"]]
    InvalidMetadata { entity: String, message: String },
    #[error["cannot convert {} into a column value", .0.kind_str()]]
    UnsupportedValue(EntityValue),
    #[error(transparent)]
    Database(sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => Error::ConstraintViolation(db.message().to_string()),
            _ => Error::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
