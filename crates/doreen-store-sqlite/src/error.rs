//! Error types for `doreen-store-sqlite`.

use doreen_core::field::FieldId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("model error: {0}")]
  Core(#[from] doreen_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("malformed timestamp {0:?}")]
  BadTimestamp(String),

  #[error("field {0} has no storage table")]
  NoStorageTable(FieldId),

  #[error("filesystem error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  /// Box a domain error so it survives the trip through a connection-task
  /// closure.
  pub(crate) fn into_call(self) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(self))
  }

  /// Recover a domain error smuggled through [`tokio_rusqlite::Error::Other`];
  /// anything else really is a database error.
  pub(crate) fn from_call(e: tokio_rusqlite::Error) -> Self {
    match e {
      tokio_rusqlite::Error::Other(inner) => match inner.downcast::<Error>() {
        Ok(domain) => *domain,
        Err(other) => Error::Database(tokio_rusqlite::Error::Other(other)),
      },
      other => Error::Database(other),
    }
  }
}

/// Shorthand for failing a connection-task closure with a domain error.
pub(crate) fn call_err(e: impl Into<Error>) -> tokio_rusqlite::Error {
  e.into().into_call()
}
