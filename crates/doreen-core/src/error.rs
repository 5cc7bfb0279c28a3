//! Error types for `doreen-core`.
//!
//! The taxonomy separates user-facing validation failures (carry the field
//! name, abort the enclosing transaction), configuration mistakes (fatal,
//! meant to surface at startup), data-integrity violations raised
//! mid-transaction, and not-found conditions. Calling code that performs
//! access checks converts "not found" and "found but forbidden" into the
//! same [`Error::InvalidTicketId`] so existence does not leak.

use thiserror::Error;

use crate::field::FieldId;

#[derive(Debug, Error)]
pub enum Error {
  // ── Validation ────────────────────────────────────────────────────────────
  #[error("missing data for required field {field:?}")]
  MissingRequiredField { field: String },

  #[error("invalid value for field {field:?}: {reason}")]
  BadValue { field: String, reason: String },

  #[error("malformed count-encoded value {0:?} (expected \"id:count\")")]
  MalformedCountValue(String),

  // ── Configuration ─────────────────────────────────────────────────────────
  #[error("no flags registered for field {0}")]
  UnknownField(FieldId),

  #[error("field {0} is already registered")]
  DuplicateField(FieldId),

  #[error("no handler registered for field {0}")]
  NoHandler(FieldId),

  #[error("field {0} is integer-typed and cannot carry a search boost")]
  BoostOnIntField(FieldId),

  // ── Data integrity ────────────────────────────────────────────────────────
  #[error("ticket type mismatch: {0}")]
  TypeMismatch(String),

  #[error("ticket {0} is not a template")]
  NotATemplate(i64),

  #[error("ticket {0} is a template")]
  IsATemplate(i64),

  // ── Not found ─────────────────────────────────────────────────────────────
  #[error("invalid ticket id {0}")]
  InvalidTicketId(i64),

  #[error("invalid field id {0}")]
  InvalidFieldId(FieldId),

  #[error("invalid template id {0}")]
  InvalidTemplateId(i64),

  #[error("invalid ticket type id {0}")]
  InvalidTypeId(i64),

  // ── Passthrough ───────────────────────────────────────────────────────────
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
