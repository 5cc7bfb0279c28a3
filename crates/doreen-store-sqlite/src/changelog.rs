//! Changelog rows: the per-ticket audit trail.
//!
//! One row per handler invocation (scalars reference the old/new value rows,
//! arrays carry an aggregate `+v,-v` token string) plus synthetic event rows
//! for creation, comments, attachments, and template deletion. Formatting a
//! row for display resolves the referenced value rows; a row that no longer
//! resolves degrades to a placeholder line instead of failing the whole
//! history view.

use chrono::{DateTime, Utc};
use doreen_core::{
  field::{FieldFlags, FieldId},
  registry::FieldRegistry,
};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::warn;

use crate::encode::{decode_dt, encode_dt};

// ─── Row type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChangelogRow {
  pub id:        i64,
  pub field_id:  FieldId,
  /// The subject ticket id.
  pub what:      i64,
  pub chg_uid:   i64,
  pub chg_dt:    DateTime<Utc>,
  /// Old value row id, for scalar fields.
  pub value_1:   Option<i64>,
  /// New value row id, for scalar fields.
  pub value_2:   Option<i64>,
  /// Array diff tokens or event payload.
  pub value_str: Option<String>,
}

// ─── Writing ─────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_row(
  conn: &Connection,
  field_id: FieldId,
  what: i64,
  chg_uid: i64,
  chg_dt: DateTime<Utc>,
  value_1: Option<i64>,
  value_2: Option<i64>,
  value_str: Option<&str>,
) -> rusqlite::Result<i64> {
  conn.execute(
    "INSERT INTO changelog (field_id, what, chg_uid, chg_dt, value_1, \
     value_2, value_str) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    params![
      field_id.0,
      what,
      chg_uid,
      encode_dt(chg_dt),
      value_1,
      value_2,
      value_str
    ],
  )?;
  Ok(conn.last_insert_rowid())
}

// ─── Reading ─────────────────────────────────────────────────────────────────

pub(crate) fn rows_for_ticket(
  conn: &Connection,
  ticket_id: i64,
) -> rusqlite::Result<Vec<ChangelogRow>> {
  let mut stmt = conn.prepare(
    "SELECT i, field_id, what, chg_uid, chg_dt, value_1, value_2, value_str \
     FROM changelog WHERE what = ?1 ORDER BY i",
  )?;
  let rows = stmt
    .query_map(params![ticket_id], |row| {
      let dt: String = row.get(4)?;
      Ok(ChangelogRow {
        id:        row.get(0)?,
        field_id:  FieldId(row.get(1)?),
        what:      row.get(2)?,
        chg_uid:   row.get(3)?,
        chg_dt:    decode_dt(&dt).unwrap_or(DateTime::<Utc>::MIN_UTC),
        value_1:   row.get(5)?,
        value_2:   row.get(6)?,
        value_str: row.get(7)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

// ─── Formatting ──────────────────────────────────────────────────────────────

/// Why one changelog row could not be formatted. Callers degrade per row.
#[derive(Debug, Error)]
pub enum FormatError {
  #[error("no flags registered for field {0}")]
  UnknownField(FieldId),

  #[error("value row {row} missing from {table}")]
  MissingValueRow { table: String, row: i64 },

  #[error("database error: {0}")]
  Db(#[from] rusqlite::Error),
}

/// Resolve one row into a display line. Scalar entries look up the old and
/// new value rows (soft-orphaned rows still resolve); array entries render
/// their token string; event markers render the event name.
pub(crate) fn format_row(
  conn: &Connection,
  registry: &FieldRegistry,
  row: &ChangelogRow,
) -> Result<String, FormatError> {
  let field = registry
    .find(row.field_id)
    .map_err(|_| FormatError::UnknownField(row.field_id))?;

  if field.flags.contains(FieldFlags::EMPTYSYSEVENT) {
    return Ok(match &row.value_str {
      Some(payload) => format!("{} ({payload})", field.name),
      None => field.name.clone(),
    });
  }

  if let Some(tokens) = &row.value_str {
    return Ok(format!("{}: {tokens}", field.name));
  }

  let table = field
    .storage_table
    .as_deref()
    .ok_or(FormatError::UnknownField(row.field_id))?;
  let old = match row.value_1 {
    Some(r) => lookup_value(conn, table, r)?,
    None => String::new(),
  };
  let new = match row.value_2 {
    Some(r) => lookup_value(conn, table, r)?,
    None => String::new(),
  };
  Ok(format!("{}: {old:?} -> {new:?}", field.name))
}

/// Format with per-row degradation: a broken row becomes a placeholder line
/// so the rest of the history still renders.
pub(crate) fn render_row(
  conn: &Connection,
  registry: &FieldRegistry,
  row: &ChangelogRow,
) -> String {
  match format_row(conn, registry, row) {
    Ok(line) => line,
    Err(e) => {
      warn!(entry = row.id, error = %e, "changelog entry failed to format");
      format!("(entry {} unavailable: {e})", row.id)
    }
  }
}

fn lookup_value(
  conn: &Connection,
  table: &str,
  row_id: i64,
) -> Result<String, FormatError> {
  // Deliberately no ticket_id filter: superseded scalar rows are orphaned,
  // not deleted, exactly so this lookup keeps working.
  let value: Option<rusqlite::types::Value> = conn
    .query_row(
      &format!("SELECT value FROM {table} WHERE i = ?1"),
      params![row_id],
      |r| r.get(0),
    )
    .optional()?;
  match value {
    None => Err(FormatError::MissingValueRow {
      table: table.to_owned(),
      row:   row_id,
    }),
    Some(rusqlite::types::Value::Null) => Ok(String::new()),
    Some(rusqlite::types::Value::Text(s)) => Ok(s),
    Some(rusqlite::types::Value::Integer(n)) => Ok(n.to_string()),
    Some(rusqlite::types::Value::Real(f)) => Ok(f.to_string()),
    Some(rusqlite::types::Value::Blob(_)) => Ok("(binary)".to_owned()),
  }
}
