//! Row- and column-level codecs shared by the pipeline.
//!
//! Timestamps are stored as RFC 3339 text, field-id lists as comma-separated
//! text, amounts as decimal text. Array population aggregates rows into one
//! cell of `rowid:value` tokens joined by the ASCII unit separator; the
//! helpers here parse those back apart.

use chrono::{DateTime, Utc};
use doreen_core::{
  field::{FieldFlags, FieldId},
  ticket::{DetailLevel, Ticket},
  value::FieldValue,
};
use rusqlite::{Row, types::Value as SqlValue};

use crate::error::{Error, Result};

/// Separator for aggregated array cells; `char(31)` on the SQL side.
pub(crate) const UNIT_SEP: char = '\u{1f}';

// ─── Timestamps ──────────────────────────────────────────────────────────────

pub(crate) fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub(crate) fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| Error::BadTimestamp(s.to_owned()))
}

// ─── Field-id lists ──────────────────────────────────────────────────────────

pub(crate) fn encode_field_ids(ids: &[FieldId]) -> String {
  ids
    .iter()
    .map(|id| id.0.to_string())
    .collect::<Vec<_>>()
    .join(",")
}

pub(crate) fn decode_field_ids(s: &str) -> Vec<FieldId> {
  s.split(',')
    .filter_map(|t| t.trim().parse::<i32>().ok())
    .map(FieldId)
    .collect()
}

// ─── Scalar values ───────────────────────────────────────────────────────────

/// Encode a scalar field value for its storage column. Integer tables take
/// integers, text tables text, amount tables decimal text.
pub(crate) fn scalar_to_sql(value: &FieldValue) -> SqlValue {
  match value {
    FieldValue::Null => SqlValue::Null,
    FieldValue::Int(n) => SqlValue::Integer(*n),
    FieldValue::Text(s) => SqlValue::Text(s.clone()),
    FieldValue::Amount(d) => SqlValue::Text(d.to_string()),
    // Arrays never go through the scalar path.
    other => SqlValue::Text(other.format_plain()),
  }
}

/// Decode a scalar storage column back into a tagged value, guided by the
/// field's declared type.
pub(crate) fn scalar_from_sql(value: SqlValue, flags: FieldFlags) -> FieldValue {
  match value {
    SqlValue::Null => FieldValue::Null,
    SqlValue::Integer(n) => FieldValue::Int(n),
    SqlValue::Real(f) => FieldValue::Text(f.to_string()),
    SqlValue::Text(s) => {
      if flags.contains(FieldFlags::TYPE_AMOUNT) {
        match s.parse() {
          Ok(d) => FieldValue::Amount(d),
          Err(_) => FieldValue::Text(s),
        }
      } else {
        FieldValue::Text(s)
      }
    }
    SqlValue::Blob(_) => FieldValue::Null,
  }
}

// ─── Aggregated array cells ──────────────────────────────────────────────────

/// Parse one aggregated array cell of `rowid:payload` tokens. A NULL cell
/// (no rows) yields the empty list.
pub(crate) fn parse_array_cell(cell: Option<&str>) -> Vec<(i64, String)> {
  let Some(cell) = cell else {
    return Vec::new();
  };
  cell
    .split(UNIT_SEP)
    .filter(|t| !t.is_empty())
    .filter_map(|t| {
      let (row, payload) = t.split_once(':')?;
      let row = row.parse::<i64>().ok()?;
      Some((row, payload.to_owned()))
    })
    .collect()
}

// ─── Ticket header rows ──────────────────────────────────────────────────────

/// Decoded `tickets` header row; stage-1 identity data only.
#[derive(Debug)]
pub(crate) struct RawTicketHeader {
  pub id:           i64,
  pub template:     Option<String>,
  pub type_id:      i64,
  pub aid:          i64,
  pub owner_uid:    i64,
  pub created_dt:   String,
  pub lastmod_uid:  i64,
  pub lastmod_dt:   String,
  pub created_from: Option<i64>,
}

pub(crate) const TICKET_HEADER_COLS: &str =
  "i, template, type_id, aid, owner_uid, created_dt, lastmod_uid, lastmod_dt, \
   created_from";

impl RawTicketHeader {
  pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
    Ok(Self {
      id:           row.get(0)?,
      template:     row.get(1)?,
      type_id:      row.get(2)?,
      aid:          row.get(3)?,
      owner_uid:    row.get(4)?,
      created_dt:   row.get(5)?,
      lastmod_uid:  row.get(6)?,
      lastmod_dt:   row.get(7)?,
      created_from: row.get(8)?,
    })
  }

  pub fn into_ticket(self) -> Result<Ticket> {
    Ok(Ticket {
      id:             self.id,
      template:       self.template,
      type_id:        self.type_id,
      access_list_id: self.aid,
      owner_uid:      self.owner_uid,
      created_at:     decode_dt(&self.created_dt)?,
      lastmod_uid:    self.lastmod_uid,
      lastmod_at:     decode_dt(&self.lastmod_dt)?,
      created_from:   self.created_from,
      field_data:     Default::default(),
      field_row_ids:  Default::default(),
      populated:      DetailLevel::Stage1,
    })
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dt_roundtrip() {
    let now = Utc::now();
    let decoded = decode_dt(&encode_dt(now)).unwrap();
    assert_eq!(decoded, now);
    assert!(matches!(decode_dt("yesterday"), Err(Error::BadTimestamp(_))));
  }

  #[test]
  fn field_id_csv_roundtrip() {
    let ids = vec![FieldId(100), FieldId(102), FieldId(120)];
    assert_eq!(decode_field_ids(&encode_field_ids(&ids)), ids);
    assert!(decode_field_ids("").is_empty());
  }

  #[test]
  fn array_cell_parsing() {
    let cell = format!("3:10{UNIT_SEP}7:12:2{UNIT_SEP}9:hello:world");
    let parsed = parse_array_cell(Some(&cell));
    assert_eq!(parsed, vec![
      (3, "10".to_owned()),
      (7, "12:2".to_owned()),
      (9, "hello:world".to_owned()),
    ]);
    assert!(parse_array_cell(None).is_empty());
  }
}
