//! Query construction: header fetches, the fallback finder, and grouped
//! field population.
//!
//! Population issues one grouped SELECT per ticket-type batch: a LEFT JOIN
//! per scalar field and an aggregate subselect per array field, so a page of
//! tickets costs one round trip instead of one per ticket per field.

use std::collections::HashMap;

use doreen_core::{
  field::{FieldFlags, FieldId, TicketField},
  registry::FieldRegistry,
  ticket::{DetailLevel, TicketSet},
  value::{CountedId, FieldValue},
};
use rusqlite::{Connection, params_from_iter, types::Value as SqlValue};

use crate::{
  encode::{RawTicketHeader, TICKET_HEADER_COLS, parse_array_cell,
    scalar_from_sql},
  error::{Error, Result},
};

// ─── Parameters and results ──────────────────────────────────────────────────

/// Structured filter set for the finder.
#[derive(Debug, Clone, Default)]
pub struct TicketFilters {
  pub type_id:           Option<i64>,
  pub owner_uid:         Option<i64>,
  pub include_templates: bool,
  pub fulltext:          Option<String>,
}

/// Sort selection; `field: None` sorts by ticket id.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortBy {
  pub field:      Option<FieldId>,
  pub descending: bool,
}

impl SortBy {
  pub fn by_id(descending: bool) -> Self {
    Self { field: None, descending }
  }

  /// Sort by a field, defaulting the direction from its descend-first flag.
  pub fn by_field(field: &TicketField) -> Self {
    Self {
      field:      Some(field.id),
      descending: field.flags.contains(FieldFlags::DESCEND_FIRST),
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
  /// 1-based.
  pub page:     usize,
  pub per_page: usize,
}

impl Default for Page {
  fn default() -> Self { Self { page: 1, per_page: 25 } }
}

impl Page {
  fn offset(&self) -> usize { self.page.saturating_sub(1) * self.per_page }
}

/// One page of finder output: total match count, the page of ids in order,
/// and per-value counts for each drill-down field.
#[derive(Debug, Clone, Default)]
pub struct FindResults {
  pub total:             usize,
  pub ids:               Vec<i64>,
  pub drill_down_counts: HashMap<FieldId, HashMap<i64, usize>>,
}

// ─── Header fetch ────────────────────────────────────────────────────────────

/// Load stage-1 headers for the given ids, in the given order. Missing ids
/// are simply absent from the result.
pub(crate) fn fetch_headers(
  conn: &Connection,
  ids: &[i64],
) -> Result<Vec<doreen_core::ticket::Ticket>> {
  if ids.is_empty() {
    return Ok(Vec::new());
  }
  let placeholders = placeholders(ids.len());
  let mut stmt = conn.prepare(&format!(
    "SELECT {TICKET_HEADER_COLS} FROM tickets WHERE i IN ({placeholders})"
  ))?;
  let raw = stmt
    .query_map(
      params_from_iter(ids.iter().copied()),
      RawTicketHeader::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut by_id: HashMap<i64, _> = raw
    .into_iter()
    .map(|r| Ok::<_, Error>((r.id, r.into_ticket()?)))
    .collect::<Result<_>>()?;
  Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

// ─── Fallback finder ─────────────────────────────────────────────────────────

/// Naive database-scan finder, used when no search sink serves the query.
///
/// Returns `Ok(None)` in exactly one case: a fulltext term was given but no
/// field is searchable and the term is not a ticket number. That quirk —
/// empty result rather than unfiltered result — is load-bearing for callers.
pub(crate) fn find_fallback(
  conn: &Connection,
  registry: &FieldRegistry,
  filters: &TicketFilters,
  sort: SortBy,
  page: Page,
  drill: &HashMap<FieldId, i64>,
) -> Result<Option<FindResults>> {
  let Some((where_sql, params)) =
    build_filters(registry, filters, drill, None)?
  else {
    return Ok(None);
  };

  let total: usize = conn.query_row(
    &format!("SELECT COUNT(*) FROM tickets t WHERE {where_sql}"),
    params_from_iter(params.iter().cloned()),
    |row| row.get(0),
  )?;

  // Sort join only for sortable scalar fields; id is always the final
  // tiebreaker so pagination is deterministic.
  let mut join = String::new();
  let mut order = String::new();
  let dir = if sort.descending { "DESC" } else { "ASC" };
  if let Some(field_id) = sort.field {
    let field = registry.find(field_id)?;
    if field.flags.contains(FieldFlags::SORTABLE) {
      if let Some(table) = &field.storage_table {
        join = format!(
          "LEFT JOIN {table} s ON s.ticket_id = t.i AND s.field_id = {}",
          field.id.0
        );
        order = format!("s.value {dir}, ");
      }
    }
  }
  if order.is_empty() {
    order = format!("t.i {dir}, ");
  }

  let mut stmt = conn.prepare(&format!(
    "SELECT t.i FROM tickets t {join} WHERE {where_sql} \
     ORDER BY {order}t.i ASC LIMIT {} OFFSET {}",
    page.per_page,
    page.offset()
  ))?;
  let ids = stmt
    .query_map(params_from_iter(params.iter().cloned()), |row| row.get(0))?
    .collect::<rusqlite::Result<Vec<i64>>>()?;

  let mut drill_down_counts = HashMap::new();
  for &field_id in registry.drill_down_ids() {
    let field = registry.find(field_id)?;
    let Some(table) = &field.storage_table else {
      continue;
    };
    // A field's own drill filter is excluded from its counts, so the user
    // still sees the other choices.
    let Some((where_sql, params)) =
      build_filters(registry, filters, drill, Some(field_id))?
    else {
      continue;
    };
    let mut stmt = conn.prepare(&format!(
      "SELECT x.value, COUNT(DISTINCT x.ticket_id) FROM {table} x \
       JOIN tickets t ON t.i = x.ticket_id \
       WHERE x.field_id = {} AND {where_sql} GROUP BY x.value",
      field_id.0
    ))?;
    let counts = stmt
      .query_map(params_from_iter(params.iter().cloned()), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, usize>(1)?))
      })?
      .collect::<rusqlite::Result<HashMap<i64, usize>>>()?;
    drill_down_counts.insert(field_id, counts);
  }

  Ok(Some(FindResults { total, ids, drill_down_counts }))
}

/// Assemble the WHERE clause for the fallback finder. `None` signals the
/// unsearchable-fulltext quirk.
fn build_filters(
  registry: &FieldRegistry,
  filters: &TicketFilters,
  drill: &HashMap<FieldId, i64>,
  exclude_drill: Option<FieldId>,
) -> Result<Option<(String, Vec<SqlValue>)>> {
  let mut clauses: Vec<String> = Vec::new();
  let mut params: Vec<SqlValue> = Vec::new();

  if !filters.include_templates {
    clauses.push("t.template IS NULL".into());
  }
  if let Some(type_id) = filters.type_id {
    clauses.push("t.type_id = ?".into());
    params.push(SqlValue::Integer(type_id));
  }
  if let Some(owner) = filters.owner_uid {
    clauses.push("t.owner_uid = ?".into());
    params.push(SqlValue::Integer(owner));
  }

  if let Some(text) = filters.fulltext.as_deref().map(str::trim) {
    if !text.is_empty() {
      let ticket_number = text
        .strip_prefix('#')
        .unwrap_or(text)
        .parse::<i64>()
        .ok();
      let searchable = registry.searchable_text_fields();

      let mut alts: Vec<String> = Vec::new();
      for field in &searchable {
        let Some(table) = &field.storage_table else {
          continue;
        };
        alts.push(format!(
          "EXISTS (SELECT 1 FROM {table} q WHERE q.ticket_id = t.i AND \
           q.field_id = {} AND q.value LIKE ?)",
          field.id.0
        ));
        params.push(SqlValue::Text(format!("%{text}%")));
      }
      if let Some(n) = ticket_number {
        alts.push("t.i = ?".into());
        params.push(SqlValue::Integer(n));
      }
      if alts.is_empty() {
        return Ok(None);
      }
      clauses.push(format!("({})", alts.join(" OR ")));
    }
  }

  for (&field_id, &value) in drill {
    if Some(field_id) == exclude_drill {
      continue;
    }
    let field = registry.find(field_id)?;
    let Some(table) = &field.storage_table else {
      continue;
    };
    clauses.push(format!(
      "EXISTS (SELECT 1 FROM {table} d WHERE d.ticket_id = t.i AND \
       d.field_id = {} AND d.value = ?)",
      field.id.0
    ));
    params.push(SqlValue::Integer(value));
  }

  if clauses.is_empty() {
    clauses.push("1 = 1".into());
  }
  Ok(Some((clauses.join(" AND "), params)))
}

// ─── Population ──────────────────────────────────────────────────────────────

enum ProjectedField<'a> {
  /// Two columns: value row id, value.
  Scalar(&'a TicketField),
  /// One aggregate column of `rowid:id[:count]` tokens.
  Array { field: &'a TicketField, counted: bool },
  /// One aggregate column of `rowid:other_ticket` tokens from the paired
  /// forward field's rows.
  Reverse(&'a TicketField),
  /// One aggregate column of `rowid:word` tokens via the dictionary.
  Words(&'a TicketField),
}

/// Populate the given fields for the given tickets in one grouped query.
/// Custom-serialization and changelog-only fields are not projected here.
pub(crate) fn populate_fields(
  conn: &Connection,
  registry: &FieldRegistry,
  tickets: &mut TicketSet,
  ids: &[i64],
  fields: &[&TicketField],
  level: DetailLevel,
) -> Result<()> {
  let projected: Vec<ProjectedField> = fields
    .iter()
    .filter(|f| {
      f.storage_table.is_some()
        && !f.flags.intersects(
          FieldFlags::CHANGELOGONLY
            | FieldFlags::EMPTYSYSEVENT
            | FieldFlags::CUSTOM_SERIALIZATION,
        )
    })
    .map(|f| {
      if f.flags.contains(FieldFlags::ARRAY_REVERSE) {
        ProjectedField::Reverse(f)
      } else if f.flags.contains(FieldFlags::WORDLIST) {
        ProjectedField::Words(f)
      } else if f.flags.is_array() {
        ProjectedField::Array {
          field:   f,
          counted: f.flags.contains(FieldFlags::ARRAY_COUNT),
        }
      } else {
        ProjectedField::Scalar(f)
      }
    })
    .collect();

  if !ids.is_empty() && !projected.is_empty() {
    let mut cols = vec!["t.i".to_owned()];
    let mut joins = Vec::new();
    for (idx, p) in projected.iter().enumerate() {
      match p {
        ProjectedField::Scalar(f) => {
          // Safe to join flat: soft-orphaning guarantees at most one live
          // row per (ticket, field).
          let table = f.storage_table.as_deref().unwrap_or_default();
          joins.push(format!(
            "LEFT JOIN {table} f{idx} ON f{idx}.ticket_id = t.i AND \
             f{idx}.field_id = {id}",
            id = f.id.0
          ));
          cols.push(format!("f{idx}.i"));
          cols.push(format!("f{idx}.value"));
        }
        ProjectedField::Array { field: f, counted } => {
          let table = f.storage_table.as_deref().unwrap_or_default();
          let payload = if *counted {
            "a.i || ':' || a.value || ':' || a.count"
          } else {
            "a.i || ':' || a.value"
          };
          cols.push(format!(
            "(SELECT group_concat({payload}, char(31)) FROM {table} a WHERE \
             a.ticket_id = t.i AND a.field_id = {id})",
            id = f.id.0
          ));
        }
        ProjectedField::Reverse(f) => {
          let table = f.storage_table.as_deref().unwrap_or_default();
          let forward = f.paired_field_id.map(|p| p.0).unwrap_or(f.id.0);
          cols.push(format!(
            "(SELECT group_concat(a.i || ':' || a.ticket_id, char(31)) FROM \
             {table} a WHERE a.field_id = {forward} AND a.value = t.i)"
          ));
        }
        ProjectedField::Words(f) => {
          let table = f.storage_table.as_deref().unwrap_or_default();
          cols.push(format!(
            "(SELECT group_concat(a.i || ':' || k.word, char(31)) FROM \
             {table} a JOIN keyword_defs k ON k.i = a.value WHERE \
             a.ticket_id = t.i AND a.field_id = {id})",
            id = f.id.0
          ));
        }
      }
    }

    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM tickets t {} WHERE t.i IN ({})",
      cols.join(", "),
      joins.join(" "),
      placeholders(ids.len())
    ))?;
    let mut rows = stmt.query(params_from_iter(ids.iter().copied()))?;
    while let Some(row) = rows.next()? {
      let ticket_id: i64 = row.get(0)?;
      let Some(ticket) = tickets.get_mut(ticket_id) else {
        continue;
      };

      let mut col = 1;
      for p in &projected {
        match p {
          ProjectedField::Scalar(f) => {
            let row_id: Option<i64> = row.get(col)?;
            let value: SqlValue = row.get(col + 1)?;
            col += 2;
            if let Some(row_id) = row_id {
              ticket.set_field(
                f.id,
                scalar_from_sql(value, f.flags),
                vec![row_id],
              );
            }
          }
          ProjectedField::Array { field: f, counted } => {
            let cell: Option<String> = row.get(col)?;
            col += 1;
            decode_id_array(ticket, f, cell.as_deref(), *counted);
          }
          ProjectedField::Reverse(f) => {
            let cell: Option<String> = row.get(col)?;
            col += 1;
            decode_id_array(ticket, f, cell.as_deref(), false);
          }
          ProjectedField::Words(f) => {
            let cell: Option<String> = row.get(col)?;
            col += 1;
            let mut members: Vec<(String, i64)> =
              parse_array_cell(cell.as_deref())
                .into_iter()
                .map(|(row_id, word)| (word, row_id))
                .collect();
            if members.is_empty() {
              continue;
            }
            members.sort();
            let (words, rows) = members.into_iter().unzip();
            ticket.set_field(f.id, FieldValue::WordList(words), rows);
          }
        }
      }
    }
  }

  for &id in ids {
    if let Some(ticket) = tickets.get_mut(id) {
      ticket.populated = ticket.populated.max(level);
    }
  }
  Ok(())
}

/// Decode an aggregated id-array cell, keeping members and row ids aligned
/// in ascending id order (the order the write path maintains).
fn decode_id_array(
  ticket: &mut doreen_core::ticket::Ticket,
  field: &TicketField,
  cell: Option<&str>,
  counted: bool,
) {
  let mut members: Vec<(i64, i64, i64)> = parse_array_cell(cell)
    .into_iter()
    .filter_map(|(row_id, payload)| {
      if counted {
        let (id, count) = payload.split_once(':')?;
        Some((id.parse().ok()?, count.parse().ok()?, row_id))
      } else {
        Some((payload.parse().ok()?, 1, row_id))
      }
    })
    .collect();
  if members.is_empty() {
    return;
  }
  members.sort();

  let rows: Vec<i64> = members.iter().map(|(_, _, row)| *row).collect();
  let value = if counted {
    FieldValue::CountedList(
      members
        .into_iter()
        .map(|(id, count, _)| CountedId { id, count })
        .collect(),
    )
  } else {
    FieldValue::IdList(members.into_iter().map(|(id, _, _)| id).collect())
  };
  ticket.set_field(field.id, value, rows);
}

fn placeholders(n: usize) -> String {
  vec!["?"; n].join(", ")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use doreen_core::registry::{FieldRegistry, builtin_fields};

  use super::*;

  fn registry_without_boosts() -> FieldRegistry {
    let mut builder = FieldRegistry::builder();
    for field in builtin_fields() {
      builder.register(field).unwrap();
    }
    builder.build()
  }

  #[test]
  fn fulltext_with_no_searchable_fields_yields_the_empty_result() {
    let registry = registry_without_boosts();
    let filters = TicketFilters {
      fulltext: Some("printer".into()),
      ..Default::default()
    };
    // Historical behavior: empty result, not unfiltered result.
    let built =
      build_filters(&registry, &filters, &HashMap::new(), None).unwrap();
    assert!(built.is_none());
  }

  #[test]
  fn ticket_number_shape_still_matches_without_searchable_fields() {
    let registry = registry_without_boosts();
    let filters = TicketFilters {
      fulltext: Some("#42".into()),
      ..Default::default()
    };
    let (where_sql, params) =
      build_filters(&registry, &filters, &HashMap::new(), None)
        .unwrap()
        .unwrap();
    assert!(where_sql.contains("t.i = ?"));
    assert!(params.contains(&SqlValue::Integer(42)));
  }
}
