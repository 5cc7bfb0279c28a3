//! Built-in field handlers.
//!
//! Most core fields are served by [`StdFieldHandler`], which is the default
//! algorithm with nothing overridden. Monetary fields normalize to storage
//! precision and render grouped; word-list fields resolve their words
//! through the `keyword_defs` dictionary and need their own write path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use doreen_core::{
  Error as CoreError,
  context::TicketContext,
  field::{
    FIELD_AMOUNT, FIELD_CHILDREN, FIELD_DESCRIPTION, FIELD_KEYWORDS,
    FIELD_PARENTS, FIELD_PRIORITY, FIELD_PROJECT, FIELD_STATUS, FIELD_TITLE,
    FieldFlags, FieldId, TicketField,
  },
  registry::FieldRegistry,
  ticket::Ticket,
  value::FieldValue,
};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;

use crate::{
  error::{Error, Result},
  handler::FieldHandler,
};

// ─── StdFieldHandler ─────────────────────────────────────────────────────────

/// The default algorithm, bound to one field id. Optionally carries a
/// declared initial value for create mode.
pub struct StdFieldHandler {
  field_id: FieldId,
  initial:  FieldValue,
}

impl StdFieldHandler {
  pub fn new(field_id: FieldId) -> Self {
    Self { field_id, initial: FieldValue::Null }
  }

  pub fn with_initial(mut self, initial: FieldValue) -> Self {
    self.initial = initial;
    self
  }
}

impl FieldHandler for StdFieldHandler {
  fn field_id(&self) -> FieldId { self.field_id }

  fn initial_value(&self, _ctx: &TicketContext) -> FieldValue {
    self.initial.clone()
  }
}

// ─── AmountFieldHandler ──────────────────────────────────────────────────────

/// Monetary fields. Storage precision is fixed at two decimal places;
/// finer input is rounded before persistence, and mails and changelog lines
/// get the grouped two-decimal rendering.
pub struct AmountFieldHandler {
  field_id: FieldId,
}

impl AmountFieldHandler {
  pub fn new(field_id: FieldId) -> Self { Self { field_id } }
}

impl FieldHandler for AmountFieldHandler {
  fn field_id(&self) -> FieldId { self.field_id }

  fn validate_before_write(
    &self,
    _ctx: &TicketContext,
    field: &TicketField,
    _old: &FieldValue,
    new: FieldValue,
  ) -> Result<FieldValue> {
    let new = match new {
      FieldValue::Text(s) if s.is_empty() => FieldValue::Null,
      // A raw string still sitting in the slot is decoded here, the same
      // way array handlers explode raw comma strings.
      FieldValue::Text(s) => {
        let d = s.parse::<Decimal>().map_err(|_| CoreError::BadValue {
          field:  field.name.clone(),
          reason: format!("not a monetary amount: {s:?}"),
        })?;
        FieldValue::Amount(d.round_dp(2))
      }
      FieldValue::Amount(d) => FieldValue::Amount(d.round_dp(2)),
      other => other,
    };
    if field.flags.contains(FieldFlags::REQUIRED) && new.is_empty() {
      return Err(
        CoreError::MissingRequiredField { field: field.name.clone() }.into(),
      );
    }
    Ok(new)
  }

  fn format_value(&self, _field: &TicketField, value: &FieldValue) -> String {
    value.format_human().unwrap_or_else(|| value.format_plain())
  }
}

// ─── WordListFieldHandler ────────────────────────────────────────────────────

/// Word-list fields store dictionary ids, not text: each word is resolved
/// through `keyword_defs` (inserted on first use) and membership rows carry
/// the dictionary id. Changelog tokens stay human-readable words.
pub struct WordListFieldHandler {
  field_id: FieldId,
}

impl WordListFieldHandler {
  pub fn new(field_id: FieldId) -> Self { Self { field_id } }
}

impl FieldHandler for WordListFieldHandler {
  fn field_id(&self) -> FieldId { self.field_id }

  /// Words are normalized to lowercase before comparison and storage.
  fn validate_before_write(
    &self,
    _ctx: &TicketContext,
    _field: &TicketField,
    _old: &FieldValue,
    new: FieldValue,
  ) -> Result<FieldValue> {
    match new {
      FieldValue::WordList(words) => Ok(FieldValue::WordList(
        words.iter().map(|w| w.trim().to_lowercase()).collect(),
      )),
      other => Ok(other),
    }
  }

  fn write_to_database(
    &self,
    conn: &Connection,
    _registry: &FieldRegistry,
    ctx: &mut TicketContext,
    ticket: &mut Ticket,
    field: &TicketField,
    old: &FieldValue,
    new: FieldValue,
    write_changelog: bool,
  ) -> Result<()> {
    let new = self.validate_before_write(ctx, field, old, new)?;
    let table = field
      .storage_table
      .clone()
      .ok_or(Error::NoStorageTable(field.id))?;

    let old_rows =
      ticket.field_row_ids.get(&field.id).cloned().unwrap_or_default();
    let old_words: BTreeMap<&str, i64> = old
      .words()
      .iter()
      .map(String::as_str)
      .zip(old_rows.iter().copied())
      .collect();
    let new_words: BTreeSet<&str> =
      new.words().iter().map(String::as_str).collect();

    let mut row_by_word: BTreeMap<String, i64> = BTreeMap::new();
    let mut tokens = Vec::new();

    for (&word, &row) in &old_words {
      if new_words.contains(word) {
        row_by_word.insert(word.to_owned(), row);
      } else {
        conn.execute(
          &format!("DELETE FROM {table} WHERE i = ?1"),
          params![row],
        )?;
        tokens.push(format!("-{word}"));
      }
    }

    for &word in &new_words {
      if old_words.contains_key(word) {
        continue;
      }
      let keyword_id = lookup_or_insert_keyword(conn, word)?;
      conn.execute(
        &format!(
          "INSERT INTO {table} (ticket_id, field_id, value) VALUES \
           (?1, ?2, ?3)"
        ),
        params![ticket.id, field.id.0, keyword_id],
      )?;
      row_by_word.insert(word.to_owned(), conn.last_insert_rowid());
      tokens.push(format!("+{word}"));
    }

    if write_changelog && !tokens.is_empty() {
      self.add_to_changelog(
        conn,
        ctx,
        ticket.id,
        field,
        None,
        None,
        Some(&tokens.join(",")),
      )?;
      self.queue_for_ticket_mail(ctx, field, old, &new);
    }

    let words: Vec<String> = row_by_word.keys().cloned().collect();
    let rows: Vec<i64> = row_by_word.values().copied().collect();
    ticket.set_field(field.id, FieldValue::WordList(words), rows);
    Ok(())
  }
}

fn lookup_or_insert_keyword(conn: &Connection, word: &str) -> Result<i64> {
  let existing: Option<i64> = conn
    .query_row(
      "SELECT i FROM keyword_defs WHERE word = ?1",
      params![word],
      |row| row.get(0),
    )
    .optional()?;
  if let Some(id) = existing {
    return Ok(id);
  }
  conn.execute("INSERT INTO keyword_defs (word) VALUES (?1)", params![word])?;
  Ok(conn.last_insert_rowid())
}

// ─── Built-in handler set ────────────────────────────────────────────────────

/// Handlers for the core field set; plugins overlay these.
pub(crate) fn builtin_handlers() -> Vec<Arc<dyn FieldHandler>> {
  vec![
    Arc::new(StdFieldHandler::new(FIELD_TITLE)),
    Arc::new(StdFieldHandler::new(FIELD_DESCRIPTION)),
    Arc::new(StdFieldHandler::new(FIELD_PRIORITY)),
    Arc::new(StdFieldHandler::new(FIELD_STATUS)),
    Arc::new(StdFieldHandler::new(FIELD_PROJECT)),
    Arc::new(StdFieldHandler::new(FIELD_PARENTS)),
    Arc::new(StdFieldHandler::new(FIELD_CHILDREN)),
    Arc::new(AmountFieldHandler::new(FIELD_AMOUNT)),
    Arc::new(WordListFieldHandler::new(FIELD_KEYWORDS)),
  ]
}
