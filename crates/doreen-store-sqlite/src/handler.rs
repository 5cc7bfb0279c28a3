//! The field-handler framework.
//!
//! One handler per field id, resolved through an explicit [`HandlerRegistry`]
//! built once at startup (plugins first, built-ins as fallback; duplicates
//! fail the build). Handlers run synchronously inside the lifecycle
//! transaction; every trait method has a default so a typical handler only
//! overrides the one or two steps it actually customizes.
//!
//! The default write algorithm:
//! - scalar fields insert a fresh value row and soft-orphan the previous one,
//!   then reference both row ids from a single changelog entry;
//! - array fields diff old against new membership as sets, insert and delete
//!   individual rows, and write exactly one aggregate changelog entry with
//!   `+v`/`-v` tokens — plus a complementary entry under the paired field on
//!   each cross-referenced ticket.

use std::{
  collections::{BTreeSet, HashMap},
  sync::Arc,
};

use bitflags::bitflags;
use chrono::Utc;
use doreen_core::{
  Error as CoreError,
  context::{TicketContext, TicketMode},
  field::{FieldFlags, FieldId, TicketField},
  registry::FieldRegistry,
  ticket::{Ticket, TicketSet},
  value::{CountedId, FieldValue},
};
use rusqlite::{Connection, params};
use tracing::debug;

use crate::{
  changelog,
  encode::scalar_to_sql,
  error::{Error, Result},
  plugin::TicketPlugin,
};

// ─── Write flags ─────────────────────────────────────────────────────────────

bitflags! {
  /// Per-invocation modifiers for the create/update field loop.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct WriteFlags: u32 {
    /// Absent required fields do not fail the operation.
    const IGNORE_MISSING = 1 << 0;
    /// Suppress changelog rows and notification lines for this write.
    const NO_CHANGELOG = 1 << 1;
  }
}

// ─── The handler contract ────────────────────────────────────────────────────

/// Per-field behavior plugged into the lifecycle pipeline. All methods have
/// defaults implementing the standard algorithm; specialize only what
/// differs.
pub trait FieldHandler: Send + Sync {
  /// The field this handler serves.
  fn field_id(&self) -> FieldId;

  /// Declared starting value in create mode.
  fn initial_value(&self, _ctx: &TicketContext) -> FieldValue {
    FieldValue::Null
  }

  /// Current effective value: the declared initial value in create mode,
  /// otherwise the ticket's in-memory value. A raw string still sitting in
  /// an array-typed slot is exploded into a list here.
  fn get_value(
    &self,
    ctx: &TicketContext,
    ticket: &Ticket,
    field: &TicketField,
  ) -> FieldValue {
    if ctx.mode == TicketMode::Create {
      return self.initial_value(ctx);
    }
    let value = ticket.field_value(field.id);
    if field.flags.is_array() {
      if let FieldValue::Text(raw) = &value {
        return FieldValue::parse_input(raw, field).unwrap_or(value);
      }
    }
    value
  }

  /// Plain-text rendering for notification mails and logs.
  fn format_value(&self, _field: &TicketField, value: &FieldValue) -> String {
    value.format_plain()
  }

  /// Final gate before persistence. May rewrite the value (empty string on
  /// a numeric field normalizes to `Null`); rejects empty required fields.
  fn validate_before_write(
    &self,
    _ctx: &TicketContext,
    field: &TicketField,
    _old: &FieldValue,
    new: FieldValue,
  ) -> Result<FieldValue> {
    let new = match &new {
      FieldValue::Text(s)
        if s.is_empty()
          && field
            .flags
            .intersects(FieldFlags::TYPE_INT | FieldFlags::TYPE_AMOUNT) =>
      {
        FieldValue::Null
      }
      _ => new,
    };
    if field.flags.contains(FieldFlags::REQUIRED) && new.is_empty() {
      return Err(
        CoreError::MissingRequiredField { field: field.name.clone() }.into(),
      );
    }
    Ok(new)
  }

  /// Change detection; the default keeps the historical asymmetry of
  /// [`FieldValue::is_changed_from`].
  fn is_new_value_different(
    &self,
    _ctx: &TicketContext,
    old: &FieldValue,
    new: &FieldValue,
  ) -> bool {
    new.is_changed_from(old)
  }

  /// One field's turn in the create/update loop: read the raw input, decide
  /// whether anything changed, and persist if so. Returns whether a write
  /// happened.
  fn on_create_or_update(
    &self,
    conn: &Connection,
    registry: &FieldRegistry,
    ctx: &mut TicketContext,
    ticket: &mut Ticket,
    field: &TicketField,
    flags: WriteFlags,
  ) -> Result<bool> {
    default_on_create_or_update(self, conn, registry, ctx, ticket, field, flags)
  }

  /// Persist one validated value; see the module docs for the scalar and
  /// array algorithms.
  #[allow(clippy::too_many_arguments)]
  fn write_to_database(
    &self,
    conn: &Connection,
    registry: &FieldRegistry,
    ctx: &mut TicketContext,
    ticket: &mut Ticket,
    field: &TicketField,
    old: &FieldValue,
    new: FieldValue,
    write_changelog: bool,
  ) -> Result<()> {
    default_write_to_database(
      self,
      conn,
      registry,
      ctx,
      ticket,
      field,
      old,
      new,
      write_changelog,
    )
  }

  /// Contribute this field to a JSON map. Paired reference fields request
  /// their referenced tickets through `subticket_ids` so the caller can
  /// fetch them in one round trip instead of recursing.
  fn serialize_to_map(
    &self,
    _ctx: &TicketContext,
    ticket: &Ticket,
    field: &TicketField,
    out: &mut serde_json::Map<String, serde_json::Value>,
    subticket_ids: &mut BTreeSet<i64>,
  ) {
    let value = ticket.field_value(field.id);
    if let Some(human) = value.format_human() {
      out.insert(
        format!("{}_formatted", field.name),
        serde_json::Value::String(human),
      );
    }
    if field.paired_field_id.is_some() {
      subticket_ids.extend(value.id_counts().keys());
    }
    out.insert(field.name.clone(), value.to_json());
  }

  /// Append one audit row. Overridable for fields with custom audit
  /// payloads.
  #[allow(clippy::too_many_arguments)]
  fn add_to_changelog(
    &self,
    conn: &Connection,
    ctx: &TicketContext,
    what: i64,
    field: &TicketField,
    old_row: Option<i64>,
    new_row: Option<i64>,
    value_str: Option<&str>,
  ) -> Result<i64> {
    Ok(changelog::insert_row(
      conn,
      field.id,
      what,
      ctx.user.uid,
      Utc::now(),
      old_row,
      new_row,
      value_str,
    )?)
  }

  /// Stage one notification line into the context accumulator. Nothing is
  /// sent here; the lifecycle folds all lines into one mail after commit.
  fn queue_for_ticket_mail(
    &self,
    ctx: &mut TicketContext,
    field: &TicketField,
    old: &FieldValue,
    new: &FieldValue,
  ) {
    let old_s = self.format_value(field, old);
    let new_s = self.format_value(field, new);
    ctx.notification.push_line(
      format!(
        "<b>{}:</b> {} &rarr; {}",
        html_escape(&field.name),
        html_escape(&old_s),
        html_escape(&new_s)
      ),
      format!("{}: {old_s} -> {new_s}", field.name),
    );
  }

  /// Hook for `CUSTOM_SERIALIZATION` fields: populate skips them in its
  /// grouped query and calls this instead.
  fn populate(
    &self,
    _conn: &Connection,
    _field: &TicketField,
    _tickets: &mut TicketSet,
    _ids: &[i64],
  ) -> Result<()> {
    Ok(())
  }
}

// ─── Default steps ───────────────────────────────────────────────────────────

fn default_on_create_or_update<H: FieldHandler + ?Sized>(
  h: &H,
  conn: &Connection,
  registry: &FieldRegistry,
  ctx: &mut TicketContext,
  ticket: &mut Ticket,
  field: &TicketField,
  flags: WriteFlags,
) -> Result<bool> {
  if field.flags.skipped_on_write() {
    return Ok(false);
  }
  // Fixed-on-create fields are immutable once the ticket exists.
  if ctx.mode == TicketMode::Edit
    && field.flags.contains(FieldFlags::FIXED_CREATEONLY)
  {
    return Ok(false);
  }

  let Some(raw) = ctx.raw_input(&field.name).map(str::to_owned) else {
    let required = field.flags.contains(FieldFlags::REQUIRED);
    if required && !flags.contains(WriteFlags::IGNORE_MISSING) {
      return Err(
        CoreError::MissingRequiredField { field: field.name.clone() }.into(),
      );
    }
    return Ok(false);
  };

  let new = FieldValue::parse_input(&raw, field)?;
  let old = h.get_value(ctx, ticket, field);
  if !h.is_new_value_different(ctx, &old, &new) {
    debug!(field = %field.id, "value unchanged, skipping write");
    return Ok(false);
  }

  h.write_to_database(
    conn,
    registry,
    ctx,
    ticket,
    field,
    &old,
    new,
    !flags.contains(WriteFlags::NO_CHANGELOG),
  )?;
  Ok(true)
}

#[allow(clippy::too_many_arguments)]
fn default_write_to_database<H: FieldHandler + ?Sized>(
  h: &H,
  conn: &Connection,
  registry: &FieldRegistry,
  ctx: &mut TicketContext,
  ticket: &mut Ticket,
  field: &TicketField,
  old: &FieldValue,
  new: FieldValue,
  write_changelog: bool,
) -> Result<()> {
  let new = h.validate_before_write(ctx, field, old, new)?;
  let table = field
    .storage_table
    .clone()
    .ok_or(Error::NoStorageTable(field.id))?;

  if field.flags.is_array() {
    write_array(h, conn, registry, ctx, ticket, field, &table, old, &new,
      write_changelog)
  } else {
    write_scalar(h, conn, ctx, ticket, field, &table, old, &new,
      write_changelog)
  }
}

#[allow(clippy::too_many_arguments)]
fn write_scalar<H: FieldHandler + ?Sized>(
  h: &H,
  conn: &Connection,
  ctx: &mut TicketContext,
  ticket: &mut Ticket,
  field: &TicketField,
  table: &str,
  old: &FieldValue,
  new: &FieldValue,
  write_changelog: bool,
) -> Result<()> {
  conn.execute(
    &format!(
      "INSERT INTO {table} (ticket_id, field_id, value) VALUES (?1, ?2, ?3)"
    ),
    params![ticket.id, field.id.0, scalar_to_sql(new)],
  )?;
  let new_row = conn.last_insert_rowid();

  // Soft-orphan the superseded row so historical changelog references to it
  // still resolve.
  let old_row = ticket
    .field_row_ids
    .get(&field.id)
    .and_then(|rows| rows.first().copied());
  if let Some(old_row) = old_row {
    conn.execute(
      &format!("UPDATE {table} SET ticket_id = NULL WHERE i = ?1"),
      params![old_row],
    )?;
  }

  if write_changelog {
    h.add_to_changelog(
      conn,
      ctx,
      ticket.id,
      field,
      old_row,
      Some(new_row),
      None,
    )?;
    h.queue_for_ticket_mail(ctx, field, old, new);
  }

  ticket.set_field(field.id, new.clone(), vec![new_row]);
  Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_array<H: FieldHandler + ?Sized>(
  h: &H,
  conn: &Connection,
  registry: &FieldRegistry,
  ctx: &mut TicketContext,
  ticket: &mut Ticket,
  field: &TicketField,
  table: &str,
  old: &FieldValue,
  new: &FieldValue,
  write_changelog: bool,
) -> Result<()> {
  let counted = field.flags.contains(FieldFlags::ARRAY_COUNT);
  let reverse = field.flags.contains(FieldFlags::ARRAY_REVERSE);

  let old_counts = old.id_counts();
  let new_counts = new.id_counts();

  // Row ids are stored aligned with the value list order.
  let old_rows = ticket.field_row_ids.get(&field.id).cloned().unwrap_or_default();
  let mut row_by_value: HashMap<i64, i64> = old_counts
    .keys()
    .copied()
    .zip(old_rows.iter().copied())
    .collect();

  let to_add: Vec<(i64, i64)> = new_counts
    .iter()
    .filter(|(id, count)| old_counts.get(id) != Some(count))
    .map(|(id, count)| (*id, *count))
    .collect();
  let to_remove: Vec<i64> = old_counts
    .iter()
    .filter(|(id, _)| !new_counts.contains_key(id))
    .map(|(id, _)| *id)
    .chain(
      // A count change replaces the row: remove then re-add.
      new_counts
        .iter()
        .filter(|(id, count)| {
          old_counts.get(id).is_some_and(|old_c| old_c != *count)
        })
        .map(|(id, _)| *id),
    )
    .collect();

  let mut tokens = Vec::with_capacity(to_add.len() + to_remove.len());

  for &id in &to_remove {
    if let Some(row) = row_by_value.remove(&id) {
      conn.execute(
        &format!("DELETE FROM {table} WHERE i = ?1"),
        params![row],
      )?;
    }
    // Count replacements are not announced as removals.
    if !new_counts.contains_key(&id) {
      tokens.push(format!("-{id}"));
      if write_changelog {
        complementary_entry(conn, registry, ctx, field, id, ticket.id, '-')?;
      }
    }
  }

  for &(id, count) in &to_add {
    if reverse {
      // Membership rows always live on the forward side: the other ticket
      // references this one under the paired forward field.
      let forward = field
        .paired_field_id
        .ok_or(CoreError::UnknownField(field.id))?;
      conn.execute(
        &format!(
          "INSERT INTO {table} (ticket_id, field_id, value) VALUES \
           (?1, ?2, ?3)"
        ),
        params![id, forward.0, ticket.id],
      )?;
    } else if counted {
      conn.execute(
        &format!(
          "INSERT INTO {table} (ticket_id, field_id, value, count) VALUES \
           (?1, ?2, ?3, ?4)"
        ),
        params![ticket.id, field.id.0, id, count],
      )?;
    } else {
      conn.execute(
        &format!(
          "INSERT INTO {table} (ticket_id, field_id, value) VALUES \
           (?1, ?2, ?3)"
        ),
        params![ticket.id, field.id.0, id],
      )?;
    }
    row_by_value.insert(id, conn.last_insert_rowid());

    if counted && count != 1 {
      tokens.push(format!("+{id}:{count}"));
    } else {
      tokens.push(format!("+{id}"));
    }
    if write_changelog && old_counts.get(&id).is_none() {
      complementary_entry(conn, registry, ctx, field, id, ticket.id, '+')?;
    }
  }

  // One aggregate changelog entry for the whole diff, never one per member.
  if write_changelog && !tokens.is_empty() {
    h.add_to_changelog(
      conn,
      ctx,
      ticket.id,
      field,
      None,
      None,
      Some(&tokens.join(",")),
    )?;
    h.queue_for_ticket_mail(ctx, field, old, new);
  }

  // Rebuild the in-memory value and aligned row ids from final membership.
  let final_value = if counted {
    FieldValue::CountedList(
      new_counts
        .iter()
        .map(|(id, count)| CountedId { id: *id, count: *count })
        .collect(),
    )
  } else {
    FieldValue::IdList(new_counts.keys().copied().collect())
  };
  let rows = new_counts
    .keys()
    .filter_map(|id| row_by_value.get(id).copied())
    .collect();
  ticket.set_field(field.id, final_value, rows);
  Ok(())
}

/// Write the mirror-image audit entry on a cross-referenced ticket: the
/// other side sees this ticket appear in (or leave) its paired field.
fn complementary_entry(
  conn: &Connection,
  registry: &FieldRegistry,
  ctx: &TicketContext,
  field: &TicketField,
  other_ticket: i64,
  this_ticket: i64,
  sign: char,
) -> Result<()> {
  let Some(paired) = field.paired_field_id else {
    return Ok(());
  };
  // Only ticket-reference pairs mirror; the paired field must be known.
  let paired_field = registry.find(paired)?;
  changelog::insert_row(
    conn,
    paired_field.id,
    other_ticket,
    ctx.user.uid,
    Utc::now(),
    None,
    None,
    Some(&format!("{sign}{this_ticket}")),
  )?;
  Ok(())
}

pub(crate) fn html_escape(s: &str) -> String {
  s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

// ─── HandlerRegistry ─────────────────────────────────────────────────────────

/// Field id → handler, assembled once at startup. Plugins register first and
/// win over built-ins for ids the built-ins would also serve; two plugins
/// claiming the same id fail the build.
pub struct HandlerRegistry {
  handlers: HashMap<FieldId, Arc<dyn FieldHandler>>,
}

impl HandlerRegistry {
  pub(crate) fn build(
    plugins: &[Arc<dyn TicketPlugin>],
    builtin: Vec<Arc<dyn FieldHandler>>,
  ) -> Result<Self> {
    let mut handlers: HashMap<FieldId, Arc<dyn FieldHandler>> = HashMap::new();
    for plugin in plugins {
      for handler in plugin.handlers() {
        let id = handler.field_id();
        if handlers.insert(id, handler).is_some() {
          return Err(CoreError::DuplicateField(id).into());
        }
      }
    }
    for handler in builtin {
      handlers.entry(handler.field_id()).or_insert(handler);
    }
    Ok(Self { handlers })
  }

  pub fn get(&self, id: FieldId) -> Result<&Arc<dyn FieldHandler>> {
    self.handlers.get(&id).ok_or_else(|| CoreError::NoHandler(id).into())
  }

  pub fn contains(&self, id: FieldId) -> bool { self.handlers.contains_key(&id) }
}
