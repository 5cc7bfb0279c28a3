//! Ticket — the aggregate root, plus ticket types and the identity map.
//!
//! A ticket holds only identity metadata (stage 1) until field data is
//! populated on demand (stage 2), independently for the "list" and
//! "details" field subsets. Field handlers mutate tickets in place during
//! an update, so there must be at most one live instance per id within an
//! operation; the [`TicketSet`] identity map makes that explicit instead of
//! hiding it in process-global state.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
  field::FieldId,
  value::FieldValue,
};

// ─── TicketType ──────────────────────────────────────────────────────────────

/// Runtime schema composition: which fields a ticket of this type carries.
/// The details list is the full visible-field set, hidden and
/// children-category fields included; the list subset is what table views
/// populate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketType {
  pub id:             i64,
  pub name:           String,
  /// Full field list ("details" subset).
  pub field_ids:      Vec<FieldId>,
  /// Subset populated for list views.
  pub list_field_ids: Vec<FieldId>,
  /// Fields the type fills in automatically; the create/update loop skips
  /// them (typically title and status).
  pub automatic:      Vec<FieldId>,
  pub parent_type_id: Option<i64>,
}

impl TicketType {
  pub fn is_automatic(&self, id: FieldId) -> bool {
    self.automatic.contains(&id)
  }
}

// ─── DetailLevel ─────────────────────────────────────────────────────────────

/// How much of a ticket is populated. Stage 1 is identity data only; the
/// two stage-2 levels load the list and details field subsets.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString,
  Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum DetailLevel {
  Stage1,
  List,
  Details,
}

// ─── Ticket ──────────────────────────────────────────────────────────────────

/// The aggregate root. Never constructed directly by callers — tickets are
/// materialised by the store (query, template copy, template creation) and
/// mutated in place by field handlers during create/update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
  pub id:             i64,
  /// Template name; `None` means a regular ticket.
  pub template:       Option<String>,
  pub type_id:        i64,
  pub access_list_id: i64,
  pub owner_uid:      i64,
  pub created_at:     DateTime<Utc>,
  pub lastmod_uid:    i64,
  pub lastmod_at:     DateTime<Utc>,
  /// The template this ticket was created from, if any.
  pub created_from:   Option<i64>,
  pub field_data:     HashMap<FieldId, FieldValue>,
  /// Row ids backing each field's current value; one entry per live row.
  pub field_row_ids:  HashMap<FieldId, Vec<i64>>,
  pub populated:      DetailLevel,
}

impl Ticket {
  pub fn is_template(&self) -> bool { self.template.is_some() }

  /// Current in-memory value for a field; missing entries are `Null`
  /// ("no data"), never an error.
  pub fn field_value(&self, id: FieldId) -> FieldValue {
    self.field_data.get(&id).cloned().unwrap_or(FieldValue::Null)
  }

  pub fn set_field(&mut self, id: FieldId, value: FieldValue, rows: Vec<i64>) {
    self.field_data.insert(id, value);
    self.field_row_ids.insert(id, rows);
  }
}

// ─── TicketSet ───────────────────────────────────────────────────────────────

/// Explicit request-scoped identity map: at most one live [`Ticket`]
/// instance per id. Lifecycle operations take tickets out, mutate them, and
/// put them back, so concurrent in-memory duplicates cannot diverge.
#[derive(Debug, Default)]
pub struct TicketSet {
  tickets: BTreeMap<i64, Ticket>,
}

impl TicketSet {
  pub fn new() -> Self { Self::default() }

  /// Insert or replace; the set owns the single live instance for this id.
  pub fn insert(&mut self, ticket: Ticket) -> &Ticket {
    let id = ticket.id;
    self.tickets.insert(id, ticket);
    &self.tickets[&id]
  }

  pub fn get(&self, id: i64) -> Option<&Ticket> { self.tickets.get(&id) }

  pub fn get_mut(&mut self, id: i64) -> Option<&mut Ticket> {
    self.tickets.get_mut(&id)
  }

  pub fn take(&mut self, id: i64) -> Option<Ticket> {
    self.tickets.remove(&id)
  }

  pub fn remove(&mut self, id: i64) -> Option<Ticket> {
    self.tickets.remove(&id)
  }

  pub fn contains(&self, id: i64) -> bool { self.tickets.contains_key(&id) }

  pub fn ids(&self) -> Vec<i64> { self.tickets.keys().copied().collect() }

  pub fn len(&self) -> usize { self.tickets.len() }

  pub fn is_empty(&self) -> bool { self.tickets.is_empty() }

  pub fn iter(&self) -> impl Iterator<Item = &Ticket> {
    self.tickets.values()
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Ticket> {
    self.tickets.values_mut()
  }

  pub fn into_tickets(self) -> impl Iterator<Item = Ticket> {
    self.tickets.into_values()
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;
  use crate::field::FIELD_TITLE;

  fn ticket(id: i64) -> Ticket {
    Ticket {
      id,
      template: None,
      type_id: 1,
      access_list_id: 1,
      owner_uid: 1,
      created_at: Utc::now(),
      lastmod_uid: 1,
      lastmod_at: Utc::now(),
      created_from: None,
      field_data: HashMap::new(),
      field_row_ids: HashMap::new(),
      populated: DetailLevel::Stage1,
    }
  }

  #[test]
  fn missing_field_reads_as_null() {
    let t = ticket(1);
    assert_eq!(t.field_value(FIELD_TITLE), FieldValue::Null);
  }

  #[test]
  fn set_keeps_one_instance_per_id() {
    let mut set = TicketSet::new();
    set.insert(ticket(1));
    let mut replacement = ticket(1);
    replacement.set_field(FIELD_TITLE, FieldValue::Text("x".into()), vec![9]);
    set.insert(replacement);

    assert_eq!(set.len(), 1);
    assert_eq!(
      set.get(1).unwrap().field_value(FIELD_TITLE),
      FieldValue::Text("x".into())
    );
  }
}
