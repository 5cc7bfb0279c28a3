//! The field metadata registry.
//!
//! Built exactly once at startup from the built-in field definitions overlaid
//! with plugin contributions, then read-only for the life of the process.
//! Re-registering an existing field id is a fatal configuration error, never
//! a silent override. Two independently-built side tables (search boosts and
//! drill-down ids) serve the search/aggregation subsystem.

use std::collections::HashMap;

use crate::{
  Error, Result,
  field::{
    FIELD_AMOUNT, FIELD_ATTACHMENT, FIELD_ATTACHMENT_DELETED, FIELD_CHILDREN,
    FIELD_COMMENT, FIELD_COMMENT_DELETED, FIELD_COMMENT_UPDATED,
    FIELD_DESCRIPTION, FIELD_KEYWORDS, FIELD_PARENTS, FIELD_PRIORITY,
    FIELD_PROJECT, FIELD_STATUS, FIELD_TEMPLATE_DELETED, FIELD_TICKET_CREATED,
    FIELD_TITLE, FieldFlags, FieldId, TicketField,
  },
};

// ─── Registry ────────────────────────────────────────────────────────────────

/// In-memory map of field id → metadata, plus the boost/drill-down side
/// tables. Cheap to share behind an `Arc`; never mutated after build.
#[derive(Debug)]
pub struct FieldRegistry {
  fields:        HashMap<FieldId, TicketField>,
  search_boosts: HashMap<FieldId, i32>,
  drill_down:    Vec<FieldId>,
}

impl FieldRegistry {
  pub fn builder() -> FieldRegistryBuilder { FieldRegistryBuilder::default() }

  /// Look up a field by id. Unknown ids are a configuration error: every
  /// non-event field must be registered before first use.
  pub fn find(&self, id: FieldId) -> Result<&TicketField> {
    self.fields.get(&id).ok_or(Error::UnknownField(id))
  }

  /// Linear scan by name. The registry holds tens of entries, so this is
  /// not worth indexing.
  pub fn find_by_name(&self, name: &str) -> Option<&TicketField> {
    self.fields.values().find(|f| f.name == name)
  }

  pub fn search_boost(&self, id: FieldId) -> Option<i32> {
    self.search_boosts.get(&id).copied()
  }

  pub fn drill_down_ids(&self) -> &[FieldId] { &self.drill_down }

  pub fn iter(&self) -> impl Iterator<Item = &TicketField> {
    self.fields.values()
  }

  /// Fields whose text values take part in the fallback fulltext scan.
  pub fn searchable_text_fields(&self) -> Vec<&TicketField> {
    let mut out: Vec<&TicketField> = self
      .fields
      .values()
      .filter(|f| self.search_boosts.contains_key(&f.id))
      .collect();
    out.sort_by_key(|f| f.id);
    out
  }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// One-time registry assembly. Core definitions go in first; plugins overlay
/// theirs afterwards. Any duplicate id fails the build.
#[derive(Debug, Default)]
pub struct FieldRegistryBuilder {
  fields:        HashMap<FieldId, TicketField>,
  search_boosts: HashMap<FieldId, i32>,
  drill_down:    Vec<FieldId>,
}

impl FieldRegistryBuilder {
  pub fn register(&mut self, field: TicketField) -> Result<&mut Self> {
    if self.fields.contains_key(&field.id) {
      return Err(Error::DuplicateField(field.id));
    }
    self.fields.insert(field.id, field);
    Ok(self)
  }

  /// Register a search boost. Integer-typed fields are aggregated, not
  /// searched, so a boost on one is rejected.
  pub fn register_search_boost(
    &mut self,
    id: FieldId,
    boost: i32,
  ) -> Result<&mut Self> {
    if let Some(field) = self.fields.get(&id) {
      if field.flags.contains(FieldFlags::TYPE_INT) {
        return Err(Error::BoostOnIntField(id));
      }
    }
    self.search_boosts.insert(id, boost);
    Ok(self)
  }

  pub fn register_drill_down(&mut self, id: FieldId) -> &mut Self {
    if !self.drill_down.contains(&id) {
      self.drill_down.push(id);
    }
    self
  }

  pub fn build(self) -> FieldRegistry {
    FieldRegistry {
      fields:        self.fields,
      search_boosts: self.search_boosts,
      drill_down:    self.drill_down,
    }
  }
}

// ─── Built-in definitions ────────────────────────────────────────────────────

/// The core field set. Plugins extend this; they never replace it.
pub fn builtin_fields() -> Vec<TicketField> {
  use FieldFlags as F;

  vec![
    TicketField::new(
      FIELD_TITLE,
      "title",
      F::STD_DATA_OLD_NEW | F::TYPE_TEXT | F::REQUIRED | F::SORTABLE,
    )
    .with_table("ticket_texts")
    .with_ordering(10),
    TicketField::new(
      FIELD_DESCRIPTION,
      "description",
      F::STD_DATA_OLD_NEW | F::TYPE_TEXT,
    )
    .with_table("ticket_texts")
    .with_ordering(20),
    TicketField::new(
      FIELD_PRIORITY,
      "priority",
      F::STD_DATA_OLD_NEW | F::TYPE_INT | F::SORTABLE | F::DESCEND_FIRST,
    )
    .with_table("ticket_ints")
    .with_ordering(30),
    TicketField::new(
      FIELD_STATUS,
      "status",
      F::STD_DATA_OLD_NEW | F::TYPE_INT | F::SORTABLE | F::VISIBILITY_CONFIG,
    )
    .with_table("ticket_ints")
    .with_ordering(40),
    TicketField::new(
      FIELD_PROJECT,
      "project",
      F::STD_DATA_OLD_NEW | F::TYPE_INT | F::MAPPED_FROM_PROJECT,
    )
    .with_table("ticket_categories")
    .with_ordering(50),
    TicketField::new(
      FIELD_KEYWORDS,
      "keywords",
      F::ARRAY | F::WORDLIST | F::TYPE_TEXT,
    )
    .with_table("ticket_words")
    .with_ordering(60),
    TicketField::new(
      FIELD_PARENTS,
      "parents",
      F::ARRAY | F::ARRAY_COUNT | F::TYPE_INT,
    )
    .with_table("ticket_parents")
    .with_pair(FIELD_CHILDREN)
    .with_ordering(70),
    TicketField::new(
      FIELD_CHILDREN,
      "children",
      F::ARRAY_REVERSE | F::TYPE_INT,
    )
    .with_table("ticket_parents")
    .with_pair(FIELD_PARENTS)
    .with_ordering(80),
    TicketField::new(
      FIELD_AMOUNT,
      "amount",
      F::STD_DATA_OLD_NEW | F::TYPE_AMOUNT | F::SORTABLE,
    )
    .with_table("ticket_amounts")
    .with_ordering(90),
    TicketField::new(
      FIELD_COMMENT,
      "comment",
      F::CHANGELOGONLY | F::TYPE_TEXT,
    )
    .with_table("ticket_texts")
    .with_ordering(100),
    TicketField::new(
      FIELD_ATTACHMENT,
      "attachment",
      F::CHANGELOGONLY | F::TYPE_TEXT,
    )
    .with_table("ticket_binaries")
    .with_ordering(110),
    // Pure event markers: changelog rows only, no stored value.
    TicketField::new(
      FIELD_TICKET_CREATED,
      "ticket_created",
      F::EMPTYSYSEVENT,
    ),
    TicketField::new(
      FIELD_TEMPLATE_DELETED,
      "template_deleted",
      F::EMPTYSYSEVENT,
    ),
    TicketField::new(
      FIELD_COMMENT_UPDATED,
      "comment_updated",
      F::EMPTYSYSEVENT,
    ),
    TicketField::new(
      FIELD_COMMENT_DELETED,
      "comment_deleted",
      F::EMPTYSYSEVENT,
    ),
    TicketField::new(
      FIELD_ATTACHMENT_DELETED,
      "attachment_deleted",
      F::EMPTYSYSEVENT,
    ),
  ]
}

/// Assemble the default registry: built-in fields, title/description
/// search boosts, priority/status drill-downs.
pub fn builtin_registry() -> Result<FieldRegistryBuilder> {
  let mut b = FieldRegistry::builder();
  for field in builtin_fields() {
    b.register(field)?;
  }
  b.register_search_boost(FIELD_TITLE, 3)?;
  b.register_search_boost(FIELD_DESCRIPTION, 1)?;
  b.register_drill_down(FIELD_PRIORITY);
  b.register_drill_down(FIELD_STATUS);
  Ok(b)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builtin_registry_builds() {
    let reg = builtin_registry().unwrap().build();
    assert!(reg.find(FIELD_TITLE).is_ok());
    assert_eq!(reg.find_by_name("priority").unwrap().id, FIELD_PRIORITY);
    assert!(reg.find_by_name("no-such-field").is_none());
  }

  #[test]
  fn duplicate_registration_is_fatal() {
    let mut b = builtin_registry().unwrap();
    let err = b
      .register(TicketField::new(
        FIELD_TITLE,
        "title2",
        FieldFlags::TYPE_TEXT,
      ))
      .unwrap_err();
    assert!(matches!(err, Error::DuplicateField(id) if id == FIELD_TITLE));
  }

  #[test]
  fn boost_on_int_field_rejected() {
    let mut b = builtin_registry().unwrap();
    let err = b.register_search_boost(FIELD_PRIORITY, 2).unwrap_err();
    assert!(matches!(err, Error::BoostOnIntField(id) if id == FIELD_PRIORITY));
  }

  #[test]
  fn unknown_field_lookup_fails() {
    let reg = builtin_registry().unwrap().build();
    assert!(matches!(
      reg.find(FieldId(9999)),
      Err(Error::UnknownField(_))
    ));
  }

  #[test]
  fn pairing_is_declared_both_ways() {
    let reg = builtin_registry().unwrap().build();
    let parents = reg.find(FIELD_PARENTS).unwrap();
    let children = reg.find(FIELD_CHILDREN).unwrap();
    assert_eq!(parents.paired_field_id, Some(FIELD_CHILDREN));
    assert_eq!(children.paired_field_id, Some(FIELD_PARENTS));
  }
}
