//! Field metadata — the schema building blocks of a ticket.
//!
//! A ticket's schema is composed at runtime from fields. Each field is
//! described by a [`TicketField`] record whose [`FieldFlags`] determine
//! storage shape (scalar, forward array, reverse array, word list, custom),
//! mutability, visibility, and behavior. The flags for every non-event field
//! must be registered before first use; see [`crate::registry`].

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ─── FieldId ─────────────────────────────────────────────────────────────────

/// Identifies one field in the runtime-composed ticket schema.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct FieldId(pub i32);

impl fmt::Display for FieldId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

// ─── Well-known field ids ────────────────────────────────────────────────────

// Header pseudo-fields (stored as columns of the `tickets` table).
pub const FIELD_CREATED_DT: FieldId = FieldId(1);
pub const FIELD_LASTMOD_DT: FieldId = FieldId(2);
pub const FIELD_CREATED_UID: FieldId = FieldId(3);
pub const FIELD_LASTMOD_UID: FieldId = FieldId(4);

// Value fields.
pub const FIELD_TITLE: FieldId = FieldId(100);
pub const FIELD_DESCRIPTION: FieldId = FieldId(101);
pub const FIELD_PRIORITY: FieldId = FieldId(102);
pub const FIELD_STATUS: FieldId = FieldId(103);
pub const FIELD_PROJECT: FieldId = FieldId(104);
pub const FIELD_KEYWORDS: FieldId = FieldId(110);
/// Forward half of the parents/children pair.
pub const FIELD_PARENTS: FieldId = FieldId(120);
/// Reverse half; derived from the rows of [`FIELD_PARENTS`].
pub const FIELD_CHILDREN: FieldId = FieldId(121);
pub const FIELD_AMOUNT: FieldId = FieldId(130);

// Changelog-only fields.
pub const FIELD_COMMENT: FieldId = FieldId(150);
pub const FIELD_ATTACHMENT: FieldId = FieldId(151);

// Pure changelog event markers (no stored value).
pub const FIELD_TICKET_CREATED: FieldId = FieldId(900);
pub const FIELD_TEMPLATE_DELETED: FieldId = FieldId(901);
pub const FIELD_COMMENT_UPDATED: FieldId = FieldId(902);
pub const FIELD_COMMENT_DELETED: FieldId = FieldId(903);
pub const FIELD_ATTACHMENT_DELETED: FieldId = FieldId(904);

// ─── FieldFlags ──────────────────────────────────────────────────────────────

bitflags! {
  /// Storage shape and behavior bits for one ticket field.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
  pub struct FieldFlags: u32 {
    /// Scalar with old/new row tracking: a write inserts a new row and
    /// soft-orphans the previous one so the changelog can still resolve it.
    const STD_DATA_OLD_NEW = 1 << 0;
    /// Forward array: membership rows are `(this ticket, field, value)`.
    const ARRAY = 1 << 1;
    /// Reverse array: rows are recorded from the other ticket's perspective
    /// under the paired forward field.
    const ARRAY_REVERSE = 1 << 2;
    /// Array values carry a quantity, encoded as `id:count` on input.
    const ARRAY_COUNT = 1 << 3;
    /// Values are words resolved through the word-list definition table.
    const WORDLIST = 1 << 4;
    /// The handler replaces the default persistence algorithm entirely.
    const CUSTOM_SERIALIZATION = 1 << 5;
    /// Must be present on write.
    const REQUIRED = 1 << 6;
    /// Required on create, immutable on edit.
    const FIXED_CREATEONLY = 1 << 7;
    /// Per-user visibility configuration applies.
    const VISIBILITY_CONFIG = 1 << 8;
    const SORTABLE = 1 << 9;
    /// First click on a sortable column sorts descending.
    const DESCEND_FIRST = 1 << 10;
    /// Appears only in the changelog; has no create/update path.
    const CHANGELOGONLY = 1 << 11;
    /// Pure event marker: no stored value, changelog row only.
    const EMPTYSYSEVENT = 1 << 12;
    /// Skipped entirely by create and update.
    const IGNORE_CREATE_UPDATE = 1 << 13;
    /// Virtual field copied through from the template's project mapping.
    const MAPPED_FROM_PROJECT = 1 << 14;

    // Data types. A field has at most one.
    const TYPE_INT = 1 << 16;
    const TYPE_TEXT = 1 << 17;
    const TYPE_AMOUNT = 1 << 18;
  }
}

impl FieldFlags {
  /// True for forward and reverse arrays alike.
  pub fn is_array(self) -> bool {
    self.intersects(Self::ARRAY | Self::ARRAY_REVERSE)
  }

  pub fn is_pure_event(self) -> bool { self.contains(Self::EMPTYSYSEVENT) }

  /// True if the field never takes part in the create/update field loop.
  pub fn skipped_on_write(self) -> bool {
    self.intersects(
      Self::IGNORE_CREATE_UPDATE | Self::CHANGELOGONLY | Self::EMPTYSYSEVENT,
    )
  }
}

// ─── TicketField ─────────────────────────────────────────────────────────────

/// Metadata record for one field. Identity is the id; immutable once the
/// registry is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketField {
  pub id:              FieldId,
  pub name:            String,
  /// Narrow value table this field persists to; `None` for header
  /// pseudo-fields and pure event markers.
  pub storage_table:   Option<String>,
  pub flags:           FieldFlags,
  /// Grouping parent for category-style fields.
  pub parent_field_id: Option<FieldId>,
  /// Explicit bidirectional pairing (e.g. parents ↔ children). Both halves
  /// of a pair declare each other.
  pub paired_field_id: Option<FieldId>,
  pub ordering:        i32,
}

impl TicketField {
  pub fn new(id: FieldId, name: &str, flags: FieldFlags) -> Self {
    Self {
      id,
      name: name.to_owned(),
      storage_table: None,
      flags,
      parent_field_id: None,
      paired_field_id: None,
      ordering: 0,
    }
  }

  pub fn with_table(mut self, table: &str) -> Self {
    self.storage_table = Some(table.to_owned());
    self
  }

  pub fn with_pair(mut self, other: FieldId) -> Self {
    self.paired_field_id = Some(other);
    self
  }

  pub fn with_parent(mut self, parent: FieldId) -> Self {
    self.parent_field_id = Some(parent);
    self
  }

  pub fn with_ordering(mut self, ordering: i32) -> Self {
    self.ordering = ordering;
    self
  }
}
