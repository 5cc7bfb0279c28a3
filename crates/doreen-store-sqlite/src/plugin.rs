//! The plugin seam: field definitions and handlers contributed at startup.

use std::sync::Arc;

use doreen_core::field::{FieldId, TicketField};

use crate::handler::FieldHandler;

/// A plugin contributes field definitions, handlers, and search metadata.
/// Everything is collected exactly once when the store opens; colliding with
/// an already-registered field id fails startup.
pub trait TicketPlugin: Send + Sync {
  fn name(&self) -> &str;

  fn field_defs(&self) -> Vec<TicketField> { Vec::new() }

  fn handlers(&self) -> Vec<Arc<dyn FieldHandler>> { Vec::new() }

  /// (field id, boost) pairs for the fallback fulltext scan.
  fn search_boosts(&self) -> Vec<(FieldId, i32)> { Vec::new() }

  fn drill_down_ids(&self) -> Vec<FieldId> { Vec::new() }
}
