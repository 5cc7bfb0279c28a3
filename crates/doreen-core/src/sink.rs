//! Boundary-collaborator traits: search indexing, mail delivery, access
//! control.
//!
//! The pipeline only pushes to these seams; their durability is their own
//! responsibility (fire-and-continue). Null implementations are provided so
//! the pipeline runs without any of them configured.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::{context::MailMessage, field::FieldId, ticket::Ticket};

// ─── Search ──────────────────────────────────────────────────────────────────

/// A fulltext / drill-down query delegated to the search sink.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
  pub fulltext:   Option<String>,
  /// Drill-down filters: field id → required value.
  pub drill_down: HashMap<FieldId, i64>,
  pub page:       usize,
  pub per_page:   usize,
}

/// Results from a delegated search.
#[derive(Debug, Clone, Default)]
pub struct SearchHits {
  /// Matching ticket ids in relevance order.
  pub ids:               Vec<i64>,
  pub total:             usize,
  /// Per drill-down field: value → ticket count.
  pub drill_down_counts: HashMap<FieldId, HashMap<i64, usize>>,
}

/// Push-only search index sink plus optional query delegation.
pub trait SearchSink: Send + Sync {
  fn on_ticket_created(&self, ticket: &Ticket);
  fn on_ticket_updated(&self, ticket: &Ticket);
  fn on_ticket_deleted(&self, ticket_id: i64);
  fn on_comment_added(&self, ticket_id: i64, row_id: i64, text: &str);
  fn on_comment_deleted(&self, ticket_id: i64, row_id: i64);
  fn on_attachment_added(&self, ticket_id: i64, row_id: i64, filename: &str);

  /// Serve a fulltext/drill-down query, or `None` if this sink cannot —
  /// the caller then falls back to a naive database scan.
  fn search(&self, request: &SearchRequest) -> Option<SearchHits>;
}

/// No search engine configured: pushes vanish, queries fall back.
#[derive(Debug, Default)]
pub struct NullSearchSink;

impl SearchSink for NullSearchSink {
  fn on_ticket_created(&self, _ticket: &Ticket) {}
  fn on_ticket_updated(&self, _ticket: &Ticket) {}
  fn on_ticket_deleted(&self, _ticket_id: i64) {}
  fn on_comment_added(&self, _ticket_id: i64, _row_id: i64, _text: &str) {}
  fn on_comment_deleted(&self, _ticket_id: i64, _row_id: i64) {}
  fn on_attachment_added(
    &self,
    _ticket_id: i64,
    _row_id: i64,
    _filename: &str,
  ) {
  }

  fn search(&self, _request: &SearchRequest) -> Option<SearchHits> { None }
}

// ─── Mail ────────────────────────────────────────────────────────────────────

/// Outgoing mail sink. Called synchronously after commit; failures here do
/// not roll back data.
pub trait MailSink: Send + Sync {
  fn enqueue(&self, mail: MailMessage);
}

#[derive(Debug, Default)]
pub struct NullMailSink;

impl MailSink for NullMailSink {
  fn enqueue(&self, _mail: MailMessage) {}
}

// ─── Access ──────────────────────────────────────────────────────────────────

bitflags! {
  /// Per-user capability bits as reported by the ACL collaborator.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct AccessFlags: u32 {
    const READ   = 1 << 0;
    const CREATE = 1 << 1;
    const UPDATE = 1 << 2;
    const DELETE = 1 << 3;
    const MAIL   = 1 << 4;
  }
}

/// ACL collaborator consumed for all permission checks. The pipeline maps
/// "found but forbidden" onto the same error as "not found".
pub trait AccessResolver: Send + Sync {
  fn user_access(&self, uid: i64) -> AccessFlags;
}

/// Grants everything; the default for embedded and test use.
#[derive(Debug, Default)]
pub struct OpenAccess;

impl AccessResolver for OpenAccess {
  fn user_access(&self, _uid: i64) -> AccessFlags { AccessFlags::all() }
}
