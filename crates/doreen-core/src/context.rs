//! Per-operation state: the ticket context and the pending-notification
//! accumulator.
//!
//! A [`TicketContext`] is created fresh for one create/update/format call
//! and discarded afterwards. Notification lines collected while field
//! handlers run are held in an explicit [`PendingNotification`] builder and
//! turned into exactly one outgoing mail after the whole operation commits —
//! never sent mid-transaction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ─── Mode ────────────────────────────────────────────────────────────────────

/// What a context is being used for; handlers branch on this.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize,
  Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum TicketMode {
  Create,
  Edit,
  ReadOnlyDetails,
  ReadOnlyList,
  Json,
  TicketMail,
}

// ─── Acting user ─────────────────────────────────────────────────────────────

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
  pub uid:   i64,
  pub login: String,
  pub email: Option<String>,
}

impl UserRef {
  pub fn new(uid: i64, login: &str) -> Self {
    Self {
      uid,
      login: login.to_owned(),
      email: None,
    }
  }

  pub fn with_email(mut self, email: &str) -> Self {
    self.email = Some(email.to_owned());
    self
  }
}

// ─── Mail message ────────────────────────────────────────────────────────────

/// One outgoing notification, handed to the mail sink after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
  pub to:        String,
  pub bcc:       Vec<String>,
  pub subject:   String,
  pub html:      String,
  pub plain:     String,
  pub from_addr: String,
  pub from_name: String,
}

// ─── PendingNotification ─────────────────────────────────────────────────────

/// Accumulates one HTML line and one plain-text line per changed field,
/// plus an optional comment, scoped to a single create/update invocation.
#[derive(Debug, Default, Clone)]
pub struct PendingNotification {
  lines:   Vec<(String, String)>,
  comment: Option<String>,
}

impl PendingNotification {
  pub fn push_line(&mut self, html: String, plain: String) {
    self.lines.push((html, plain));
  }

  pub fn set_comment(&mut self, text: String) { self.comment = Some(text); }

  pub fn comment(&self) -> Option<&str> { self.comment.as_deref() }

  pub fn is_empty(&self) -> bool {
    self.lines.is_empty() && self.comment.is_none()
  }

  /// True when the comment was the only change — it then gets its own
  /// notification with a comment-specific subject.
  pub fn is_comment_only(&self) -> bool {
    self.lines.is_empty() && self.comment.is_some()
  }

  pub fn line_count(&self) -> usize { self.lines.len() }

  /// Fold everything collected into one aggregate mail.
  pub fn into_mail(
    self,
    to: &str,
    subject: String,
    from_addr: &str,
    from_name: &str,
  ) -> MailMessage {
    let mut html = String::from("<ul>\n");
    let mut plain = String::new();
    for (h, p) in &self.lines {
      html.push_str("<li>");
      html.push_str(h);
      html.push_str("</li>\n");
      plain.push_str(p);
      plain.push('\n');
    }
    html.push_str("</ul>\n");

    if let Some(comment) = &self.comment {
      html.push_str("<p>");
      html.push_str(comment);
      html.push_str("</p>\n");
      plain.push('\n');
      plain.push_str(comment);
      plain.push('\n');
    }

    MailMessage {
      to: to.to_owned(),
      bcc: vec![],
      subject,
      html,
      plain,
      from_addr: from_addr.to_owned(),
      from_name: from_name.to_owned(),
    }
  }
}

// ─── TicketContext ───────────────────────────────────────────────────────────

/// Transient parameter/result bag for one create/update/format operation:
/// the acting user, the mode, the raw request input, and the notification
/// accumulator. Created per call; never reused.
#[derive(Debug)]
pub struct TicketContext {
  pub user:         UserRef,
  pub mode:         TicketMode,
  /// Flat field-name → raw value map from the inbound request.
  pub input:        HashMap<String, String>,
  pub notification: PendingNotification,
}

impl TicketContext {
  pub fn new(
    user: UserRef,
    mode: TicketMode,
    input: HashMap<String, String>,
  ) -> Self {
    Self {
      user,
      mode,
      input,
      notification: PendingNotification::default(),
    }
  }

  pub fn raw_input(&self, field_name: &str) -> Option<&str> {
    self.input.get(field_name).map(String::as_str)
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn comment_only_detection() {
    let mut n = PendingNotification::default();
    assert!(n.is_empty());
    n.set_comment("hello".into());
    assert!(n.is_comment_only());
    n.push_line("<b>title</b>".into(), "title".into());
    assert!(!n.is_comment_only());
    assert!(!n.is_empty());
  }

  #[test]
  fn into_mail_aggregates_all_lines() {
    let mut n = PendingNotification::default();
    n.push_line("<b>a</b>".into(), "a".into());
    n.push_line("<b>b</b>".into(), "b".into());
    let mail = n.into_mail("t@example.com", "s".into(), "noreply@x", "Doreen");
    assert!(mail.html.contains("<li><b>a</b></li>"));
    assert!(mail.plain.contains("a\nb\n"));
  }
}
